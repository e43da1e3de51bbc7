use fuser_rs::bench::{
    build_gelu_bwd_fusion, run_gelu_bwd_baseline_case, run_gelu_bwd_fusion_case,
    BaselineExecutor, BenchConfig, GeluBwdInputs, FLOAT_DTYPES,
};
use fuser_rs::ops::gelu::{gelu_bwd_eager, gelu_bwd_reference_f64};
use fuser_rs::tensor::DType;
use fuser_rs_backend_ref_cpu::CpuBackend;

fn quick_config() -> BenchConfig {
    BenchConfig {
        warmup_rounds: 0,
        rounds: 1,
        min_exponent: 3,
        max_exponent: 5,
        ..BenchConfig::default()
    }
}

#[test]
fn fused_gelu_bwd_matches_reference_for_every_dtype_and_size() {
    let backend = CpuBackend::new();
    let config = quick_config();
    let sizes = config.input_sizes(2);
    assert_eq!(sizes.len(), 9);
    for dtype in FLOAT_DTYPES {
        for size in &sizes {
            let result = run_gelu_bwd_fusion_case(&backend, size, dtype, &config)
                .unwrap_or_else(|err| panic!("{dtype} {size:?}: {err:#}"))
                .expect("benchmarking enabled");
            assert_eq!(result.rounds, 1);
            assert!(result.name.contains(dtype.name()), "{}", result.name);
        }
    }
    // One plan per dtype; sizes are symbolic.
    assert_eq!(backend.compilations(), FLOAT_DTYPES.len());
}

#[test]
fn validation_only_runs_skip_timing() {
    let config = BenchConfig {
        benchmark: false,
        ..quick_config()
    };
    let result = run_gelu_bwd_fusion_case(&CpuBackend::new(), &[8, 16], DType::BF16, &config)
        .expect("validated case");
    assert!(result.is_none());
}

#[test]
fn compiled_baseline_recompiles_for_each_configuration() {
    let backend = CpuBackend::interpreted();
    let config = quick_config();
    for dtype in [DType::F32, DType::F16] {
        run_gelu_bwd_baseline_case(BaselineExecutor::Compiled(&backend), &[8, 8], dtype, &config)
            .expect("baseline case");
    }
    run_gelu_bwd_baseline_case(BaselineExecutor::Compiled(&backend), &[8, 8], DType::F32, &config)
        .expect("repeated configuration");
    assert_eq!(backend.compilations(), 3);
    assert_eq!(backend.cached_plans(), 1);
}

#[test]
fn eager_baseline_times_host_ops() {
    let result = run_gelu_bwd_baseline_case(
        BaselineExecutor::Eager,
        &[16, 32],
        DType::F32,
        &quick_config(),
    )
    .expect("eager case")
    .expect("benchmarking enabled");
    assert_eq!(result.name, "gelu_bwd/eager/f32/16x32");
    assert_eq!(result.iobytes, Some(4 * (3 * 16 * 32 + 32)));
}

#[test]
fn fused_and_eager_paths_agree_in_f32() {
    let inputs = GeluBwdInputs::generate(&[4, 8], DType::F32, 7).expect("inputs");
    let fused = build_gelu_bwd_fusion(DType::F32)
        .expect("fusion")
        .execute(&CpuBackend::new(), &inputs.args())
        .expect("execute");
    let eager = gelu_bwd_eager(&inputs.input, &inputs.grad, &inputs.bias).expect("eager");
    let reference =
        gelu_bwd_reference_f64(&inputs.input, &inputs.grad, &inputs.bias).expect("reference");

    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].dtype(), DType::F32);
    assert!(fused[0].max_abs_diff(&reference).expect("diff") < 1e-4);
    assert!(eager.max_abs_diff(&reference).expect("diff") < 1e-4);
}

#[test]
fn half_precision_outputs_keep_input_dtype() {
    let inputs = GeluBwdInputs::generate(&[4, 4], DType::F16, 3).expect("inputs");
    let out = build_gelu_bwd_fusion(DType::F16)
        .expect("fusion")
        .execute(&CpuBackend::new(), &inputs.args())
        .expect("execute");
    assert_eq!(out[0].dtype(), DType::F16);
    assert_eq!(out[0].sizes(), &[4, 4]);
}
