use fuser_rs::backend::spec::FusionBackend;
use fuser_rs::fusion::{Fusion, FusionArg, FusionDefinition};
use fuser_rs::tensor::{DType, Tensor};
use fuser_rs_backend_ref_cpu::{CpuBackend, ExecutionMode};

fn scale_fusion(factor: f64) -> Fusion {
    FusionDefinition::define(|fd| {
        let x = fd.define_tensor(&[-1, -1], &[Some(true), Some(true)], DType::F32)?;
        let y = fd.mul(x, factor)?;
        fd.add_output(y)
    })
    .expect("define")
}

#[test]
fn repeated_programs_hit_the_plan_cache() {
    let backend = CpuBackend::new();
    let x = Tensor::ones([2, 3], DType::F32);
    for _ in 0..3 {
        scale_fusion(2.0)
            .execute(&backend, &[FusionArg::from(&x)])
            .expect("execute");
    }
    // Extents are symbolic, so a new shape reuses the plan as well.
    let wide = Tensor::ones([4, 8], DType::F32);
    let out = scale_fusion(2.0)
        .execute(&backend, &[FusionArg::from(&wide)])
        .expect("execute");
    assert_eq!(out[0].sizes(), &[4, 8]);
    assert_eq!(backend.compilations(), 1);
    assert_eq!(backend.cached_plans(), 1);
}

#[test]
fn constants_are_part_of_the_cache_key() {
    let backend = CpuBackend::new();
    let x = Tensor::ones([1, 2], DType::F32);
    let half = scale_fusion(0.5)
        .execute(&backend, &[FusionArg::from(&x)])
        .expect("execute");
    let triple = scale_fusion(3.0)
        .execute(&backend, &[FusionArg::from(&x)])
        .expect("execute");
    assert_eq!(half[0].to_vec_f64(), vec![0.5, 0.5]);
    assert_eq!(triple[0].to_vec_f64(), vec![3.0, 3.0]);
    assert_eq!(backend.compilations(), 2);
}

#[test]
fn clearing_the_cache_forces_recompilation() {
    let backend = CpuBackend::interpreted();
    let fusion = scale_fusion(2.0);
    let x = Tensor::ones([2, 2], DType::F32);
    fusion
        .execute(&backend, &[FusionArg::from(&x)])
        .expect("execute");
    backend.clear_cache();
    assert_eq!(backend.cached_plans(), 0);
    fusion
        .execute(&backend, &[FusionArg::from(&x)])
        .expect("execute");
    assert_eq!(backend.compilations(), 2);
    assert_eq!(backend.cached_plans(), 1);
}

#[test]
fn least_recently_used_plans_are_evicted() {
    let backend = CpuBackend::with_capacity(ExecutionMode::Fused, 1);
    let x = Tensor::ones([2, 2], DType::F32);
    for factor in [1.0, 2.0, 1.0] {
        scale_fusion(factor)
            .execute(&backend, &[FusionArg::from(&x)])
            .expect("execute");
    }
    assert_eq!(backend.cached_plans(), 1);
    assert_eq!(backend.compilations(), 3);
}

#[test]
fn engine_rejects_inputs_that_do_not_match_the_program() {
    let backend = CpuBackend::new();
    let fusion = scale_fusion(2.0);
    let err = backend
        .run_program(fusion.program(), &[])
        .expect_err("missing input");
    assert!(err.to_string().contains("arity mismatch"), "{err}");

    let half = Tensor::ones([2, 2], DType::F16);
    let err = backend
        .run_program(fusion.program(), &[half])
        .expect_err("wrong dtype");
    assert!(err.to_string().contains("input 0"), "{err}");
}

#[test]
fn backend_names_reflect_the_execution_mode() {
    assert_eq!(CpuBackend::new().backend_name(), "cpu");
    assert_eq!(CpuBackend::interpreted().backend_name(), "cpu-interpreted");
    assert_eq!(CpuBackend::default().mode(), ExecutionMode::Fused);
}
