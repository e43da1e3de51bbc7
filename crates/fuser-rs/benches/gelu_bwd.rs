//! GELU backward throughput: fused engine against the interpreted and eager baselines.
//!
//! `FUSER_DISABLE_VALIDATION=1` skips the reference check that precedes each size;
//! `FUSER_DISABLE_BENCHMARKING=1` runs only that check.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fuser_rs::bench::{
    build_gelu_bwd_fusion, gelu_bwd_iobytes, run_gelu_bwd_baseline_case, run_gelu_bwd_fusion_case,
    BaselineExecutor, BenchConfig, GeluBwdInputs, FLOAT_DTYPES,
};
use fuser_rs::ops::gelu::gelu_bwd_eager;
use fuser_rs_backend_ref_cpu::CpuBackend;
use tracing_subscriber::EnvFilter;

fn bench_sizes() -> Vec<Vec<usize>> {
    BenchConfig {
        min_exponent: 6,
        max_exponent: 10,
        max_numel: 1 << 16,
        ..BenchConfig::default()
    }
    .input_sizes(2)
}

fn benchmark_gelu_bwd(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let fused = CpuBackend::new();
    let interpreted = CpuBackend::interpreted();
    let env_config = BenchConfig::from_env();
    let validation = BenchConfig {
        benchmark: false,
        ..env_config.clone()
    };

    for dtype in FLOAT_DTYPES {
        let mut group = c.benchmark_group(format!("gelu_bwd/{dtype}"));
        let fusion = build_gelu_bwd_fusion(dtype).unwrap();
        for size in bench_sizes() {
            if validation.validate {
                run_gelu_bwd_fusion_case(&fused, &size, dtype, &validation).unwrap();
            }
            // Clears the interpreted engine's plan cache for this size, validating if enabled.
            run_gelu_bwd_baseline_case(
                BaselineExecutor::Compiled(&interpreted),
                &size,
                dtype,
                &validation,
            )
            .unwrap();
            if !env_config.benchmark {
                continue;
            }
            let inputs = GeluBwdInputs::generate(&size, dtype, validation.seed).unwrap();
            let args = inputs.args();
            let label = format!("{}x{}", size[0], size[1]);
            group.throughput(Throughput::Bytes(gelu_bwd_iobytes(&size, dtype) as u64));

            group.bench_with_input(BenchmarkId::new("fused", &label), &args, |b, args| {
                b.iter(|| black_box(fusion.execute(&fused, black_box(args)).unwrap()))
            });
            group.bench_with_input(BenchmarkId::new("interpreted", &label), &args, |b, args| {
                b.iter(|| black_box(fusion.execute(&interpreted, black_box(args)).unwrap()))
            });
            group.bench_with_input(BenchmarkId::new("eager", &label), &inputs, |b, inputs| {
                b.iter(|| {
                    black_box(
                        gelu_bwd_eager(
                            black_box(&inputs.input),
                            black_box(&inputs.grad),
                            black_box(&inputs.bias),
                        )
                        .unwrap(),
                    )
                })
            });
        }
        group.finish();
    }
}

criterion_group!(benches, benchmark_gelu_bwd);
criterion_main!(benches);
