//! Throughput harness comparing fused execution against unfused baselines.
//!
//! Cases validate the fused output against a double-precision reference before timing, unless
//! validation is switched off through [`BenchConfig`] or `FUSER_DISABLE_VALIDATION`.

use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::backend::spec::{DType, FusionBackend};
use crate::env;
use crate::fusion::{Fusion, FusionArg, FusionDefinition};
use crate::ops::gelu::{gelu_bwd_eager, gelu_bwd_fusion, gelu_bwd_reference_f64};
use crate::tensor::Tensor;

/// Dtypes every benchmark case is run with.
pub const FLOAT_DTYPES: [DType; 3] = [DType::F16, DType::BF16, DType::F32];
/// Dtypes the fused graphs compute in `F32`.
pub const PROMOTE_DTYPES: [DType; 2] = [DType::F16, DType::BF16];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub warmup_rounds: usize,
    pub rounds: usize,
    pub validate: bool,
    pub benchmark: bool,
    pub seed: u64,
    /// Smallest and largest power-of-two exponent used per axis by the size grid.
    pub min_exponent: u32,
    pub max_exponent: u32,
    /// Sizes with more elements than this are left out of the grid.
    pub max_numel: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            warmup_rounds: 2,
            rounds: 10,
            validate: true,
            benchmark: true,
            seed: 0,
            min_exponent: 4,
            max_exponent: 10,
            max_numel: 1 << 18,
        }
    }
}

impl BenchConfig {
    /// Defaults overridden by the `FUSER_*` environment flags.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.validate = !env::validation_disabled();
        config.benchmark = !env::benchmarking_disabled();
        if let Some(rounds) = env::bench_rounds() {
            config.rounds = rounds;
        }
        config
    }

    /// Every power-of-two shape of rank `dims` within the configured bounds.
    pub fn input_sizes(&self, dims: usize) -> Vec<Vec<usize>> {
        let extents: Vec<usize> = (self.min_exponent..=self.max_exponent)
            .map(|exp| 1usize << exp)
            .collect();
        let mut sizes: Vec<Vec<usize>> = vec![Vec::new()];
        for _ in 0..dims {
            sizes = sizes
                .into_iter()
                .flat_map(|prefix| {
                    extents.iter().map(move |&extent| {
                        let mut next = prefix.clone();
                        next.push(extent);
                        next
                    })
                })
                .filter(|size| size.iter().product::<usize>() <= self.max_numel)
                .collect();
        }
        sizes
    }
}

/// Size grid of the default configuration.
pub fn generate_input_sizes(dims: usize) -> Vec<Vec<usize>> {
    BenchConfig::default().input_sizes(dims)
}

/// Bytes moved by one GELU backward: input, grad, bias and the gradient written back.
pub fn gelu_bwd_iobytes(size: &[usize], dtype: DType) -> usize {
    let rows = size.first().copied().unwrap_or(0);
    let cols = size.get(1).copied().unwrap_or(0);
    dtype.size_in_bytes() * (3 * rows * cols + cols)
}

/// Timing summary of one benchmark case.
#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    pub name: String,
    pub rounds: usize,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub iobytes: Option<usize>,
    pub bytes_per_second: Option<f64>,
}

/// Runs `f` for the configured warmup and timed rounds.
pub fn run_benchmark(
    name: &str,
    config: &BenchConfig,
    iobytes: Option<usize>,
    mut f: impl FnMut() -> Result<()>,
) -> Result<BenchResult> {
    ensure!(config.rounds > 0, "benchmark {name} needs at least one round");
    for _ in 0..config.warmup_rounds {
        f()?;
    }
    let mut samples = Vec::with_capacity(config.rounds);
    for _ in 0..config.rounds {
        let start = Instant::now();
        f()?;
        samples.push(start.elapsed());
    }
    let total: Duration = samples.iter().sum();
    let mean = total / config.rounds as u32;
    let min = samples.iter().copied().min().unwrap_or_default();
    let max = samples.iter().copied().max().unwrap_or_default();
    let bytes_per_second = iobytes
        .filter(|_| !mean.is_zero())
        .map(|bytes| bytes as f64 / mean.as_secs_f64());
    tracing::debug!(
        name,
        rounds = config.rounds,
        mean_us = mean.as_micros() as u64,
        "benchmark finished"
    );
    Ok(BenchResult {
        name: name.to_string(),
        rounds: config.rounds,
        mean,
        min,
        max,
        iobytes,
        bytes_per_second,
    })
}

/// Seeded GELU backward operands: normal `input` and `grad`, a ones `bias`.
pub struct GeluBwdInputs {
    pub input: Tensor,
    pub grad: Tensor,
    pub bias: Tensor,
}

impl GeluBwdInputs {
    pub fn generate(size: &[usize], dtype: DType, seed: u64) -> Result<Self> {
        ensure!(size.len() == 2, "gelu_bwd needs a 2-D size, got {size:?}");
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            input: Tensor::randn(size.to_vec(), 1.0, dtype, &mut rng),
            grad: Tensor::randn(size.to_vec(), 1.0, dtype, &mut rng),
            bias: Tensor::ones([size[1]], dtype),
        })
    }

    pub fn args(&self) -> Vec<FusionArg> {
        vec![
            FusionArg::from(&self.input),
            FusionArg::from(&self.grad),
            FusionArg::from(&self.bias),
        ]
    }
}

fn case_name(kind: &str, size: &[usize], dtype: DType) -> String {
    let dims: Vec<String> = size.iter().map(usize::to_string).collect();
    format!("gelu_bwd/{kind}/{}/{}", dtype, dims.join("x"))
}

pub fn build_gelu_bwd_fusion(dtype: DType) -> Result<Fusion> {
    FusionDefinition::define(|fd| gelu_bwd_fusion(fd, dtype))
}

/// Validates and times the fused GELU backward on `backend`.
///
/// Returns `None` when benchmarking is disabled; validation failures are errors.
pub fn run_gelu_bwd_fusion_case(
    backend: &dyn FusionBackend,
    size: &[usize],
    dtype: DType,
    config: &BenchConfig,
) -> Result<Option<BenchResult>> {
    let inputs = GeluBwdInputs::generate(size, dtype, config.seed)?;
    let fusion = build_gelu_bwd_fusion(dtype)?;
    let args = inputs.args();
    if config.validate {
        let reference = gelu_bwd_reference_f64(&inputs.input, &inputs.grad, &inputs.bias)?;
        fusion.validate(backend, &args, &[reference])?;
    }
    if !config.benchmark {
        return Ok(None);
    }
    let name = case_name(backend.backend_name(), size, dtype);
    let result = run_benchmark(&name, config, Some(gelu_bwd_iobytes(size, dtype)), || {
        fusion.execute(backend, &args).map(drop)
    })?;
    Ok(Some(result))
}

/// Unfused baselines the fused path is compared with.
#[derive(Clone, Copy)]
pub enum BaselineExecutor<'a> {
    /// One host tensor op per step.
    Eager,
    /// The same graph on an engine that does not fuse; its cache is cleared before each
    /// configuration.
    Compiled(&'a dyn FusionBackend),
}

impl BaselineExecutor<'_> {
    pub fn name(&self) -> &str {
        match self {
            BaselineExecutor::Eager => "eager",
            BaselineExecutor::Compiled(backend) => backend.backend_name(),
        }
    }
}

/// Times the GELU backward baseline for one size and dtype.
pub fn run_gelu_bwd_baseline_case(
    executor: BaselineExecutor<'_>,
    size: &[usize],
    dtype: DType,
    config: &BenchConfig,
) -> Result<Option<BenchResult>> {
    let inputs = GeluBwdInputs::generate(size, dtype, config.seed)?;
    let iobytes = Some(gelu_bwd_iobytes(size, dtype));
    let name = case_name(executor.name(), size, dtype);
    match executor {
        BaselineExecutor::Eager => {
            if !config.benchmark {
                return Ok(None);
            }
            run_benchmark(&name, config, iobytes, || {
                gelu_bwd_eager(&inputs.input, &inputs.grad, &inputs.bias).map(drop)
            })
            .map(Some)
        }
        BaselineExecutor::Compiled(backend) => {
            backend.clear_cache();
            let fusion = build_gelu_bwd_fusion(dtype)?;
            let args = inputs.args();
            if config.validate {
                let reference =
                    gelu_bwd_reference_f64(&inputs.input, &inputs.grad, &inputs.bias)?;
                fusion.validate(backend, &args, &[reference])?;
            }
            if !config.benchmark {
                return Ok(None);
            }
            run_benchmark(&name, config, iobytes, || {
                fusion.execute(backend, &args).map(drop)
            })
            .map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iobytes_count_three_matrices_and_bias() {
        assert_eq!(gelu_bwd_iobytes(&[4, 8], DType::F16), 2 * (3 * 32 + 8));
        assert_eq!(gelu_bwd_iobytes(&[4, 8], DType::F32), 4 * (3 * 32 + 8));
    }

    #[test]
    fn promoted_dtypes_are_the_reduced_precision_ones() {
        for dtype in FLOAT_DTYPES {
            assert_eq!(PROMOTE_DTYPES.contains(&dtype), dtype.is_reduced_precision());
        }
    }

    #[test]
    fn size_grid_respects_bounds() {
        let config = BenchConfig {
            min_exponent: 1,
            max_exponent: 3,
            max_numel: 32,
            ..BenchConfig::default()
        };
        let sizes = config.input_sizes(2);
        assert!(sizes.contains(&vec![2, 2]));
        assert!(sizes.contains(&vec![4, 8]));
        assert!(!sizes.contains(&vec![8, 8]));
        assert!(sizes
            .iter()
            .all(|size| size.iter().all(|d| d.is_power_of_two())));
    }

    #[test]
    fn benchmark_counts_every_timed_round() {
        let config = BenchConfig {
            warmup_rounds: 1,
            rounds: 3,
            ..BenchConfig::default()
        };
        let mut calls = 0;
        let result = run_benchmark("noop", &config, Some(64), || {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 4);
        assert_eq!(result.rounds, 3);
        assert!(result.min <= result.max);
    }
}
