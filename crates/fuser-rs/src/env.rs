use std::env;
use std::sync::OnceLock;

static FUSER_DISABLE_VALIDATION: OnceLock<bool> = OnceLock::new();
static FUSER_DISABLE_BENCHMARKING: OnceLock<bool> = OnceLock::new();
static FUSER_BENCH_ROUNDS: OnceLock<Option<usize>> = OnceLock::new();
static FUSER_PLAN_CACHE_CAPACITY: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

fn read_count(name: &str) -> Option<usize> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|&count| count > 0)
}

/// Skips numeric validation of fused outputs in the benchmark harness.
pub fn validation_disabled() -> bool {
    *FUSER_DISABLE_VALIDATION.get_or_init(|| read_flag("FUSER_DISABLE_VALIDATION"))
}

/// Skips the timed rounds in the benchmark harness (validation still runs).
pub fn benchmarking_disabled() -> bool {
    *FUSER_DISABLE_BENCHMARKING.get_or_init(|| read_flag("FUSER_DISABLE_BENCHMARKING"))
}

pub fn bench_rounds() -> Option<usize> {
    *FUSER_BENCH_ROUNDS.get_or_init(|| read_count("FUSER_BENCH_ROUNDS"))
}

/// Capacity override for compiled-plan caches in engines.
pub fn plan_cache_capacity() -> Option<usize> {
    *FUSER_PLAN_CACHE_CAPACITY.get_or_init(|| read_count("FUSER_PLAN_CACHE_CAPACITY"))
}
