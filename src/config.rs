// SPDX-License-Identifier: AGPL-3.0-only

//! Run configuration from `FIBERTRACE_*` environment variables.
//!
//! Everything has a usable default so `track` runs out of the box; every
//! knob is a plain field handed to the components at construction — no
//! globals, no re-reads after startup.

use std::env;

/// Parsed run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Steps each advance dispatch performs per particle
    /// (`FIBERTRACE_STEPS_PER_KERNEL`, default 10).
    pub steps_per_kernel: u32,
    /// Hard per-particle step ceiling (`FIBERTRACE_MAX_STEPS`, default 2000).
    pub max_steps: u32,
    /// Curvature threshold as a dot-product bound
    /// (`FIBERTRACE_CURVATURE`, default 0.2).
    pub curvature_threshold: f32,
    /// Step length in voxel units (`FIBERTRACE_STEP_LENGTH`, default 0.5).
    pub step_length: f32,
    /// Fraction of device memory the run may claim
    /// (`FIBERTRACE_MEMRISK`, default 0.9).
    pub mem_risk: f64,
    /// Device memory assumed available, MiB
    /// (`FIBERTRACE_GPU_MEM_MB`, default 1024).
    pub gpu_mem_mib: u64,
    /// Auxiliary reducer threads (`FIBERTRACE_REDUCERS`, default 1;
    /// 0 reduces inline on the worker thread).
    pub reducers: usize,
    /// Advance dispatches between reductions
    /// (`FIBERTRACE_REDUCE_INTERVAL`, default 8).
    pub reduce_interval: u64,
    /// Stream particle paths to the sink
    /// (`FIBERTRACE_SAVE_PATHS`, default 1).
    pub save_paths: bool,
    /// Enable loop-check history (`FIBERTRACE_LOOPCHECK`, default 0).
    pub loopcheck: bool,
    /// Devices to use (`FIBERTRACE_DEVICES`, default 1).
    pub devices: usize,
    /// Seeds the demo producer generates (`FIBERTRACE_SEEDS`, default 4096).
    pub seed_count: u64,
    /// Seed queue capacity (`FIBERTRACE_SEED_QUEUE_CAPACITY`, default 1024).
    pub seed_queue_capacity: usize,
    /// Path output file (`FIBERTRACE_PATH_OUTPUT`, default `path_output`).
    pub path_output: String,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn flag_or(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(s) => !matches!(s.trim(), "" | "0" | "false" | "no"),
        Err(_) => default,
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self {
            steps_per_kernel: parse_or("FIBERTRACE_STEPS_PER_KERNEL", 10),
            max_steps: parse_or("FIBERTRACE_MAX_STEPS", 2000),
            curvature_threshold: parse_or("FIBERTRACE_CURVATURE", 0.2),
            step_length: parse_or("FIBERTRACE_STEP_LENGTH", 0.5),
            mem_risk: parse_or("FIBERTRACE_MEMRISK", 0.9),
            gpu_mem_mib: parse_or("FIBERTRACE_GPU_MEM_MB", 1024),
            reducers: parse_or("FIBERTRACE_REDUCERS", 1),
            reduce_interval: parse_or::<u64>("FIBERTRACE_REDUCE_INTERVAL", 8).max(1),
            save_paths: flag_or("FIBERTRACE_SAVE_PATHS", true),
            loopcheck: flag_or("FIBERTRACE_LOOPCHECK", false),
            devices: parse_or::<usize>("FIBERTRACE_DEVICES", 1).max(1),
            seed_count: parse_or("FIBERTRACE_SEEDS", 4096),
            seed_queue_capacity: parse_or::<usize>("FIBERTRACE_SEED_QUEUE_CAPACITY", 1024).max(1),
            path_output: env::var("FIBERTRACE_PATH_OUTPUT")
                .unwrap_or_else(|_| "path_output".into()),
        }
    }

    /// Device memory budget in bytes before the memory-risk fraction.
    pub fn gpu_mem_bytes(&self) -> u64 {
        self.gpu_mem_mib * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // Note: reads the real environment; defaults only asserted for keys
        // the test environment does not set.
        let cfg = RunConfig::from_env();
        assert!(cfg.steps_per_kernel >= 1);
        assert!(cfg.reduce_interval >= 1);
        assert!(cfg.devices >= 1);
        assert!(cfg.mem_risk > 0.0);
    }

    #[test]
    fn flag_parsing() {
        // flag_or treats "0", "false", "no", "" as off.
        std::env::set_var("FIBERTRACE_TEST_FLAG_OFF", "0");
        assert!(!flag_or("FIBERTRACE_TEST_FLAG_OFF", true));
        std::env::set_var("FIBERTRACE_TEST_FLAG_ON", "yes");
        assert!(flag_or("FIBERTRACE_TEST_FLAG_ON", false));
        assert!(flag_or("FIBERTRACE_TEST_FLAG_UNSET", true));
    }
}
