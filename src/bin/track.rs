// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end tractography run on a synthetic volume.
//!
//! Stands in for the production entry point: builds a swirl-field test
//! volume, streams seeds through every configured device, and reports
//! density/path totals plus a JSON run summary. All knobs come from
//! `FIBERTRACE_*` environment variables; see `config.rs`.
//!
//! Set `FIBERTRACE_LIST_ADAPTERS=1` to print GPUs and exit.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use fibertrace::config::RunConfig;
use fibertrace::context::{GpuContext, WORKGROUP_SIZE};
use fibertrace::environment::{
    allocate_environment, EnvironmentConfig, MaskVolumes, VolumeSamples,
};
use fibertrace::error::TrackError;
use fibertrace::seed::{seed_queue, ParticleRecord};
use fibertrace::sink::PathSink;
use fibertrace::tracker::types::TrackAttrs;
use fibertrace::tracker::DeviceTracker;
use fibertrace::worker::{run_device_worker, ReducerPool, WorkerStats};

#[derive(Serialize)]
struct RunReport {
    adapters: Vec<String>,
    seeds: u64,
    dispatches: u64,
    reductions: u64,
    wall_ms: u128,
    voxels_visited: u64,
    density_total: u64,
    per_device: Vec<WorkerStats>,
}

/// Swirl field: directions circle the volume's vertical axis, with a small
/// upward drift, inside a spherical brain mask.
fn synthetic_volume(dim: u32) -> (VolumeSamples, MaskVolumes) {
    let n = dim as usize;
    let voxels = n * n * n;
    let center = (dim as f32 - 1.0) / 2.0;
    let radius = 0.45 * dim as f32;

    let mut f = vec![0.0f32; voxels];
    let mut phi = vec![0.0f32; voxels];
    let mut theta = vec![0.0f32; voxels];
    let mut brain = vec![0u32; voxels];

    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let idx = (z * n + y) * n + x;
                let dx = x as f32 - center;
                let dy = y as f32 - center;
                let dz = z as f32 - center;
                if (dx * dx + dy * dy + dz * dz).sqrt() > radius {
                    continue;
                }
                brain[idx] = 1;
                // Tangent to the circle through (x, y), drifting up.
                let dir = [-dy, dx, 0.3 * (dx * dx + dy * dy).sqrt().max(1.0)];
                let len = (dir[0] * dir[0] + dir[1] * dir[1] + dir[2] * dir[2]).sqrt();
                f[idx] = 0.6;
                theta[idx] = (dir[2] / len).clamp(-1.0, 1.0).acos();
                phi[idx] = dir[1].atan2(dir[0]);
            }
        }
    }

    (
        VolumeSamples {
            nx: dim,
            ny: dim,
            nz: dim,
            ns: 1,
            f,
            phi,
            theta,
        },
        MaskVolumes {
            brain,
            ..MaskVolumes::default()
        },
    )
}

fn seed_records(count: u64, dim: u32) -> Vec<ParticleRecord> {
    let center = (dim as f32 - 1.0) / 2.0;
    (0..count)
        .map(|i| {
            // Deterministic scatter in a small box around the center.
            let h = i.wrapping_mul(0x9e37_79b9_7f4a_7c15);
            let ox = ((h >> 8) & 0xff) as f32 / 255.0 - 0.5;
            let oy = ((h >> 16) & 0xff) as f32 / 255.0 - 0.5;
            let oz = ((h >> 24) & 0xff) as f32 / 255.0 - 0.5;
            let pos = [
                center + ox * 4.0,
                center + 0.25 * dim as f32 + oy * 2.0,
                center + oz * 4.0,
            ];
            ParticleRecord::at(pos, [-1.0, 0.0, 0.0], i)
        })
        .collect()
}

fn main() {
    if std::env::var("FIBERTRACE_LIST_ADAPTERS").is_ok() {
        GpuContext::print_available_adapters();
        return;
    }

    let cfg = RunConfig::from_env();
    let dim: u32 = std::env::var("FIBERTRACE_VOLUME_DIM")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(32);

    println!("═══════════════════════════════════════════════════════════");
    println!("  fibertrace — probabilistic tractography");
    println!("═══════════════════════════════════════════════════════════");
    println!(
        "  volume {dim}³, {} seeds, {} device(s), {} reducer(s)",
        cfg.seed_count, cfg.devices, cfg.reducers
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime");

    // Device contexts: explicit selector for a single device, enumeration
    // order beyond that.
    let selector = std::env::var("FIBERTRACE_GPU_ADAPTER").unwrap_or_default();
    let mut contexts = Vec::new();
    for i in 0..cfg.devices {
        let pick = if cfg.devices == 1 {
            selector.clone()
        } else {
            i.to_string()
        };
        match rt.block_on(GpuContext::new(&pick)) {
            Ok(ctx) => {
                println!("  device {i}: {}", ctx.adapter_name);
                contexts.push(ctx);
            }
            Err(e) if i == 0 => {
                eprintln!("fatal: {e}");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("  device {i}: unavailable ({e}), continuing without it");
            }
        }
    }

    let (samples, masks) = synthetic_volume(dim);
    let env_cfg = EnvironmentConfig {
        total_device_memory: cfg.gpu_mem_bytes(),
        mem_risk: cfg.mem_risk,
        save_paths: cfg.save_paths,
        loopcheck: cfg.loopcheck,
    };

    let sink = if cfg.save_paths {
        match PathSink::create(Path::new(&cfg.path_output)) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                eprintln!("fatal: {e}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    // Per-device environment + handler. Budget exhaustion here is the one
    // recoverable condition and its message carries the recourse.
    let mut environments = Vec::new();
    let mut trackers = Vec::new();
    for ctx in &contexts {
        let result = allocate_environment(ctx.device(), &samples, None, &masks, &env_cfg)
            .and_then(|env| {
                let attrs = TrackAttrs {
                    steps_per_kernel: cfg.steps_per_kernel,
                    max_steps: cfg.max_steps,
                    curvature_threshold: cfg.curvature_threshold,
                    step_length: cfg.step_length,
                    ..bytemuck::Zeroable::zeroed()
                };
                let tracker = DeviceTracker::init(
                    ctx.device_arc(),
                    ctx.queue_arc(),
                    ctx.advance_pipeline(),
                    ctx.reduce_pipeline(),
                    attrs,
                    sink.clone(),
                    WORKGROUP_SIZE,
                    &env,
                    &env.global_density,
                )?;
                Ok((env, tracker))
            });
        match result {
            Ok((env, tracker)) => {
                environments.push(env);
                trackers.push(tracker);
            }
            Err(e @ TrackError::OutOfDeviceMemory { .. }) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("fatal: {e}");
                std::process::exit(1);
            }
        }
    }

    let (seed_tx, seed_rx) = seed_queue(cfg.seed_queue_capacity);
    let seeds = seed_records(cfg.seed_count, dim);
    let producer = std::thread::Builder::new()
        .name("fibertrace-seeder".into())
        .spawn(move || {
            for record in seeds {
                if !seed_tx.push(record) {
                    break;
                }
            }
        })
        .expect("spawn seed producer");

    let pool = (cfg.reducers > 0).then(|| ReducerPool::spawn(cfg.reducers));

    let t_start = Instant::now();
    let stats: Vec<WorkerStats> = std::thread::scope(|scope| {
        let handles: Vec<_> = trackers
            .iter_mut()
            .enumerate()
            .map(|(i, tracker)| {
                let rx = seed_rx.clone();
                let pool = pool.as_ref();
                std::thread::Builder::new()
                    .name(format!("fibertrace-worker-{i}"))
                    .spawn_scoped(scope, move || {
                        run_device_worker(tracker, &rx, pool, cfg.reduce_interval)
                    })
                    .expect("spawn device worker")
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join().expect("worker thread") {
                Ok(stats) => stats,
                Err(e) => {
                    eprintln!("fatal: {e}");
                    std::process::exit(1);
                }
            })
            .collect()
    });
    drop(seed_rx);
    producer.join().expect("seed producer");
    drop(pool); // joins reducers; all folds land before read-back
    let wall_ms = t_start.elapsed().as_millis();

    if let Some(sink) = &sink {
        if let Err(e) = sink.flush() {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    }

    // Density totals per device (cross-device merging is out of scope).
    let mut voxels_visited = 0u64;
    let mut density_total = 0u64;
    for (ctx, env) in contexts.iter().zip(&environments) {
        match env.read_density(ctx.device(), ctx.queue()) {
            Ok(density) => {
                voxels_visited += density.iter().filter(|&&c| c > 0).count() as u64;
                density_total += density.iter().map(|&c| u64::from(c)).sum::<u64>();
            }
            Err(e) => {
                eprintln!("fatal: {e}");
                std::process::exit(1);
            }
        }
    }

    let report = RunReport {
        adapters: contexts.iter().map(|c| c.adapter_name.clone()).collect(),
        seeds: stats.iter().map(|s| s.seeds_written).sum(),
        dispatches: stats.iter().map(|s| s.dispatches).sum(),
        reductions: stats.iter().map(|s| s.reductions).sum(),
        wall_ms,
        voxels_visited,
        density_total,
        per_device: stats,
    };

    println!("  ───────────────────────────────────────────────────────");
    println!(
        "  {} seeds, {} dispatches, {} reductions in {} ms",
        report.seeds, report.dispatches, report.reductions, report.wall_ms
    );
    println!(
        "  density: {} visits over {} voxels",
        report.density_total, report.voxels_visited
    );
    if cfg.save_paths {
        println!("  paths: {}", cfg.path_output);
    }

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            if let Err(e) = std::fs::write("fibertrace_report.json", json) {
                eprintln!("  warning: could not write run report: {e}");
            } else {
                println!("  report: fibertrace_report.json");
            }
        }
        Err(e) => eprintln!("  warning: could not serialize run report: {e}"),
    }
}
