// SPDX-License-Identifier: AGPL-3.0-only

//! Per-device tractography handler.
//!
//! A `DeviceTracker` owns one device's double-buffered particle state: it
//! sizes the resident population against the memory budget, writes seeds
//! into free slots, dispatches the advance kernel one bank at a time, reads
//! completion codes back, and streams retained path positions to the sink.
//! The advance kernel's numerical content is opaque here — the handler only
//! knows how to size, bind, and invoke it.
//!
//! `ParticleHost` is the host-side face of that kernel contract; the worker
//! pipeline drives any implementation of it, which keeps the pipeline
//! testable against a stub backend.

pub mod dispatch;
mod resources;
pub mod types;

use std::sync::{Arc, Mutex};

use crate::environment::{EnvironmentData, FeatureFlags};
use crate::error::TrackError;
use crate::seed::ParticleRecord;
use crate::sink::PathSink;
use self::dispatch::ReduceStage;
use self::resources::SlotBuffers;
use self::types::{
    bind_group_from, chunk_steps_to_emit, completion, particle_footprint, plan_capacity, Bank,
    ReduceAttrs, TrackAttrs,
};

/// Host-side contract of the advance/reduce kernel pair.
///
/// `advance` mutates slot state for one bank; `reduce` folds the density
/// accumulator into the global map. Any backend exposing this contract can
/// sit under the worker pipeline.
pub trait ParticleHost {
    fn particles_per_bank(&self) -> u32;

    /// Write a seed into `slot`: record transferred, code set to active,
    /// step counter zeroed, optional per-slot feature state cleared.
    fn write_particle(&mut self, record: &ParticleRecord, slot: u32) -> Result<(), TrackError>;

    /// Mark `slot` dead: code back to the uninitialized sentinel, step
    /// counter zeroed so later whole-bank dumps emit nothing for it.
    fn retire_slot(&mut self, slot: u32) -> Result<(), TrackError>;

    /// Advance every active particle in `bank` by one batch of steps;
    /// blocks until the device finishes.
    fn run_advance(&mut self, bank: Bank) -> Result<(), TrackError>;

    /// Fold per-workgroup density into the global map; blocks.
    fn run_reduction(&mut self) -> Result<(), TrackError>;

    /// Read `count` completion codes starting at `offset`.
    fn read_status(&mut self, offset: u32, count: u32) -> Result<Vec<u32>, TrackError>;

    /// Read path fragments and step counters for `[offset, offset+count)`
    /// and emit retained positions to the sink.
    fn dump_path(&mut self, offset: u32, count: u32) -> Result<(), TrackError>;

    /// Reduction work shareable with the reducer pool, when the backend
    /// has any.
    fn shared_reducer(&self) -> Option<Arc<ReduceStage>> {
        None
    }
}

/// wgpu-backed handler for one device.
pub struct DeviceTracker {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    advance_pipeline: Arc<wgpu::ComputePipeline>,
    attrs: TrackAttrs,
    attrs_buf: wgpu::Buffer,
    flags: FeatureFlags,
    slots: SlotBuffers,
    slot_bg: wgpu::BindGroup,
    env_bg: wgpu::BindGroup,
    reduce_stage: Arc<ReduceStage>,
    dispatch_guard: Arc<Mutex<()>>,
    sink: Option<Arc<PathSink>>,
    first_dump: bool,
}

impl DeviceTracker {
    /// Size the resident particle population against the memory budget and
    /// allocate all per-slot state.
    ///
    /// Fails with the distinguished resource-exhaustion error when the
    /// budget cannot hold one workgroup per bank or a single allocation
    /// exceeds the device's buffer limits — the operator's recourse is a
    /// lower memory-risk fraction, not a retry.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        advance_pipeline: Arc<wgpu::ComputePipeline>,
        reduce_pipeline: Arc<wgpu::ComputePipeline>,
        mut attrs: TrackAttrs,
        sink: Option<Arc<PathSink>>,
        workgroup_size: u32,
        env: &EnvironmentData,
        global_density: &wgpu::Buffer,
    ) -> Result<Self, TrackError> {
        // The environment is authoritative for geometry and features.
        attrs.sample_nx = env.nx;
        attrs.sample_ny = env.ny;
        attrs.sample_nz = env.nz;
        attrs.n_samples = env.n_samples;
        attrs.n_waypoint_masks = env.n_waypoint_masks;
        attrs.lx = env.lx;
        attrs.ly = env.ly;
        attrs.lz = env.lz;
        attrs.save_paths = u32::from(env.flags.save_paths);
        attrs.loopcheck = u32::from(env.flags.loopcheck);
        attrs.exclusion = u32::from(env.flags.exclusion_mask);
        attrs.slot_offset = 0;

        let footprint = particle_footprint(&attrs, workgroup_size);
        let (num_wg, particles_per_bank) =
            plan_capacity(env.dynamic_mem_left, footprint, workgroup_size);
        if num_wg == 0 {
            return Err(TrackError::OutOfDeviceMemory {
                required: 2 * u64::from(workgroup_size) * footprint,
                budget: env.dynamic_mem_left,
            });
        }
        attrs.num_wg = num_wg;
        attrs.particles_per_bank = particles_per_bank;

        let limits = device.limits();
        let largest = resources::largest_allocation(&attrs, &env.flags);
        let max_alloc = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        if largest > max_alloc {
            return Err(TrackError::OutOfDeviceMemory {
                required: largest,
                budget: max_alloc,
            });
        }

        println!(
            "  Allocating {particles_per_bank} particles per bank in {num_wg} workgroups \
             ({footprint} B per particle)"
        );

        let slots = resources::allocate_slot_buffers(&device, &queue, &attrs, &env.flags);

        let attrs_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("track_attrs"),
            size: std::mem::size_of::<TrackAttrs>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let slot_bg = bind_group_from(
            &device,
            "slot_state",
            &advance_pipeline.get_bind_group_layout(0),
            &[
                &attrs_buf,
                &slots.particles,
                &slots.visited_sets,
                slots.paths.buffer(),
                &slots.step_counts,
                &slots.completion,
                &slots.local_density,
                slots.waypoints.buffer(),
                slots.exclusion.buffer(),
                slots.loopcheck.buffer(),
            ],
        );
        let env_bg = bind_group_from(
            &device,
            "environment",
            &advance_pipeline.get_bind_group_layout(1),
            &[
                &env.sample_sets[0].f,
                &env.sample_sets[0].phi,
                &env.sample_sets[0].theta,
                &env.sample_sets[1].f,
                &env.sample_sets[1].phi,
                &env.sample_sets[1].theta,
                &env.brain_mask,
                env.waypoint_masks.buffer(),
                env.termination_mask.buffer(),
                env.exclusion_mask.buffer(),
            ],
        );

        use wgpu::util::DeviceExt;
        let reduce_attrs = ReduceAttrs {
            nx: env.nx,
            ny: env.ny,
            nz: env.nz,
            num_wg,
        };
        let reduce_attrs_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("reduce_attrs"),
            contents: bytemuck::bytes_of(&reduce_attrs),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let reduce_bg = bind_group_from(
            &device,
            "reduce",
            &reduce_pipeline.get_bind_group_layout(0),
            &[&reduce_attrs_buf, &slots.local_density, global_density],
        );

        let dispatch_guard = Arc::new(Mutex::new(()));
        let reduce_stage = Arc::new(ReduceStage::new(
            device.clone(),
            queue.clone(),
            reduce_pipeline,
            reduce_bg,
            (env.nx.div_ceil(4), env.ny.div_ceil(4), env.nz.div_ceil(4)),
            dispatch_guard.clone(),
        ));

        Ok(Self {
            device,
            queue,
            advance_pipeline,
            attrs,
            attrs_buf,
            flags: env.flags,
            slots,
            slot_bg,
            env_bg,
            reduce_stage,
            dispatch_guard,
            sink,
            first_dump: true,
        })
    }

    /// The attrs the handler settled on (bank size, workgroup count).
    pub fn attrs(&self) -> &TrackAttrs {
        &self.attrs
    }

    /// Explicit host-side zeroing of one slot's visited-set region.
    ///
    /// The pipeline never calls this: the observed design leaves the
    /// visited set untouched on particle rewrite, relying on the kernel to
    /// self-initialize it when a fresh particle starts. The hook exists so
    /// that reading can be forced either way without touching the kernel.
    pub fn reset_visited_set(&self, slot: u32) -> Result<(), TrackError> {
        let bytes = types::visited_set_bytes(self.attrs.max_steps);
        let zeros = vec![0u8; bytes as usize];
        self.queue
            .write_buffer(&self.slots.visited_sets, u64::from(slot) * bytes, &zeros);
        Ok(())
    }

    fn total_slots(&self) -> u32 {
        2 * self.attrs.particles_per_bank
    }
}

impl ParticleHost for DeviceTracker {
    fn particles_per_bank(&self) -> u32 {
        self.attrs.particles_per_bank
    }

    fn write_particle(&mut self, record: &ParticleRecord, slot: u32) -> Result<(), TrackError> {
        assert!(slot < self.total_slots(), "slot {slot} out of range");

        if let Some(sink) = &self.sink {
            sink.write_line(
                slot,
                [record.position[0], record.position[1], record.position[2]],
            )?;
        }

        self.queue.write_buffer(
            &self.slots.particles,
            u64::from(slot) * std::mem::size_of::<ParticleRecord>() as u64,
            bytemuck::bytes_of(record),
        );
        self.queue.write_buffer(
            &self.slots.completion,
            u64::from(slot) * 4,
            bytemuck::bytes_of(&completion::ACTIVE),
        );
        self.queue.write_buffer(
            &self.slots.step_counts,
            u64::from(slot) * 4,
            bytemuck::bytes_of(&0u32),
        );

        if self.flags.loopcheck {
            let lvoxels =
                u64::from(self.attrs.lx) * u64::from(self.attrs.ly) * u64::from(self.attrs.lz);
            let zeros = vec![0u8; (lvoxels * 16) as usize];
            self.queue.write_buffer(
                self.slots.loopcheck.buffer(),
                u64::from(slot) * lvoxels * 16,
                &zeros,
            );
        }
        if self.attrs.n_waypoint_masks > 0 {
            let zeros = vec![0u8; self.attrs.n_waypoint_masks as usize * 4];
            self.queue.write_buffer(
                self.slots.waypoints.buffer(),
                u64::from(slot) * u64::from(self.attrs.n_waypoint_masks) * 4,
                &zeros,
            );
        }
        if self.flags.exclusion_mask {
            self.queue.write_buffer(
                self.slots.exclusion.buffer(),
                u64::from(slot) * 4,
                bytemuck::bytes_of(&0u32),
            );
        }
        Ok(())
    }

    fn retire_slot(&mut self, slot: u32) -> Result<(), TrackError> {
        assert!(slot < self.total_slots(), "slot {slot} out of range");
        self.queue.write_buffer(
            &self.slots.completion,
            u64::from(slot) * 4,
            bytemuck::bytes_of(&completion::UNINITIALIZED),
        );
        self.queue.write_buffer(
            &self.slots.step_counts,
            u64::from(slot) * 4,
            bytemuck::bytes_of(&0u32),
        );
        Ok(())
    }

    fn run_advance(&mut self, bank: Bank) -> Result<(), TrackError> {
        let _ordered = self
            .dispatch_guard
            .lock()
            .map_err(|_| TrackError::GpuCompute("dispatch guard poisoned".into()))?;

        // Attrs go to the device verbatim each dispatch; the slot offset is
        // the only field that varies between banks.
        let mut attrs = self.attrs;
        attrs.slot_offset = bank.base_slot(self.attrs.particles_per_bank);
        self.queue
            .write_buffer(&self.attrs_buf, 0, bytemuck::bytes_of(&attrs));

        dispatch::run_compute(
            &self.device,
            &self.queue,
            &self.advance_pipeline,
            &[&self.slot_bg, &self.env_bg],
            (self.attrs.num_wg, 1, 1),
            "advance_particles",
        );
        Ok(())
    }

    fn run_reduction(&mut self) -> Result<(), TrackError> {
        self.reduce_stage.run()
    }

    fn read_status(&mut self, offset: u32, count: u32) -> Result<Vec<u32>, TrackError> {
        dispatch::read_back_u32(
            &self.device,
            &self.queue,
            &self.slots.completion,
            offset,
            count,
            "status_readback",
        )
    }

    fn dump_path(&mut self, offset: u32, count: u32) -> Result<(), TrackError> {
        if !self.flags.save_paths {
            return Ok(());
        }
        let Some(sink) = self.sink.clone() else {
            return Ok(());
        };

        // The first harvest reads a bank that has never been dispatched;
        // the buffers hold allocation garbage which must never reach the
        // sink.
        if self.first_dump {
            self.first_dump = false;
            return Ok(());
        }

        let spk = self.attrs.steps_per_kernel;
        let fragments = dispatch::read_back_vec4(
            &self.device,
            &self.queue,
            self.slots.paths.buffer(),
            u64::from(offset) * u64::from(spk),
            u64::from(count) * u64::from(spk),
            "path_readback",
        )?;
        let counters = dispatch::read_back_u32(
            &self.device,
            &self.queue,
            &self.slots.step_counts,
            offset,
            count,
            "step_readback",
        )?;

        let mut block = String::new();
        for id in 0..count as usize {
            let emit = chunk_steps_to_emit(counters[id], spk) as usize;
            for step in 0..emit {
                let p = fragments[id * spk as usize + step];
                block.push_str(&PathSink::format_line(
                    offset + id as u32,
                    [p[0], p[1], p[2]],
                ));
            }
        }
        if !block.is_empty() {
            sink.write_block(&block)?;
        }
        Ok(())
    }

    fn shared_reducer(&self) -> Option<Arc<ReduceStage>> {
        Some(self.reduce_stage.clone())
    }
}

#[cfg(test)]
mod tests {
    #[test]
    #[ignore = "requires GPU"]
    fn tracker_init_on_real_device() {
        // Covered by the track binary on hardware; init + one advance +
        // status read-back is the smoke path.
    }
}
