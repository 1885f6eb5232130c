// SPDX-License-Identifier: AGPL-3.0-only

//! Per-slot device buffer allocation for one tracker.
//!
//! All per-particle state exists in `2 * particles_per_bank` slots split
//! into two banks; the density accumulator is per-workgroup and not
//! bank-scoped. This is the heaviest one-time setup call; nothing here is
//! reallocated during a run.

use crate::environment::FeatureFlags;
use crate::tracker::types::{completion, visited_set_bytes, MaskBuffer, TrackAttrs};

pub(super) struct SlotBuffers {
    /// Particle records, 64 B per slot.
    pub particles: wgpu::Buffer,
    /// Per-particle visited-set structures; layout belongs to the kernel.
    pub visited_sets: wgpu::Buffer,
    /// Path-history fragments, `steps_per_kernel` positions per slot.
    pub paths: MaskBuffer,
    /// Per-slot step counters.
    pub step_counts: wgpu::Buffer,
    /// Per-slot completion codes.
    pub completion: wgpu::Buffer,
    /// Per-workgroup density accumulator, `voxels * num_wg` cells.
    pub local_density: wgpu::Buffer,
    /// Per-slot waypoint-hit bitmaps.
    pub waypoints: MaskBuffer,
    /// Per-slot exclusion flags.
    pub exclusion: MaskBuffer,
    /// Per-slot loop-check visit history.
    pub loopcheck: MaskBuffer,
}

/// Largest single buffer the attrs/flags combination will allocate, for the
/// construction-time check against device limits.
pub(super) fn largest_allocation(attrs: &TrackAttrs, flags: &FeatureFlags) -> u64 {
    let total_slots = 2 * u64::from(attrs.particles_per_bank);
    let mut largest = total_slots * std::mem::size_of::<crate::seed::ParticleRecord>() as u64;
    largest = largest.max(total_slots * visited_set_bytes(attrs.max_steps));
    largest = largest.max(attrs.voxels() * u64::from(attrs.num_wg) * 4);
    if flags.save_paths {
        largest = largest.max(total_slots * u64::from(attrs.steps_per_kernel) * 16);
    }
    if attrs.n_waypoint_masks > 0 {
        largest = largest.max(total_slots * u64::from(attrs.n_waypoint_masks) * 4);
    }
    if flags.loopcheck {
        let lvoxels = u64::from(attrs.lx) * u64::from(attrs.ly) * u64::from(attrs.lz);
        largest = largest.max(total_slots * lvoxels * 16);
    }
    largest
}

pub(super) fn allocate_slot_buffers(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    attrs: &TrackAttrs,
    flags: &FeatureFlags,
) -> SlotBuffers {
    let total_slots = 2 * u64::from(attrs.particles_per_bank);

    let make_storage = |label: &str, size: u64, extra: wgpu::BufferUsages| {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE | extra,
            mapped_at_creation: false,
        })
    };

    let particles = make_storage(
        "particles",
        total_slots * std::mem::size_of::<crate::seed::ParticleRecord>() as u64,
        wgpu::BufferUsages::COPY_DST,
    );
    let visited_sets = make_storage(
        "visited_sets",
        total_slots * visited_set_bytes(attrs.max_steps),
        wgpu::BufferUsages::COPY_DST,
    );
    let step_counts = make_storage(
        "step_counts",
        total_slots * 4,
        wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
    );
    let completion_buf = make_storage(
        "completion",
        total_slots * 4,
        wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
    );

    // Not doubled: every workgroup folds into the same slice whichever bank
    // it is processing. wgpu zero-initializes fresh buffers, which is the
    // accumulator's required starting state.
    let local_density = make_storage(
        "local_density",
        attrs.voxels() * u64::from(attrs.num_wg) * 4,
        wgpu::BufferUsages::empty(),
    );

    let paths = if flags.save_paths {
        MaskBuffer::present(make_storage(
            "paths",
            total_slots * u64::from(attrs.steps_per_kernel) * 16,
            wgpu::BufferUsages::COPY_SRC,
        ))
    } else {
        MaskBuffer::absent(device, "paths_absent")
    };

    let waypoints = if attrs.n_waypoint_masks > 0 {
        MaskBuffer::present(make_storage(
            "waypoints",
            total_slots * u64::from(attrs.n_waypoint_masks) * 4,
            wgpu::BufferUsages::COPY_DST,
        ))
    } else {
        MaskBuffer::absent(device, "waypoints_absent")
    };

    let exclusion = if flags.exclusion_mask {
        MaskBuffer::present(make_storage(
            "exclusion",
            total_slots * 4,
            wgpu::BufferUsages::COPY_DST,
        ))
    } else {
        MaskBuffer::absent(device, "exclusion_absent")
    };

    let loopcheck = if flags.loopcheck {
        let lvoxels = u64::from(attrs.lx) * u64::from(attrs.ly) * u64::from(attrs.lz);
        MaskBuffer::present(make_storage(
            "loopcheck",
            total_slots * lvoxels * 16,
            wgpu::BufferUsages::COPY_DST,
        ))
    } else {
        MaskBuffer::absent(device, "loopcheck_absent")
    };

    // Every slot starts at the uninitialized sentinel: no live particle
    // resident until the host writes a seed.
    let sentinels = vec![completion::UNINITIALIZED; total_slots as usize];
    queue.write_buffer(&completion_buf, 0, bytemuck::cast_slice(&sentinels));

    SlotBuffers {
        particles,
        visited_sets,
        paths,
        step_counts,
        completion: completion_buf,
        local_density,
        waypoints,
        exclusion,
        loopcheck,
    }
}
