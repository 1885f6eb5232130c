// SPDX-License-Identifier: AGPL-3.0-only

//! Device-visible types and host-side sizing policy for the tracker.
//!
//! Contains the argument uniforms (matching the WGSL shader structs
//! byte-for-byte), completion-code constants, the per-particle footprint and
//! capacity-planning functions that enforce the memory budget, the tagged
//! optional-buffer handle, and small bind-group helpers.

use bytemuck::{Pod, Zeroable};

use crate::seed::ParticleRecord;

/// Completion codes as the host sees them. The advance kernel owns the
/// terminal reasons (1..=7); the host writes only `ACTIVE` when seeding a
/// slot and `UNINITIALIZED` when retiring one.
pub mod completion {
    /// Slot holds a live particle; the advance kernel steps it.
    pub const ACTIVE: u32 = 0;
    /// Reserved sentinel: no live particle resident. Set at allocation and
    /// on retirement; distinct from every in-kernel termination reason.
    pub const UNINITIALIZED: u32 = 8;
}

/// One of the two equal partitions of per-slot state. Harvest/refill runs on
/// one bank while the device computes the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Zero,
    One,
}

impl Bank {
    /// The other bank.
    pub fn flip(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    /// 0 or 1, for indexing per-bank bookkeeping.
    pub fn index(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }

    /// First slot of this bank.
    pub fn base_slot(self, particles_per_bank: u32) -> u32 {
        self.index() as u32 * particles_per_bank
    }
}

/// Simulation attributes, copied verbatim into the device argument uniform
/// before every advance dispatch. Must match `Attrs` in
/// `shaders/advance.wgsl`.
///
/// `slot_offset` is the wgpu stand-in for an NDRange global offset: it
/// selects which bank the dispatch walks, and is the only field the handler
/// rewrites between dispatches.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct TrackAttrs {
    pub steps_per_kernel: u32,
    pub max_steps: u32,
    pub particles_per_bank: u32,
    pub slot_offset: u32,
    pub sample_nx: u32,
    pub sample_ny: u32,
    pub sample_nz: u32,
    pub n_samples: u32,
    pub n_waypoint_masks: u32,
    pub lx: u32,
    pub ly: u32,
    pub lz: u32,
    pub num_wg: u32,
    pub save_paths: u32,
    pub loopcheck: u32,
    pub exclusion: u32,
    pub curvature_threshold: f32,
    pub step_length: f32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl TrackAttrs {
    /// Volume voxel count.
    pub fn voxels(&self) -> u64 {
        u64::from(self.sample_nx) * u64::from(self.sample_ny) * u64::from(self.sample_nz)
    }
}

/// Arguments for the reduction kernel. Must match `ReduceAttrs` in
/// `shaders/reduce.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct ReduceAttrs {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub num_wg: u32,
}

/// Visited-set footprint for one particle: a compact search structure bound
/// to `max_steps` capacity, rounded up to a 16-byte boundary. The internal
/// layout belongs to the device kernel; the host only sizes it.
pub fn visited_set_bytes(max_steps: u32) -> u64 {
    let steps = u64::from(max_steps.max(1));
    let depth = (steps as f64).log2().ceil() as u64;
    let raw = steps * 8 + 2 * depth * 2 * 2 + 2 * 2;
    raw.div_ceil(16) * 16
}

/// Total device bytes one particle slot costs, including the slot's
/// amortized share of the per-workgroup density accumulator.
pub fn particle_footprint(attrs: &TrackAttrs, workgroup_size: u32) -> u64 {
    let mut size = std::mem::size_of::<ParticleRecord>() as u64;
    size += 4; // completion code
    size += 4; // step counter
    size += visited_set_bytes(attrs.max_steps);

    // Density accumulator is voxels * num_wg cells shared by
    // 2 * particles_per_bank slots, i.e. voxels / workgroup_size / 2 each.
    size += (attrs.voxels() / u64::from(workgroup_size) / 2 + 1) * 4;

    if attrs.save_paths != 0 {
        size += u64::from(attrs.steps_per_kernel) * 16;
    }
    if attrs.n_waypoint_masks > 0 {
        size += u64::from(attrs.n_waypoint_masks) * 4;
    }
    if attrs.exclusion != 0 {
        size += 4;
    }
    if attrs.loopcheck != 0 {
        size += u64::from(attrs.lx) * u64::from(attrs.ly) * u64::from(attrs.lz) * 16;
    }
    size
}

/// Pick the workgroup count and bank size for a memory budget.
///
/// Returns `(workgroup_count, particles_per_bank)`; the trailing halving
/// reserves headroom for the second bank, so
/// `2 * particles_per_bank * footprint <= budget` always holds. A zero
/// workgroup count means the budget cannot hold even one workgroup per bank.
pub fn plan_capacity(budget: u64, footprint: u64, workgroup_size: u32) -> (u32, u32) {
    let max_particles = budget / footprint;
    let num_wg = (max_particles / u64::from(workgroup_size) / 2) as u32;
    (num_wg, workgroup_size * num_wg)
}

/// How many positions of a slot's current path chunk are real output.
///
/// A counter at a nonzero multiple of `steps_per_kernel` means the slot just
/// filled a whole chunk; anything else means the slot stopped mid-chunk and
/// only the leading `counter % steps_per_kernel` positions were written this
/// chunk — the rest is the previous chunk's stale tail.
pub fn chunk_steps_to_emit(step_count: u32, steps_per_kernel: u32) -> u32 {
    if step_count != 0 && step_count % steps_per_kernel == 0 {
        steps_per_kernel
    } else {
        step_count % steps_per_kernel
    }
}

/// Tagged optional device buffer. Disabled features still bind a placeholder
/// so the kernel's argument signature is fixed regardless of configuration.
pub enum MaskBuffer {
    Present(wgpu::Buffer),
    Absent(wgpu::Buffer),
}

impl MaskBuffer {
    pub fn present(buffer: wgpu::Buffer) -> Self {
        Self::Present(buffer)
    }

    /// A 16-byte placeholder standing in for a disabled feature's buffer.
    pub fn absent(device: &wgpu::Device, label: &str) -> Self {
        Self::Absent(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        }))
    }

    /// The buffer to bind — real or placeholder.
    pub fn buffer(&self) -> &wgpu::Buffer {
        match self {
            Self::Present(b) | Self::Absent(b) => b,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Create a bind group binding `buffers` in order at bindings 0, 1, 2, ...
pub fn bind_group_from(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, buf)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buf.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_attrs() -> TrackAttrs {
        TrackAttrs {
            steps_per_kernel: 10,
            max_steps: 2000,
            particles_per_bank: 0,
            slot_offset: 0,
            sample_nx: 64,
            sample_ny: 64,
            sample_nz: 32,
            n_samples: 1,
            n_waypoint_masks: 0,
            lx: 16,
            ly: 16,
            lz: 8,
            num_wg: 0,
            save_paths: 0,
            loopcheck: 0,
            exclusion: 0,
            curvature_threshold: 0.2,
            step_length: 0.5,
            _pad0: 0,
            _pad1: 0,
        }
    }

    #[test]
    fn attrs_uniform_is_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<TrackAttrs>() % 16, 0);
        assert_eq!(std::mem::size_of::<ReduceAttrs>(), 16);
    }

    #[test]
    fn visited_set_rounds_to_16() {
        for steps in [1, 2, 10, 100, 2000, 65535] {
            assert_eq!(visited_set_bytes(steps) % 16, 0);
        }
        // max_steps=10: 80 + 2*4*4 + 4 = 116 -> 128
        assert_eq!(visited_set_bytes(10), 128);
    }

    #[test]
    fn visited_set_grows_with_max_steps() {
        let mut last = 0;
        for steps in [10, 20, 40, 80, 1000, 10_000] {
            let size = visited_set_bytes(steps);
            assert!(size > last);
            last = size;
        }
    }

    #[test]
    fn footprint_increases_with_max_steps() {
        let mut attrs = base_attrs();
        let small = particle_footprint(&attrs, 64);
        attrs.max_steps *= 2;
        assert!(particle_footprint(&attrs, 64) > small);
    }

    #[test]
    fn footprint_flag_deltas_are_exact() {
        let attrs = base_attrs();
        let base = particle_footprint(&attrs, 64);

        let mut with_paths = attrs;
        with_paths.save_paths = 1;
        assert_eq!(
            particle_footprint(&with_paths, 64),
            base + u64::from(attrs.steps_per_kernel) * 16
        );

        let mut with_waypoints = attrs;
        with_waypoints.n_waypoint_masks = 3;
        assert_eq!(particle_footprint(&with_waypoints, 64), base + 3 * 4);

        let mut with_exclusion = attrs;
        with_exclusion.exclusion = 1;
        assert_eq!(particle_footprint(&with_exclusion, 64), base + 4);

        let mut with_loopcheck = attrs;
        with_loopcheck.loopcheck = 1;
        assert_eq!(
            particle_footprint(&with_loopcheck, 64),
            base + 16 * 16 * 8 * 16
        );
    }

    #[test]
    fn capacity_never_exceeds_budget() {
        let mut attrs = base_attrs();
        attrs.save_paths = 1;
        attrs.loopcheck = 1;
        attrs.exclusion = 1;
        attrs.n_waypoint_masks = 2;
        let footprint = particle_footprint(&attrs, 64);
        for budget in [
            footprint,
            footprint * 3,
            footprint * 128,
            footprint * 129 + 7,
            footprint * 100_000,
        ] {
            let (_, ppb) = plan_capacity(budget, footprint, 64);
            assert!(2 * u64::from(ppb) * footprint <= budget);
        }
    }

    #[test]
    fn capacity_is_monotone_in_budget() {
        let attrs = base_attrs();
        let footprint = particle_footprint(&attrs, 64);
        let mut last_ppb = 0;
        for mult in [1u64, 2, 10, 100, 1000, 5000] {
            let (_, ppb) = plan_capacity(footprint * mult * 64, footprint, 64);
            assert!(ppb >= last_ppb);
            last_ppb = ppb;
        }
    }

    #[test]
    fn capacity_scenario_four_per_bank() {
        // Budget sized for exactly 4 particles per bank at workgroup size 2.
        let attrs = base_attrs();
        let footprint = particle_footprint(&attrs, 2);
        let (num_wg, ppb) = plan_capacity(8 * footprint, footprint, 2);
        assert_eq!(num_wg, 2);
        assert_eq!(ppb, 4);
    }

    #[test]
    fn chunk_emission_rule() {
        // Full chunks emit the whole chunk.
        assert_eq!(chunk_steps_to_emit(10, 10), 10);
        assert_eq!(chunk_steps_to_emit(30, 10), 10);
        // Mid-chunk emits only the fresh prefix.
        assert_eq!(chunk_steps_to_emit(13, 10), 3);
        assert_eq!(chunk_steps_to_emit(9, 10), 9);
        // Untouched slots emit nothing.
        assert_eq!(chunk_steps_to_emit(0, 10), 0);
    }

    #[test]
    fn bank_addressing() {
        assert_eq!(Bank::Zero.flip(), Bank::One);
        assert_eq!(Bank::One.flip(), Bank::Zero);
        assert_eq!(Bank::Zero.base_slot(128), 0);
        assert_eq!(Bank::One.base_slot(128), 128);
    }
}
