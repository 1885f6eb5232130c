// SPDX-License-Identifier: AGPL-3.0-only

//! Device-resident environment: diffusion-sample volumes, masks, the global
//! density map, and the remaining device-memory budget.
//!
//! The environment is prepared once per device and is read-only to the
//! tracker. Sample data is uploaded as two alternating buffer sets so the
//! producer can stream the next Monte-Carlo repeat while the current one is
//! being consumed — independent of the tracker's particle double-buffering.
//! The global density buffer lives here because it must outlive every
//! handler that folds into it.

use wgpu::util::DeviceExt;

use crate::error::TrackError;
use crate::tracker::types::MaskBuffer;

/// Optional tracker features. Each enabled feature grows the per-particle
/// footprint and enables one optional kernel argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    /// Stream every particle's path positions to the output sink.
    pub save_paths: bool,
    /// Track per-particle loop-check history on a coarse grid.
    pub loopcheck: bool,
    /// Terminate particles entering the exclusion mask.
    pub exclusion_mask: bool,
}

/// One diffusion-sample volume (f/phi/theta triple) from the sample manager,
/// `nx*ny*nz*ns` values each in x-fastest order.
pub struct VolumeSamples {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub ns: u32,
    pub f: Vec<f32>,
    pub phi: Vec<f32>,
    pub theta: Vec<f32>,
}

impl VolumeSamples {
    fn expected_len(&self) -> usize {
        (self.nx as usize) * (self.ny as usize) * (self.nz as usize) * (self.ns as usize)
    }

    fn validate(&self) -> Result<(), TrackError> {
        let want = self.expected_len();
        if self.f.len() != want || self.phi.len() != want || self.theta.len() != want {
            return Err(TrackError::DataLoad(format!(
                "sample volume is {}x{}x{}x{} = {want} values, got f={} phi={} theta={}",
                self.nx,
                self.ny,
                self.nz,
                self.ns,
                self.f.len(),
                self.phi.len(),
                self.theta.len()
            )));
        }
        Ok(())
    }

    fn byte_len(&self) -> u64 {
        3 * self.expected_len() as u64 * 4
    }
}

/// Mask volumes from the sample manager, each `nx*ny*nz` values
/// (nonzero = inside).
#[derive(Default)]
pub struct MaskVolumes {
    pub brain: Vec<u32>,
    pub waypoints: Vec<Vec<u32>>,
    pub termination: Option<Vec<u32>>,
    pub exclusion: Option<Vec<u32>>,
}

/// Environment sizing knobs.
pub struct EnvironmentConfig {
    /// Device memory assumed available, in bytes.
    pub total_device_memory: u64,
    /// Fraction of `total_device_memory` the run may claim.
    pub mem_risk: f64,
    /// Stream particle paths to the sink.
    pub save_paths: bool,
    /// Enable loop-check history.
    pub loopcheck: bool,
}

/// One uploaded f/phi/theta buffer set.
pub struct SampleSet {
    pub f: wgpu::Buffer,
    pub phi: wgpu::Buffer,
    pub theta: wgpu::Buffer,
}

/// Everything the tracker consumes read-only: volume geometry, feature
/// flags, the remaining memory budget, and the device buffers prepared here.
pub struct EnvironmentData {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub n_samples: u32,
    /// Loop-check grid dimensions (quarter resolution of the volume).
    pub lx: u32,
    pub ly: u32,
    pub lz: u32,
    pub n_waypoint_masks: u32,
    pub flags: FeatureFlags,
    /// Bytes left for per-particle state after the resident uploads.
    pub dynamic_mem_left: u64,
    /// Two alternating sample sets for double-buffered repeat streaming.
    pub sample_sets: [SampleSet; 2],
    pub brain_mask: wgpu::Buffer,
    pub waypoint_masks: MaskBuffer,
    pub termination_mask: MaskBuffer,
    pub exclusion_mask: MaskBuffer,
    /// Global density map, one u32 per voxel; outlives every handler.
    pub global_density: wgpu::Buffer,
}

impl EnvironmentData {
    pub fn voxels(&self) -> u64 {
        u64::from(self.nx) * u64::from(self.ny) * u64::from(self.nz)
    }

    /// Read the accumulated global density map back to the host.
    pub fn read_density(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<Vec<u32>, TrackError> {
        crate::tracker::dispatch::read_back_u32(
            device,
            queue,
            &self.global_density,
            0,
            self.voxels() as u32,
            "global_density_readback",
        )
    }
}

/// Budget left after the resident uploads, or the distinguished
/// resource-exhaustion error when the uploads alone exceed it.
fn remaining_budget(total: u64, mem_risk: f64, resident: u64) -> Result<u64, TrackError> {
    let budget = (total as f64 * mem_risk) as u64;
    budget
        .checked_sub(resident)
        .ok_or(TrackError::OutOfDeviceMemory {
            required: resident,
            budget,
        })
}

fn upload_f32(device: &wgpu::Device, label: &str, data: &[f32]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(data),
        usage: wgpu::BufferUsages::STORAGE,
    })
}

fn upload_u32(device: &wgpu::Device, label: &str, data: &[u32]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(data),
        usage: wgpu::BufferUsages::STORAGE,
    })
}

fn upload_set(device: &wgpu::Device, tag: &str, samples: &VolumeSamples) -> SampleSet {
    SampleSet {
        f: upload_f32(device, &format!("f_samples_{tag}"), &samples.f),
        phi: upload_f32(device, &format!("phi_samples_{tag}"), &samples.phi),
        theta: upload_f32(device, &format!("theta_samples_{tag}"), &samples.theta),
    }
}

/// Upload sample volumes and masks, and compute the remaining budget.
///
/// `next` is the second sample set for repeat streaming; when the run has a
/// single repeat the current set is uploaded to both slots so the kernel's
/// argument arity stays fixed.
pub fn allocate_environment(
    device: &wgpu::Device,
    current: &VolumeSamples,
    next: Option<&VolumeSamples>,
    masks: &MaskVolumes,
    cfg: &EnvironmentConfig,
) -> Result<EnvironmentData, TrackError> {
    current.validate()?;
    if let Some(next) = next {
        next.validate()?;
    }

    let voxels = (current.nx as usize) * (current.ny as usize) * (current.nz as usize);
    if masks.brain.len() != voxels {
        return Err(TrackError::DataLoad(format!(
            "brain mask is {} values, volume has {voxels} voxels",
            masks.brain.len()
        )));
    }
    for (i, mask) in masks.waypoints.iter().enumerate() {
        if mask.len() != voxels {
            return Err(TrackError::DataLoad(format!(
                "waypoint mask {i} is {} values, volume has {voxels} voxels",
                mask.len()
            )));
        }
    }

    let set_a = upload_set(device, "a", current);
    let set_b = upload_set(device, "b", next.unwrap_or(current));
    let brain_mask = upload_u32(device, "brain_mask", &masks.brain);

    let waypoint_masks = if masks.waypoints.is_empty() {
        MaskBuffer::absent(device, "waypoint_masks_absent")
    } else {
        let concat: Vec<u32> = masks.waypoints.iter().flatten().copied().collect();
        MaskBuffer::present(upload_u32(device, "waypoint_masks", &concat))
    };
    let termination_mask = match &masks.termination {
        Some(data) => MaskBuffer::present(upload_u32(device, "termination_mask", data)),
        None => MaskBuffer::absent(device, "termination_mask_absent"),
    };
    let exclusion_mask = match &masks.exclusion {
        Some(data) => MaskBuffer::present(upload_u32(device, "exclusion_mask", data)),
        None => MaskBuffer::absent(device, "exclusion_mask_absent"),
    };

    let global_density = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("global_density"),
        size: voxels as u64 * 4,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });

    let mut resident = current.byte_len()
        + next.unwrap_or(current).byte_len()
        + masks.brain.len() as u64 * 4
        + voxels as u64 * 4; // global density
    resident += masks.waypoints.len() as u64 * voxels as u64 * 4;
    if masks.termination.is_some() {
        resident += voxels as u64 * 4;
    }
    if masks.exclusion.is_some() {
        resident += voxels as u64 * 4;
    }

    let dynamic_mem_left = remaining_budget(cfg.total_device_memory, cfg.mem_risk, resident)?;

    Ok(EnvironmentData {
        nx: current.nx,
        ny: current.ny,
        nz: current.nz,
        n_samples: current.ns,
        lx: current.nx.div_ceil(4),
        ly: current.ny.div_ceil(4),
        lz: current.nz.div_ceil(4),
        n_waypoint_masks: masks.waypoints.len() as u32,
        flags: FeatureFlags {
            save_paths: cfg.save_paths,
            loopcheck: cfg.loopcheck,
            exclusion_mask: masks.exclusion.is_some(),
        },
        dynamic_mem_left,
        sample_sets: [set_a, set_b],
        brain_mask,
        waypoint_masks,
        termination_mask,
        exclusion_mask,
        global_density,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_budget_subtracts_resident() {
        let left = remaining_budget(1_000_000, 0.5, 100_000).expect("budget");
        assert_eq!(left, 400_000);
    }

    #[test]
    fn remaining_budget_exhaustion_is_distinguished() {
        let err = remaining_budget(1_000_000, 0.1, 200_000).expect_err("over budget");
        match err {
            TrackError::OutOfDeviceMemory { required, budget } => {
                assert_eq!(required, 200_000);
                assert_eq!(budget, 100_000);
            }
            other => panic!("wrong variant: {other}"),
        }
    }

    #[test]
    fn sample_volume_validation_checks_lengths() {
        let bad = VolumeSamples {
            nx: 4,
            ny: 4,
            nz: 4,
            ns: 1,
            f: vec![0.0; 64],
            phi: vec![0.0; 64],
            theta: vec![0.0; 63],
        };
        assert!(bad.validate().is_err());
    }
}
