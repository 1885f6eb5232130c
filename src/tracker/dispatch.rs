// SPDX-License-Identifier: AGPL-3.0-only

//! Blocking dispatch and staging read-back for the tracker.
//!
//! Every dispatch submits one encoder and waits the queue out — the pipeline
//! gets its overlap from double-buffered banks and the reducer pool, never
//! from multiple in-flight dispatches on one device. Read-back goes through
//! a transient staging buffer: copy, `map_async` into an mpsc channel,
//! `poll(Wait)`, receive.

use std::sync::{Arc, Mutex};

use crate::error::TrackError;

/// Submit one compute pass and block until the device finishes it.
pub(crate) fn run_compute(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pipeline: &wgpu::ComputePipeline,
    bind_groups: &[&wgpu::BindGroup],
    workgroups: (u32, u32, u32),
    label: &str,
) {
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some(label),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        for (i, bg) in bind_groups.iter().enumerate() {
            pass.set_bind_group(i as u32, bg, &[]);
        }
        pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
    }
    queue.submit(std::iter::once(encoder.finish()));
    device.poll(wgpu::Maintain::Wait);
}

/// Blocking read of `len` bytes from `src` starting at `offset`.
pub(crate) fn read_back_bytes(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    offset: u64,
    len: u64,
    label: &str,
) -> Result<Vec<u8>, TrackError> {
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: len,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some(label),
    });
    encoder.copy_buffer_to_buffer(src, offset, &staging, 0, len);
    queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    receiver
        .recv()
        .map_err(|_| TrackError::GpuCompute(format!("{label}: map channel closed")))?
        .map_err(|e| TrackError::GpuCompute(format!("{label}: buffer mapping: {e}")))?;

    let data = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(data)
}

/// Blocking read of `count` u32 values starting at element `offset`.
pub(crate) fn read_back_u32(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    offset: u32,
    count: u32,
    label: &str,
) -> Result<Vec<u32>, TrackError> {
    let bytes = read_back_bytes(
        device,
        queue,
        src,
        u64::from(offset) * 4,
        u64::from(count) * 4,
        label,
    )?;
    Ok(bytemuck::cast_slice(&bytes).to_vec())
}

/// Blocking read of `count` vec4<f32> values starting at element `offset`.
pub(crate) fn read_back_vec4(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    offset: u64,
    count: u64,
    label: &str,
) -> Result<Vec<[f32; 4]>, TrackError> {
    let bytes = read_back_bytes(device, queue, src, offset * 16, count * 16, label)?;
    let floats: &[f32] = bytemuck::cast_slice(&bytes);
    Ok(floats
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect())
}

/// Everything a reduction dispatch needs, shareable with the reducer pool.
///
/// The dispatch guard serializes reductions against advance dispatches on
/// the same device: the accumulator must never be folded while an advance
/// kernel is writing it. Repeating a reduction is safe — the kernel clears
/// each accumulator cell as it folds, so a second fold adds zeros.
pub struct ReduceStage {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group: wgpu::BindGroup,
    workgroups: (u32, u32, u32),
    guard: Arc<Mutex<()>>,
}

impl ReduceStage {
    pub(crate) fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        pipeline: Arc<wgpu::ComputePipeline>,
        bind_group: wgpu::BindGroup,
        workgroups: (u32, u32, u32),
        guard: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            device,
            queue,
            pipeline,
            bind_group,
            workgroups,
            guard,
        }
    }

    /// Fold every workgroup's accumulator slice into the global density map,
    /// blocking until the device finishes.
    pub fn run(&self) -> Result<(), TrackError> {
        let _ordered = self
            .guard
            .lock()
            .map_err(|_| TrackError::GpuCompute("dispatch guard poisoned".into()))?;
        run_compute(
            &self.device,
            &self.queue,
            &self.pipeline,
            &[&self.bind_group],
            self.workgroups,
            "reduce_density",
        );
        Ok(())
    }
}
