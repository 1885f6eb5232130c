// SPDX-License-Identifier: AGPL-3.0-only

//! GPU device context: adapter discovery, device/queue creation, and kernel
//! compilation.
//!
//! ## Adapter selection
//!
//! Set `FIBERTRACE_GPU_ADAPTER` to target a specific GPU:
//!
//! | Value | Behavior |
//! |-------|----------|
//! | `auto` / unset | Prefer a discrete adapter, else the first usable one |
//! | `0`, `1`, … | Select adapter by enumeration index |
//! | substring | Case-insensitive name match (e.g. `"titan"`, `"4070"`) |
//!
//! Use [`GpuContext::enumerate_adapters`] to list GPUs before selecting.
//! `FIBERTRACE_WGPU_BACKEND` (`vulkan`/`metal`/`dx12`) restricts the backend.

use std::sync::Arc;

use crate::error::TrackError;

/// Advance-kernel workgroup size. Compiled into the WGSL, so the value here
/// and `@workgroup_size` in `shaders/advance.wgsl` must agree.
pub const WORKGROUP_SIZE: u32 = 64;

const ADVANCE_SHADER: &str = include_str!("shaders/advance.wgsl");
const REDUCE_SHADER: &str = include_str!("shaders/reduce.wgsl");

/// Summary of a discovered GPU adapter.
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    /// Enumeration index (stable within a single run).
    pub index: usize,
    /// Adapter name as reported by the driver.
    pub name: String,
    /// Driver name (e.g. `"NVIDIA"`, `"radv"`).
    pub driver: String,
    /// Adapter device type (discrete, integrated, software, etc.).
    pub device_type: wgpu::DeviceType,
}

impl std::fmt::Display for AdapterSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.device_type {
            wgpu::DeviceType::DiscreteGpu => "discrete",
            wgpu::DeviceType::IntegratedGpu => "integrated",
            wgpu::DeviceType::VirtualGpu => "virtual",
            wgpu::DeviceType::Cpu => "cpu",
            wgpu::DeviceType::Other => "other",
        };
        write!(f, "[{}] {} ({}, {})", self.index, self.name, self.driver, kind)
    }
}

/// One device's context: device, queue, and compiled kernels come from here.
pub struct GpuContext {
    pub adapter_name: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    fn create_instance() -> wgpu::Instance {
        let backends = match std::env::var("FIBERTRACE_WGPU_BACKEND").as_deref() {
            Ok("vulkan") => wgpu::Backends::VULKAN,
            Ok("metal") => wgpu::Backends::METAL,
            Ok("dx12") => wgpu::Backends::DX12,
            _ => wgpu::Backends::all(),
        };
        wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        })
    }

    /// Enumerate all available GPU adapters.
    pub fn enumerate_adapters() -> Vec<AdapterSummary> {
        let instance = Self::create_instance();
        instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .enumerate()
            .map(|(i, adapter)| {
                let info = adapter.get_info();
                AdapterSummary {
                    index: i,
                    name: info.name.clone(),
                    driver: info.driver.clone(),
                    device_type: info.device_type,
                }
            })
            .collect()
    }

    /// Print all available adapters to stdout.
    pub fn print_available_adapters() {
        let adapters = Self::enumerate_adapters();
        println!("  Available GPU adapters:");
        for summary in &adapters {
            println!("    {summary}");
        }
        if adapters.is_empty() {
            println!("    (none found)");
        }
    }

    /// Create a device context for the adapter `selector` picks (see the
    /// module docs); an empty selector means auto-select.
    pub async fn new(selector: &str) -> Result<Self, TrackError> {
        let selector = selector.trim().to_lowercase();
        let instance = Self::create_instance();
        let adapters: Vec<wgpu::Adapter> = instance.enumerate_adapters(wgpu::Backends::all());
        if adapters.is_empty() {
            return Err(TrackError::NoAdapter);
        }

        let adapter = if selector.is_empty() || selector == "auto" {
            let mut chosen: Option<wgpu::Adapter> = None;
            let mut fallback: Option<wgpu::Adapter> = None;
            for a in adapters {
                if a.get_info().device_type == wgpu::DeviceType::DiscreteGpu && chosen.is_none() {
                    chosen = Some(a);
                } else if fallback.is_none() {
                    fallback = Some(a);
                }
            }
            chosen.or(fallback).ok_or(TrackError::NoAdapter)?
        } else if let Ok(idx) = selector.parse::<usize>() {
            if idx < adapters.len() {
                adapters.into_iter().nth(idx).ok_or(TrackError::NoAdapter)?
            } else {
                return Err(TrackError::DeviceCreation(format!(
                    "adapter index {idx} out of range ({} adapters)",
                    adapters.len()
                )));
            }
        } else {
            adapters
                .into_iter()
                .find(|a| a.get_info().name.to_ascii_lowercase().contains(&selector))
                .ok_or_else(|| {
                    TrackError::DeviceCreation(format!("No adapter matching '{selector}'"))
                })?
        };

        let adapter_name = adapter.get_info().name.clone();

        // The advance kernel binds 9 slot-state storage buffers plus 10
        // environment storage buffers (two sample sets of f/phi/theta and
        // four masks), so the default per-stage limit of 8 is far too low.
        let required_limits = wgpu::Limits {
            max_storage_buffers_per_shader_stage: 19,
            max_storage_buffer_binding_size: 512 * 1024 * 1024,
            max_buffer_size: 1024 * 1024 * 1024,
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("fibertrace device"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| TrackError::DeviceCreation(e.to_string()))?;

        Ok(Self {
            adapter_name,
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn device_arc(&self) -> Arc<wgpu::Device> {
        self.device.clone()
    }

    pub fn queue_arc(&self) -> Arc<wgpu::Queue> {
        self.queue.clone()
    }

    fn compile(&self, source: &str, entry_point: &str, label: &str) -> wgpu::ComputePipeline {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        self.device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
    }

    /// Compile the advance kernel.
    pub fn advance_pipeline(&self) -> Arc<wgpu::ComputePipeline> {
        Arc::new(self.compile(ADVANCE_SHADER, "advance_particles", "advance"))
    }

    /// Compile the reduction kernel.
    pub fn reduce_pipeline(&self) -> Arc<wgpu::ComputePipeline> {
        Arc::new(self.compile(REDUCE_SHADER, "reduce_density", "reduce"))
    }
}
