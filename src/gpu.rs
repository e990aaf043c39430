//! Core GPU context and device management.
//!
//! [`GpuContext`] holds the wgpu device and queue the [`WgpuRenderer`] draws
//! with. The composer never presents anything itself, so no surface is
//! involved: either request a headless device, or hand over the device and
//! queue an application already owns.
//!
//! # Example
//!
//! ```no_run
//! use hoplite_fx::{GpuContext, WgpuRenderer};
//!
//! let gpu = GpuContext::headless()?;
//! let renderer = WgpuRenderer::new(&gpu);
//! # Ok::<(), hoplite_fx::renderer::RendererError>(())
//! ```
//!
//! [`WgpuRenderer`]: crate::WgpuRenderer

use crate::config::ShaderLimits;
use crate::renderer::RendererError;

/// Device and queue used for rendering.
///
/// Both handles are reference counted by wgpu, so the context is cheap to
/// clone and share with the renderer.
#[derive(Clone)]
pub struct GpuContext {
    /// The logical GPU device for creating resources and pipelines.
    pub device: wgpu::Device,
    /// The command queue for submitting work to the GPU.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Request a device without a surface.
    ///
    /// This creates a wgpu instance with the primary backends, picks the
    /// default adapter and creates the logical device with default limits.
    pub fn headless() -> Result<Self, RendererError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| RendererError::Device(format!("no suitable GPU adapter: {e}")))?;

        let info = adapter.get_info();
        tracing::info!("Using adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Hoplite FX Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| RendererError::Device(format!("failed to create device: {e}")))?;

        Ok(Self { device, queue })
    }

    /// Wrap a device and queue created elsewhere.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }

    /// Shader limits matching this device.
    pub fn shader_limits(&self) -> ShaderLimits {
        ShaderLimits::from_wgpu(&self.device.limits())
    }
}
