//! wgpu implementation of [`Renderer`].
//!
//! Every frame is recorded into a single command encoder: `begin_frame`
//! creates it, each draw records one render pass, and `end_frame` submits.
//! Each program owns its uniform buffers. A program is drawn at most once
//! per frame, so writing them through the queue before submission is safe.
//!
//! Pipelines depend on the formats of the attachments they write, which are
//! only known at draw time. They are built lazily and cached per program and
//! format set.

use std::collections::HashMap;

use super::{Binding, Draw, FrameUniforms, Renderer, RendererError};
use crate::gpu::GpuContext;
use crate::synth::{CompiledProgram, TextureSource};
use crate::target_pool::TargetDescriptor;

/// A pool-owned texture.
pub struct WgpuTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
}

/// A caller-supplied texture view (scene buffers, the surface).
///
/// Depth views are read with `textureLoad`. Color and velocity views are
/// sampled with a filtering sampler, so their formats must be filterable.
#[derive(Clone)]
pub struct WgpuView {
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
}

impl WgpuView {
    pub fn new(view: wgpu::TextureView, format: wgpu::TextureFormat) -> Self {
        Self { view, format }
    }
}

pub struct WgpuProgram {
    id: u64,
    label: String,
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    frame_buffer: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
}

pub struct WgpuRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    sampler: wgpu::Sampler,
    pipelines: HashMap<(u64, Vec<wgpu::TextureFormat>), wgpu::RenderPipeline>,
    encoder: Option<wgpu::CommandEncoder>,
    next_program: u64,
}

impl WgpuRenderer {
    pub fn new(gpu: &GpuContext) -> Self {
        let sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Composer Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Self {
            device: gpu.device.clone(),
            queue: gpu.queue.clone(),
            sampler,
            pipelines: HashMap::new(),
            encoder: None,
            next_program: 0,
        }
    }

    fn view<'a>(binding: &'a Binding<'_, Self>) -> (&'a wgpu::TextureView, wgpu::TextureFormat) {
        match binding {
            Binding::Target(target) => (&target.view, target.format),
            Binding::External(view) => (&view.view, view.format),
        }
    }

    fn texture_entry(binding: u32, source: &TextureSource) -> wgpu::BindGroupLayoutEntry {
        let sample_type = match source {
            TextureSource::Depth => wgpu::TextureSampleType::Depth,
            _ => wgpu::TextureSampleType::Float { filterable: true },
        };
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type,
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        }
    }

    fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    fn pipeline(
        &mut self,
        program: &WgpuProgram,
        formats: Vec<wgpu::TextureFormat>,
    ) -> Result<&wgpu::RenderPipeline, RendererError> {
        let key = (program.id, formats);
        if !self.pipelines.contains_key(&key) {
            let targets: Vec<Option<wgpu::ColorTargetState>> = key
                .1
                .iter()
                .map(|format| {
                    Some(wgpu::ColorTargetState {
                        format: *format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })
                })
                .collect();

            self.device.push_error_scope(wgpu::ErrorFilter::Validation);
            let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(program.label.as_str()),
                layout: Some(&program.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: Some("vs"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: Some("fs"),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
            if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
                return Err(RendererError::Compile(format!("{}: {error}", program.label)));
            }
            self.pipelines.insert(key.clone(), pipeline);
        }
        self.pipelines
            .get(&key)
            .ok_or_else(|| RendererError::Device("pipeline cache miss".into()))
    }
}

impl Renderer for WgpuRenderer {
    type Target = WgpuTarget;
    type View = WgpuView;
    type Program = WgpuProgram;

    fn create_target(&mut self, descriptor: &TargetDescriptor) -> Result<WgpuTarget, RendererError> {
        let format = descriptor.format.to_wgpu();

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(descriptor.label.as_str()),
            size: wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RendererError::OutOfMemory(format!("{}: {error}", descriptor.label)));
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(WgpuTarget {
            texture,
            view,
            format,
        })
    }

    fn release_target(&mut self, target: WgpuTarget) {
        target.texture.destroy();
    }

    fn compile(&mut self, program: &CompiledProgram) -> Result<WgpuProgram, RendererError> {
        let device = &self.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.label.as_str()),
            source: wgpu::ShaderSource::Wgsl(program.source.as_str().into()),
        });

        let mut entries = vec![
            Self::uniform_entry(0),
            Self::uniform_entry(1),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ];
        entries.extend(
            program
                .textures
                .iter()
                .map(|t| Self::texture_entry(t.binding, &t.source)),
        );
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(program.label.as_str()),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.label.as_str()),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(RendererError::Compile(error.to_string()));
        }

        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composer Frame Uniforms"),
            size: std::mem::size_of::<FrameUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composer Group Params"),
            size: (program.params.len().max(1) * std::mem::size_of::<[f32; 4]>()) as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.next_program += 1;
        Ok(WgpuProgram {
            id: self.next_program,
            label: program.label.clone(),
            module,
            bind_group_layout,
            pipeline_layout,
            frame_buffer,
            params_buffer,
        })
    }

    fn release_program(&mut self, program: WgpuProgram) {
        self.pipelines.retain(|(id, _), _| *id != program.id);
        program.frame_buffer.destroy();
        program.params_buffer.destroy();
    }

    fn begin_frame(&mut self) -> Result<(), RendererError> {
        if self.encoder.is_some() {
            return Err(RendererError::Draw("frame already open".into()));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.encoder = Some(self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Composer Encoder"),
        }));
        Ok(())
    }

    fn draw(&mut self, draw: &Draw<'_, Self>) -> Result<(), RendererError> {
        let program = draw.program;

        self.queue
            .write_buffer(&program.frame_buffer, 0, bytemuck::cast_slice(&[draw.frame]));
        if !draw.params.is_empty() {
            self.queue
                .write_buffer(&program.params_buffer, 0, bytemuck::cast_slice(draw.params));
        }

        let (output_view, output_format) = Self::view(&draw.output);
        let side: Vec<_> = draw.side_outputs.iter().map(Self::view).collect();
        let formats = std::iter::once(output_format)
            .chain(side.iter().map(|(_, f)| *f))
            .collect();
        let pipeline = self.pipeline(program, formats)?.clone();

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: program.frame_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: program.params_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            },
        ];
        for texture in &draw.textures {
            entries.push(wgpu::BindGroupEntry {
                binding: texture.binding,
                resource: wgpu::BindingResource::TextureView(Self::view(&texture.texture).0),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(draw.label),
            layout: &program.bind_group_layout,
            entries: &entries,
        });

        let color_attachments: Vec<_> = std::iter::once(output_view)
            .chain(side.iter().map(|(v, _)| *v))
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| RendererError::Draw(format!("{}: no open frame", draw.label)))?;
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(draw.label),
            color_attachments: &color_attachments,
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(&pipeline);
        render_pass.set_bind_group(0, &bind_group, &[]);
        render_pass.draw(0..3, 0..1);
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), RendererError> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| RendererError::Draw("no open frame".into()))?;
        self.queue.submit(std::iter::once(encoder.finish()));

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(wgpu::Error::OutOfMemory { source }) => {
                Err(RendererError::OutOfMemory(source.to_string()))
            }
            Some(error) => Err(RendererError::Draw(error.to_string())),
            None => Ok(()),
        }
    }
}
