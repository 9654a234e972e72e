//! Deferred G-buffer pipeline
//!
//! One render pass, three subpasses over five attachments:
//!
//! 0. depth prepass — depth only, color writes masked off
//! 1. G-buffer — position/normal/albedo targets, depth test without write
//! 2. lighting — G-buffer read back as input attachments, fullscreen quad
//!    into the backbuffer
//!
//! Subpass advancement stays inside the single pass so tile-based GPUs keep
//! the G-buffer resident in attachment memory between phases. Every
//! dependency is by-region: each consumer reads exactly the pixel the
//! producer wrote.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::path::Path;

use crate::backend::{
    AccessMask, AttachmentDesc, AttachmentRef, AttachmentView, BackendError, BackendResult,
    BindingKind, BufferObject, BufferUsage, ClearValue, ColorTargetState, ColorWrites, CommandHandle,
    CompareOp, CullMode, DepthState, DescriptorSetHandle, DescriptorSetLayoutHandle,
    DescriptorWrite, FramebufferHandle, GraphicsPipelineDesc, ImageLayout, ImageObject,
    LayoutBinding, LoadOp, MemoryKind, PipelineHandle, PipelineLayoutHandle, PrimitiveTopology,
    RenderDevice, RenderPassDesc, RenderPassHandle, ShaderStages, StageMask, StoreOp, SubpassDesc,
    SubpassDependency, TextureFormat, TextureUsage, VertexAttributeDesc, VertexBinding,
    VertexFormat, SUBPASS_EXTERNAL,
};
use crate::pipeline::{LayoutId, PassId};
use crate::registry::Registry;

pub const ATTACH_BACKBUFFER: u32 = 0;
pub const ATTACH_DEPTH: u32 = 1;
pub const ATTACH_GBUFFER_POSITION: u32 = 2;
pub const ATTACH_GBUFFER_NORMAL: u32 = 3;
pub const ATTACH_GBUFFER_ALBEDO: u32 = 4;

pub const SUBPASS_DEPTH_PREPASS: u32 = 0;
pub const SUBPASS_GBUFFER: u32 = 1;
pub const SUBPASS_LIGHTING: u32 = 2;

// Geometry descriptor set (shared by prepass and G-buffer subpasses)
pub const GEOMETRY_BINDING_SCENE: u32 = 0;
pub const GEOMETRY_BINDING_MODEL: u32 = 1;
pub const GEOMETRY_BINDING_ALBEDO: u32 = 2;
pub const GEOMETRY_BINDING_SPECULAR: u32 = 3;

// Lighting descriptor set
pub const LIGHTING_BINDING_SCENE: u32 = 0;
pub const LIGHTING_BINDING_POSITION: u32 = 1;
pub const LIGHTING_BINDING_NORMAL: u32 = 2;
pub const LIGHTING_BINDING_ALBEDO: u32 = 3;

pub const MAX_POINT_LIGHTS: usize = 8;

/// Per-frame uniform block consumed by all three subpasses
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SceneParams {
    pub view: Mat4,
    pub proj: Mat4,
    pub camera_position: Vec4,
    pub light_dir: Vec4,
    /// xyz = position, w = radius
    pub point_lights: [Vec4; MAX_POINT_LIGHTS],
    pub point_light_colors: [Vec4; MAX_POINT_LIGHTS],
    pub frame_delta_time: f32,
    pub frame_count: u32,
    pub draw_flag: u32,
    pub _padding: u32,
}

impl Default for SceneParams {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            camera_position: Vec4::ZERO,
            light_dir: Vec4::new(0.0, -1.0, 0.0, 0.0),
            point_lights: [Vec4::ZERO; MAX_POINT_LIGHTS],
            point_light_colors: [Vec4::ZERO; MAX_POINT_LIGHTS],
            frame_delta_time: 0.0,
            frame_count: 0,
            draw_flag: 0,
            _padding: 0,
        }
    }
}

/// SPIR-V for the three subpass pipelines
pub struct ShaderSet {
    pub depth_prepass_vs: Vec<u32>,
    pub depth_prepass_fs: Vec<u32>,
    pub gbuffer_vs: Vec<u32>,
    pub gbuffer_fs: Vec<u32>,
    pub lighting_vs: Vec<u32>,
    pub lighting_fs: Vec<u32>,
}

impl ShaderSet {
    /// Load the pre-compiled `.spv` files from a shader directory.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> BackendResult<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| -> BackendResult<Vec<u32>> {
            let path = dir.join(name);
            let mut file = std::fs::File::open(&path).map_err(|e| {
                BackendError::PipelineCreationFailed(format!("{}: {e}", path.display()))
            })?;
            ash::util::read_spv(&mut file).map_err(|e| {
                BackendError::PipelineCreationFailed(format!("{}: {e}", path.display()))
            })
        };
        Ok(Self {
            depth_prepass_vs: read("depth_prepass.vert.spv")?,
            depth_prepass_fs: read("depth_prepass.frag.spv")?,
            gbuffer_vs: read("gbuffer.vert.spv")?,
            gbuffer_fs: read("gbuffer.frag.spv")?,
            lighting_vs: read("deferred_lighting.vert.spv")?,
            lighting_fs: read("deferred_lighting.frag.spv")?,
        })
    }
}

/// Build the three-subpass deferred render-pass description.
pub fn render_pass_desc(surface_format: TextureFormat) -> RenderPassDesc {
    let attachments = vec![
        // Backbuffer: cleared, stored, handed to the overlay pass
        AttachmentDesc {
            format: surface_format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ColorAttachment,
        },
        // Depth: cleared, stored, reused by all three subpasses
        AttachmentDesc {
            format: TextureFormat::Depth32Float,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::DepthStencilAttachment,
        },
        // G-buffer position (world space)
        AttachmentDesc {
            format: TextureFormat::Rgba32Float,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ColorAttachment,
        },
        // G-buffer normal
        AttachmentDesc {
            format: TextureFormat::Rgba16Float,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ColorAttachment,
        },
        // G-buffer albedo
        AttachmentDesc {
            format: TextureFormat::Rgba8Unorm,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ColorAttachment,
        },
    ];

    let depth_ref = AttachmentRef {
        attachment: ATTACH_DEPTH,
        layout: ImageLayout::DepthStencilAttachment,
    };
    let gbuffer_out = |attachment| AttachmentRef {
        attachment,
        layout: ImageLayout::ColorAttachment,
    };
    let gbuffer_in = |attachment| AttachmentRef {
        attachment,
        layout: ImageLayout::ShaderReadOnly,
    };

    let subpasses = vec![
        // Depth prepass: depth only, no color attachments
        SubpassDesc {
            input_attachments: Vec::new(),
            color_attachments: Vec::new(),
            depth_stencil_attachment: Some(depth_ref),
        },
        // G-buffer fill
        SubpassDesc {
            input_attachments: Vec::new(),
            color_attachments: vec![
                gbuffer_out(ATTACH_GBUFFER_POSITION),
                gbuffer_out(ATTACH_GBUFFER_NORMAL),
                gbuffer_out(ATTACH_GBUFFER_ALBEDO),
            ],
            depth_stencil_attachment: Some(depth_ref),
        },
        // Lighting: G-buffer in, backbuffer out
        SubpassDesc {
            input_attachments: vec![
                gbuffer_in(ATTACH_GBUFFER_POSITION),
                gbuffer_in(ATTACH_GBUFFER_NORMAL),
                gbuffer_in(ATTACH_GBUFFER_ALBEDO),
            ],
            color_attachments: vec![AttachmentRef {
                attachment: ATTACH_BACKBUFFER,
                layout: ImageLayout::ColorAttachment,
            }],
            depth_stencil_attachment: None,
        },
    ];

    let dependencies = vec![
        SubpassDependency {
            src_subpass: SUBPASS_EXTERNAL,
            dst_subpass: SUBPASS_DEPTH_PREPASS,
            src_stage: StageMask::BOTTOM_OF_PIPE,
            dst_stage: StageMask::COLOR_ATTACHMENT_OUTPUT,
            src_access: AccessMask::MEMORY_READ,
            dst_access: AccessMask::COLOR_ATTACHMENT_READ | AccessMask::COLOR_ATTACHMENT_WRITE,
            by_region: true,
        },
        SubpassDependency {
            src_subpass: SUBPASS_DEPTH_PREPASS,
            dst_subpass: SUBPASS_GBUFFER,
            src_stage: StageMask::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: StageMask::FRAGMENT_SHADER,
            src_access: AccessMask::COLOR_ATTACHMENT_WRITE,
            dst_access: AccessMask::SHADER_READ,
            by_region: true,
        },
        SubpassDependency {
            src_subpass: SUBPASS_GBUFFER,
            dst_subpass: SUBPASS_LIGHTING,
            src_stage: StageMask::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: StageMask::FRAGMENT_SHADER,
            src_access: AccessMask::COLOR_ATTACHMENT_WRITE,
            dst_access: AccessMask::SHADER_READ,
            by_region: true,
        },
        SubpassDependency {
            src_subpass: SUBPASS_LIGHTING,
            dst_subpass: SUBPASS_EXTERNAL,
            src_stage: StageMask::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: StageMask::BOTTOM_OF_PIPE,
            src_access: AccessMask::COLOR_ATTACHMENT_READ | AccessMask::COLOR_ATTACHMENT_WRITE,
            dst_access: AccessMask::MEMORY_READ,
            by_region: true,
        },
    ];

    RenderPassDesc {
        attachments,
        subpasses,
        dependencies,
    }
}

/// Build the non-clearing overlay pass over backbuffer + depth. UI draws in
/// here; the backbuffer leaves it present-ready.
pub fn overlay_pass_desc(surface_format: TextureFormat) -> RenderPassDesc {
    RenderPassDesc {
        attachments: vec![
            AttachmentDesc {
                format: surface_format,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
                initial_layout: ImageLayout::ColorAttachment,
                final_layout: ImageLayout::PresentSrc,
            },
            AttachmentDesc {
                format: TextureFormat::Depth32Float,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
                initial_layout: ImageLayout::DepthStencilAttachment,
                final_layout: ImageLayout::DepthStencilAttachment,
            },
        ],
        subpasses: vec![SubpassDesc {
            input_attachments: Vec::new(),
            color_attachments: vec![AttachmentRef {
                attachment: 0,
                layout: ImageLayout::ColorAttachment,
            }],
            depth_stencil_attachment: Some(AttachmentRef {
                attachment: 1,
                layout: ImageLayout::DepthStencilAttachment,
            }),
        }],
        dependencies: Vec::new(),
    }
}

fn geometry_vertex_layout() -> (Vec<VertexBinding>, Vec<VertexAttributeDesc>) {
    let bindings = vec![
        VertexBinding {
            binding: 0,
            stride: 12,
        },
        VertexBinding {
            binding: 1,
            stride: 12,
        },
        VertexBinding {
            binding: 2,
            stride: 8,
        },
        VertexBinding {
            binding: 3,
            stride: 12,
        },
    ];
    let attributes = vec![
        VertexAttributeDesc {
            location: 0,
            binding: 0,
            format: VertexFormat::Float32x3,
            offset: 0,
        },
        VertexAttributeDesc {
            location: 1,
            binding: 1,
            format: VertexFormat::Float32x3,
            offset: 0,
        },
        VertexAttributeDesc {
            location: 2,
            binding: 2,
            format: VertexFormat::Float32x2,
            offset: 0,
        },
        VertexAttributeDesc {
            location: 3,
            binding: 3,
            format: VertexFormat::Float32x3,
            offset: 0,
        },
    ];
    (bindings, attributes)
}

/// Depth prepass pipeline: depth write on, color output masked to zero.
pub fn depth_prepass_pipeline_desc(
    vs: Vec<u32>,
    fs: Vec<u32>,
    layout: PipelineLayoutHandle,
    render_pass: RenderPassHandle,
) -> GraphicsPipelineDesc {
    let (vertex_bindings, vertex_attributes) = geometry_vertex_layout();
    GraphicsPipelineDesc {
        vertex_spirv: vs,
        fragment_spirv: fs,
        vertex_bindings,
        vertex_attributes,
        topology: PrimitiveTopology::TriangleList,
        cull_mode: CullMode::Back,
        depth: Some(DepthState {
            test_enable: true,
            write_enable: true,
            compare: CompareOp::Less,
        }),
        color_targets: vec![ColorTargetState {
            blend_enable: false,
            write_mask: ColorWrites::NONE,
        }],
        layout,
        render_pass,
        subpass: SUBPASS_DEPTH_PREPASS,
    }
}

/// G-buffer pipeline: depth test with less-or-equal, depth write off (depth
/// is final after the prepass), three opaque color targets.
pub fn gbuffer_pipeline_desc(
    vs: Vec<u32>,
    fs: Vec<u32>,
    layout: PipelineLayoutHandle,
    render_pass: RenderPassHandle,
) -> GraphicsPipelineDesc {
    let (vertex_bindings, vertex_attributes) = geometry_vertex_layout();
    GraphicsPipelineDesc {
        vertex_spirv: vs,
        fragment_spirv: fs,
        vertex_bindings,
        vertex_attributes,
        topology: PrimitiveTopology::TriangleList,
        cull_mode: CullMode::Back,
        depth: Some(DepthState {
            test_enable: true,
            write_enable: false,
            compare: CompareOp::LessEqual,
        }),
        color_targets: vec![
            ColorTargetState::opaque(),
            ColorTargetState::opaque(),
            ColorTargetState::opaque(),
        ],
        layout,
        render_pass,
        subpass: SUBPASS_GBUFFER,
    }
}

/// Lighting pipeline: no vertex input at all, the fullscreen quad is
/// generated in the vertex stage from the vertex index.
pub fn lighting_pipeline_desc(
    vs: Vec<u32>,
    fs: Vec<u32>,
    layout: PipelineLayoutHandle,
    render_pass: RenderPassHandle,
) -> GraphicsPipelineDesc {
    GraphicsPipelineDesc {
        vertex_spirv: vs,
        fragment_spirv: fs,
        vertex_bindings: Vec::new(),
        vertex_attributes: Vec::new(),
        topology: PrimitiveTopology::TriangleStrip,
        cull_mode: CullMode::None,
        depth: None,
        color_targets: vec![ColorTargetState::opaque()],
        layout,
        render_pass,
        subpass: SUBPASS_LIGHTING,
    }
}

/// The deferred pipeline instance: render targets, framebuffers, pipelines
/// and per-frame-image uniform/descriptor state.
pub struct DeferredPipeline {
    render_pass: RenderPassHandle,
    overlay_pass: RenderPassHandle,
    geometry_ds_layout: DescriptorSetLayoutHandle,
    geometry_layout: PipelineLayoutHandle,
    lighting_layout: PipelineLayoutHandle,

    depth_prepass_pipeline: PipelineHandle,
    gbuffer_pipeline: PipelineHandle,
    lighting_pipeline: PipelineHandle,

    rt_position: ImageObject,
    rt_normal: ImageObject,
    rt_albedo: ImageObject,
    depth_buffer: ImageObject,
    framebuffers: Vec<FramebufferHandle>,
    overlay_framebuffers: Vec<FramebufferHandle>,

    scene_uniforms: Vec<BufferObject>,
    lighting_sets: Vec<DescriptorSetHandle>,
}

impl DeferredPipeline {
    pub fn new<D: RenderDevice>(
        device: &mut D,
        render_passes: &mut Registry<PassId, RenderPassHandle>,
        ds_layouts: &mut Registry<LayoutId, DescriptorSetLayoutHandle>,
        pipeline_layouts: &mut Registry<LayoutId, PipelineLayoutHandle>,
        shaders: &ShaderSet,
    ) -> BackendResult<Self> {
        let surface_format = device.surface_format();
        let extent = device.surface_extent();
        let image_count = device.image_count();

        // Layouts, registered once and fetched by every consumer.
        let geometry_ds_layout = device.create_descriptor_set_layout(&[
            LayoutBinding {
                binding: GEOMETRY_BINDING_SCENE,
                kind: BindingKind::UniformBuffer,
                stages: ShaderStages::ALL,
            },
            LayoutBinding {
                binding: GEOMETRY_BINDING_MODEL,
                kind: BindingKind::UniformBuffer,
                stages: ShaderStages::ALL,
            },
            LayoutBinding {
                binding: GEOMETRY_BINDING_ALBEDO,
                kind: BindingKind::CombinedImageSampler,
                stages: ShaderStages::ALL,
            },
            LayoutBinding {
                binding: GEOMETRY_BINDING_SPECULAR,
                kind: BindingKind::CombinedImageSampler,
                stages: ShaderStages::ALL,
            },
        ])?;
        ds_layouts.register(LayoutId::Geometry, geometry_ds_layout)?;

        let lighting_ds_layout = device.create_descriptor_set_layout(&[
            LayoutBinding {
                binding: LIGHTING_BINDING_SCENE,
                kind: BindingKind::UniformBuffer,
                stages: ShaderStages::ALL,
            },
            LayoutBinding {
                binding: LIGHTING_BINDING_POSITION,
                kind: BindingKind::InputAttachment,
                stages: ShaderStages::FRAGMENT,
            },
            LayoutBinding {
                binding: LIGHTING_BINDING_NORMAL,
                kind: BindingKind::InputAttachment,
                stages: ShaderStages::FRAGMENT,
            },
            LayoutBinding {
                binding: LIGHTING_BINDING_ALBEDO,
                kind: BindingKind::InputAttachment,
                stages: ShaderStages::FRAGMENT,
            },
        ])?;
        ds_layouts.register(LayoutId::DeferredLighting, lighting_ds_layout)?;

        let geometry_layout = device.create_pipeline_layout(&[geometry_ds_layout])?;
        pipeline_layouts.register(LayoutId::Geometry, geometry_layout)?;

        let lighting_layout = device.create_pipeline_layout(&[lighting_ds_layout])?;
        pipeline_layouts.register(LayoutId::DeferredLighting, lighting_layout)?;

        // Render passes
        let render_pass = device.create_render_pass(&render_pass_desc(surface_format))?;
        render_passes.register(PassId::Deferred, render_pass)?;

        let overlay_pass = device.create_render_pass(&overlay_pass_desc(surface_format))?;
        render_passes.register(PassId::Overlay, overlay_pass)?;

        // Swapchain-sized targets
        let (rt_position, rt_normal, rt_albedo, depth_buffer) =
            Self::create_targets(device, extent)?;

        let framebuffers = Self::create_framebuffers(
            device,
            render_pass,
            overlay_pass,
            extent,
            image_count,
            &rt_position,
            &rt_normal,
            &rt_albedo,
            &depth_buffer,
        )?;

        // Per-image scene uniforms and lighting descriptor sets
        let mut scene_uniforms = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            scene_uniforms.push(device.create_buffer(
                std::mem::size_of::<SceneParams>() as u64,
                BufferUsage::UNIFORM,
                MemoryKind::HostVisible,
            )?);
        }

        let mut lighting_sets = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            lighting_sets.push(device.allocate_descriptor_set(lighting_ds_layout)?);
        }

        let mut pipeline = Self {
            render_pass,
            overlay_pass,
            geometry_ds_layout,
            geometry_layout,
            lighting_layout,
            depth_prepass_pipeline: device.create_graphics_pipeline(
                &depth_prepass_pipeline_desc(
                    shaders.depth_prepass_vs.clone(),
                    shaders.depth_prepass_fs.clone(),
                    geometry_layout,
                    render_pass,
                ),
            )?,
            gbuffer_pipeline: device.create_graphics_pipeline(&gbuffer_pipeline_desc(
                shaders.gbuffer_vs.clone(),
                shaders.gbuffer_fs.clone(),
                geometry_layout,
                render_pass,
            ))?,
            lighting_pipeline: device.create_graphics_pipeline(&lighting_pipeline_desc(
                shaders.lighting_vs.clone(),
                shaders.lighting_fs.clone(),
                lighting_layout,
                render_pass,
            ))?,
            rt_position,
            rt_normal,
            rt_albedo,
            depth_buffer,
            framebuffers: framebuffers.0,
            overlay_framebuffers: framebuffers.1,
            scene_uniforms,
            lighting_sets,
        };

        pipeline.write_lighting_sets(device);
        Ok(pipeline)
    }

    fn create_targets<D: RenderDevice>(
        device: &mut D,
        extent: (u32, u32),
    ) -> BackendResult<(ImageObject, ImageObject, ImageObject, ImageObject)> {
        let gbuffer_usage = TextureUsage::COLOR_ATTACHMENT | TextureUsage::INPUT_ATTACHMENT;
        let rt_position =
            device.create_texture(extent.0, extent.1, TextureFormat::Rgba32Float, gbuffer_usage)?;
        let rt_normal =
            device.create_texture(extent.0, extent.1, TextureFormat::Rgba16Float, gbuffer_usage)?;
        let rt_albedo =
            device.create_texture(extent.0, extent.1, TextureFormat::Rgba8Unorm, gbuffer_usage)?;
        let depth_buffer = device.create_texture(
            extent.0,
            extent.1,
            TextureFormat::Depth32Float,
            TextureUsage::DEPTH_STENCIL_ATTACHMENT,
        )?;
        Ok((rt_position, rt_normal, rt_albedo, depth_buffer))
    }

    #[allow(clippy::too_many_arguments)]
    fn create_framebuffers<D: RenderDevice>(
        device: &mut D,
        render_pass: RenderPassHandle,
        overlay_pass: RenderPassHandle,
        extent: (u32, u32),
        image_count: u32,
        rt_position: &ImageObject,
        rt_normal: &ImageObject,
        rt_albedo: &ImageObject,
        depth_buffer: &ImageObject,
    ) -> BackendResult<(Vec<FramebufferHandle>, Vec<FramebufferHandle>)> {
        let mut framebuffers = Vec::with_capacity(image_count as usize);
        let mut overlay_framebuffers = Vec::with_capacity(image_count as usize);
        for i in 0..image_count {
            framebuffers.push(device.create_framebuffer(
                render_pass,
                extent,
                &[
                    AttachmentView::SwapchainImage(i),
                    AttachmentView::Texture(depth_buffer.handle),
                    AttachmentView::Texture(rt_position.handle),
                    AttachmentView::Texture(rt_normal.handle),
                    AttachmentView::Texture(rt_albedo.handle),
                ],
            )?);
            overlay_framebuffers.push(device.create_framebuffer(
                overlay_pass,
                extent,
                &[
                    AttachmentView::SwapchainImage(i),
                    AttachmentView::Texture(depth_buffer.handle),
                ],
            )?);
        }
        Ok((framebuffers, overlay_framebuffers))
    }

    fn write_lighting_sets<D: RenderDevice>(&mut self, device: &mut D) {
        for (set, ubo) in self.lighting_sets.iter().zip(&self.scene_uniforms) {
            device.update_descriptor_set(
                *set,
                &[
                    DescriptorWrite::UniformBuffer {
                        binding: LIGHTING_BINDING_SCENE,
                        buffer: ubo.handle,
                    },
                    DescriptorWrite::InputAttachment {
                        binding: LIGHTING_BINDING_POSITION,
                        texture: self.rt_position.handle,
                    },
                    DescriptorWrite::InputAttachment {
                        binding: LIGHTING_BINDING_NORMAL,
                        texture: self.rt_normal.handle,
                    },
                    DescriptorWrite::InputAttachment {
                        binding: LIGHTING_BINDING_ALBEDO,
                        texture: self.rt_albedo.handle,
                    },
                ],
            );
        }
    }

    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    pub fn geometry_ds_layout(&self) -> DescriptorSetLayoutHandle {
        self.geometry_ds_layout
    }

    pub fn geometry_layout(&self) -> PipelineLayoutHandle {
        self.geometry_layout
    }

    pub fn scene_uniform(&self, image_index: u32) -> BufferObject {
        self.scene_uniforms[image_index as usize]
    }

    /// Write this image's per-frame uniform block. The caller has already
    /// waited on the image's fence, which serializes access to the buffer.
    pub fn update_scene_params<D: RenderDevice>(
        &self,
        device: &mut D,
        image_index: u32,
        params: &SceneParams,
    ) -> BackendResult<()> {
        device.write_buffer(
            self.scene_uniforms[image_index as usize].handle,
            bytemuck::bytes_of(params),
        )
    }

    /// Record the full deferred sequence plus the overlay pass into an
    /// already-recording command buffer.
    pub fn record<D, FG, FO>(
        &self,
        device: &mut D,
        command: CommandHandle,
        image_index: u32,
        mut draw_geometry: FG,
        mut draw_overlay: FO,
    ) -> BackendResult<()>
    where
        D: RenderDevice,
        FG: FnMut(&mut D, CommandHandle),
        FO: FnMut(&mut D, CommandHandle),
    {
        let extent = device.surface_extent();
        let clears = [
            ClearValue::Color([0.0, 0.0, 0.0, 0.0]),
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
            ClearValue::Color([0.0, 0.0, 0.0, 0.0]),
            ClearValue::Color([0.0, 0.0, 0.0, 0.0]),
            ClearValue::Color([0.0, 0.0, 0.0, 0.0]),
        ];

        device.cmd_begin_render_pass(
            command,
            self.render_pass,
            self.framebuffers[image_index as usize],
            extent,
            &clears,
        );
        device.cmd_set_viewport_scissor(command, extent);

        device.cmd_bind_pipeline(command, self.depth_prepass_pipeline);
        draw_geometry(device, command);

        device.cmd_next_subpass(command);
        device.cmd_bind_pipeline(command, self.gbuffer_pipeline);
        draw_geometry(device, command);

        device.cmd_next_subpass(command);
        device.cmd_bind_pipeline(command, self.lighting_pipeline);
        device.cmd_bind_descriptor_set(
            command,
            self.lighting_layout,
            self.lighting_sets[image_index as usize],
        );
        device.cmd_draw(command, 4);
        device.cmd_end_render_pass(command);

        // UI composition; loads the attachments and leaves the backbuffer
        // present-ready.
        device.cmd_begin_render_pass(
            command,
            self.overlay_pass,
            self.overlay_framebuffers[image_index as usize],
            extent,
            &[],
        );
        draw_overlay(device, command);
        device.cmd_end_render_pass(command);

        Ok(())
    }

    /// Recreate swapchain-sized resources after a resize. The swapchain
    /// itself has already been rebuilt.
    pub fn on_resize<D: RenderDevice>(&mut self, device: &mut D) -> BackendResult<()> {
        for framebuffer in self
            .framebuffers
            .drain(..)
            .chain(self.overlay_framebuffers.drain(..))
        {
            device.destroy_framebuffer(framebuffer);
        }
        device.destroy_texture(self.rt_position.handle);
        device.destroy_texture(self.rt_normal.handle);
        device.destroy_texture(self.rt_albedo.handle);
        device.destroy_texture(self.depth_buffer.handle);

        let extent = device.surface_extent();
        let (rt_position, rt_normal, rt_albedo, depth_buffer) =
            Self::create_targets(device, extent)?;
        self.rt_position = rt_position;
        self.rt_normal = rt_normal;
        self.rt_albedo = rt_albedo;
        self.depth_buffer = depth_buffer;

        let (framebuffers, overlay_framebuffers) = Self::create_framebuffers(
            device,
            self.render_pass,
            self.overlay_pass,
            extent,
            device.image_count(),
            &self.rt_position,
            &self.rt_normal,
            &self.rt_albedo,
            &self.depth_buffer,
        )?;
        self.framebuffers = framebuffers;
        self.overlay_framebuffers = overlay_framebuffers;

        // The lighting sets still point at the old G-buffer views.
        self.write_lighting_sets(device);
        Ok(())
    }

    /// Destroy everything this pipeline owns. Render passes and layouts are
    /// owned by the registries and disposed there.
    pub fn destroy<D: RenderDevice>(&mut self, device: &mut D) {
        for set in self.lighting_sets.drain(..) {
            device.free_descriptor_set(set);
        }
        for ubo in self.scene_uniforms.drain(..) {
            device.destroy_buffer(ubo.handle);
        }
        device.destroy_pipeline(self.depth_prepass_pipeline);
        device.destroy_pipeline(self.gbuffer_pipeline);
        device.destroy_pipeline(self.lighting_pipeline);
        for framebuffer in self
            .framebuffers
            .drain(..)
            .chain(self.overlay_framebuffers.drain(..))
        {
            device.destroy_framebuffer(framebuffer);
        }
        device.destroy_texture(self.rt_position.handle);
        device.destroy_texture(self.rt_normal.handle);
        device.destroy_texture(self.rt_albedo.handle);
        device.destroy_texture(self.depth_buffer.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_formats_and_ops() {
        let desc = render_pass_desc(TextureFormat::Bgra8UnormSrgb);
        assert_eq!(desc.attachments.len(), 5);

        let backbuffer = &desc.attachments[ATTACH_BACKBUFFER as usize];
        assert_eq!(backbuffer.format, TextureFormat::Bgra8UnormSrgb);
        assert_eq!(backbuffer.load_op, LoadOp::Clear);
        assert_eq!(backbuffer.store_op, StoreOp::Store);

        let depth = &desc.attachments[ATTACH_DEPTH as usize];
        assert_eq!(depth.format, TextureFormat::Depth32Float);
        assert_eq!(depth.load_op, LoadOp::Clear);
        assert_eq!(depth.store_op, StoreOp::Store);

        // G-buffer targets never survive the pass.
        for index in [
            ATTACH_GBUFFER_POSITION,
            ATTACH_GBUFFER_NORMAL,
            ATTACH_GBUFFER_ALBEDO,
        ] {
            let attachment = &desc.attachments[index as usize];
            assert_eq!(attachment.load_op, LoadOp::Clear);
            assert_eq!(attachment.store_op, StoreOp::DontCare);
        }
        assert_eq!(
            desc.attachments[ATTACH_GBUFFER_POSITION as usize].format,
            TextureFormat::Rgba32Float
        );
        assert_eq!(
            desc.attachments[ATTACH_GBUFFER_NORMAL as usize].format,
            TextureFormat::Rgba16Float
        );
        assert_eq!(
            desc.attachments[ATTACH_GBUFFER_ALBEDO as usize].format,
            TextureFormat::Rgba8Unorm
        );
    }

    #[test]
    fn subpass_shapes() {
        let desc = render_pass_desc(TextureFormat::Bgra8UnormSrgb);
        assert_eq!(desc.subpasses.len(), 3);

        let prepass = &desc.subpasses[SUBPASS_DEPTH_PREPASS as usize];
        assert!(prepass.color_attachments.is_empty());
        assert!(prepass.input_attachments.is_empty());
        assert_eq!(
            prepass.depth_stencil_attachment.map(|d| d.attachment),
            Some(ATTACH_DEPTH)
        );

        let gbuffer = &desc.subpasses[SUBPASS_GBUFFER as usize];
        assert_eq!(gbuffer.color_attachments.len(), 3);
        assert!(gbuffer.input_attachments.is_empty());
        assert_eq!(
            gbuffer.depth_stencil_attachment.map(|d| d.attachment),
            Some(ATTACH_DEPTH)
        );

        let lighting = &desc.subpasses[SUBPASS_LIGHTING as usize];
        assert_eq!(lighting.input_attachments.len(), 3);
        assert_eq!(lighting.color_attachments.len(), 1);
        assert_eq!(
            lighting.color_attachments[0].attachment,
            ATTACH_BACKBUFFER
        );
        assert!(lighting.depth_stencil_attachment.is_none());
        for input in &lighting.input_attachments {
            assert_eq!(input.layout, ImageLayout::ShaderReadOnly);
        }
    }

    #[test]
    fn dependency_chain_is_by_region() {
        let desc = render_pass_desc(TextureFormat::Bgra8UnormSrgb);
        assert_eq!(desc.dependencies.len(), 4);
        assert!(desc.dependencies.iter().all(|d| d.by_region));

        let edges: Vec<(u32, u32)> = desc
            .dependencies
            .iter()
            .map(|d| (d.src_subpass, d.dst_subpass))
            .collect();
        assert_eq!(
            edges,
            vec![
                (SUBPASS_EXTERNAL, SUBPASS_DEPTH_PREPASS),
                (SUBPASS_DEPTH_PREPASS, SUBPASS_GBUFFER),
                (SUBPASS_GBUFFER, SUBPASS_LIGHTING),
                (SUBPASS_LIGHTING, SUBPASS_EXTERNAL),
            ]
        );
    }

    #[test]
    fn gbuffer_to_lighting_waits_in_fragment_shader() {
        let desc = render_pass_desc(TextureFormat::Bgra8UnormSrgb);
        let dep = desc
            .dependencies
            .iter()
            .find(|d| d.src_subpass == SUBPASS_GBUFFER && d.dst_subpass == SUBPASS_LIGHTING)
            .expect("missing gbuffer → lighting dependency");
        assert!(dep.src_stage.contains(StageMask::COLOR_ATTACHMENT_OUTPUT));
        assert!(dep.dst_stage.contains(StageMask::FRAGMENT_SHADER));
        assert!(dep.src_access.contains(AccessMask::COLOR_ATTACHMENT_WRITE));
        assert!(dep.dst_access.contains(AccessMask::SHADER_READ));
    }

    #[test]
    fn prepass_masks_color_writes() {
        let desc = depth_prepass_pipeline_desc(
            vec![0],
            vec![0],
            PipelineLayoutHandle::from_raw(1),
            RenderPassHandle::from_raw(2),
        );
        assert_eq!(desc.subpass, SUBPASS_DEPTH_PREPASS);
        assert_eq!(desc.color_targets.len(), 1);
        assert_eq!(desc.color_targets[0].write_mask, ColorWrites::NONE);
        let depth = desc.depth.unwrap();
        assert!(depth.test_enable);
        assert!(depth.write_enable);
    }

    #[test]
    fn gbuffer_tests_depth_but_never_writes_it() {
        let desc = gbuffer_pipeline_desc(
            vec![0],
            vec![0],
            PipelineLayoutHandle::from_raw(1),
            RenderPassHandle::from_raw(2),
        );
        assert_eq!(desc.subpass, SUBPASS_GBUFFER);
        assert_eq!(desc.color_targets.len(), 3);
        let depth = desc.depth.unwrap();
        assert!(depth.test_enable);
        assert!(!depth.write_enable);
        assert_eq!(depth.compare, CompareOp::LessEqual);
    }

    #[test]
    fn lighting_generates_its_quad_in_the_vertex_stage() {
        let desc = lighting_pipeline_desc(
            vec![0],
            vec![0],
            PipelineLayoutHandle::from_raw(1),
            RenderPassHandle::from_raw(2),
        );
        assert_eq!(desc.subpass, SUBPASS_LIGHTING);
        assert!(desc.vertex_bindings.is_empty());
        assert!(desc.vertex_attributes.is_empty());
        assert_eq!(desc.topology, PrimitiveTopology::TriangleStrip);
        assert!(desc.depth.is_none());
    }
}
