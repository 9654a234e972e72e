//! Shared test backend
//!
//! `MockDevice` implements `RenderDevice` with no GPU: it hands out fake
//! handles, tracks which are alive, models fence signaled state and records
//! an event stream that tests assert ordering properties against.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use vk_sample_engine::backend::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acquire,
    WaitFence(u64),
    ResetFence(u64),
    BeginCommand(u64),
    EndCommand(u64),
    Submit { command: u64, fence: u64 },
    SubmitAndWait(u64),
    Present(u32),
    CopyBuffer { src: u64, dst: u64, size: u64 },
    CopyBufferToTexture { src: u64, dst: u64 },
}

pub struct MockDevice {
    next_id: u64,
    image_count: u32,
    extent: (u32, u32),
    next_image: u32,
    /// When true, every acquire reports the surface as out of date.
    pub out_of_date: bool,
    pub events: Vec<Event>,

    buffers: HashMap<u64, (u64, MemoryKind)>,
    textures: HashSet<u64>,
    samplers: HashSet<u64>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashSet<u64>,
    pipelines: HashSet<u64>,
    pipeline_layouts: HashSet<u64>,
    ds_layouts: HashSet<u64>,
    descriptor_sets: HashSet<u64>,
    commands: HashSet<u64>,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
}

impl MockDevice {
    pub fn new(image_count: u32) -> Self {
        Self {
            next_id: 1,
            image_count,
            extent: (640, 480),
            next_image: 0,
            out_of_date: false,
            events: Vec::new(),
            buffers: HashMap::new(),
            textures: HashSet::new(),
            samplers: HashSet::new(),
            render_passes: HashMap::new(),
            framebuffers: HashSet::new(),
            pipelines: HashSet::new(),
            pipeline_layouts: HashSet::new(),
            ds_layouts: HashSet::new(),
            descriptor_sets: HashSet::new(),
            commands: HashSet::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.descriptor_sets.len()
    }

    /// Every live handle of every kind; zero after a clean teardown.
    pub fn live_handles(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.samplers.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.pipelines.len()
            + self.pipeline_layouts.len()
            + self.ds_layouts.len()
            + self.descriptor_sets.len()
            + self.commands.len()
            + self.fences.len()
            + self.semaphores.len()
    }

    pub fn submit_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Submit { .. }))
            .count()
    }

    pub fn begin_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::BeginCommand(_)))
            .count()
    }
}

impl RenderDevice for MockDevice {
    fn image_count(&self) -> u32 {
        self.image_count
    }

    fn surface_extent(&self) -> (u32, u32) {
        self.extent
    }

    fn surface_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn create_buffer(
        &mut self,
        size: u64,
        _usage: BufferUsage,
        memory: MemoryKind,
    ) -> BackendResult<BufferObject> {
        if size == 0 {
            return Err(BackendError::BufferCreationFailed(
                "zero-sized buffer".into(),
            ));
        }
        let id = self.next_id();
        self.buffers.insert(id, (size, memory));
        Ok(BufferObject {
            handle: BufferHandle::from_raw(id),
            size,
        })
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.as_raw());
    }

    fn write_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> BackendResult<()> {
        let &(size, memory) = self
            .buffers
            .get(&buffer.as_raw())
            .ok_or(BackendError::UnknownHandle("buffer"))?;
        if memory != MemoryKind::HostVisible {
            return Err(BackendError::HostWriteFailed(
                "buffer is not host-visible".into(),
            ));
        }
        if data.len() as u64 > size {
            return Err(BackendError::HostWriteFailed(format!(
                "write of {} bytes exceeds buffer size {size}",
                data.len()
            )));
        }
        Ok(())
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        _usage: TextureUsage,
    ) -> BackendResult<ImageObject> {
        let id = self.next_id();
        self.textures.insert(id);
        Ok(ImageObject {
            handle: TextureHandle::from_raw(id),
            width,
            height,
            format,
        })
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.as_raw());
    }

    fn create_sampler(&mut self, _desc: &SamplerDesc) -> BackendResult<SamplerHandle> {
        let id = self.next_id();
        self.samplers.insert(id);
        Ok(SamplerHandle::from_raw(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.as_raw());
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> BackendResult<RenderPassHandle> {
        let id = self.next_id();
        self.render_passes.insert(id, desc.clone());
        Ok(RenderPassHandle::from_raw(id))
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        self.render_passes.remove(&pass.as_raw());
    }

    fn create_framebuffer(
        &mut self,
        pass: RenderPassHandle,
        _extent: (u32, u32),
        _views: &[AttachmentView],
    ) -> BackendResult<FramebufferHandle> {
        if !self.render_passes.contains_key(&pass.as_raw()) {
            return Err(BackendError::UnknownHandle("render pass"));
        }
        let id = self.next_id();
        self.framebuffers.insert(id);
        Ok(FramebufferHandle::from_raw(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.as_raw());
    }

    fn create_descriptor_set_layout(
        &mut self,
        _bindings: &[LayoutBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let id = self.next_id();
        self.ds_layouts.insert(id);
        Ok(DescriptorSetLayoutHandle::from_raw(id))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        self.ds_layouts.remove(&layout.as_raw());
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> BackendResult<PipelineLayoutHandle> {
        for layout in set_layouts {
            if !self.ds_layouts.contains(&layout.as_raw()) {
                return Err(BackendError::UnknownHandle("descriptor-set layout"));
            }
        }
        let id = self.next_id();
        self.pipeline_layouts.insert(id);
        Ok(PipelineLayoutHandle::from_raw(id))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        self.pipeline_layouts.remove(&layout.as_raw());
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        if !self.ds_layouts.contains(&layout.as_raw()) {
            return Err(BackendError::UnknownHandle("descriptor-set layout"));
        }
        let id = self.next_id();
        self.descriptor_sets.insert(id);
        Ok(DescriptorSetHandle::from_raw(id))
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) {
        self.descriptor_sets.remove(&set.as_raw());
    }

    fn update_descriptor_set(&mut self, _set: DescriptorSetHandle, _writes: &[DescriptorWrite]) {}

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        if !self.pipeline_layouts.contains(&desc.layout.as_raw()) {
            return Err(BackendError::UnknownHandle("pipeline layout"));
        }
        if !self.render_passes.contains_key(&desc.render_pass.as_raw()) {
            return Err(BackendError::UnknownHandle("render pass"));
        }
        let id = self.next_id();
        self.pipelines.insert(id);
        Ok(PipelineHandle::from_raw(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.as_raw());
    }

    fn allocate_command_buffer(&mut self) -> BackendResult<CommandHandle> {
        let id = self.next_id();
        self.commands.insert(id);
        Ok(CommandHandle::from_raw(id))
    }

    fn free_command_buffer(&mut self, command: CommandHandle) {
        self.commands.remove(&command.as_raw());
    }

    fn begin_command_buffer(&mut self, command: CommandHandle) -> BackendResult<()> {
        if !self.commands.contains(&command.as_raw()) {
            return Err(BackendError::UnknownHandle("command buffer"));
        }
        self.events.push(Event::BeginCommand(command.as_raw()));
        Ok(())
    }

    fn end_command_buffer(&mut self, command: CommandHandle) -> BackendResult<()> {
        if !self.commands.contains(&command.as_raw()) {
            return Err(BackendError::UnknownHandle("command buffer"));
        }
        self.events.push(Event::EndCommand(command.as_raw()));
        Ok(())
    }

    fn submit_and_wait(&mut self, command: CommandHandle) -> BackendResult<()> {
        if !self.commands.contains(&command.as_raw()) {
            return Err(BackendError::UnknownHandle("command buffer"));
        }
        self.events.push(Event::SubmitAndWait(command.as_raw()));
        Ok(())
    }

    fn cmd_copy_buffer(
        &mut self,
        _command: CommandHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) {
        self.events.push(Event::CopyBuffer {
            src: src.as_raw(),
            dst: dst.as_raw(),
            size,
        });
    }

    fn cmd_copy_buffer_to_texture(
        &mut self,
        _command: CommandHandle,
        src: BufferHandle,
        dst: TextureHandle,
        _width: u32,
        _height: u32,
    ) {
        self.events.push(Event::CopyBufferToTexture {
            src: src.as_raw(),
            dst: dst.as_raw(),
        });
    }

    fn cmd_begin_render_pass(
        &mut self,
        _command: CommandHandle,
        _pass: RenderPassHandle,
        _framebuffer: FramebufferHandle,
        _extent: (u32, u32),
        _clear_values: &[ClearValue],
    ) {
    }

    fn cmd_next_subpass(&mut self, _command: CommandHandle) {}
    fn cmd_end_render_pass(&mut self, _command: CommandHandle) {}
    fn cmd_bind_pipeline(&mut self, _command: CommandHandle, _pipeline: PipelineHandle) {}

    fn cmd_bind_descriptor_set(
        &mut self,
        _command: CommandHandle,
        _layout: PipelineLayoutHandle,
        _set: DescriptorSetHandle,
    ) {
    }

    fn cmd_bind_vertex_buffers(&mut self, _command: CommandHandle, _buffers: &[BufferHandle]) {}
    fn cmd_bind_index_buffer(&mut self, _command: CommandHandle, _buffer: BufferHandle) {}
    fn cmd_set_viewport_scissor(&mut self, _command: CommandHandle, _extent: (u32, u32)) {}
    fn cmd_draw(&mut self, _command: CommandHandle, _vertex_count: u32) {}

    fn cmd_draw_indexed(
        &mut self,
        _command: CommandHandle,
        _index_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
    ) {
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let id = self.next_id();
        self.fences.insert(id, signaled);
        Ok(FenceHandle::from_raw(id))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(&fence.as_raw());
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        // Waiting models GPU completion: the fence ends up signaled.
        let state = self
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(BackendError::UnknownHandle("fence"))?;
        *state = true;
        self.events.push(Event::WaitFence(fence.as_raw()));
        Ok(())
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let state = self
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(BackendError::UnknownHandle("fence"))?;
        *state = false;
        self.events.push(Event::ResetFence(fence.as_raw()));
        Ok(())
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let id = self.next_id();
        self.semaphores.insert(id);
        Ok(SemaphoreHandle::from_raw(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.semaphores.remove(&semaphore.as_raw());
    }

    fn acquire_next_image(&mut self, _signal: SemaphoreHandle) -> BackendResult<AcquireResult> {
        self.events.push(Event::Acquire);
        if self.out_of_date {
            return Ok(AcquireResult::OutOfDate);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquireResult::Ready(index))
    }

    fn queue_submit(
        &mut self,
        command: CommandHandle,
        _wait: SemaphoreHandle,
        _signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        let signaled = *self
            .fences
            .get(&fence.as_raw())
            .ok_or(BackendError::UnknownHandle("fence"))?;
        // A submit against a still-signaled fence means the caller skipped
        // the reset; real validation layers flag this.
        if signaled {
            return Err(BackendError::FenceFailed(
                "fence not reset before submit".into(),
            ));
        }
        self.events.push(Event::Submit {
            command: command.as_raw(),
            fence: fence.as_raw(),
        });
        Ok(())
    }

    fn queue_present(
        &mut self,
        image_index: u32,
        _wait: SemaphoreHandle,
    ) -> BackendResult<PresentResult> {
        self.events.push(Event::Present(image_index));
        Ok(PresentResult::Presented)
    }

    fn wait_idle(&mut self) {}
}
