//! Device abstraction
//!
//! `RenderDevice` is the single seam between engine logic and the GPU. The
//! Vulkan backend implements it for real hardware; the test suite implements
//! it with a mock that records calls and tracks live handles.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type.
///
/// Everything except `SurfaceOutOfDate` is unrecoverable at this layer and
/// is expected to be caught only at the outermost application loop.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to submit queue: {0}")]
    SubmitFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to write host-visible memory: {0}")]
    HostWriteFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create sampler: {0}")]
    SamplerCreationFailed(String),
    #[error("Failed to create render pass: {0}")]
    RenderPassCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to allocate descriptors: {0}")]
    DescriptorAllocationFailed(String),
    #[error("Command buffer operation failed: {0}")]
    CommandFailed(String),
    #[error("Fence operation failed: {0}")]
    FenceFailed(String),
    #[error("Unknown {0} handle")]
    UnknownHandle(&'static str),
    #[error("Registry key already taken: {0}")]
    DuplicateRegistryKey(String),
    #[error("Surface out of date")]
    SurfaceOutOfDate,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU image (with its primary view)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u64);

/// Handle to a pipeline layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLayoutHandle(pub(crate) u64);

/// Handle to a descriptor-set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutHandle(pub(crate) u64);

/// Handle to an allocated descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub(crate) u64);

/// Handle to a primary command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(pub(crate) u64);

/// Handle to a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub(crate) u64);

/// Handle to a semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub(crate) u64);

// Raw constructors in the ash `Handle::from_raw` style; alternate backends
// (including the test mock) mint their own handle values with these.
macro_rules! impl_raw_handle {
    ($($ty:ident),*) => {
        $(impl $ty {
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn as_raw(&self) -> u64 {
                self.0
            }
        })*
    };
}

impl_raw_handle!(
    BufferHandle,
    TextureHandle,
    SamplerHandle,
    RenderPassHandle,
    FramebufferHandle,
    PipelineHandle,
    PipelineLayoutHandle,
    DescriptorSetLayoutHandle,
    DescriptorSetHandle,
    CommandHandle,
    FenceHandle,
    SemaphoreHandle
);

/// A created buffer: fully bound and ready to use.
///
/// `size` is the requested size; the backing memory region is sized from the
/// backend's reported requirements and may be larger.
#[derive(Debug, Clone, Copy)]
pub struct BufferObject {
    pub handle: BufferHandle,
    pub size: u64,
}

/// A created image with its primary view, fully bound and ready to use.
#[derive(Debug, Clone, Copy)]
pub struct ImageObject {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Result of a swapchain acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// Image index ready for recording
    Ready(u32),
    /// Surface changed under us; the frame must be skipped
    OutOfDate,
}

/// Result of a present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented,
    OutOfDate,
}

/// GPU device abstraction consumed by the scaffold.
///
/// Every create has a symmetric destroy; callers own the pairing. Creation
/// failures are fatal for the call and surface as `BackendError`.
pub trait RenderDevice {
    // Swapchain facts (the swapchain itself is owned by the backend)

    fn image_count(&self) -> u32;
    fn surface_extent(&self) -> (u32, u32);
    fn surface_format(&self) -> TextureFormat;

    // Resource allocator

    /// Create a buffer and bind freshly allocated memory to it.
    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        memory: MemoryKind,
    ) -> BackendResult<BufferObject>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Write `data` into a host-visible buffer from offset zero.
    fn write_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> BackendResult<()>;

    /// Create an image, bind memory, and create its primary view. The view's
    /// aspect is inferred from usage: depth-stencil usage means depth aspect,
    /// anything else color.
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> BackendResult<ImageObject>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> BackendResult<SamplerHandle>;
    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    // Render passes, framebuffers, pipelines, descriptors

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> BackendResult<RenderPassHandle>;
    fn destroy_render_pass(&mut self, pass: RenderPassHandle);

    fn create_framebuffer(
        &mut self,
        pass: RenderPassHandle,
        extent: (u32, u32),
        views: &[AttachmentView],
    ) -> BackendResult<FramebufferHandle>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[LayoutBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle);

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> BackendResult<PipelineLayoutHandle>;
    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle);

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle>;
    fn free_descriptor_set(&mut self, set: DescriptorSetHandle);
    fn update_descriptor_set(&mut self, set: DescriptorSetHandle, writes: &[DescriptorWrite]);

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> BackendResult<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    // Command buffers

    fn allocate_command_buffer(&mut self) -> BackendResult<CommandHandle>;
    fn free_command_buffer(&mut self, command: CommandHandle);
    fn begin_command_buffer(&mut self, command: CommandHandle) -> BackendResult<()>;
    fn end_command_buffer(&mut self, command: CommandHandle) -> BackendResult<()>;

    /// Submit a finished command buffer and block until the GPU completes it.
    /// Used by the one-shot upload paths, never by the frame loop.
    fn submit_and_wait(&mut self, command: CommandHandle) -> BackendResult<()>;

    fn cmd_copy_buffer(
        &mut self,
        command: CommandHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    );

    /// Transition the target image, copy pixels from a staging buffer, then
    /// transition it to shader-read layout.
    fn cmd_copy_buffer_to_texture(
        &mut self,
        command: CommandHandle,
        src: BufferHandle,
        dst: TextureHandle,
        width: u32,
        height: u32,
    );

    fn cmd_begin_render_pass(
        &mut self,
        command: CommandHandle,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: (u32, u32),
        clear_values: &[ClearValue],
    );
    fn cmd_next_subpass(&mut self, command: CommandHandle);
    fn cmd_end_render_pass(&mut self, command: CommandHandle);

    fn cmd_bind_pipeline(&mut self, command: CommandHandle, pipeline: PipelineHandle);
    fn cmd_bind_descriptor_set(
        &mut self,
        command: CommandHandle,
        layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    );
    fn cmd_bind_vertex_buffers(&mut self, command: CommandHandle, buffers: &[BufferHandle]);
    fn cmd_bind_index_buffer(&mut self, command: CommandHandle, buffer: BufferHandle);
    fn cmd_set_viewport_scissor(&mut self, command: CommandHandle, extent: (u32, u32));
    fn cmd_draw(&mut self, command: CommandHandle, vertex_count: u32);
    fn cmd_draw_indexed(
        &mut self,
        command: CommandHandle,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    );

    // Frame synchronization

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle>;
    fn destroy_fence(&mut self, fence: FenceHandle);
    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;
    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    /// Acquire the next presentable image, signaling `signal` when it is
    /// ready. `OutOfDate` is an expected condition on resize, not an error.
    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquireResult>;

    /// Submit the frame's command buffer: waits on `wait` at color-output
    /// stage, signals `signal` and `fence` on completion.
    fn queue_submit(
        &mut self,
        command: CommandHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()>;

    fn queue_present(
        &mut self,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentResult>;

    /// Block until the device is idle. The only abort path for in-flight
    /// work; used before teardown and swapchain rebuilds.
    fn wait_idle(&mut self);
}
