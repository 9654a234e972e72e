//! Vulkan device implementation using ash
//!
//! Owns the instance, device, queue, swapchain and all GPU object storage.
//! Resources are created with memory sized from the driver's reported
//! requirements and bound at creation; every create has a symmetric destroy.

use crate::backend::traits::*;
use crate::backend::types::*;
use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::Arc;

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    memory: MemoryKind,
    _size: u64,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    view: vk::ImageView,
    _format: vk::Format,
}

/// Vulkan implementation of [`RenderDevice`]
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
    allocator: Option<Arc<Mutex<Allocator>>>,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,

    // Pools
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    samplers: HashMap<u64, vk::Sampler>,
    render_passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, vk::Framebuffer>,
    pipelines: HashMap<u64, vk::Pipeline>,
    pipeline_layouts: HashMap<u64, vk::PipelineLayout>,
    descriptor_set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    descriptor_sets: HashMap<u64, vk::DescriptorSet>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,

    next_id: u64,
    vsync: bool,
}

impl VulkanDevice {
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_name = CStr::from_bytes_with_nul(b"vk-sample-engine\0").unwrap();
            let app_info = vk::ApplicationInfo {
                p_application_name: app_name.as_ptr(),
                application_version: vk::make_api_version(0, 1, 0, 0),
                p_engine_name: app_name.as_ptr(),
                engine_version: vk::make_api_version(0, 1, 0, 0),
                api_version: vk::API_VERSION_1_2,
                ..Default::default()
            };

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo {
                p_application_info: &app_info,
                enabled_extension_count: extensions.len() as u32,
                pp_enabled_extension_names: extensions.as_ptr(),
                ..Default::default()
            };

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

            let physical_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let physical_device = physical_devices
                .into_iter()
                .find(|&pd| Self::find_queue_family(&instance, pd, &surface_fn, surface).is_some())
                .ok_or_else(|| {
                    BackendError::InitializationFailed("No suitable physical device".into())
                })?;

            let graphics_queue_family =
                Self::find_queue_family(&instance, physical_device, &surface_fn, surface)
                    .ok_or_else(|| {
                        BackendError::InitializationFailed("No suitable queue family".into())
                    })?;

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo {
                queue_family_index: graphics_queue_family,
                queue_count: 1,
                p_queue_priorities: queue_priorities.as_ptr(),
                ..Default::default()
            };

            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default();

            let device_info = vk::DeviceCreateInfo {
                queue_create_info_count: 1,
                p_queue_create_infos: &queue_info,
                enabled_extension_count: device_extensions.len() as u32,
                pp_enabled_extension_names: device_extensions.as_ptr(),
                p_enabled_features: &device_features,
                ..Default::default()
            };

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo {
                queue_family_index: graphics_queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 10000,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 1000,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::INPUT_ATTACHMENT,
                    descriptor_count: 100,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo {
                pool_size_count: pool_sizes.len() as u32,
                p_pool_sizes: pool_sizes.as_ptr(),
                max_sets: 3000,
                flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
                ..Default::default()
            };
            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                graphics_queue_family,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_SRGB,
                swapchain_extent: vk::Extent2D {
                    width: 0,
                    height: 0,
                },
                command_pool,
                descriptor_pool,
                buffers: HashMap::new(),
                textures: HashMap::new(),
                samplers: HashMap::new(),
                render_passes: HashMap::new(),
                framebuffers: HashMap::new(),
                pipelines: HashMap::new(),
                pipeline_layouts: HashMap::new(),
                descriptor_set_layouts: HashMap::new(),
                descriptor_sets: HashMap::new(),
                command_buffers: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                next_id: 1,
                vsync,
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;

            Ok(backend)
        }
    }

    /// Rebuild the swapchain after a resize. Waits for the device to go idle
    /// first; callers must recreate swapchain-sized resources afterwards.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.create_swapchain(width, height)
    }

    /// Raw device access for integrations that record into our command
    /// buffers (e.g. an immediate-mode UI renderer).
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        for (index, family) in queue_families.iter().enumerate() {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };
            if supports_graphics && supports_surface {
                return Some(index as u32);
            }
        }
        None
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            self.device.device_wait_idle().ok();

            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            }

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .unwrap_or(&formats[0]);

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let swapchain_info = vk::SwapchainCreateInfoKHR {
                surface: self.surface,
                min_image_count: image_count,
                image_format: format.format,
                image_color_space: format.color_space,
                image_extent: extent,
                image_array_layers: 1,
                image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                image_sharing_mode: vk::SharingMode::EXCLUSIVE,
                pre_transform: capabilities.current_transform,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                present_mode,
                clipped: vk::TRUE,
                ..Default::default()
            };

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            self.swapchain_image_views = self
                .swapchain_images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo {
                        image,
                        view_type: vk::ImageViewType::TYPE_2D,
                        format: format.format,
                        components: vk::ComponentMapping::default(),
                        subresource_range: vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        ..Default::default()
                    };
                    self.device.create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            Ok(())
        }
    }

    fn convert_format(format: TextureFormat) -> vk::Format {
        match format {
            TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
            TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        }
    }

    fn convert_format_back(format: vk::Format) -> TextureFormat {
        match format {
            vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
            vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
            vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8UnormSrgb,
            vk::Format::R16G16B16A16_SFLOAT => TextureFormat::Rgba16Float,
            vk::Format::R32G32B32A32_SFLOAT => TextureFormat::Rgba32Float,
            vk::Format::D32_SFLOAT => TextureFormat::Depth32Float,
            _ => TextureFormat::Bgra8Unorm,
        }
    }

    fn convert_layout(layout: ImageLayout) -> vk::ImageLayout {
        match layout {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::DepthStencilAttachment => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    fn convert_load_op(op: LoadOp) -> vk::AttachmentLoadOp {
        match op {
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }

    fn convert_store_op(op: StoreOp) -> vk::AttachmentStoreOp {
        match op {
            StoreOp::Store => vk::AttachmentStoreOp::STORE,
            StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        }
    }

    fn convert_stage_mask(mask: StageMask) -> vk::PipelineStageFlags {
        let mut flags = vk::PipelineStageFlags::empty();
        if mask.contains(StageMask::COLOR_ATTACHMENT_OUTPUT) {
            flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        }
        if mask.contains(StageMask::FRAGMENT_SHADER) {
            flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
        }
        if mask.contains(StageMask::BOTTOM_OF_PIPE) {
            flags |= vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }
        flags
    }

    fn convert_access_mask(mask: AccessMask) -> vk::AccessFlags {
        let mut flags = vk::AccessFlags::empty();
        if mask.contains(AccessMask::MEMORY_READ) {
            flags |= vk::AccessFlags::MEMORY_READ;
        }
        if mask.contains(AccessMask::COLOR_ATTACHMENT_READ) {
            flags |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
        }
        if mask.contains(AccessMask::COLOR_ATTACHMENT_WRITE) {
            flags |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
        if mask.contains(AccessMask::SHADER_READ) {
            flags |= vk::AccessFlags::SHADER_READ;
        }
        flags
    }

    fn convert_attachment_ref(r: AttachmentRef) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment: r.attachment,
            layout: Self::convert_layout(r.layout),
        }
    }

    fn convert_compare_op(op: CompareOp) -> vk::CompareOp {
        match op {
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> vk::Format {
        match format {
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::Sint32x4 => vk::Format::R32G32B32A32_SINT,
        }
    }

    fn convert_shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
        let mut flags = vk::ShaderStageFlags::empty();
        if stages.contains(ShaderStages::VERTEX) {
            flags |= vk::ShaderStageFlags::VERTEX;
        }
        if stages.contains(ShaderStages::FRAGMENT) {
            flags |= vk::ShaderStageFlags::FRAGMENT;
        }
        flags
    }

    fn create_shader_module(&self, spirv: &[u32]) -> BackendResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo {
            code_size: spirv.len() * 4,
            p_code: spirv.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .create_shader_module(&info, None)
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))
        }
    }
}

impl RenderDevice for VulkanDevice {
    fn image_count(&self) -> u32 {
        self.swapchain_images.len() as u32
    }

    fn surface_extent(&self) -> (u32, u32) {
        (self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn surface_format(&self) -> TextureFormat {
        Self::convert_format_back(self.swapchain_format)
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        memory: MemoryKind,
    ) -> BackendResult<BufferObject> {
        if size == 0 {
            return Err(BackendError::BufferCreationFailed(
                "zero-sized buffer".into(),
            ));
        }

        let mut vk_usage = vk::BufferUsageFlags::empty();
        if usage.contains(BufferUsage::TRANSFER_SRC) {
            vk_usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if usage.contains(BufferUsage::TRANSFER_DST) {
            vk_usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if usage.contains(BufferUsage::VERTEX) {
            vk_usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if usage.contains(BufferUsage::INDEX) {
            vk_usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            vk_usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }

        unsafe {
            let buffer_info = vk::BufferCreateInfo {
                size,
                usage: vk_usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };

            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

            // Allocation is sized from the reported requirements, not `size`.
            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let location = match memory {
                MemoryKind::DeviceLocal => MemoryLocation::GpuOnly,
                MemoryKind::HostVisible => MemoryLocation::CpuToGpu,
            };

            let allocation = self
                .allocator
                .as_ref()
                .ok_or_else(|| {
                    BackendError::BufferCreationFailed("Allocator not available".into())
                })?
                .lock()
                .allocate(&AllocationCreateDesc {
                    name: "buffer",
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

            let id = self.next_id();
            self.buffers.insert(
                id,
                VkBuffer {
                    buffer,
                    allocation,
                    memory,
                    _size: size,
                },
            );

            Ok(BufferObject {
                handle: BufferHandle(id),
                size,
            })
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe {
                self.device.destroy_buffer(vk_buffer.buffer, None);
            }
            if let Some(ref allocator) = self.allocator {
                let _ = allocator.lock().free(vk_buffer.allocation);
            }
        }
    }

    fn write_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> BackendResult<()> {
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::UnknownHandle("buffer"))?;

        if vk_buffer.memory != MemoryKind::HostVisible {
            return Err(BackendError::HostWriteFailed(
                "buffer is not host-visible".into(),
            ));
        }

        let mapped = vk_buffer
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::HostWriteFailed("buffer is not mapped".into()))?;

        if data.len() > mapped.len() {
            return Err(BackendError::HostWriteFailed(format!(
                "write of {} bytes exceeds mapped size {}",
                data.len(),
                mapped.len()
            )));
        }
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> BackendResult<ImageObject> {
        let vk_format = Self::convert_format(format);

        let mut vk_usage = vk::ImageUsageFlags::empty();
        if usage.contains(TextureUsage::TRANSFER_DST) {
            vk_usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if usage.contains(TextureUsage::SAMPLED) {
            vk_usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            vk_usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
            vk_usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if usage.contains(TextureUsage::INPUT_ATTACHMENT) {
            vk_usage |= vk::ImageUsageFlags::INPUT_ATTACHMENT;
        }

        unsafe {
            let image_info = vk::ImageCreateInfo {
                image_type: vk::ImageType::TYPE_2D,
                extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: 1,
                format: vk_format,
                tiling: vk::ImageTiling::OPTIMAL,
                initial_layout: vk::ImageLayout::UNDEFINED,
                usage: vk_usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                samples: vk::SampleCountFlags::TYPE_1,
                ..Default::default()
            };

            let image = self
                .device
                .create_image(&image_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

            let requirements = self.device.get_image_memory_requirements(image);

            let allocation = self
                .allocator
                .as_ref()
                .ok_or_else(|| {
                    BackendError::TextureCreationFailed("Allocator not available".into())
                })?
                .lock()
                .allocate(&AllocationCreateDesc {
                    name: "texture",
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

            // Aspect follows usage: depth-stencil attachments get the depth
            // aspect, everything else color.
            let aspect_mask = if usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
                vk::ImageAspectFlags::DEPTH
            } else {
                vk::ImageAspectFlags::COLOR
            };

            let view_info = vk::ImageViewCreateInfo {
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: vk_format,
                components: vk::ComponentMapping::default(),
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = self
                .device
                .create_image_view(&view_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

            let id = self.next_id();
            self.textures.insert(
                id,
                VkTexture {
                    image,
                    allocation,
                    view,
                    _format: vk_format,
                },
            );

            Ok(ImageObject {
                handle: TextureHandle(id),
                width,
                height,
                format,
            })
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            unsafe {
                self.device.destroy_image_view(vk_texture.view, None);
                self.device.destroy_image(vk_texture.image, None);
            }
            if let Some(ref allocator) = self.allocator {
                let _ = allocator.lock().free(vk_texture.allocation);
            }
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> BackendResult<SamplerHandle> {
        let convert_filter = |f: FilterMode| match f {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Linear => vk::Filter::LINEAR,
        };
        let address_mode = match desc.address_mode {
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        };

        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: convert_filter(desc.mag_filter),
            min_filter: convert_filter(desc.min_filter),
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::INT_OPAQUE_WHITE,
            ..Default::default()
        };

        let sampler = unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .map_err(|e| BackendError::SamplerCreationFailed(e.to_string()))?
        };

        let id = self.next_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.samplers.remove(&sampler.0) {
            unsafe {
                self.device.destroy_sampler(sampler, None);
            }
        }
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> BackendResult<RenderPassHandle> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .attachments
            .iter()
            .map(|a| vk::AttachmentDescription {
                format: Self::convert_format(a.format),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: Self::convert_load_op(a.load_op),
                store_op: Self::convert_store_op(a.store_op),
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: Self::convert_layout(a.initial_layout),
                final_layout: Self::convert_layout(a.final_layout),
                ..Default::default()
            })
            .collect();

        // Reference arrays must stay alive until pass creation, so collect
        // per-subpass storage first and build the descriptions over it.
        struct SubpassRefs {
            inputs: Vec<vk::AttachmentReference>,
            colors: Vec<vk::AttachmentReference>,
            depth: Option<vk::AttachmentReference>,
        }

        let refs: Vec<SubpassRefs> = desc
            .subpasses
            .iter()
            .map(|s| SubpassRefs {
                inputs: s
                    .input_attachments
                    .iter()
                    .map(|&r| Self::convert_attachment_ref(r))
                    .collect(),
                colors: s
                    .color_attachments
                    .iter()
                    .map(|&r| Self::convert_attachment_ref(r))
                    .collect(),
                depth: s
                    .depth_stencil_attachment
                    .map(Self::convert_attachment_ref),
            })
            .collect();

        let subpasses: Vec<vk::SubpassDescription> = refs
            .iter()
            .map(|r| vk::SubpassDescription {
                pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
                input_attachment_count: r.inputs.len() as u32,
                p_input_attachments: if r.inputs.is_empty() {
                    std::ptr::null()
                } else {
                    r.inputs.as_ptr()
                },
                color_attachment_count: r.colors.len() as u32,
                p_color_attachments: if r.colors.is_empty() {
                    std::ptr::null()
                } else {
                    r.colors.as_ptr()
                },
                p_depth_stencil_attachment: r
                    .depth
                    .as_ref()
                    .map_or(std::ptr::null(), |d| d as *const _),
                ..Default::default()
            })
            .collect();

        let dependencies: Vec<vk::SubpassDependency> = desc
            .dependencies
            .iter()
            .map(|d| vk::SubpassDependency {
                src_subpass: if d.src_subpass == SUBPASS_EXTERNAL {
                    vk::SUBPASS_EXTERNAL
                } else {
                    d.src_subpass
                },
                dst_subpass: if d.dst_subpass == SUBPASS_EXTERNAL {
                    vk::SUBPASS_EXTERNAL
                } else {
                    d.dst_subpass
                },
                src_stage_mask: Self::convert_stage_mask(d.src_stage),
                dst_stage_mask: Self::convert_stage_mask(d.dst_stage),
                src_access_mask: Self::convert_access_mask(d.src_access),
                dst_access_mask: Self::convert_access_mask(d.dst_access),
                dependency_flags: if d.by_region {
                    vk::DependencyFlags::BY_REGION
                } else {
                    vk::DependencyFlags::empty()
                },
            })
            .collect();

        let render_pass_info = vk::RenderPassCreateInfo {
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            subpass_count: subpasses.len() as u32,
            p_subpasses: subpasses.as_ptr(),
            dependency_count: dependencies.len() as u32,
            p_dependencies: dependencies.as_ptr(),
            ..Default::default()
        };

        let render_pass = unsafe {
            self.device
                .create_render_pass(&render_pass_info, None)
                .map_err(|e| BackendError::RenderPassCreationFailed(e.to_string()))?
        };

        let id = self.next_id();
        self.render_passes.insert(id, render_pass);
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        if let Some(pass) = self.render_passes.remove(&pass.0) {
            unsafe {
                self.device.destroy_render_pass(pass, None);
            }
        }
    }

    fn create_framebuffer(
        &mut self,
        pass: RenderPassHandle,
        extent: (u32, u32),
        views: &[AttachmentView],
    ) -> BackendResult<FramebufferHandle> {
        let render_pass = *self
            .render_passes
            .get(&pass.0)
            .ok_or(BackendError::UnknownHandle("render pass"))?;

        let vk_views: Vec<vk::ImageView> = views
            .iter()
            .map(|view| match view {
                AttachmentView::SwapchainImage(index) => self
                    .swapchain_image_views
                    .get(*index as usize)
                    .copied()
                    .ok_or(BackendError::UnknownHandle("swapchain image")),
                AttachmentView::Texture(handle) => self
                    .textures
                    .get(&handle.0)
                    .map(|t| t.view)
                    .ok_or(BackendError::UnknownHandle("texture")),
            })
            .collect::<BackendResult<_>>()?;

        let framebuffer_info = vk::FramebufferCreateInfo {
            render_pass,
            attachment_count: vk_views.len() as u32,
            p_attachments: vk_views.as_ptr(),
            width: extent.0,
            height: extent.1,
            layers: 1,
            ..Default::default()
        };

        let framebuffer = unsafe {
            self.device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(|e| BackendError::FramebufferCreationFailed(e.to_string()))?
        };

        let id = self.next_id();
        self.framebuffers.insert(id, framebuffer);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(framebuffer) = self.framebuffers.remove(&framebuffer.0) {
            unsafe {
                self.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[LayoutBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: match b.kind {
                    BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
                    BindingKind::CombinedImageSampler => {
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    }
                    BindingKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
                },
                descriptor_count: 1,
                stage_flags: Self::convert_shader_stages(b.stages),
                ..Default::default()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo {
            binding_count: vk_bindings.len() as u32,
            p_bindings: vk_bindings.as_ptr(),
            ..Default::default()
        };

        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| BackendError::DescriptorAllocationFailed(e.to_string()))?
        };

        let id = self.next_id();
        self.descriptor_set_layouts.insert(id, layout);
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        if let Some(layout) = self.descriptor_set_layouts.remove(&layout.0) {
            unsafe {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> BackendResult<PipelineLayoutHandle> {
        let layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|h| {
                self.descriptor_set_layouts
                    .get(&h.0)
                    .copied()
                    .ok_or(BackendError::UnknownHandle("descriptor-set layout"))
            })
            .collect::<BackendResult<_>>()?;

        let layout_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };

        let layout = unsafe {
            self.device
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?
        };

        let id = self.next_id();
        self.pipeline_layouts.insert(id, layout);
        Ok(PipelineLayoutHandle(id))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        if let Some(layout) = self.pipeline_layouts.remove(&layout.0) {
            unsafe {
                self.device.destroy_pipeline_layout(layout, None);
            }
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        let vk_layout = *self
            .descriptor_set_layouts
            .get(&layout.0)
            .ok_or(BackendError::UnknownHandle("descriptor-set layout"))?;

        let alloc_info = vk::DescriptorSetAllocateInfo {
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: 1,
            p_set_layouts: &vk_layout,
            ..Default::default()
        };

        let set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| BackendError::DescriptorAllocationFailed(e.to_string()))?[0]
        };

        let id = self.next_id();
        self.descriptor_sets.insert(id, set);
        Ok(DescriptorSetHandle(id))
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) {
        if let Some(set) = self.descriptor_sets.remove(&set.0) {
            unsafe {
                let _ = self
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[set]);
            }
        }
    }

    fn update_descriptor_set(&mut self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) {
        let Some(&vk_set) = self.descriptor_sets.get(&set.0) else {
            return;
        };

        // Info storage has to outlive the write array; index into it after
        // all pushes are done so the pointers stay valid.
        enum Pending {
            Buffer { binding: u32, info: usize },
            Sampled { binding: u32, info: usize },
            Input { binding: u32, info: usize },
        }

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut pending = Vec::new();

        for write in writes {
            match *write {
                DescriptorWrite::UniformBuffer { binding, buffer } => {
                    let Some(vk_buffer) = self.buffers.get(&buffer.0) else {
                        continue;
                    };
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk_buffer.buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    });
                    pending.push(Pending::Buffer {
                        binding,
                        info: buffer_infos.len() - 1,
                    });
                }
                DescriptorWrite::CombinedImageSampler {
                    binding,
                    texture,
                    sampler,
                } => {
                    let (Some(vk_texture), Some(&vk_sampler)) = (
                        self.textures.get(&texture.0),
                        self.samplers.get(&sampler.0),
                    ) else {
                        continue;
                    };
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk_sampler,
                        image_view: vk_texture.view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                    pending.push(Pending::Sampled {
                        binding,
                        info: image_infos.len() - 1,
                    });
                }
                DescriptorWrite::InputAttachment { binding, texture } => {
                    let Some(vk_texture) = self.textures.get(&texture.0) else {
                        continue;
                    };
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk_texture.view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                    pending.push(Pending::Input {
                        binding,
                        info: image_infos.len() - 1,
                    });
                }
            }
        }

        let vk_writes: Vec<vk::WriteDescriptorSet> = pending
            .iter()
            .map(|p| match *p {
                Pending::Buffer { binding, info } => vk::WriteDescriptorSet {
                    dst_set: vk_set,
                    dst_binding: binding,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: &buffer_infos[info],
                    ..Default::default()
                },
                Pending::Sampled { binding, info } => vk::WriteDescriptorSet {
                    dst_set: vk_set,
                    dst_binding: binding,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: &image_infos[info],
                    ..Default::default()
                },
                Pending::Input { binding, info } => vk::WriteDescriptorSet {
                    dst_set: vk_set,
                    dst_binding: binding,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::INPUT_ATTACHMENT,
                    p_image_info: &image_infos[info],
                    ..Default::default()
                },
            })
            .collect();

        unsafe {
            self.device.update_descriptor_sets(&vk_writes, &[]);
        }
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        let layout = *self
            .pipeline_layouts
            .get(&desc.layout.0)
            .ok_or(BackendError::UnknownHandle("pipeline layout"))?;
        let render_pass = *self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or(BackendError::UnknownHandle("render pass"))?;

        let vertex_module = self.create_shader_module(&desc.vertex_spirv)?;
        let fragment_module = self.create_shader_module(&desc.fragment_spirv)?;

        let entry = CStr::from_bytes_with_nul(b"main\0").unwrap();
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::VERTEX,
                module: vertex_module,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fragment_module,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
        ];

        let bindings: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            })
            .collect();

        let attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: Self::convert_vertex_format(a.format),
                offset: a.offset,
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: bindings.len() as u32,
            p_vertex_binding_descriptions: bindings.as_ptr(),
            vertex_attribute_description_count: attributes.len() as u32,
            p_vertex_attribute_descriptions: attributes.as_ptr(),
            ..Default::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: match desc.topology {
                PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
                PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            },
            primitive_restart_enable: vk::FALSE,
            ..Default::default()
        };

        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let rasterization = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: match desc.cull_mode {
                CullMode::None => vk::CullModeFlags::NONE,
                CullMode::Back => vk::CullModeFlags::BACK,
            },
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };

        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };

        let depth_stencil = match desc.depth {
            Some(depth) => vk::PipelineDepthStencilStateCreateInfo {
                depth_test_enable: if depth.test_enable {
                    vk::TRUE
                } else {
                    vk::FALSE
                },
                depth_write_enable: if depth.write_enable {
                    vk::TRUE
                } else {
                    vk::FALSE
                },
                depth_compare_op: Self::convert_compare_op(depth.compare),
                ..Default::default()
            },
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_targets
            .iter()
            .map(|t| vk::PipelineColorBlendAttachmentState {
                blend_enable: if t.blend_enable { vk::TRUE } else { vk::FALSE },
                src_color_blend_factor: vk::BlendFactor::ONE,
                dst_color_blend_factor: vk::BlendFactor::ZERO,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: vk::BlendFactor::ONE,
                dst_alpha_blend_factor: vk::BlendFactor::ZERO,
                alpha_blend_op: vk::BlendOp::ADD,
                color_write_mask: vk::ColorComponentFlags::from_raw(t.write_mask.bits()),
            })
            .collect();

        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            attachment_count: blend_attachments.len() as u32,
            p_attachments: if blend_attachments.is_empty() {
                std::ptr::null()
            } else {
                blend_attachments.as_ptr()
            },
            ..Default::default()
        };

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &rasterization,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout,
            render_pass,
            subpass: desc.subpass,
            ..Default::default()
        };

        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        unsafe {
            self.device.destroy_shader_module(vertex_module, None);
            self.device.destroy_shader_module(fragment_module, None);
        }

        let pipeline =
            result.map_err(|(_, e)| BackendError::PipelineCreationFailed(e.to_string()))?[0];

        let id = self.next_id();
        self.pipelines.insert(id, pipeline);
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(pipeline, None);
            }
        }
    }

    fn allocate_command_buffer(&mut self) -> BackendResult<CommandHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };

        let command = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::CommandFailed(e.to_string()))?[0]
        };

        let id = self.next_id();
        self.command_buffers.insert(id, command);
        Ok(CommandHandle(id))
    }

    fn free_command_buffer(&mut self, command: CommandHandle) {
        if let Some(command) = self.command_buffers.remove(&command.0) {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &[command]);
            }
        }
    }

    fn begin_command_buffer(&mut self, command: CommandHandle) -> BackendResult<()> {
        let command = *self
            .command_buffers
            .get(&command.0)
            .ok_or(BackendError::UnknownHandle("command buffer"))?;
        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe {
            self.device
                .reset_command_buffer(command, vk::CommandBufferResetFlags::empty())
                .map_err(|e| BackendError::CommandFailed(e.to_string()))?;
            self.device
                .begin_command_buffer(command, &begin_info)
                .map_err(|e| BackendError::CommandFailed(e.to_string()))
        }
    }

    fn end_command_buffer(&mut self, command: CommandHandle) -> BackendResult<()> {
        let command = *self
            .command_buffers
            .get(&command.0)
            .ok_or(BackendError::UnknownHandle("command buffer"))?;
        unsafe {
            self.device
                .end_command_buffer(command)
                .map_err(|e| BackendError::CommandFailed(e.to_string()))
        }
    }

    fn submit_and_wait(&mut self, command: CommandHandle) -> BackendResult<()> {
        let command = *self
            .command_buffers
            .get(&command.0)
            .ok_or(BackendError::UnknownHandle("command buffer"))?;

        unsafe {
            let fence_info = vk::FenceCreateInfo::default();
            let fence = self
                .device
                .create_fence(&fence_info, None)
                .map_err(|e| BackendError::SubmitFailed(e.to_string()))?;

            let submit_info = vk::SubmitInfo {
                command_buffer_count: 1,
                p_command_buffers: &command,
                ..Default::default()
            };

            let result = self
                .device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .map_err(|e| BackendError::SubmitFailed(e.to_string()))
                .and_then(|_| {
                    self.device
                        .wait_for_fences(&[fence], true, u64::MAX)
                        .map_err(|e| BackendError::SubmitFailed(e.to_string()))
                });

            self.device.destroy_fence(fence, None);
            result
        }
    }

    fn cmd_copy_buffer(
        &mut self,
        command: CommandHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) {
        let (Some(&command), Some(src), Some(dst)) = (
            self.command_buffers.get(&command.0),
            self.buffers.get(&src.0),
            self.buffers.get(&dst.0),
        ) else {
            return;
        };

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(command, src.buffer, dst.buffer, &[region]);
        }
    }

    fn cmd_copy_buffer_to_texture(
        &mut self,
        command: CommandHandle,
        src: BufferHandle,
        dst: TextureHandle,
        width: u32,
        height: u32,
    ) {
        let (Some(&command), Some(src), Some(dst)) = (
            self.command_buffers.get(&command.0),
            self.buffers.get(&src.0),
            self.textures.get(&dst.0),
        ) else {
            return;
        };

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let mut barrier = vk::ImageMemoryBarrier {
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: dst.image,
            subresource_range,
            ..Default::default()
        };

        let region = vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            ..Default::default()
        };

        unsafe {
            self.device.cmd_pipeline_barrier(
                command,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );

            self.device.cmd_copy_buffer_to_image(
                command,
                src.buffer,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
            barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;
            barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

            self.device.cmd_pipeline_barrier(
                command,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn cmd_begin_render_pass(
        &mut self,
        command: CommandHandle,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: (u32, u32),
        clear_values: &[ClearValue],
    ) {
        let (Some(&command), Some(&render_pass), Some(&framebuffer)) = (
            self.command_buffers.get(&command.0),
            self.render_passes.get(&pass.0),
            self.framebuffers.get(&framebuffer.0),
        ) else {
            return;
        };

        let clears: Vec<vk::ClearValue> = clear_values
            .iter()
            .map(|c| match *c {
                ClearValue::Color(float32) => vk::ClearValue {
                    color: vk::ClearColorValue { float32 },
                },
                ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
                },
            })
            .collect();

        let begin_info = vk::RenderPassBeginInfo {
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: extent.0,
                    height: extent.1,
                },
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };

        unsafe {
            self.device
                .cmd_begin_render_pass(command, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_next_subpass(&mut self, command: CommandHandle) {
        if let Some(&command) = self.command_buffers.get(&command.0) {
            unsafe {
                self.device
                    .cmd_next_subpass(command, vk::SubpassContents::INLINE);
            }
        }
    }

    fn cmd_end_render_pass(&mut self, command: CommandHandle) {
        if let Some(&command) = self.command_buffers.get(&command.0) {
            unsafe {
                self.device.cmd_end_render_pass(command);
            }
        }
    }

    fn cmd_bind_pipeline(&mut self, command: CommandHandle, pipeline: PipelineHandle) {
        let (Some(&command), Some(&pipeline)) = (
            self.command_buffers.get(&command.0),
            self.pipelines.get(&pipeline.0),
        ) else {
            return;
        };
        unsafe {
            self.device
                .cmd_bind_pipeline(command, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        command: CommandHandle,
        layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) {
        let (Some(&command), Some(&layout), Some(&set)) = (
            self.command_buffers.get(&command.0),
            self.pipeline_layouts.get(&layout.0),
            self.descriptor_sets.get(&set.0),
        ) else {
            return;
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn cmd_bind_vertex_buffers(&mut self, command: CommandHandle, buffers: &[BufferHandle]) {
        let Some(&command) = self.command_buffers.get(&command.0) else {
            return;
        };
        let vk_buffers: Vec<vk::Buffer> = buffers
            .iter()
            .filter_map(|b| self.buffers.get(&b.0).map(|b| b.buffer))
            .collect();
        if vk_buffers.len() != buffers.len() {
            return;
        }
        let offsets = vec![0u64; vk_buffers.len()];
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command, 0, &vk_buffers, &offsets);
        }
    }

    fn cmd_bind_index_buffer(&mut self, command: CommandHandle, buffer: BufferHandle) {
        let (Some(&command), Some(buffer)) = (
            self.command_buffers.get(&command.0),
            self.buffers.get(&buffer.0),
        ) else {
            return;
        };
        unsafe {
            self.device
                .cmd_bind_index_buffer(command, buffer.buffer, 0, vk::IndexType::UINT32);
        }
    }

    fn cmd_set_viewport_scissor(&mut self, command: CommandHandle, extent: (u32, u32)) {
        let Some(&command) = self.command_buffers.get(&command.0) else {
            return;
        };

        // Flipped viewport: positive-Y-up clip space, matching the models.
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.1 as f32,
            width: extent.0 as f32,
            height: -(extent.1 as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.0,
                height: extent.1,
            },
        };
        unsafe {
            self.device.cmd_set_viewport(command, 0, &[viewport]);
            self.device.cmd_set_scissor(command, 0, &[scissor]);
        }
    }

    fn cmd_draw(&mut self, command: CommandHandle, vertex_count: u32) {
        if let Some(&command) = self.command_buffers.get(&command.0) {
            unsafe {
                self.device.cmd_draw(command, vertex_count, 1, 0, 0);
            }
        }
    }

    fn cmd_draw_indexed(
        &mut self,
        command: CommandHandle,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    ) {
        if let Some(&command) = self.command_buffers.get(&command.0) {
            unsafe {
                self.device
                    .cmd_draw_indexed(command, index_count, 1, first_index, vertex_offset, 0);
            }
        }
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let fence_info = vk::FenceCreateInfo {
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };

        let fence = unsafe {
            self.device
                .create_fence(&fence_info, None)
                .map_err(|e| BackendError::FenceFailed(e.to_string()))?
        };

        let id = self.next_id();
        self.fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if let Some(fence) = self.fences.remove(&fence.0) {
            unsafe {
                self.device.destroy_fence(fence, None);
            }
        }
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::UnknownHandle("fence"))?;
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(|e| BackendError::FenceFailed(e.to_string()))
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::UnknownHandle("fence"))?;
        unsafe {
            self.device
                .reset_fences(&[fence])
                .map_err(|e| BackendError::FenceFailed(e.to_string()))
        }
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe {
            self.device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
        };

        let id = self.next_id();
        self.semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.semaphores.remove(&semaphore.0) {
            unsafe {
                self.device.destroy_semaphore(semaphore, None);
            }
        }
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquireResult> {
        let semaphore = *self
            .semaphores
            .get(&signal.0)
            .ok_or(BackendError::UnknownHandle("semaphore"))?;

        let result = unsafe {
            self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, _)) => Ok(AcquireResult::Ready(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(BackendError::AcquireImageFailed(e.to_string())),
        }
    }

    fn queue_submit(
        &mut self,
        command: CommandHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        let command = *self
            .command_buffers
            .get(&command.0)
            .ok_or(BackendError::UnknownHandle("command buffer"))?;
        let wait = *self
            .semaphores
            .get(&wait.0)
            .ok_or(BackendError::UnknownHandle("semaphore"))?;
        let signal = *self
            .semaphores
            .get(&signal.0)
            .ok_or(BackendError::UnknownHandle("semaphore"))?;
        let fence = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::UnknownHandle("fence"))?;

        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit_info = vk::SubmitInfo {
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &command,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .map_err(|e| BackendError::SubmitFailed(e.to_string()))
        }
    }

    fn queue_present(
        &mut self,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentResult> {
        let wait = *self
            .semaphores
            .get(&wait.0)
            .ok_or(BackendError::UnknownHandle("semaphore"))?;

        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };

        let result = unsafe {
            self.swapchain_fn
                .queue_present(self.graphics_queue, &present_info)
        };

        match result {
            Ok(_) => Ok(PresentResult::Presented),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentResult::OutOfDate),
            Err(e) => Err(BackendError::PresentFailed(e.to_string())),
        }
    }

    fn wait_idle(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            if let Some(ref allocator) = self.allocator {
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.lock().free(buffer.allocation);
                }
                for (_, texture) in self.textures.drain() {
                    self.device.destroy_image_view(texture.view, None);
                    self.device.destroy_image(texture.image, None);
                    let _ = allocator.lock().free(texture.allocation);
                }
            }

            // The allocator must go before the device.
            drop(self.allocator.take());

            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, layout) in self.pipeline_layouts.drain() {
                self.device.destroy_pipeline_layout(layout, None);
            }
            for (_, layout) in self.descriptor_set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(pass, None);
            }
            for (_, fence) in self.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in self.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }

            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);

            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_fn.destroy_swapchain(self.swapchain, None);

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
