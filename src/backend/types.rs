//! Common value types shared between the engine and backends

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const TRANSFER_SRC: Self = Self(1 << 0);
    pub const TRANSFER_DST: Self = Self(1 << 1);
    pub const VERTEX: Self = Self(1 << 2);
    pub const INDEX: Self = Self(1 << 3);
    pub const UNIFORM: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const TRANSFER_DST: Self = Self(1 << 0);
    pub const SAMPLED: Self = Self(1 << 1);
    pub const COLOR_ATTACHMENT: Self = Self(1 << 2);
    pub const DEPTH_STENCIL_ATTACHMENT: Self = Self(1 << 3);
    pub const INPUT_ATTACHMENT: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Where a resource's memory lives.
///
/// `HostVisible` memory is host-coherent and accepts the direct
/// map/write/flush path; any buffer later written from the CPU must be
/// created with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    DeviceLocal,
    HostVisible,
}

/// Attachment load operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    Clear,
    Load,
    DontCare,
}

/// Attachment store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// Image layout at render-pass boundaries and attachment references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    PresentSrc,
}

/// One attachment of a render pass
#[derive(Debug, Clone)]
pub struct AttachmentDesc {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

/// Reference to an attachment from a subpass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRef {
    pub attachment: u32,
    pub layout: ImageLayout,
}

/// One subpass of a render pass
#[derive(Debug, Clone, Default)]
pub struct SubpassDesc {
    pub input_attachments: Vec<AttachmentRef>,
    pub color_attachments: Vec<AttachmentRef>,
    pub depth_stencil_attachment: Option<AttachmentRef>,
}

/// Marker for dependencies crossing the render-pass boundary
pub const SUBPASS_EXTERNAL: u32 = u32::MAX;

/// Pipeline stage mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMask(u32);

impl StageMask {
    pub const COLOR_ATTACHMENT_OUTPUT: Self = Self(1 << 0);
    pub const FRAGMENT_SHADER: Self = Self(1 << 1);
    pub const BOTTOM_OF_PIPE: Self = Self(1 << 2);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for StageMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Memory access mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMask(u32);

impl AccessMask {
    pub const MEMORY_READ: Self = Self(1 << 0);
    pub const COLOR_ATTACHMENT_READ: Self = Self(1 << 1);
    pub const COLOR_ATTACHMENT_WRITE: Self = Self(1 << 2);
    pub const SHADER_READ: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for AccessMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Execution/memory dependency between two subpasses.
///
/// `by_region` restricts the dependency to the same pixel region; only valid
/// when the consumer reads exactly the pixels the producer wrote.
#[derive(Debug, Clone, Copy)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage: StageMask,
    pub dst_stage: StageMask,
    pub src_access: AccessMask,
    pub dst_access: AccessMask,
    pub by_region: bool,
}

/// Complete render-pass description
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
    pub dependencies: Vec<SubpassDependency>,
}

/// Clear value for one attachment at render-pass begin
#[derive(Debug, Clone, Copy)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
    Sint32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u32 {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 | VertexFormat::Sint32x4 => 16,
        }
    }
}

/// Per-binding vertex buffer layout (vertex rate only)
#[derive(Debug, Clone, Copy)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
}

/// Single vertex attribute
#[derive(Debug, Clone, Copy)]
pub struct VertexAttributeDesc {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Back,
}

/// Compare function for depth testing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    LessEqual,
    Always,
}

/// Depth test/write state
#[derive(Debug, Clone, Copy)]
pub struct DepthState {
    pub test_enable: bool,
    pub write_enable: bool,
    pub compare: CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enable: true,
            write_enable: true,
            compare: CompareOp::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWrites(pub u32);

impl ColorWrites {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0xF);

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Per-color-target blend/write state.
///
/// A zero `write_mask` keeps the target bound but discards all fragment
/// output, which is how the depth prepass disables color writes.
#[derive(Debug, Clone, Copy)]
pub struct ColorTargetState {
    pub blend_enable: bool,
    pub write_mask: ColorWrites,
}

impl ColorTargetState {
    pub fn opaque() -> Self {
        Self {
            blend_enable: false,
            write_mask: ColorWrites::ALL,
        }
    }

    pub fn disabled() -> Self {
        Self {
            blend_enable: false,
            write_mask: ColorWrites::NONE,
        }
    }
}

/// Graphics pipeline description.
///
/// Viewport and scissor are always dynamic state; shaders are pre-compiled
/// SPIR-V words.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub vertex_spirv: Vec<u32>,
    pub fragment_spirv: Vec<u32>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttributeDesc>,
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub depth: Option<DepthState>,
    pub color_targets: Vec<ColorTargetState>,
    pub layout: super::traits::PipelineLayoutHandle,
    pub render_pass: super::traits::RenderPassHandle,
    pub subpass: u32,
}

/// Shader stage visibility flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStages(u32);

impl ShaderStages {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const ALL: Self = Self((1 << 0) | (1 << 1));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStages {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Descriptor binding kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    UniformBuffer,
    CombinedImageSampler,
    InputAttachment,
}

/// One binding of a descriptor-set layout
#[derive(Debug, Clone, Copy)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: ShaderStages,
}

/// One write into an allocated descriptor set
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    UniformBuffer {
        binding: u32,
        buffer: super::traits::BufferHandle,
    },
    CombinedImageSampler {
        binding: u32,
        texture: super::traits::TextureHandle,
        sampler: super::traits::SamplerHandle,
    },
    InputAttachment {
        binding: u32,
        texture: super::traits::TextureHandle,
    },
}

/// Sampler filter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Sampler address mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
}

/// Sampler description
#[derive(Debug, Clone)]
pub struct SamplerDesc {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub address_mode: AddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            address_mode: AddressMode::Repeat,
        }
    }
}

/// Framebuffer attachment source: a swapchain image view or an engine texture
#[derive(Debug, Clone, Copy)]
pub enum AttachmentView {
    SwapchainImage(u32),
    Texture(super::traits::TextureHandle),
}
