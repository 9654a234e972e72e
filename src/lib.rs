//! vk-sample-engine - a Vulkan sample-app scaffold
//!
//! The reusable substrate under a family of graphics-technique demos:
//!
//! - explicit GPU resource lifecycle (create/destroy pairs, memory bound at
//!   creation, sizes from reported requirements)
//! - named registries for render passes and layouts with bulk teardown
//! - per-swapchain-image command/fence orchestration with fence-gated reuse
//! - a three-subpass deferred G-buffer pipeline with by-region dependencies
//! - a skinned-mesh asset loader with flat buffers, bone palettes and
//!   staging-buffer bulk upload
//!
//! All GPU access goes through the [`backend::RenderDevice`] trait; the ash
//! implementation lives in [`backend::vulkan`].

pub mod app;
pub mod backend;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod resources;
pub mod scene;
pub mod window;

pub use app::{run_sample, AppContext, SampleApp};
pub use frame::{FrameOrchestrator, FrameOutcome, FrameState};
pub use registry::Registry;

/// Configuration for a sample executable
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Sample".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
        }
    }
}
