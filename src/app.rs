//! Application context and sample harness
//!
//! `AppContext` owns everything process-wide: the device, the frame
//! orchestrator, the three named registries and the texture cache. Samples
//! implement [`SampleApp`] and get composed into the run loop; none of them
//! overrides scaffold behavior.

use log::{error, info, warn};

use crate::backend::{
    BackendResult, CommandHandle, DescriptorSetLayoutHandle, PipelineLayoutHandle, RenderDevice,
    RenderPassHandle,
};
use crate::backend::vulkan::VulkanDevice;
use crate::frame::{FrameOrchestrator, FrameOutcome};
use crate::pipeline::{LayoutId, PassId};
use crate::registry::Registry;
use crate::resources::{AssetError, TextureCache};
use crate::window;
use crate::AppConfig;

/// Process-wide engine state shared by every sample
pub struct AppContext<D: RenderDevice> {
    pub device: D,
    pub frames: FrameOrchestrator,
    pub render_passes: Registry<PassId, RenderPassHandle>,
    pub ds_layouts: Registry<LayoutId, DescriptorSetLayoutHandle>,
    pub pipeline_layouts: Registry<LayoutId, PipelineLayoutHandle>,
    pub textures: TextureCache,
}

impl<D: RenderDevice> AppContext<D> {
    pub fn new(mut device: D) -> BackendResult<Self> {
        let image_count = device.image_count();
        let frames = FrameOrchestrator::new(&mut device, image_count)?;
        Ok(Self {
            device,
            frames,
            render_passes: Registry::new(),
            ds_layouts: Registry::new(),
            pipeline_layouts: Registry::new(),
            textures: TextureCache::new(),
        })
    }

    /// Run one frame through the orchestrator. Out-of-date surfaces skip the
    /// frame and report `Skipped`.
    pub fn render_frame<F>(&mut self, record: F) -> BackendResult<FrameOutcome>
    where
        F: FnMut(&mut D, CommandHandle, u32) -> BackendResult<()>,
    {
        self.frames.render_frame(&mut self.device, record)
    }

    /// Ordered teardown of everything the context owns. The sample's own
    /// cleanup must already have run.
    pub fn shutdown(&mut self) {
        self.device.wait_idle();

        self.textures.cleanup(&mut self.device);

        let device = &mut self.device;
        self.render_passes
            .cleanup(|pass| device.destroy_render_pass(pass));
        self.pipeline_layouts
            .cleanup(|layout| device.destroy_pipeline_layout(layout));
        self.ds_layouts
            .cleanup(|layout| device.destroy_descriptor_set_layout(layout));

        self.frames.destroy(&mut self.device);
    }
}

impl AppContext<VulkanDevice> {
    /// Rebuild the swapchain after a resize and re-pair the frame slots if
    /// the image count changed. The sample's `on_resize` runs after this.
    pub fn handle_resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        self.device.wait_idle();
        self.device.recreate_swapchain(width, height)?;
        let image_count = self.device.image_count();
        if self.frames.image_count() != image_count {
            self.frames.destroy(&mut self.device);
            self.frames = FrameOrchestrator::new(&mut self.device, image_count)?;
        }
        Ok(())
    }
}

/// Capability set each sample implements; selected at startup by
/// composition.
pub trait SampleApp<D: RenderDevice> {
    /// Create pipelines, load assets, register passes/layouts.
    fn prepare(&mut self, ctx: &mut AppContext<D>) -> Result<(), AssetError>;

    /// Record and submit one frame.
    fn render(&mut self, ctx: &mut AppContext<D>) -> BackendResult<FrameOutcome>;

    /// Swapchain was rebuilt; recreate swapchain-sized resources.
    fn on_resize(&mut self, ctx: &mut AppContext<D>) -> BackendResult<()>;

    /// Destroy everything the sample created, before context shutdown.
    fn cleanup(&mut self, ctx: &mut AppContext<D>);
}

/// Run a sample against the Vulkan device until the window closes.
///
/// GPU errors are unrecoverable by design: they propagate here, get logged
/// and terminate the loop. Out-of-date surfaces never reach this point.
pub fn run_sample<S>(config: AppConfig, sample: S)
where
    S: SampleApp<VulkanDevice> + 'static,
{
    let _ = env_logger::try_init();

    let AppConfig {
        title,
        width,
        height,
        vsync,
    } = config;

    let mut state: Option<(AppContext<VulkanDevice>, S)> = None;
    let mut sample = Some(sample);
    let mut failed = false;

    window::run(&title, width, height, move |window| {
        if failed {
            return;
        }

        // Device creation is deferred to the first loop iteration so the
        // window exists.
        if state.is_none() {
            let result = VulkanDevice::new(window.window_arc(), vsync)
                .and_then(AppContext::new)
                .map_err(AssetError::from)
                .and_then(|mut ctx| {
                    let mut s = sample.take().expect("sample consumed twice");
                    s.prepare(&mut ctx)?;
                    Ok((ctx, s))
                });
            match result {
                Ok(pair) => {
                    info!("engine initialized");
                    state = Some(pair);
                }
                Err(e) => {
                    error!("initialization failed: {e}");
                    failed = true;
                    return;
                }
            }
        }

        if window.should_close() {
            if let Some((mut ctx, mut app)) = state.take() {
                app.cleanup(&mut ctx);
                ctx.shutdown();
            }
            return;
        }

        let Some((ctx, app)) = state.as_mut() else {
            return;
        };

        if window.is_minimized() {
            return;
        }

        if window.was_resized() {
            window.clear_resize_flag();
            let (w, h) = window.dimensions();
            if let Err(e) = ctx.handle_resize(w, h).and_then(|_| app.on_resize(ctx)) {
                error!("resize failed: {e}");
                failed = true;
                return;
            }
        }

        match app.render(ctx) {
            Ok(FrameOutcome::Rendered) => {}
            Ok(FrameOutcome::Skipped) => {
                warn!("frame skipped (surface out of date)");
            }
            Err(e) => {
                // Unrecoverable by contract; log and stop rendering.
                error!("render failed: {e}");
                failed = true;
            }
        }
    });
}
