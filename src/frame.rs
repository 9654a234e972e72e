//! Per-frame command orchestration
//!
//! One command buffer and one fence per swapchain image. The fence gates
//! reuse: a command buffer is never re-recorded until the fence of its prior
//! submission has signaled. `render_frame` wraps acquire, fence wait,
//! recording, submit and present into a single scoped operation so callers
//! cannot omit the wait.

use log::{debug, trace};

use crate::backend::{
    AcquireResult, BackendResult, CommandHandle, FenceHandle, PresentResult, RenderDevice,
    SemaphoreHandle,
};

/// Recording state of one swapchain image's command buffer.
///
/// Idle → Recording on acquire (after the fence wait), Recording → Submitted
/// on queue submit, Submitted → Idle implicitly on the next acquire of the
/// same image index once the GPU has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
}

struct FrameSlot {
    command: CommandHandle,
    fence: FenceHandle,
    state: FrameState,
}

/// Outcome of one `render_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Recorded, submitted and presented
    Rendered,
    /// Surface was out of date; nothing was recorded or submitted
    Skipped,
}

pub struct FrameOrchestrator {
    slots: Vec<FrameSlot>,
    image_available: SemaphoreHandle,
    render_finished: SemaphoreHandle,
}

impl FrameOrchestrator {
    /// Create one command/fence pair per swapchain image. Fences start
    /// signaled so the first wait on each slot passes immediately.
    pub fn new(device: &mut impl RenderDevice, image_count: u32) -> BackendResult<Self> {
        let mut slots = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            slots.push(FrameSlot {
                command: device.allocate_command_buffer()?,
                fence: device.create_fence(true)?,
                state: FrameState::Idle,
            });
        }
        Ok(Self {
            slots,
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
        })
    }

    pub fn image_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Run one frame: acquire an image, wait on that image's fence, hand the
    /// command buffer to `record`, then submit and present.
    ///
    /// An out-of-date surface skips the frame entirely; no command buffer is
    /// touched and nothing is submitted. This is the expected path during a
    /// resize, not an error.
    pub fn render_frame<D, F>(&mut self, device: &mut D, mut record: F) -> BackendResult<FrameOutcome>
    where
        D: RenderDevice,
        F: FnMut(&mut D, CommandHandle, u32) -> BackendResult<()>,
    {
        let image_index = match device.acquire_next_image(self.image_available)? {
            AcquireResult::Ready(index) => index,
            AcquireResult::OutOfDate => {
                debug!("surface out of date on acquire, skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
        };

        let slot = &mut self.slots[image_index as usize];

        // The GPU may still be consuming this slot's command buffer from its
        // previous submission; the fence wait is the only backpressure.
        device.wait_fence(slot.fence)?;
        slot.state = FrameState::Idle;

        device.begin_command_buffer(slot.command)?;
        slot.state = FrameState::Recording;

        record(device, slot.command, image_index)?;

        device.end_command_buffer(slot.command)?;
        device.reset_fence(slot.fence)?;
        device.queue_submit(
            slot.command,
            self.image_available,
            self.render_finished,
            slot.fence,
        )?;
        slot.state = FrameState::Submitted;

        match device.queue_present(image_index, self.render_finished)? {
            PresentResult::Presented => trace!("presented image {image_index}"),
            PresentResult::OutOfDate => {
                // Already submitted; the swapchain rebuild happens on the
                // resize event that caused this.
                debug!("surface out of date on present");
            }
        }

        Ok(FrameOutcome::Rendered)
    }

    pub fn state(&self, image_index: u32) -> FrameState {
        self.slots[image_index as usize].state
    }

    /// Destroy all per-image objects. Callers must have waited for device
    /// idle first.
    pub fn destroy(&mut self, device: &mut impl RenderDevice) {
        for slot in self.slots.drain(..) {
            device.free_command_buffer(slot.command);
            device.destroy_fence(slot.fence);
        }
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
    }
}
