// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight.
//!
//! Each slot owns a command buffer, an image-available semaphore, a
//! render-finished semaphore and an in-flight fence. A slot's command
//! buffer and uniform buffer are only touched after its fence signals.

use anyhow::Result;
use ash::vk;
use bitflags::bitflags;
use tessera_math::FrameUniforms;
use tessera_render::FrameStatus;
use tracing::{debug, info};

use crate::error::VkResultExt;

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

bitflags! {
    /// Why the swapchain is being rebuilt.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RebuildReason: u8 {
        const OUT_OF_DATE = 1 << 0;
        const SUBOPTIMAL = 1 << 1;
        const RESIZED = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Device operations one frame is made of. `slot` is always
/// `< MAX_FRAMES_IN_FLIGHT`.
pub trait FrameBackend {
    /// Blocks until the slot's fence is signaled.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    /// Signals the slot's image-available semaphore when the image is ready.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    fn write_uniforms(&mut self, slot: usize, uniforms: &FrameUniforms);
    fn reset_fence(&mut self, slot: usize) -> Result<()>;
    /// Resets and re-records the slot's command buffer for `image_index`.
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;
    /// Waits image-available, signals render-finished and the fence.
    fn submit(&mut self, slot: usize) -> Result<()>;
    /// Waits render-finished.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    fn rebuild_swapchain(&mut self, reason: RebuildReason) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct FrameScheduler {
    current_frame: usize,
    resized: bool,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Forces a rebuild after the next present.
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    pub fn draw_frame(
        &mut self,
        backend: &mut dyn FrameBackend,
        uniforms: &FrameUniforms,
    ) -> Result<FrameStatus> {
        let slot = self.current_frame;
        backend.wait_for_slot(slot)?;

        let image_index = match backend.acquire_image(slot)? {
            AcquireOutcome::Image(i) => i,
            AcquireOutcome::OutOfDate => {
                // Fence untouched: the slot stays idle for the retry.
                let mut reason = RebuildReason::OUT_OF_DATE;
                if std::mem::take(&mut self.resized) {
                    reason |= RebuildReason::RESIZED;
                }
                backend.rebuild_swapchain(reason)?;
                return Ok(FrameStatus::Skipped);
            }
        };

        backend.write_uniforms(slot, uniforms);
        backend.reset_fence(slot)?;
        backend.record(slot, image_index)?;
        backend.submit(slot)?;

        let mut reason = match backend.present(slot, image_index)? {
            PresentOutcome::Presented => RebuildReason::empty(),
            PresentOutcome::Suboptimal => RebuildReason::SUBOPTIMAL,
            PresentOutcome::OutOfDate => RebuildReason::OUT_OF_DATE,
        };
        if std::mem::take(&mut self.resized) {
            reason |= RebuildReason::RESIZED;
        }
        if !reason.is_empty() {
            info!("rebuilding swapchain: {reason:?}");
            backend.rebuild_swapchain(reason)?;
        }

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(FrameStatus::Presented)
    }
}

pub struct FrameSlot {
    pub(crate) command_buffer: vk::CommandBuffer,
    pub(crate) image_available: vk::Semaphore,
    pub(crate) render_finished: vk::Semaphore,
    pub(crate) in_flight: vk::Fence,
}

/// One slot per frame in flight. Fences start signaled so the first pass
/// through each slot does not block.
pub unsafe fn create_frame_slots(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<Vec<FrameSlot>> {
    let alloc_info = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: MAX_FRAMES_IN_FLIGHT as u32,
        ..Default::default()
    };
    let command_buffers = device
        .allocate_command_buffers(&alloc_info)
        .op("allocate_command_buffers(frames)")?;

    let sem_ci = vk::SemaphoreCreateInfo::default();
    let fence_ci = vk::FenceCreateInfo {
        s_type: vk::StructureType::FENCE_CREATE_INFO,
        flags: vk::FenceCreateFlags::SIGNALED,
        ..Default::default()
    };

    let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
    for command_buffer in command_buffers {
        slots.push(FrameSlot {
            command_buffer,
            image_available: device
                .create_semaphore(&sem_ci, None)
                .op("create_semaphore(image_available)")?,
            render_finished: device
                .create_semaphore(&sem_ci, None)
                .op("create_semaphore(render_finished)")?,
            in_flight: device
                .create_fence(&fence_ci, None)
                .op("create_fence(in_flight)")?,
        });
    }
    debug!("{} frame slots created", slots.len());
    Ok(slots)
}

pub unsafe fn destroy_frame_slots(device: &ash::Device, slots: &mut Vec<FrameSlot>) {
    for slot in slots.drain(..) {
        device.destroy_semaphore(slot.image_available, None);
        device.destroy_semaphore(slot.render_finished, None);
        device.destroy_fence(slot.in_flight, None);
    }
}
