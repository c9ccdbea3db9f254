// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace, warn};

use crate::context::GpuContext;
use crate::error::Result;

/// Per-poll timeout for the in-flight fence; a timeout just polls again.
pub const FENCE_POLL_TIMEOUT_NS: u64 = 1_000_000_000;

/// The single frame in flight: acquire -> render -> present ordering.
pub struct FrameSync {
    ctx: Arc<GpuContext>,
    pub image_acquired: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        let mut sync = FrameSync {
            ctx,
            image_acquired: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
        };
        sync.create_objects()?;
        Ok(sync)
    }

    fn create_objects(&mut self) -> Result<()> {
        let device = self.ctx.device();
        let sem_ci = vk::SemaphoreCreateInfo::default();
        // Signaled so the very first wait returns immediately.
        let fence_ci = vk::FenceCreateInfo {
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        unsafe {
            self.image_acquired = device.create_semaphore(&sem_ci, None)?;
            self.render_finished = device.create_semaphore(&sem_ci, None)?;
            self.in_flight = device.create_fence(&fence_ci, None)?;
        }
        Ok(())
    }

    fn destroy_objects(&mut self) {
        let device = self.ctx.device();
        unsafe {
            if self.in_flight != vk::Fence::null() {
                device.destroy_fence(self.in_flight, None);
            }
            if self.render_finished != vk::Semaphore::null() {
                device.destroy_semaphore(self.render_finished, None);
            }
            if self.image_acquired != vk::Semaphore::null() {
                device.destroy_semaphore(self.image_acquired, None);
            }
        }
        self.in_flight = vk::Fence::null();
        self.render_finished = vk::Semaphore::null();
        self.image_acquired = vk::Semaphore::null();
    }

    /// Replace all three objects with fresh ones, the fence signaled again.
    /// Used when a frame could not be drained through the queue.
    pub fn recreate(&mut self) -> Result<()> {
        self.ctx.wait_idle();
        self.destroy_objects();
        warn!("frame sync objects recreated");
        self.create_objects()
    }

    /// Block until the previous submission has retired.
    pub fn wait_in_flight(&self) -> Result<()> {
        let device = self.ctx.device();
        loop {
            match unsafe { device.wait_for_fences(&[self.in_flight], true, FENCE_POLL_TIMEOUT_NS) } {
                Ok(()) => return Ok(()),
                Err(vk::Result::TIMEOUT) => trace!("in-flight fence still pending"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn reset_in_flight(&self) -> Result<()> {
        unsafe { self.ctx.device().reset_fences(&[self.in_flight])? };
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        self.destroy_objects();
        debug!("frame sync destroyed");
    }
}
