// SPDX-License-Identifier: CEPL-1.0
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use lumen_render::{HasDisplayHandle, HasWindowHandle, RenderSize, ScissorRect, SurfaceHost, Viewport};
use tracing::{debug, error, info, warn};

use crate::commands::CommandContext;
use crate::context::GpuContext;
use crate::error::{RenderError, Result};
use crate::frame::{AcquireOutcome, FrameLoop, FrameOps, FramePhase, FrameStatus, PresentOutcome};
use crate::pipeline::{load_shader_code, ShaderPipeline};
use crate::resources::{vertex_bytes, write_vertices, GpuBuffer, GpuImage, Vertex};
use crate::swapchain::{extent_from_caps, rebuild_stack, SwapchainStack};
use crate::sync::FrameSync;

pub const DEFAULT_CLEAR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

/// Owns every GPU object of the harness and sequences frames.
///
/// Per frame: `begin_render_pass` -> `set_viewport`/`set_scissors` ->
/// `bind_shader`/`bind_vertex_buffer`/`draw` -> `end_render_pass` -> `present`.
/// A single frame is in flight; the CPU blocks only on the in-flight fence at
/// the top of `begin_render_pass`.
pub struct RenderingDevice {
    frames: FrameLoop,
    clear: vk::ClearValue,
    // Field order is teardown order: sync, commands, swapchain, then the context.
    sync: FrameSync,
    commands: CommandContext,
    swapchain: Option<SwapchainStack>,
    ctx: Arc<GpuContext>,
}

impl RenderingDevice {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
    ) -> Result<Self> {
        let ctx = GpuContext::new(window, display)?;
        let swapchain = SwapchainStack::new(Arc::clone(&ctx), size)?;
        let commands = CommandContext::new(Arc::clone(&ctx))?;
        let sync = FrameSync::new(Arc::clone(&ctx))?;
        info!("rendering device ready");

        Ok(RenderingDevice {
            frames: FrameLoop::default(),
            clear: clear_value(DEFAULT_CLEAR),
            sync,
            commands,
            swapchain: Some(swapchain),
            ctx,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    pub fn commands(&self) -> &CommandContext {
        &self.commands
    }

    pub fn swapchain(&self) -> Option<&SwapchainStack> {
        self.swapchain.as_ref()
    }

    /// Current framebuffer size, zero while no swapchain exists.
    pub fn extent(&self) -> RenderSize {
        self.swapchain
            .as_ref()
            .map(|s| RenderSize::new(s.extent().width, s.extent().height))
            .unwrap_or_default()
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = clear_value(rgba);
    }

    pub fn wait_idle(&self) {
        self.ctx.wait_idle();
    }

    /// Rebuild the swapchain stack, blocking while the drawable has zero area.
    pub fn recreate_swapchain<H: SurfaceHost + ?Sized>(&mut self, host: &mut H) -> Result<()> {
        if self.frames.phase() != FramePhase::Idle {
            return Err(RenderError::FrameOrder {
                expected: "idle",
                found: self.frames.phase().name(),
            });
        }
        rebuild_swapchain(&self.ctx, &mut self.swapchain, host)
    }

    /// Split the borrow into the state machine and the GPU side it drives.
    fn frame<'a, H: SurfaceHost + ?Sized>(
        &'a mut self,
        host: &'a mut H,
    ) -> (&'a mut FrameLoop, DeviceFrame<'a, H>) {
        let ops = DeviceFrame {
            ctx: &self.ctx,
            swapchain: &mut self.swapchain,
            commands: &self.commands,
            sync: &mut self.sync,
            clear: self.clear,
            host,
        };
        (&mut self.frames, ops)
    }

    pub fn begin_render_pass<H: SurfaceHost + ?Sized>(&mut self, host: &mut H) -> Result<FrameStatus> {
        let (frames, mut ops) = self.frame(host);
        frames.begin(&mut ops)
    }

    /// `host` is only consulted if the frame has to be dropped and the swapchain rebuilt.
    pub fn end_render_pass<H: SurfaceHost + ?Sized>(&mut self, host: &mut H) -> Result<()> {
        let (frames, mut ops) = self.frame(host);
        frames.end(&mut ops)
    }

    pub fn present<H: SurfaceHost + ?Sized>(&mut self, host: &mut H) -> Result<FrameStatus> {
        let (frames, mut ops) = self.frame(host);
        frames.present(&mut ops)
    }

    fn recording_cmd(&self) -> Result<vk::CommandBuffer> {
        match self.frames.recording_image() {
            Some(_) => Ok(self.commands.frame_cmd()),
            None => Err(RenderError::FrameOrder {
                expected: "recording",
                found: self.frames.phase().name(),
            }),
        }
    }

    pub fn set_viewport(&self, viewport: Viewport) -> Result<()> {
        let cmd = self.recording_cmd()?;
        let vp = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.ctx.device().cmd_set_viewport(cmd, 0, &[vp]) };
        Ok(())
    }

    pub fn set_scissors(&self, scissor: ScissorRect) -> Result<()> {
        let cmd = self.recording_cmd()?;
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: scissor.x, y: scissor.y },
            extent: vk::Extent2D {
                width: scissor.width,
                height: scissor.height,
            },
        };
        unsafe { self.ctx.device().cmd_set_scissor(cmd, 0, &[rect]) };
        Ok(())
    }

    pub fn bind_shader(&self, shader: &ShaderPipeline) -> Result<()> {
        let cmd = self.recording_cmd()?;
        unsafe {
            self.ctx
                .device()
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, shader.pipeline())
        };
        Ok(())
    }

    pub fn bind_vertex_buffer(&self, buffer: &GpuBuffer) -> Result<()> {
        let cmd = self.recording_cmd()?;
        unsafe {
            self.ctx
                .device()
                .cmd_bind_vertex_buffers(cmd, 0, &[buffer.handle()], &[0])
        };
        Ok(())
    }

    /// Non-indexed draw of `vertex_count` vertices, one instance.
    pub fn draw(&self, vertex_count: u32) -> Result<()> {
        let cmd = self.recording_cmd()?;
        unsafe { self.ctx.device().cmd_draw(cmd, vertex_count, 1, 0, 0) };
        Ok(())
    }

    /// Load two SPIR-V files and build the pipeline against the current render pass.
    pub fn create_shader(&self, vertex_path: &Path, fragment_path: &Path) -> Result<ShaderPipeline> {
        let vertex_code = load_shader_code(vertex_path)?;
        let fragment_code = load_shader_code(fragment_path)?;
        let render_pass = self
            .swapchain
            .as_ref()
            .ok_or(RenderError::SwapchainMissing)?
            .render_pass();
        ShaderPipeline::new(Arc::clone(&self.ctx), render_pass, &vertex_code, &fragment_code)
    }

    /// Host-visible, host-coherent vertex buffer holding exactly `vertices`.
    pub fn create_vertex_buffer(&self, vertices: &[Vertex]) -> Result<GpuBuffer> {
        if vertices.is_empty() {
            return Err(RenderError::EmptyVertexBuffer);
        }
        let size = vertex_bytes(vertices).len() as vk::DeviceSize;
        let buffer = self.create_buffer(
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.with_mapped(|mapped| write_vertices(mapped, vertices))?;
        Ok(buffer)
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<GpuBuffer> {
        GpuBuffer::new(Arc::clone(&self.ctx), size, usage, props)
    }

    pub fn create_image(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<GpuImage> {
        GpuImage::new(
            Arc::clone(&self.ctx),
            vk::Extent2D { width, height },
            format,
            usage,
            props,
        )
    }

    pub fn change_image_layout(
        &self,
        image: &GpuImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        self.commands.change_image_layout(image.handle(), old, new)
    }
}

impl Drop for RenderingDevice {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        info!("rendering device shutting down");
    }
}

fn clear_value(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}

fn rebuild_swapchain<H: SurfaceHost + ?Sized>(
    ctx: &Arc<GpuContext>,
    slot: &mut Option<SwapchainStack>,
    host: &mut H,
) -> Result<()> {
    let query = |size: RenderSize| -> Result<vk::Extent2D> {
        let caps = unsafe {
            ctx.surface_loader()
                .get_physical_device_surface_capabilities(ctx.physical_device(), ctx.surface())?
        };
        Ok(extent_from_caps(&caps, size))
    };
    rebuild_stack(slot, host, query, |extent| {
        SwapchainStack::new(Arc::clone(ctx), RenderSize::new(extent.width, extent.height))
    })
}

/// Borrowed view of the device handed to `FrameLoop` for one call.
struct DeviceFrame<'a, H: ?Sized> {
    ctx: &'a Arc<GpuContext>,
    swapchain: &'a mut Option<SwapchainStack>,
    commands: &'a CommandContext,
    sync: &'a mut FrameSync,
    clear: vk::ClearValue,
    host: &'a mut H,
}

impl<H: SurfaceHost + ?Sized> DeviceFrame<'_, H> {
    fn stack(&self) -> Result<&SwapchainStack> {
        self.swapchain.as_ref().ok_or(RenderError::SwapchainMissing)
    }

    /// Submit a batch with no commands that waits on the acquire semaphore
    /// and signals the in-flight fence.
    fn drain_acquire(&self) -> Result<()> {
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.sync.image_acquired,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            ..Default::default()
        };
        self.sync.reset_in_flight()?;
        unsafe {
            self.ctx.device().queue_submit(
                self.ctx.queue(),
                std::slice::from_ref(&submit),
                self.sync.in_flight,
            )?
        };
        Ok(())
    }
}

impl<H: SurfaceHost + ?Sized> FrameOps for DeviceFrame<'_, H> {
    fn wait_for_previous_frame(&mut self) -> Result<()> {
        self.sync.wait_in_flight()
    }

    fn acquire_image(&mut self) -> Result<AcquireOutcome> {
        let swapchain = self.stack()?.handle();
        let acquired = unsafe {
            self.ctx.swapchain_loader().acquire_next_image(
                swapchain,
                u64::MAX,
                self.sync.image_acquired,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => {
                error!("acquire_next_image: {e:?}");
                Err(e.into())
            }
        }
    }

    fn begin_recording(&mut self, image_index: u32) -> Result<()> {
        let stack = self.stack()?;
        let framebuffer = stack
            .framebuffer(image_index)
            .ok_or(RenderError::SwapchainMissing)?;
        let device = self.ctx.device();
        let cmd = self.commands.frame_cmd();

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())?;

            let rp_begin = vk::RenderPassBeginInfo {
                render_pass: stack.render_pass(),
                framebuffer,
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: stack.extent(),
                },
                clear_value_count: 1,
                p_clear_values: &self.clear,
                ..Default::default()
            };
            device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    fn reset_frame_fence(&mut self) -> Result<()> {
        self.sync.reset_in_flight()
    }

    fn submit(&mut self) -> Result<()> {
        let device = self.ctx.device();
        let cmd = self.commands.frame_cmd();
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

        unsafe {
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;

            let submit = vk::SubmitInfo {
                wait_semaphore_count: 1,
                p_wait_semaphores: &self.sync.image_acquired,
                p_wait_dst_stage_mask: wait_stages.as_ptr(),
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                signal_semaphore_count: 1,
                p_signal_semaphores: &self.sync.render_finished,
                ..Default::default()
            };
            device.queue_submit(self.ctx.queue(), std::slice::from_ref(&submit), self.sync.in_flight)?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
        let swapchain = self.stack()?.handle();
        let present = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.sync.render_finished,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        match unsafe { self.ctx.swapchain_loader().queue_present(self.ctx.queue(), &present) } {
            Ok(suboptimal) => Ok(PresentOutcome::Presented { suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => {
                error!("queue_present: {e:?}");
                Err(e.into())
            }
        }
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        rebuild_swapchain(self.ctx, &mut *self.swapchain, &mut *self.host)
    }

    fn abandon_frame(&mut self, image_index: u32) -> Result<()> {
        let drained = self.drain_acquire();
        // Core Vulkan has no way to hand one image back; replacing the swapchain releases it.
        debug!("releasing image {image_index} with its swapchain");
        let rebuilt = rebuild_swapchain(self.ctx, &mut *self.swapchain, &mut *self.host);
        if let Err(e) = drained {
            warn!("could not drain dropped frame: {e}");
            self.sync.recreate()?;
        }
        rebuilt
    }
}
