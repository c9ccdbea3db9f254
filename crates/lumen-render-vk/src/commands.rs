// SPDX-License-Identifier: CEPL-1.0
//! Command pool, the persistent per-frame command buffer and one-shot submissions.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error};

use crate::context::GpuContext;
use crate::error::{RenderError, Result};

/// Access and stage masks for one supported image layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Only the upload path is supported: UNDEFINED -> TRANSFER_DST -> SHADER_READ_ONLY.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<LayoutBarrier> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(LayoutBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(LayoutBarrier {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(RenderError::UnsupportedLayoutTransition { old, new }),
    }
}

pub struct CommandContext {
    ctx: Arc<GpuContext>,
    pool: vk::CommandPool,
    frame_cmd: vk::CommandBuffer,
}

impl CommandContext {
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            queue_family_index: ctx.queue_family(),
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let pool = unsafe { ctx.device().create_command_pool(&pool_info, None)? };
        let mut commands = CommandContext {
            ctx,
            pool,
            frame_cmd: vk::CommandBuffer::null(),
        };
        commands.frame_cmd = commands.allocate_command_buffer()?;
        Ok(commands)
    }

    /// The command buffer re-recorded every frame.
    pub fn frame_cmd(&self) -> vk::CommandBuffer {
        self.frame_cmd
    }

    pub fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let bufs = unsafe { self.ctx.device().allocate_command_buffers(&alloc_info)? };
        Ok(bufs[0])
    }

    pub fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer> {
        let cmd = self.allocate_command_buffer()?;
        let begin = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        if let Err(e) = unsafe { self.ctx.device().begin_command_buffer(cmd, &begin) } {
            self.free(cmd);
            return Err(e.into());
        }
        Ok(cmd)
    }

    /// End, submit without semaphores, wait for the device, free. The buffer
    /// is freed even when submission fails.
    pub fn end_single_time_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let device = self.ctx.device();
        let submitted = unsafe {
            device.end_command_buffer(cmd).and_then(|()| {
                let submit = vk::SubmitInfo {
                    command_buffer_count: 1,
                    p_command_buffers: &cmd,
                    ..Default::default()
                };
                device.queue_submit(self.ctx.queue(), std::slice::from_ref(&submit), vk::Fence::null())
            })
        };
        // Also covers the failure path: the buffer may be pending even if a later call failed.
        self.ctx.wait_idle();
        self.free(cmd);
        submitted.map_err(Into::into)
    }

    /// Record a layout transition barrier on a one-shot buffer and wait for it.
    pub fn change_image_layout(
        &self,
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let masks = transition_masks(old, new).inspect_err(|e| error!("{e}"))?;

        let barrier = vk::ImageMemoryBarrier {
            src_access_mask: masks.src_access,
            dst_access_mask: masks.dst_access,
            old_layout: old,
            new_layout: new,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };

        let cmd = self.begin_single_time_commands()?;
        unsafe {
            self.ctx.device().cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            );
        }
        self.end_single_time_commands(cmd)
    }

    fn free(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.ctx
                .device()
                .free_command_buffers(self.pool, std::slice::from_ref(&cmd))
        };
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        unsafe {
            if self.frame_cmd != vk::CommandBuffer::null() {
                self.ctx
                    .device()
                    .free_command_buffers(self.pool, std::slice::from_ref(&self.frame_cmd));
            }
            self.ctx.device().destroy_command_pool(self.pool, None);
        }
        debug!("command pool destroyed");
    }
}
