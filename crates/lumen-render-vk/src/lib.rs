// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: GPU context, swapchain, commands, frame sync and resources.
#![deny(unsafe_op_in_unsafe_fn)]

mod commands;
mod context;
mod device;
mod error;
mod frame;
mod pipeline;
mod resources;
mod swapchain;
mod sync;

pub use ash::vk;

pub use commands::{transition_masks, CommandContext, LayoutBarrier};
pub use context::GpuContext;
pub use device::{RenderingDevice, DEFAULT_CLEAR};
pub use error::{RenderError, Result};
pub use frame::{AcquireOutcome, FrameLoop, FrameOps, FramePhase, FrameStatus, PresentOutcome};
pub use pipeline::{load_shader_code, ShaderPipeline};
pub use resources::{find_memory_type, vertex_bytes, GpuBuffer, GpuImage, Vertex, VERTEX_STRIDE};
pub use swapchain::{SwapchainStack, SURFACE_FORMAT};
pub use sync::FrameSync;
