// SPDX-License-Identifier: CEPL-1.0
//! Swapchain and everything sized by it: image views, render pass, framebuffers.

use std::sync::Arc;

use ash::vk;
use lumen_render::{RenderSize, SurfaceHost};
use tracing::{debug, info, warn};

use crate::context::GpuContext;
use crate::error::{creation, Result};

pub const SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// 8-bit BGRA sRGB unless the surface advertises formats and that one is not among them.
pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let preferred = |f: &vk::SurfaceFormatKHR| {
        f.format == SURFACE_FORMAT.format && f.color_space == SURFACE_FORMAT.color_space
    };
    if formats.is_empty() || formats.iter().any(preferred) {
        return SURFACE_FORMAT;
    }
    warn!(
        "surface does not advertise {:?}/{:?}; using {:?}/{:?}",
        SURFACE_FORMAT.format, SURFACE_FORMAT.color_space, formats[0].format, formats[0].color_space
    );
    formats[0]
}

pub(crate) fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// `current_extent` of `u32::MAX` means the window system lets the swapchain pick.
pub(crate) fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Resolve the surface extent, parking on the host's event wait while either
/// the drawable or the surface has zero area.
pub(crate) fn wait_for_drawable_extent<H, Q>(host: &mut H, mut query: Q) -> Result<vk::Extent2D>
where
    H: SurfaceHost + ?Sized,
    Q: FnMut(RenderSize) -> Result<vk::Extent2D>,
{
    let mut logged = false;
    loop {
        let size = host.drawable_size();
        let extent = query(size)?;
        if !size.is_zero_area() && extent.width != 0 && extent.height != 0 {
            return Ok(extent);
        }
        if !logged {
            info!("drawable has zero area; waiting for a resize");
            logged = true;
        }
        host.wait_event();
    }
}

/// Replace the stack in `slot` once the drawable has a usable extent.
///
/// The old stack is dropped before `build` runs, so at most one is ever alive;
/// if `build` fails the slot is left empty.
pub(crate) fn rebuild_stack<S, H, Q, B>(slot: &mut Option<S>, host: &mut H, query: Q, build: B) -> Result<()>
where
    H: SurfaceHost + ?Sized,
    Q: FnMut(RenderSize) -> Result<vk::Extent2D>,
    B: FnOnce(vk::Extent2D) -> Result<S>,
{
    let extent = wait_for_drawable_extent(host, query)?;
    drop(slot.take());
    *slot = Some(build(extent)?);
    Ok(())
}

/// Swapchain plus its dependents. Views, render pass and framebuffers always
/// match the swapchain's image count and die with it.
pub struct SwapchainStack {
    ctx: Arc<GpuContext>,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    image_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
}

impl SwapchainStack {
    pub fn new(ctx: Arc<GpuContext>, hint: RenderSize) -> Result<Self> {
        let surface_loader = ctx.surface_loader();
        let (phys, surface) = (ctx.physical_device(), ctx.surface());

        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(phys, surface)? };
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(phys, surface)? };
        let modes = unsafe { surface_loader.get_physical_device_surface_present_modes(phys, surface)? };

        let surface_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&modes);
        let extent = extent_from_caps(&caps, hint);

        let mut stack = SwapchainStack {
            ctx: Arc::clone(&ctx),
            swapchain: vk::SwapchainKHR::null(),
            format: surface_format.format,
            extent,
            present_mode,
            image_views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            surface,
            min_image_count: caps.min_image_count,
            image_format: surface_format.format,
            image_color_space: surface_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            ..Default::default()
        };
        stack.swapchain = unsafe { ctx.swapchain_loader().create_swapchain(&swap_info, None) }
            .map_err(creation("vkCreateSwapchainKHR"))?;

        let images = unsafe { ctx.swapchain_loader().get_swapchain_images(stack.swapchain)? };
        for &image in &images {
            let view = create_image_view(ctx.device(), image, stack.format)?;
            stack.image_views.push(view);
        }

        stack.render_pass = create_render_pass(ctx.device(), stack.format)?;

        for &view in &stack.image_views {
            let fb_info = vk::FramebufferCreateInfo {
                render_pass: stack.render_pass,
                attachment_count: 1,
                p_attachments: &view,
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            let fb = unsafe { ctx.device().create_framebuffer(&fb_info, None)? };
            stack.framebuffers.push(fb);
        }

        info!(
            "swapchain ready ({}x{}, {:?}, {:?}, {} images)",
            extent.width,
            extent.height,
            stack.format,
            present_mode,
            images.len()
        );
        Ok(stack)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn image_count(&self) -> usize {
        self.image_views.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }
}

impl Drop for SwapchainStack {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        let device = self.ctx.device();
        unsafe {
            for fb in self.framebuffers.drain(..) {
                device.destroy_framebuffer(fb, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
            }
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.ctx.swapchain_loader().destroy_swapchain(self.swapchain, None);
            }
        }
        debug!("swapchain destroyed");
    }
}

pub(crate) fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let iv_info = vk::ImageViewCreateInfo {
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    Ok(unsafe { device.create_image_view(&iv_info, None)? })
}

// Single color attachment: clear on load, keep on store, hand off for present.
fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color_att = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };
    // The acquire semaphore is waited at COLOR_ATTACHMENT_OUTPUT, so the
    // layout transition has to wait there too.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let rp_info = vk::RenderPassCreateInfo {
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    Ok(unsafe { device.create_render_pass(&rp_info, None)? })
}
