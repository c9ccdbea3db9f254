// SPDX-License-Identifier: CEPL-1.0
//! The fixed graphics pipeline: position-only vertices, one color attachment, alpha blending.

use std::ffi::CStr;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use ash::util::read_spv;
use ash::vk;
use tracing::{debug, info};

use crate::context::GpuContext;
use crate::error::{creation, RenderError, Result};
use crate::resources::{Vertex, VERTEX_STRIDE};

const SHADER_ENTRY: &CStr = c"main";

/// Read a SPIR-V blob as words. Missing, unreadable or malformed files are a `ShaderLoad` error.
pub fn load_shader_code(path: &Path) -> Result<Vec<u32>> {
    let shader_err = |source| RenderError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(shader_err)?;
    let code = read_spv(&mut file).map_err(shader_err)?;
    debug!("loaded {} ({} words)", path.display(), code.len());
    Ok(code)
}

/// Destroys the module on drop, so pipeline creation can bail out early without leaking it.
struct ShaderModule<'a> {
    device: &'a ash::Device,
    module: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    fn new(device: &'a ash::Device, code: &[u32]) -> Result<Self> {
        let ci = vk::ShaderModuleCreateInfo {
            code_size: std::mem::size_of_val(code),
            p_code: code.as_ptr(),
            ..Default::default()
        };
        let module = unsafe { device.create_shader_module(&ci, None)? };
        Ok(Self { device, module })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

pub struct ShaderPipeline {
    ctx: Arc<GpuContext>,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl ShaderPipeline {
    pub fn new(
        ctx: Arc<GpuContext>,
        render_pass: vk::RenderPass,
        vertex_code: &[u32],
        fragment_code: &[u32],
    ) -> Result<Self> {
        let device = ctx.device();
        let vs = ShaderModule::new(device, vertex_code)?;
        let fs = ShaderModule::new(device, fragment_code)?;

        let stages = [
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::VERTEX,
                module: vs.module,
                p_name: SHADER_ENTRY.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fs.module,
                p_name: SHADER_ENTRY.as_ptr(),
                ..Default::default()
            },
        ];

        // binding 0, location 0: R32G32B32_SFLOAT position
        let vb = vk::VertexInputBindingDescription {
            binding: 0,
            stride: VERTEX_STRIDE as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        };
        let va = vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: std::mem::offset_of!(Vertex, position) as u32,
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: 1,
            p_vertex_binding_descriptions: &vb,
            vertex_attribute_description_count: 1,
            p_vertex_attribute_descriptions: &va,
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart_enable: vk::FALSE,
            ..Default::default()
        };

        // Viewport and scissor are recorded every frame.
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let raster = vk::PipelineRasterizationStateCreateInfo {
            depth_clamp_enable: vk::FALSE,
            rasterizer_discard_enable: vk::FALSE,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_bias_enable: vk::FALSE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            sample_shading_enable: vk::FALSE,
            min_sample_shading: 1.0,
            ..Default::default()
        };

        let color_blend_att = vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            logic_op_enable: vk::FALSE,
            logic_op: vk::LogicOp::COPY,
            attachment_count: 1,
            p_attachments: &color_blend_att,
            ..Default::default()
        };

        // No descriptors, no push constants.
        let layout_info = vk::PipelineLayoutCreateInfo::default();
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };
        let mut shader = ShaderPipeline {
            ctx: Arc::clone(&ctx),
            layout,
            pipeline: vk::Pipeline::null(),
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout,
            render_pass,
            subpass: 0,
            ..Default::default()
        };

        let pipelines = unsafe {
            device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        }
        .map_err(|(_, err)| creation("vkCreateGraphicsPipelines")(err))?;
        shader.pipeline = pipelines[0];

        info!("graphics pipeline created");
        Ok(shader)
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for ShaderPipeline {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                self.ctx.device().destroy_pipeline(self.pipeline, None);
            }
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
        debug!("pipeline destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::path::PathBuf;

    fn scratch(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("lumen-{}-{name}", std::process::id()));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn missing_shader_is_a_load_error() {
        let path = Path::new("/nonexistent/lumen/tri.vert.spv");
        match load_shader_code(path) {
            Err(RenderError::ShaderLoad { path: p, source }) => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("expected ShaderLoad, got {other:?}"),
        }
    }

    #[test]
    fn truncated_shader_is_a_load_error() {
        let path = scratch("truncated.spv", &[0x03, 0x02, 0x23]);
        let result = load_shader_code(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(RenderError::ShaderLoad { .. })));
    }

    #[test]
    fn spirv_words_are_read_in_order() {
        // Magic number followed by a version word.
        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let path = scratch("header.spv", &bytes);
        let result = load_shader_code(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(result.unwrap(), vec![0x0723_0203, 0x0001_0000]);
    }
}
