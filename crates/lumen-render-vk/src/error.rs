// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Vulkan loader unavailable: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("no usable GPU: {0}")]
    UnsupportedDevice(&'static str),

    #[error("{what} failed: {result:?}")]
    DeviceCreation { what: &'static str, result: vk::Result },

    #[error("failed to load shader {path}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no memory type in 0b{type_bits:b} with {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("vertex buffer needs at least one vertex")]
    EmptyVertexBuffer,

    #[error("frame call out of order: expected {expected}, frame is {found}")]
    FrameOrder {
        expected: &'static str,
        found: &'static str,
    },

    #[error("swapchain is missing after a failed recreation")]
    SwapchainMissing,

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("Vulkan call failed: {0:?}")]
    Vulkan(#[from] vk::Result),
}

impl RenderError {
    /// Errors meaning "this machine cannot run the renderer" rather than a bug or transient failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            RenderError::Loading(_)
                | RenderError::UnsupportedDevice(_)
                | RenderError::DeviceCreation { .. }
        )
    }
}

/// Tag a raw `vk::Result` from one of the setup calls.
pub(crate) fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
    move |result| RenderError::DeviceCreation { what, result }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_failures_are_classified_unsupported() {
        assert!(RenderError::UnsupportedDevice("no physical device").is_unsupported());
        assert!(creation("vkCreateDevice")(vk::Result::ERROR_INITIALIZATION_FAILED).is_unsupported());
        assert!(!RenderError::SwapchainMissing.is_unsupported());
        assert!(!RenderError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_unsupported());
    }

    #[test]
    fn memory_type_error_names_the_request() {
        let err = RenderError::NoSuitableMemoryType {
            type_bits: 0b101,
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        let msg = err.to_string();
        assert!(msg.contains("0b101"), "{msg}");
        assert!(msg.contains("HOST_VISIBLE"), "{msg}");
    }

    #[test]
    fn window_handle_error_keeps_its_source() {
        let err = RenderError::from(raw_window_handle::HandleError::Unavailable);
        assert!(matches!(err, RenderError::WindowHandle(_)));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_unsupported());
    }
}
