// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic contracts shared by the platform layer and the Vulkan device.

pub use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero (minimized or collapsed window).
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Floating point viewport rectangle, depth range fixed to `0.0..=1.0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn covering(size: RenderSize) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: size.width as f32,
            height: size.height as f32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn covering(size: RenderSize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }
}

/// The windowing collaborator as seen by the renderer.
///
/// The device asks for the drawable size when the surface does not report
/// one, and parks on `wait_event` while the drawable has zero area.
pub trait SurfaceHost {
    fn drawable_size(&self) -> RenderSize;

    /// Block the calling thread until at least one window event arrives.
    fn wait_event(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_detects_either_axis() {
        assert!(RenderSize::new(0, 600).is_zero_area());
        assert!(RenderSize::new(800, 0).is_zero_area());
        assert!(!RenderSize::new(800, 600).is_zero_area());
    }

    #[test]
    fn covering_rects_match_size() {
        let size = RenderSize::new(960, 540);
        let vp = Viewport::covering(size);
        assert_eq!((vp.x, vp.y, vp.width, vp.height), (0.0, 0.0, 960.0, 540.0));
        assert_eq!(
            ScissorRect::covering(size),
            ScissorRect { x: 0, y: 0, width: 960, height: 540 }
        );
    }
}
