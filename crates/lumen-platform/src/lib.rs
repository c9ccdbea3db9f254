// SPDX-License-Identifier: CEPL-1.0
//! Window ownership and event pumping.
//!
//! The render loop owns the thread, so instead of handing control to
//! `EventLoop::run_app` the window is driven through `pump_app_events`:
//! a zero timeout drains pending events, no timeout blocks until one arrives.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lumen_render::{RenderSize, SurfaceHost};
use tracing::{debug, error, info};

pub use winit;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowId},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    Resized(RenderSize),
    CloseRequested,
}

#[derive(Clone, Debug)]
pub struct WindowConfig {
    pub title: String,
    pub size: RenderSize,
}

struct PlatformState {
    config: WindowConfig,
    window: Option<Window>,
    create_error: Option<String>,
    pending: Vec<PlatformEvent>,
    keys_down: HashSet<KeyCode>,
    exited: bool,
}

impl PlatformState {
    fn new(config: WindowConfig) -> Self {
        Self {
            config,
            window: None,
            create_error: None,
            pending: Vec::new(),
            keys_down: HashSet::new(),
            exited: false,
        }
    }

    fn handle_window_event(&mut self, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.pending.push(PlatformEvent::CloseRequested);
            }
            WindowEvent::Resized(new_size) => {
                debug!("Resized → {}x{}", new_size.width, new_size.height);
                self.pending.push(PlatformEvent::Resized(RenderSize::new(
                    new_size.width,
                    new_size.height,
                )));
            }
            WindowEvent::KeyboardInput { event, .. } => {
                self.record_key(event.physical_key, event.state);
            }
            WindowEvent::Focused(false) => {
                // Releases are not delivered to unfocused windows.
                self.keys_down.clear();
            }
            _ => {}
        }
    }

    fn record_key(&mut self, key: PhysicalKey, state: ElementState) {
        let PhysicalKey::Code(code) = key else {
            return;
        };
        match state {
            ElementState::Pressed => {
                self.keys_down.insert(code);
            }
            ElementState::Released => {
                self.keys_down.remove(&code);
            }
        }
    }
}

impl ApplicationHandler for PlatformState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(PhysicalSize::new(
                self.config.size.width,
                self.config.size.height,
            ));
        match event_loop.create_window(attrs) {
            Ok(window) => {
                let size = window.inner_size();
                info!("window created ({}x{})", size.width, size.height);
                self.window = Some(window);
            }
            Err(e) => {
                error!("create_window failed: {e}");
                self.create_error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }
        self.handle_window_event(event);
    }
}

/// A single window plus the event loop that feeds it.
///
/// `close` only marks the window closed; the native window lives until the
/// `Platform` is dropped, so a Vulkan surface created from it must be dropped first.
pub struct Platform {
    event_loop: EventLoop<()>,
    state: PlatformState,
    open: bool,
}

impl Platform {
    pub fn new(config: WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new().context("EventLoop::new")?;
        let mut platform = Self {
            event_loop,
            state: PlatformState::new(config),
            open: true,
        };

        // Window creation happens in `resumed`, delivered by the first pumps.
        while platform.state.window.is_none() {
            platform.pump(Some(Duration::ZERO));
            if let Some(e) = platform.state.create_error.take() {
                return Err(anyhow!("create_window: {e}"));
            }
            if platform.state.exited {
                return Err(anyhow!("event loop exited before a window was created"));
            }
        }
        Ok(platform)
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if self.state.exited {
            return;
        }
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            info!("event loop exited ({code})");
            self.state.exited = true;
            self.open = false;
        }
    }

    /// Drain every event that is already pending without blocking.
    pub fn poll_events(&mut self) -> Vec<PlatformEvent> {
        self.pump(Some(Duration::ZERO));
        std::mem::take(&mut self.state.pending)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn close(&mut self) {
        if self.open {
            info!("window closing");
        }
        self.open = false;
    }

    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.state.keys_down.contains(&key)
    }

    pub fn window(&self) -> Option<&Window> {
        self.state.window.as_ref()
    }
}

impl SurfaceHost for Platform {
    fn drawable_size(&self) -> RenderSize {
        self.state
            .window
            .as_ref()
            .map(|w| {
                let size = w.inner_size();
                RenderSize::new(size.width, size.height)
            })
            .unwrap_or_default()
    }

    fn wait_event(&mut self) {
        self.pump(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PlatformState {
        PlatformState::new(WindowConfig {
            title: "test".into(),
            size: RenderSize::new(960, 540),
        })
    }

    #[test]
    fn resize_and_close_are_queued_in_order() {
        let mut s = state();
        s.handle_window_event(WindowEvent::Resized(PhysicalSize::new(0, 0)));
        s.handle_window_event(WindowEvent::Resized(PhysicalSize::new(800, 600)));
        s.handle_window_event(WindowEvent::CloseRequested);
        assert_eq!(
            s.pending,
            vec![
                PlatformEvent::Resized(RenderSize::new(0, 0)),
                PlatformEvent::Resized(RenderSize::new(800, 600)),
                PlatformEvent::CloseRequested,
            ]
        );
    }

    #[test]
    fn key_state_tracks_press_and_release() {
        let mut s = state();
        let esc = PhysicalKey::Code(KeyCode::Escape);
        s.record_key(esc, ElementState::Pressed);
        assert!(s.keys_down.contains(&KeyCode::Escape));
        s.record_key(esc, ElementState::Released);
        assert!(!s.keys_down.contains(&KeyCode::Escape));
    }

    #[test]
    fn losing_focus_releases_all_keys() {
        let mut s = state();
        s.record_key(PhysicalKey::Code(KeyCode::KeyW), ElementState::Pressed);
        s.handle_window_event(WindowEvent::Focused(false));
        assert!(s.keys_down.is_empty());
        assert!(s.pending.is_empty());
    }
}
