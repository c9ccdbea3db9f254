// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::Parser;
use lumen_core::init_tracing;
use lumen_platform::winit::keyboard::KeyCode;
use lumen_platform::{Platform, PlatformEvent, WindowConfig};
use lumen_render::{RenderSize, ScissorRect, Viewport};
use lumen_render_vk::{FrameStatus, RenderingDevice, Vertex};
use serde::Deserialize;
use tracing::{error, info, warn};

/// Exit status when no usable Vulkan loader or device is present.
const EXIT_GPU_UNAVAILABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config; missing file means defaults
    #[arg(long, default_value = "lumen.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
struct AppCfg {
    #[serde(default)]
    window: WindowCfg,
    #[serde(default)]
    render: RenderCfg,
    #[serde(default)]
    shaders: ShaderCfg,
}

#[derive(Debug, Deserialize, PartialEq)]
struct WindowCfg {
    #[serde(default = "default_title")]
    title: String,
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
}

#[derive(Debug, Deserialize, PartialEq)]
struct RenderCfg {
    #[serde(default = "default_clear")]
    clear_color: [f32; 4],
}

#[derive(Debug, Deserialize, PartialEq)]
struct ShaderCfg {
    #[serde(default = "default_vertex_shader")]
    vertex: PathBuf,
    #[serde(default = "default_fragment_shader")]
    fragment: PathBuf,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: default_title(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
        }
    }
}

impl Default for ShaderCfg {
    fn default() -> Self {
        ShaderCfg {
            vertex: default_vertex_shader(),
            fragment: default_fragment_shader(),
        }
    }
}

fn default_title() -> String {
    "Lumen".to_owned()
}
fn default_width() -> u32 {
    960
}
fn default_height() -> u32 {
    540
}
fn default_clear() -> [f32; 4] {
    [1.0, 1.0, 1.0, 1.0]
}
fn default_vertex_shader() -> PathBuf {
    PathBuf::from(concat!(env!("OUT_DIR"), "/tri.vert.spv"))
}
fn default_fragment_shader() -> PathBuf {
    PathBuf::from(concat!(env!("OUT_DIR"), "/tri.frag.spv"))
}

fn parse_cfg(src: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(src)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => AppCfg::default(),
    }
}

fn triangle() -> [Vertex; 3] {
    [
        Vertex::new(0.0, -0.5, 0.0),
        Vertex::new(0.5, 0.5, 0.0),
        Vertex::new(-0.5, 0.5, 0.0),
    ]
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);

    let mut platform = Platform::new(WindowConfig {
        title: cfg.window.title.clone(),
        size: RenderSize::new(cfg.window.width, cfg.window.height),
    })?;

    let window = platform.window().ok_or_else(|| anyhow!("window missing"))?;
    let size = RenderSize::new(window.inner_size().width, window.inner_size().height);
    let mut device = match RenderingDevice::new(window, window, size) {
        Ok(device) => device,
        Err(e) if e.is_unsupported() => {
            error!("no usable Vulkan device: {e}");
            platform.close();
            return Ok(ExitCode::from(EXIT_GPU_UNAVAILABLE));
        }
        Err(e) => return Err(e.into()),
    };
    device.set_clear_color(cfg.render.clear_color);

    let shader = device.create_shader(&cfg.shaders.vertex, &cfg.shaders.fragment)?;
    let vertices = triangle();
    let vertex_buffer = device.create_vertex_buffer(&vertices)?;
    info!("entering render loop");

    while platform.is_open() {
        for event in platform.poll_events() {
            match event {
                PlatformEvent::CloseRequested => platform.close(),
                PlatformEvent::Resized(size) => {
                    info!("resized to {}x{}", size.width, size.height);
                    if let Err(e) = device.recreate_swapchain(&mut platform) {
                        error!("swapchain recreation failed: {e}");
                    }
                }
            }
        }
        if platform.is_key_pressed(KeyCode::Escape) {
            platform.close();
        }
        if !platform.is_open() {
            break;
        }

        match device.begin_render_pass(&mut platform) {
            Ok(FrameStatus::Ready) => {}
            Ok(FrameStatus::SwapchainRecreated) => continue,
            Err(e) => {
                error!("begin frame: {e}");
                continue;
            }
        }

        let extent = device.extent();
        let recorded = device
            .set_viewport(Viewport::covering(extent))
            .and_then(|()| device.set_scissors(ScissorRect::covering(extent)))
            .and_then(|()| device.bind_shader(&shader))
            .and_then(|()| device.bind_vertex_buffer(&vertex_buffer))
            .and_then(|()| device.draw(vertices.len() as u32));
        if let Err(e) = recorded {
            error!("record frame: {e}");
        }

        if let Err(e) = device.end_render_pass(&mut platform) {
            error!("end frame: {e}");
            continue;
        }
        if let Err(e) = device.present(&mut platform) {
            error!("present: {e}");
        }
    }

    // GPU objects go before the device, the device before the window.
    drop(vertex_buffer);
    drop(shader);
    drop(device);
    drop(platform);
    info!("bye");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        assert_eq!(cfg.window.title, "Lumen");
        assert_eq!((cfg.window.width, cfg.window.height), (960, 540));
        assert_eq!(cfg.render.clear_color, [1.0; 4]);
        assert!(cfg.shaders.vertex.ends_with("tri.vert.spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
[window]
width = 1280

[render]
clear_color = [0.0, 0.0, 0.0, 1.0]
"#,
        )
        .unwrap();
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.window.height, 540);
        assert_eq!(cfg.render.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(cfg.shaders, ShaderCfg::default());
    }

    #[test]
    fn missing_config_file_falls_back() {
        let cfg = load_cfg(Path::new("does/not/exist/lumen.toml"));
        assert_eq!(cfg, AppCfg::default());
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(parse_cfg("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn demo_triangle_is_centered() {
        let tri = triangle();
        let sum_x: f32 = tri.iter().map(|v| v.position[0]).sum();
        assert_eq!(sum_x, 0.0);
        assert!(tri.iter().all(|v| v.position[2] == 0.0));
    }
}
