// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tessera_core::init_tracing;
use tessera_math::spin_uniforms;
use tessera_platform::Platform;
use tessera_render::{DrawableSurface, FrameStatus, Renderer};
use tessera_render_vk::VkRenderer;
use tracing::{error, info};

mod config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; missing means defaults
    #[arg(long, default_value = "tessera.toml")]
    config: PathBuf,
    /// OBJ model, overrides [assets].model
    #[arg(long)]
    model: Option<PathBuf>,
    /// Texture image, overrides [assets].texture
    #[arg(long)]
    texture: Option<PathBuf>,
    /// Force the validation layer on or off
    #[arg(long)]
    validation: Option<bool>,
}

fn run(args: Args) -> Result<()> {
    let cfg = config::load_cfg(&args.config);
    let model_path = args.model.unwrap_or(cfg.assets.model);
    let texture_path = args.texture.unwrap_or(cfg.assets.texture);
    let settings = cfg.render.settings(args.validation);

    let mut platform = Platform::new(&cfg.window.title, cfg.window.width, cfg.window.height)?;

    let mesh = tessera_assets::load_mesh(&model_path)
        .with_context(|| format!("loading model {}", model_path.display()))?;
    let texture = tessera_assets::load_texture(&texture_path)
        .with_context(|| format!("loading texture {}", texture_path.display()))?;

    let mut renderer = VkRenderer::new(
        platform.window(),
        platform.window(),
        platform.drawable_size(),
        &mesh,
        &texture,
        &settings,
    )
    .context("vk init")?;

    let start = Instant::now();
    let mut frames = 0u32;
    let mut last_fps_instant = Instant::now();
    loop {
        let pump = platform.pump();
        if pump.close_requested {
            break;
        }

        let extent = renderer.extent();
        let uniforms = spin_uniforms(start.elapsed().as_secs_f32(), extent.width, extent.height);
        if renderer.render(&mut platform, pump.resized, &uniforms)? == FrameStatus::Presented {
            frames = frames.saturating_add(1);
        }

        let now = Instant::now();
        if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {frames}");
            frames = 0;
            last_fps_instant = now;
        }
    }

    renderer.wait_idle()?;
    // Renderer (and its surface) before the window it was created from.
    drop(renderer);
    drop(platform);
    info!("shutdown complete");
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("fatal: {e:#}");
        return Err(e);
    }
    Ok(())
}
