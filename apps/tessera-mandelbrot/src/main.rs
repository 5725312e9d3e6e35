//! Tessera Mandelbrot
//!
//! Fills a storage image on a compute queue, hands it to a transfer queue
//! through a semaphore, copies it into a host-visible buffer and writes the
//! result as a PNG.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tessera-mandelbrot -- [OPTIONS]
//! ```
//!
//! The default software backend runs a host-side Mandelbrot kernel. With
//! `--backend vulkan` the same flow runs on a real device, clearing the image
//! instead of running a shader.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod kernel;
mod render;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::render::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum Backend {
    /// Deterministic software device.
    #[default]
    Soft,
    /// First suitable Vulkan device.
    Vulkan,
}

#[derive(Parser, Debug)]
#[command(name = "tessera-mandelbrot", version, about = "Render the Mandelbrot set to a PNG")]
struct Args {
    #[arg(long, default_value = "soft", value_enum)]
    backend: Backend,

    #[arg(long, default_value_t = 512)]
    width: u32,

    #[arg(long, default_value_t = 512)]
    height: u32,

    /// Escape-time iteration limit.
    #[arg(long, default_value_t = 256)]
    max_iterations: u32,

    #[arg(short, long, default_value = "mandelbrot.png")]
    output: PathBuf,

    /// Enable Vulkan validation layers.
    #[arg(long)]
    validation: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        args.width > 0 && args.height > 0,
        "image size must be non-zero"
    );
    let params = Params {
        width: args.width,
        height: args.height,
        max_iterations: args.max_iterations.max(1),
    };

    let pixels = match args.backend {
        Backend::Soft => render::soft(&params)?,
        Backend::Vulkan => render::vulkan(&params, args.validation)?,
    };
    let image = image::RgbaImage::from_raw(params.width, params.height, pixels)
        .context("readback size does not match the image")?;
    image
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    info!(
        path = %args.output.display(),
        width = params.width,
        height = params.height,
        "wrote image"
    );
    Ok(())
}
