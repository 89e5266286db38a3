//! Synthetic frame publisher
//!
//! Publishes generated test frames on the camera bus so the full video
//! path can be exercised without vehicle hardware.

use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, ValueEnum};

use teleop_gateway::source::FramePublisher;
use teleop_gateway::video::frame::{CameraSample, PixelFormat};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Gray,
    Rgb,
}

#[derive(Parser, Debug)]
#[command(name = "frame-publisher")]
#[command(about = "Publish synthetic camera frames", long_about = None)]
struct CliArgs {
    /// Publish address
    #[arg(long, default_value = "tcp://127.0.0.1:5563")]
    address: String,

    /// Topic the frames are published on
    #[arg(long, default_value = "camera")]
    topic: String,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Pixel format of the generated frames
    #[arg(long, value_enum, default_value_t = Format::Gray)]
    format: Format,

    /// Frames per second
    #[arg(long, default_value_t = 15)]
    fps: u32,
}

fn generate(args: &CliArgs, tick: u32) -> CameraSample {
    let (width, height) = (args.width as usize, args.height as usize);
    match args.format {
        Format::Gray => {
            let mut data = vec![0u8; width * height];
            for (y, row) in data.chunks_exact_mut(width).enumerate() {
                for (x, px) in row.iter_mut().enumerate() {
                    *px = ((x + y + tick as usize) % 256) as u8;
                }
            }
            CameraSample::packed(args.width, args.height, PixelFormat::Luminance, Bytes::from(data))
        }
        Format::Rgb => {
            let mut data = vec![0u8; width * height * 3];
            for (y, row) in data.chunks_exact_mut(width * 3).enumerate() {
                for (x, px) in row.chunks_exact_mut(3).enumerate() {
                    px[0] = ((x + tick as usize) % 256) as u8;
                    px[1] = ((y + tick as usize) % 256) as u8;
                    px[2] = (tick % 256) as u8;
                }
            }
            CameraSample::packed(args.width, args.height, PixelFormat::Rgb, Bytes::from(data))
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CliArgs::parse();
    let mut publisher = FramePublisher::bind(&args.address)?;
    let interval = Duration::from_secs(1) / args.fps.max(1);

    tracing::info!(
        "publishing {}x{} frames on {} topic {}",
        args.width,
        args.height,
        args.address,
        args.topic
    );

    let mut tick = 0u32;
    loop {
        publisher.publish(&args.topic, &generate(&args, tick));
        tick = tick.wrapping_add(1);
        std::thread::sleep(interval);
    }
}
