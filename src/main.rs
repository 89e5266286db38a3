use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use teleop_gateway::config::ConnectionOptions;
use teleop_gateway::control::ControlChannelClient;
use teleop_gateway::source::TcpSourceConnector;
use teleop_gateway::webrtc::Signaler;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// teleop-gateway command line arguments
#[derive(Parser, Debug)]
#[command(name = "teleop-gateway")]
#[command(version, about = "Teleoperation video-streaming gateway", long_about = None)]
struct CliArgs {
    /// Path to the gateway configuration file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "config/teleop.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting teleop-gateway v{}", env!("CARGO_PKG_VERSION"));

    // A malformed configuration aborts the process here
    let opts = Arc::new(ConnectionOptions::load(&args.config)?);
    tracing::info!(
        "vehicle {} with {} cameras, backend {}",
        opts.vehicle_id,
        opts.video_sources.len(),
        opts.backend_address
    );

    let signaler = Signaler::new(&opts.webrtc, Arc::new(TcpSourceConnector))?;
    let client = ControlChannelClient::new(opts, signaler.clone());

    // Driving commands are forwarded to the vehicle control stack by the
    // embedding application; the gateway itself only observes them.
    client.on_joystick(|cmd| {
        tracing::debug!(
            "joystick: linear {:.2} angular {:.2}",
            cmd.linear_velocity,
            cmd.angular_velocity
        )
    });
    client.on_stop_requested(|_| tracing::info!("stop requested"));

    tokio::select! {
        result = client.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            signaler.shutdown().await;
        }
    }

    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "teleop_gateway=error,webrtc=error",
        LogLevel::Warn => "teleop_gateway=warn,webrtc=warn",
        LogLevel::Info => "teleop_gateway=info,webrtc=error",
        LogLevel::Debug => "teleop_gateway=debug,webrtc=info",
        LogLevel::Trace => "teleop_gateway=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
