//! Capture node CLI application

use anyhow::Result;
use clap::Parser;
use mocap_node::camera::synthetic::SyntheticCamera;
use mocap_node::config::Config;
use mocap_node::pipeline::Pipeline;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mocap-node")]
#[command(about = "Synchronized motion-capture camera node")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.txt")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    info!(config_path = %cli.config, "capture node starting");
    let config = Config::load(&cli.config)?;

    info!(
        resolution = %format!("{}x{}", config.frame_width, config.frame_height),
        fps = %config.fps,
        server = %format!("{}:{}", config.server_ip, config.tcp_port),
        control_port = %config.udp_port,
        "configuration loaded"
    );

    // The platform driver plugs in behind the CameraDevice seam; without
    // one linked, the node records from the synthetic device.
    let device = Box::new(SyntheticCamera::new());

    let mut pipeline = Pipeline::new(config, device)?;
    pipeline.run()?;

    info!("clean stop");
    Ok(())
}
