//! lxdriver CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// lxdriver - node-local LXD VM driver
#[derive(Parser, Debug)]
#[command(name = "lxdriver")]
#[command(about = "node-local LXD VM driver")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Map the VM's storage, create the container and boot it.
    Deploy(cli::deploy::DeployCmd),

    /// Stop the container, release its storage and delete it.
    Shutdown(cli::shutdown::ShutdownCmd),

    /// Restart the container in place.
    Reset(cli::reset::ResetCmd),

    /// Hot-attach a disk to a running container.
    AttachDisk(cli::hotplug::AttachDiskCmd),

    /// Hot-detach a disk from a running container.
    DetachDisk(cli::hotplug::DetachDiskCmd),

    /// Hot-attach a NIC by MAC address.
    AttachNic(cli::hotplug::AttachNicCmd),

    /// Hot-detach a NIC by MAC address.
    DetachNic(cli::hotplug::DetachNicCmd),

    /// Re-map the context image and republish it.
    Context(cli::context::ContextCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = lxdriver::VERSION, "starting lxdriver");

    let result = match cli.command {
        Commands::Deploy(cmd) => cmd.run(),
        Commands::Shutdown(cmd) => cmd.run(),
        Commands::Reset(cmd) => cmd.run(),
        Commands::AttachDisk(cmd) => cmd.run(),
        Commands::DetachDisk(cmd) => cmd.run(),
        Commands::AttachNic(cmd) => cmd.run(),
        Commands::DetachNic(cmd) => cmd.run(),
        Commands::Context(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lxdriver=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
