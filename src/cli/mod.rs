//! CLI command implementations.

pub mod context;
pub mod deploy;
pub mod hotplug;
pub mod parsers;
pub mod reset;
pub mod shutdown;

use clap::Args;
use lxdriver::descriptor::VmDescriptor;
use lxdriver::lifecycle::{Driver, DEFAULT_CONTAINERS_DIR};
use lxdriver::rest::{UnixClient, WaitMode, DEFAULT_SOCKET};
use std::path::PathBuf;
use std::time::Duration;

/// Descriptor, connection and wait options shared by every action.
#[derive(Args, Debug)]
pub struct DriverArgs {
    /// VM descriptor file ("-" reads stdin).
    #[arg(default_value = "-")]
    pub descriptor: String,

    /// LXD unix socket path.
    #[arg(long, default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,

    /// How long to wait for server-side operations (e.g. "30s", "2m").
    #[arg(long, default_value = "30s", value_parser = parsers::parse_duration)]
    pub timeout: Duration,

    /// Submit operations without waiting for them to finish.
    #[arg(long)]
    pub no_wait: bool,

    /// Container storage directory on the host.
    #[arg(long, default_value = DEFAULT_CONTAINERS_DIR)]
    pub containers_dir: PathBuf,
}

impl DriverArgs {
    /// Read the descriptor and build the production driver.
    pub fn driver(&self) -> lxdriver::Result<Driver<UnixClient>> {
        let vm = VmDescriptor::from_path(&self.descriptor)?;
        let wait = if self.no_wait {
            WaitMode::FireAndForget
        } else {
            WaitMode::WaitFor(self.timeout)
        };

        Ok(Driver::connect(self.socket.clone(), vm, wait)
            .with_containers_dir(self.containers_dir.clone()))
    }
}
