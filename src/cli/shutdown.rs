//! Shutdown command implementation.

use crate::cli::DriverArgs;
use clap::Args;

/// Stop the container, release its storage and delete the resource.
#[derive(Args, Debug)]
pub struct ShutdownCmd {
    #[command(flatten)]
    pub driver: DriverArgs,
}

impl ShutdownCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        self.driver.driver()?.shutdown()
    }
}
