//! Reset command implementation.

use crate::cli::DriverArgs;
use clap::Args;

/// Restart the container in place; storage stays mapped.
#[derive(Args, Debug)]
pub struct ResetCmd {
    #[command(flatten)]
    pub driver: DriverArgs,
}

impl ResetCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        self.driver.driver()?.reset()
    }
}
