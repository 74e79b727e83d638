//! Context hotplug command implementation.

use crate::cli::DriverArgs;
use clap::Args;

/// Re-map the context image after its content changed and republish
/// the /context device.
#[derive(Args, Debug)]
pub struct ContextCmd {
    #[command(flatten)]
    pub driver: DriverArgs,
}

impl ContextCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        self.driver.driver()?.hotplug_context()
    }
}
