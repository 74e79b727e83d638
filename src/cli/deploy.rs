//! Deploy command implementation.

use crate::cli::DriverArgs;
use clap::Args;

/// Map the VM's storage, converge the container and boot it.
///
/// Prints the container name on success; the surrounding automation
/// records it as the deploy identifier.
#[derive(Args, Debug)]
pub struct DeployCmd {
    #[command(flatten)]
    pub driver: DriverArgs,
}

impl DeployCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        let driver = self.driver.driver()?;
        let name = driver.deploy()?;
        println!("{}", name);
        Ok(())
    }
}
