//! Disk and NIC hotplug command implementations.

use crate::cli::DriverArgs;
use clap::Args;

/// Map a disk and publish its device stanza to the running container.
#[derive(Args, Debug)]
pub struct AttachDiskCmd {
    #[command(flatten)]
    pub driver: DriverArgs,

    /// Disk id from the descriptor.
    #[arg(long)]
    pub disk_id: u32,
}

impl AttachDiskCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        self.driver.driver()?.attach_disk(self.disk_id)
    }
}

/// Retract a disk's device stanza and unmap it.
#[derive(Args, Debug)]
pub struct DetachDiskCmd {
    #[command(flatten)]
    pub driver: DriverArgs,

    /// Disk id from the descriptor.
    #[arg(long)]
    pub disk_id: u32,
}

impl DetachDiskCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        self.driver.driver()?.detach_disk(self.disk_id)
    }
}

/// Publish a NIC device stanza for a descriptor NIC.
#[derive(Args, Debug)]
pub struct AttachNicCmd {
    #[command(flatten)]
    pub driver: DriverArgs,

    /// MAC address identifying the NIC.
    #[arg(long)]
    pub mac: String,
}

impl AttachNicCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        self.driver.driver()?.attach_nic(&self.mac)
    }
}

/// Retract the NIC device stanza carrying a MAC address.
#[derive(Args, Debug)]
pub struct DetachNicCmd {
    #[command(flatten)]
    pub driver: DriverArgs,

    /// MAC address identifying the NIC.
    #[arg(long)]
    pub mac: String,
}

impl DetachNicCmd {
    pub fn run(self) -> lxdriver::Result<()> {
        self.driver.driver()?.detach_nic(&self.mac)
    }
}
