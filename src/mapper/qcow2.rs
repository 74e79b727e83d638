//! QCOW2 backend: `qemu-nbd` exports over the kernel nbd devices.

use crate::blockdev::{self, Partition};
use crate::cmd;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// The kernel populates an nbd device's partition metadata a moment
/// after `qemu-nbd -c` returns; poll until it shows up.
const NBD_PROBE_ATTEMPTS: u32 = 50;
const NBD_PROBE_INTERVAL: Duration = Duration::from_millis(100);

pub struct Qcow2Mapper;

impl Qcow2Mapper {
    /// Connect the image to the first free nbd device.
    pub fn map(&self, source: &str) -> Result<String> {
        cmd::require("qemu-nbd")?;

        let device = next_free_nbd()?;
        cmd::run("qemu-nbd", &["-c", &device, source])?;

        Ok(device)
    }

    /// Disconnect the nbd export; already-disconnected is a no-op.
    pub fn unmap(&self, device: &str) -> Result<()> {
        if !Path::new(device).exists() {
            return Ok(());
        }

        cmd::run("qemu-nbd", &["-d", device])?;
        Ok(())
    }

    /// List partitions, waiting out the kernel's asynchronous partition
    /// scan.
    pub fn detect_parts(&self, device: &str) -> Result<Vec<Partition>> {
        for _ in 0..NBD_PROBE_ATTEMPTS {
            let parts = blockdev::list_partitions(device)?;
            if parts.iter().any(|p| p.fstype.is_some()) {
                return Ok(parts);
            }

            if parts.is_empty() && blockdev::device_fstype(device)?.is_some() {
                // whole-device filesystem, nothing more will appear
                return Ok(Vec::new());
            }

            thread::sleep(NBD_PROBE_INTERVAL);
        }

        // Whatever is visible by now is all we get; mount will surface
        // the failure if the device never became ready.
        blockdev::list_partitions(device)
    }
}

/// Pick the lowest-numbered nbd device with nothing attached.
///
/// The scan and the subsequent `qemu-nbd -c` are not atomic; a
/// concurrent mapper on the same host may win the slot, in which case
/// the connect fails and the deploy rolls back.
fn next_free_nbd() -> Result<String> {
    let devices = blockdev::report(None)?;
    let busy = busy_nbd_indices(devices.iter().filter_map(|d| d.name.as_deref()));
    let index = first_free_index(&busy);

    let device = format!("/dev/nbd{}", index);
    if !Path::new(&device).exists() {
        if index == 0 {
            // no nbd nodes at all means the module is not loaded
            return Err(Error::backend_unavailable("nbd"));
        }
        return Err(Error::device_exhausted("nbd"));
    }

    Ok(device)
}

/// Indices of nbd devices that have a filesystem or export attached.
/// Partition nodes ("nbd0p1") belong to their parent and are skipped.
fn busy_nbd_indices<'a>(names: impl Iterator<Item = &'a str>) -> BTreeSet<u32> {
    names
        .filter_map(|name| name.strip_prefix("nbd"))
        .filter(|rest| !rest.contains('p'))
        .filter_map(|rest| rest.parse().ok())
        .collect()
}

fn first_free_index(busy: &BTreeSet<u32>) -> u32 {
    let mut index = 0;
    while busy.contains(&index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_indices_skip_partition_nodes() {
        let names = ["sda", "nbd0", "nbd0p1", "nbd0p2", "nbd2", "loop1"];
        let busy = busy_nbd_indices(names.iter().copied());

        assert!(busy.contains(&0));
        assert!(busy.contains(&2));
        assert_eq!(busy.len(), 2);
    }

    #[test]
    fn test_first_free_fills_gaps() {
        let busy: BTreeSet<u32> = [0, 1, 3].into_iter().collect();
        assert_eq!(first_free_index(&busy), 2);
    }

    #[test]
    fn test_first_free_of_empty_is_zero() {
        assert_eq!(first_free_index(&BTreeSet::new()), 0);
    }
}
