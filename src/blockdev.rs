//! Block-device topology inspection.
//!
//! Wraps the host's `lsblk -J -O` structured report and normalizes it into
//! [`Partition`] values: swap partitions are dropped, partitions without a
//! stable identity (no UUID) are dropped, and device paths are
//! reconstructed for lsblk versions that omit the `path` column.

use crate::cmd;
use crate::error::{Error, Result};
use serde::Deserialize;

/// One node of the lsblk device tree.
#[derive(Debug, Clone, Deserialize)]
pub struct LsblkDevice {
    /// Kernel device name (e.g. "loop0", "nbd1p2").
    #[serde(default)]
    pub name: Option<String>,
    /// Canonical device node path; absent on lsblk < 2.33.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// Child nodes (partitions, device-mapper nodes).
    #[serde(default)]
    pub children: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// One filesystem-bearing region of a mapped block device.
///
/// Partitions are discovered, never persisted; they exist only for the
/// duration of a map/unmount operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Device node path.
    pub path: String,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub fstype: Option<String>,
    /// Where the partition is currently mounted, if anywhere.
    pub mountpoint: Option<String>,
}

/// A device found to be backing a mounted target directory.
#[derive(Debug, Clone)]
pub struct MountedDisk {
    /// The parent block device (the one the mapper releases).
    pub device: String,
    /// Currently-mounted partitions belonging to the device. For a
    /// whole-device filesystem this is the device itself.
    pub partitions: Vec<Partition>,
    /// True when the device carries a partition table.
    pub multi: bool,
}

/// Run lsblk for the whole host or a single device.
pub fn report(device: Option<&str>) -> Result<Vec<LsblkDevice>> {
    let mut args = vec!["-J", "-O"];
    if let Some(dev) = device {
        args.push(dev);
    }

    let out = cmd::run("lsblk", &args)?;
    parse_report(&out.stdout)
}

/// Parse an `lsblk -J` report.
pub fn parse_report(json: &str) -> Result<Vec<LsblkDevice>> {
    let report: LsblkReport = serde_json::from_str(json)
        .map_err(|e| Error::command_failed("lsblk", format!("unparseable report: {}", e)))?;
    Ok(report.blockdevices)
}

/// List the partitions of a mapped device.
///
/// Returns an empty list (not an error) when the device carries no
/// partition table.
pub fn list_partitions(device: &str) -> Result<Vec<Partition>> {
    let devices = report(Some(device))?;

    let Some(parent) = devices.first() else {
        return Ok(Vec::new());
    };

    Ok(normalize_children(&parent.children, node_exists))
}

/// Filesystem kind of the device node itself (whole-device filesystems).
pub fn device_fstype(device: &str) -> Result<Option<String>> {
    let devices = report(Some(device))?;
    Ok(devices.first().and_then(|d| d.fstype.clone()))
}

/// Find the block device currently mounted at `target`, scanning the
/// whole host topology. Returns `None` when nothing is mounted there.
pub fn find_mounted(target: &str) -> Result<Option<MountedDisk>> {
    let devices = report(None)?;
    Ok(find_mounted_in(&devices, target, node_exists))
}

/// Pure scan over an lsblk tree for the device backing `target`.
pub fn find_mounted_in(
    devices: &[LsblkDevice],
    target: &str,
    exists: impl Fn(&str) -> bool + Copy,
) -> Option<MountedDisk> {
    for dev in devices {
        if dev.mountpoint.as_deref() == Some(target) {
            return Some(MountedDisk {
                device: device_path(dev, exists)?,
                partitions: vec![to_partition(dev, exists)?],
                multi: false,
            });
        }

        if dev
            .children
            .iter()
            .any(|c| c.mountpoint.as_deref() == Some(target))
        {
            // Report every mounted sibling so the unmount chain can
            // release them all before the parent device.
            let partitions = dev
                .children
                .iter()
                .filter(|c| c.mountpoint.is_some())
                .filter_map(|c| to_partition(c, exists))
                .collect();

            return Some(MountedDisk {
                device: device_path(dev, exists)?,
                partitions,
                multi: true,
            });
        }
    }

    None
}

/// Normalize child nodes into mappable partitions: drop swap, drop
/// identity-less entries, reconstruct paths.
pub fn normalize_children(
    children: &[LsblkDevice],
    exists: impl Fn(&str) -> bool + Copy,
) -> Vec<Partition> {
    children
        .iter()
        .filter(|c| {
            !c.fstype
                .as_deref()
                .map(|f| f.eq_ignore_ascii_case("swap"))
                .unwrap_or(false)
        })
        .filter(|c| c.uuid.is_some())
        .filter_map(|c| to_partition(c, exists))
        .collect()
}

fn to_partition(dev: &LsblkDevice, exists: impl Fn(&str) -> bool) -> Option<Partition> {
    Some(Partition {
        path: device_path(dev, exists)?,
        uuid: dev.uuid.clone(),
        label: dev.label.clone(),
        fstype: dev.fstype.clone(),
        mountpoint: dev.mountpoint.clone(),
    })
}

/// Canonical node path for a device. lsblk < 2.33 reports no `path`
/// column; reconstruct it from the name, preferring /dev and falling
/// back to /dev/mapper for kpartx-exposed partitions.
fn device_path(dev: &LsblkDevice, exists: impl Fn(&str) -> bool) -> Option<String> {
    if let Some(path) = &dev.path {
        return Some(path.clone());
    }

    let name = dev.name.as_deref()?;

    let plain = format!("/dev/{}", name);
    if exists(&plain) {
        return Some(plain);
    }

    let mapped = format!("/dev/mapper/{}", name);
    if exists(&mapped) {
        return Some(mapped);
    }

    None
}

fn node_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}
