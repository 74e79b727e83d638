//! Storage-mapping engine.
//!
//! A [`DiskMapper`] turns a disk source (file path or RBD image
//! reference) into a host block device and mounts it — including
//! multi-partition images — at a target directory. The backend set is a
//! closed enum; an unsupported type/driver combination is rejected when
//! the mapper is selected, never silently defaulted.
//!
//! The orchestrator drives everything through [`DiskMapper::run`]:
//! `Map` is mkdir → attach → detect partitions → optional resize →
//! mount; `Unmap` detects the mounted device for the target and runs the
//! unmount chain in reverse depth order before releasing the device.

pub mod qcow2;
pub mod raw;
pub mod rbd;

use crate::blockdev::{self, Partition};
use crate::cmd;
use crate::descriptor::{BackendKind, Disk};
use crate::error::{Error, Result};
use crate::fstab::{self, MountPlan};
use std::path::Path;

pub use qcow2::Qcow2Mapper;
pub use raw::RawMapper;
pub use rbd::RbdMapper;

/// Mapper entry-point action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAction {
    Map,
    Unmap,
}

/// Storage backend dispatch, closed over the supported technologies.
pub enum DiskMapper {
    Raw(RawMapper),
    Qcow2(Qcow2Mapper),
    Rbd(RbdMapper),
}

impl DiskMapper {
    /// Select the backend for a disk's type/driver combination.
    pub fn for_disk(disk: &Disk) -> Result<Self> {
        Ok(match disk.backend_kind()? {
            BackendKind::FileRaw => DiskMapper::Raw(RawMapper),
            BackendKind::FileQcow2 => DiskMapper::Qcow2(Qcow2Mapper),
            BackendKind::Rbd => DiskMapper::Rbd(RbdMapper::new(disk.ceph_user.clone())),
        })
    }

    /// The raw-loop backend, used for context images regardless of the
    /// VM's primary disk backend.
    pub fn raw() -> Self {
        DiskMapper::Raw(RawMapper)
    }

    /// Make the disk's content addressable as a host block device.
    pub fn map(&self, source: &str) -> Result<String> {
        match self {
            DiskMapper::Raw(m) => m.map(source),
            DiskMapper::Qcow2(m) => m.map(source),
            DiskMapper::Rbd(m) => m.map(source),
        }
    }

    /// Release the block device. Idempotent: unmapping an
    /// already-released device is a no-op.
    pub fn unmap(&self, device: &str) -> Result<()> {
        match self {
            DiskMapper::Raw(m) => m.unmap(device),
            DiskMapper::Qcow2(m) => m.unmap(device),
            DiskMapper::Rbd(m) => m.unmap(device),
        }
    }

    /// List the device's partitions; empty means no partition table
    /// (whole-device filesystem).
    pub fn detect_parts(&self, device: &str) -> Result<Vec<Partition>> {
        match self {
            DiskMapper::Raw(m) => m.detect_parts(device),
            DiskMapper::Qcow2(m) => m.detect_parts(device),
            DiskMapper::Rbd(m) => m.detect_parts(device),
        }
    }

    /// Single entry point for the orchestrator.
    pub fn run(&self, action: MapAction, target: &Path, source: &str, disk: &Disk) -> Result<()> {
        match action {
            MapAction::Map => {
                tracing::info!(source = %source, target = %target.display(), "mapping disk");
                cmd::mkdir_p(target)?;

                let device = self.map(source)?;
                if let Err(e) = self.finish_map(&device, target, disk) {
                    // Never leave a device attached without its mount.
                    // Partial mounts (multi-partition failures) must come
                    // down first or the device release fails busy.
                    tracing::warn!(device = %device, error = %e,
                        "map failed after attach, rolling back");
                    if let Err(undo) = self.unmount(target) {
                        tracing::warn!(target = %target.display(), error = %undo,
                            "rollback unmount failed");
                    }
                    if let Err(undo) = self.unmap(&device) {
                        tracing::warn!(device = %device, error = %undo,
                            "rollback unmap failed");
                    }
                    return Err(e);
                }
                Ok(())
            }
            MapAction::Unmap => {
                tracing::info!(target = %target.display(), "unmapping disk");
                self.unmount(target)
            }
        }
    }

    fn finish_map(&self, device: &str, target: &Path, disk: &Disk) -> Result<()> {
        let parts = self.detect_parts(device)?;

        if disk.resize {
            match parts.len() {
                0 => {
                    let kind = blockdev::device_fstype(device)?.unwrap_or_default();
                    resize(device, target, &kind)?;
                }
                1 => {
                    let kind = parts[0].fstype.clone().unwrap_or_default();
                    resize(&parts[0].path, target, &kind)?;
                }
                _ => {
                    return Err(Error::mount(format!(
                        "cannot resize partitioned disk {}",
                        device
                    )))
                }
            }
        }

        self.mount(device, &parts, target)
    }

    /// Mount a mapped device at the target directory.
    ///
    /// A whole-device or single-partition filesystem mounts directly;
    /// multiple partitions go through the fstab probe and [`MountPlan`].
    pub fn mount(&self, device: &str, parts: &[Partition], target: &Path) -> Result<()> {
        match parts {
            [] => mount_dev(device, target),
            [single] => mount_dev(&single.path, target),
            _ => mount_multi(device, parts, target),
        }
    }

    /// Detect and tear down whatever is mounted at the target.
    ///
    /// A no-op when nothing is mounted there, so partial-failure retries
    /// converge instead of erroring.
    pub fn unmount(&self, target: &Path) -> Result<()> {
        let target_str = target.to_string_lossy();

        let Some(mounted) = blockdev::find_mounted(&target_str)? else {
            tracing::info!(target = %target.display(), "nothing mounted, skipping unmount");
            return Ok(());
        };

        if mounted.multi {
            for part in teardown_order(&mounted.partitions) {
                umount_dev(&part.path)?;
            }
        } else {
            umount_dev(&target_str)?;
        }

        self.unmap(&mounted.device)
    }
}

/// Mounted partitions in teardown order, deepest mount first, so
/// parents are never unmounted under their children. Also covers
/// partially-mounted disks: whatever subset is mounted comes down in
/// a valid order.
fn teardown_order(partitions: &[Partition]) -> Vec<&Partition> {
    let mut parts: Vec<&Partition> = partitions.iter().collect();
    parts.sort_by_key(|p| {
        std::cmp::Reverse(p.mountpoint.as_deref().map(|m| m.len()).unwrap_or(0))
    });
    parts
}

/// Mount the first partition that yields a parseable fstab as the plan
/// anchor, then mount the remaining partitions at their planned
/// subpaths.
fn mount_multi(device: &str, parts: &[Partition], target: &Path) -> Result<()> {
    let mut anchor: Option<&Partition> = None;
    let mut entries = Vec::new();

    // Probe candidates at the target itself; the winner has to end up
    // mounted there anyway. Losers are unmounted immediately.
    for part in parts {
        mount_dev(&part.path, target)?;

        let fstab_path = target.join("etc/fstab");
        let probe = cmd::run_unchecked("cat", &[&fstab_path.to_string_lossy()])?;
        let parsed = if probe.success() {
            fstab::parse(&probe.stdout)
        } else {
            Vec::new()
        };

        if parsed.is_empty() {
            umount_dev(&part.path)?;
            continue;
        }

        anchor = Some(part);
        entries = parsed;
        break;
    }

    let Some(anchor) = anchor else {
        return Err(Error::NoFstabFound {
            device: device.to_string(),
        });
    };

    let plan = MountPlan::build(&entries, parts)?;

    for step in plan.mount_order() {
        // The anchor already covers the root of the tree.
        if step.mount_point == "/" || step.device == anchor.path {
            continue;
        }

        let subdir = target.join(step.mount_point.trim_start_matches('/'));
        mount_dev(&step.device, &subdir)?;
    }

    Ok(())
}

/// Mount a device node at a directory, creating the directory first.
fn mount_dev(device: &str, path: &Path) -> Result<()> {
    tracing::info!(device = %device, path = %path.display(), "mounting");

    cmd::mkdir_p(path)?;

    let out = cmd::run_unchecked("mount", &[device, &path.to_string_lossy()])?;
    if !out.success() {
        return Err(Error::mount(format!(
            "{} at {}: {}",
            device,
            path.display(),
            out.stderr
        )));
    }

    Ok(())
}

/// Unmount a device node or mounted path; already-unmounted is a no-op.
fn umount_dev(what: &str) -> Result<()> {
    tracing::info!(device = %what, "unmounting");

    let out = cmd::run_unchecked("umount", &[what])?;
    if !out.success() && !out.stderr.contains("not mounted") && !out.stderr.contains("not found") {
        return Err(Error::mount(format!("umount {}: {}", what, out.stderr)));
    }

    Ok(())
}

/// Grow a filesystem to fill its (possibly just-extended) device.
///
/// Unsupported kinds are reported, never silently skipped.
pub fn resize(device: &str, target: &Path, fs_kind: &str) -> Result<()> {
    tracing::info!(device = %device, kind = %fs_kind, "resizing filesystem");

    match fs_kind {
        "ext4" | "ext3" | "ext2" => {
            cmd::require("resize2fs")?;
            // fsck first; resize2fs refuses an unchecked filesystem
            let _ = cmd::run_unchecked("e2fsck", &["-f", "-y", device]);
            cmd::run("resize2fs", &[device])?;
            Ok(())
        }
        "xfs" => {
            cmd::require("xfs_growfs")?;
            // xfs grows online, on the mounted tree
            mount_dev(device, target)?;
            let result = cmd::run("xfs_growfs", &[&target.to_string_lossy()]);
            umount_dev(&target.to_string_lossy())?;
            result.map(|_| ())
        }
        other => Err(Error::UnsupportedFilesystem {
            kind: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Disk, IoLimits};

    fn disk(kind: &str, driver: &str) -> Disk {
        Disk {
            id: 0,
            kind: kind.to_string(),
            driver: driver.to_string(),
            source: "/src".to_string(),
            target: None,
            readonly: false,
            clone: false,
            resize: false,
            io: IoLimits::default(),
            ceph_user: None,
        }
    }

    #[test]
    fn test_backend_selection_is_exhaustive() {
        assert!(matches!(
            DiskMapper::for_disk(&disk("FILE", "raw")).unwrap(),
            DiskMapper::Raw(_)
        ));
        assert!(matches!(
            DiskMapper::for_disk(&disk("FILE", "qcow2")).unwrap(),
            DiskMapper::Qcow2(_)
        ));
        assert!(matches!(
            DiskMapper::for_disk(&disk("RBD", "raw")).unwrap(),
            DiskMapper::Rbd(_)
        ));
        assert!(matches!(
            DiskMapper::for_disk(&disk("FILE", "vmdk")),
            Err(Error::UnsupportedDisk { .. })
        ));
    }

    fn mounted_part(path: &str, mountpoint: Option<&str>) -> crate::blockdev::Partition {
        crate::blockdev::Partition {
            path: path.to_string(),
            uuid: Some("u".to_string()),
            label: None,
            fstype: Some("ext4".to_string()),
            mountpoint: mountpoint.map(String::from),
        }
    }

    #[test]
    fn test_teardown_unmounts_deepest_first() {
        let parts = vec![
            mounted_part("/dev/mapper/loop0p1", Some("/var/lib/lxd/containers/one-3")),
            mounted_part("/dev/mapper/loop0p3", Some("/var/lib/lxd/containers/one-3/var/log")),
            mounted_part("/dev/mapper/loop0p2", Some("/var/lib/lxd/containers/one-3/var")),
        ];

        let order: Vec<_> = teardown_order(&parts).iter().map(|p| p.path.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "/dev/mapper/loop0p3",
                "/dev/mapper/loop0p2",
                "/dev/mapper/loop0p1"
            ]
        );
    }

    #[test]
    fn test_teardown_handles_partially_mounted_disk() {
        // mount failed midway: only the anchor and one subpath are up
        let parts = vec![
            mounted_part("/dev/mapper/loop1p1", Some("/var/lib/lxd/containers/one-4")),
            mounted_part("/dev/mapper/loop1p2", Some("/var/lib/lxd/containers/one-4/var")),
        ];

        let order: Vec<_> = teardown_order(&parts).iter().map(|p| p.path.as_str()).collect();
        // the anchor comes down last so the subpath is never orphaned
        assert_eq!(order, vec!["/dev/mapper/loop1p2", "/dev/mapper/loop1p1"]);
    }

    #[test]
    fn test_unmap_of_absent_device_is_a_no_op() {
        // a released device node is gone; a second unmap must not fail
        assert!(RawMapper.unmap("/dev/loop-does-not-exist").is_ok());
        assert!(Qcow2Mapper.unmap("/dev/nbd-does-not-exist").is_ok());
        assert!(RbdMapper::new(None).unmap("/dev/rbd-does-not-exist").is_ok());
    }

    #[test]
    fn test_resize_rejects_unknown_filesystem() {
        let err = resize("/dev/null", Path::new("/tmp"), "btrfs").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFilesystem { .. }));
        assert!(err.to_string().contains("btrfs"));
    }
}
