//! Filesystem-table parsing and mount planning.
//!
//! A multi-partition disk image carries its own `/etc/fstab` naming which
//! partition goes where. [`parse`] reads UUID/LABEL-keyed entries out of
//! that file and [`MountPlan`] joins them against the discovered partition
//! list, ordering mounts so that deeper paths never shadow their parents.

use crate::blockdev::Partition;
use crate::error::{Error, Result};

/// Stable identity a fstab entry uses to name its filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKey {
    Uuid(String),
    Label(String),
}

/// One usable fstab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub key: DeviceKey,
    pub mount_point: String,
}

/// Parse fstab content into UUID/LABEL-keyed entries.
///
/// Comments, blank lines, swap entries and device-path entries (not
/// stable across mapping) are skipped. Malformed content simply yields
/// fewer entries; the caller decides whether an empty result is fatal.
pub fn parse(content: &str) -> Vec<FstabEntry> {
    let mut entries = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(fs), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };

        let key = if let Some(value) = fs.strip_prefix("UUID=") {
            DeviceKey::Uuid(value.to_string())
        } else if let Some(value) = fs.strip_prefix("LABEL=") {
            DeviceKey::Label(value.to_string())
        } else {
            // device-path or pseudo-fs entry
            continue;
        };

        if mount_point == "swap" || mount_point == "none" {
            continue;
        }

        entries.push(FstabEntry {
            key,
            mount_point: mount_point.to_string(),
        });
    }

    entries
}

/// One partition→subpath binding of a [`MountPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountStep {
    /// Partition device node.
    pub device: String,
    /// Mount point relative to the disk's target directory ("/" for root).
    pub mount_point: String,
}

/// Ordered mapping from partitions to target subdirectories.
///
/// Mount order is root first, then ascending path depth; unmount order is
/// the exact reverse.
#[derive(Debug, Clone)]
pub struct MountPlan {
    steps: Vec<MountStep>,
}

impl MountPlan {
    /// Join fstab entries against a partition list.
    ///
    /// Entries naming a filesystem not present on the disk are ignored.
    /// At most one entry may map to `/`.
    pub fn build(entries: &[FstabEntry], partitions: &[Partition]) -> Result<MountPlan> {
        let mut steps = Vec::new();

        for entry in entries {
            let matched = partitions.iter().find(|p| match &entry.key {
                DeviceKey::Uuid(uuid) => p.uuid.as_deref() == Some(uuid),
                DeviceKey::Label(label) => p.label.as_deref() == Some(label),
            });

            if let Some(part) = matched {
                steps.push(MountStep {
                    device: part.path.clone(),
                    mount_point: entry.mount_point.clone(),
                });
            }
        }

        if steps.iter().filter(|s| s.mount_point == "/").count() > 1 {
            return Err(Error::mount("fstab maps more than one partition to /"));
        }

        steps.sort_by_key(|s| {
            (
                s.mount_point != "/",
                path_depth(&s.mount_point),
                s.mount_point.len(),
            )
        });

        Ok(MountPlan { steps })
    }

    /// Steps in mount order.
    pub fn mount_order(&self) -> &[MountStep] {
        &self.steps
    }

    /// Steps in unmount order (deepest first).
    pub fn unmount_order(&self) -> Vec<&MountStep> {
        self.steps.iter().rev().collect()
    }

    /// The step mapping to `/`, if the table declares one.
    pub fn root(&self) -> Option<&MountStep> {
        self.steps.iter().find(|s| s.mount_point == "/")
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn path_depth(path: &str) -> usize {
    path.matches('/').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(path: &str, uuid: &str, label: Option<&str>) -> Partition {
        Partition {
            path: path.to_string(),
            uuid: Some(uuid.to_string()),
            label: label.map(String::from),
            fstype: Some("ext4".to_string()),
            mountpoint: None,
        }
    }

    #[test]
    fn test_parse_skips_comments_and_devices() {
        let content = "\
# /etc/fstab
UUID=aaaa / ext4 defaults 0 1
/dev/sda2 /home ext4 defaults 0 2
LABEL=var /var ext4 defaults 0 2

UUID=cccc swap swap defaults 0 0
";
        let entries = parse(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, DeviceKey::Uuid("aaaa".to_string()));
        assert_eq!(entries[1].key, DeviceKey::Label("var".to_string()));
    }

    #[test]
    fn test_parse_malformed_yields_no_entries() {
        assert!(parse("this is not a table").is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_plan_orders_by_depth() {
        let entries = parse(
            "UUID=log /var/log ext4 defaults 0 2\n\
             UUID=root / ext4 defaults 0 1\n\
             UUID=var /var ext4 defaults 0 2\n",
        );
        let parts = vec![
            part("/dev/mapper/loop0p3", "log", None),
            part("/dev/mapper/loop0p1", "root", None),
            part("/dev/mapper/loop0p2", "var", None),
        ];

        let plan = MountPlan::build(&entries, &parts).unwrap();

        let mounts: Vec<_> = plan
            .mount_order()
            .iter()
            .map(|s| s.mount_point.as_str())
            .collect();
        assert_eq!(mounts, vec!["/", "/var", "/var/log"]);

        let unmounts: Vec<_> = plan
            .unmount_order()
            .iter()
            .map(|s| s.mount_point.as_str())
            .collect();
        assert_eq!(unmounts, vec!["/var/log", "/var", "/"]);
    }

    #[test]
    fn test_plan_root_is_mounted_first() {
        let entries = parse(
            "UUID=boot /boot ext4 defaults 0 2\n\
             UUID=root / ext4 defaults 0 1\n",
        );
        let parts = vec![
            part("/dev/nbd0p1", "boot", None),
            part("/dev/nbd0p2", "root", None),
        ];

        let plan = MountPlan::build(&entries, &parts).unwrap();
        assert_eq!(plan.mount_order()[0].mount_point, "/");
        assert_eq!(plan.root().unwrap().device, "/dev/nbd0p2");
    }

    #[test]
    fn test_plan_rejects_two_roots() {
        let entries = parse(
            "UUID=a / ext4 defaults 0 1\n\
             UUID=b / ext4 defaults 0 1\n",
        );
        let parts = vec![part("/dev/x1", "a", None), part("/dev/x2", "b", None)];

        assert!(MountPlan::build(&entries, &parts).is_err());
    }

    #[test]
    fn test_plan_matches_by_label() {
        let entries = parse("LABEL=data /srv/data ext4 defaults 0 2\n");
        let parts = vec![part("/dev/nbd1p1", "u", Some("data"))];

        let plan = MountPlan::build(&entries, &parts).unwrap();
        assert_eq!(plan.mount_order()[0].device, "/dev/nbd1p1");
    }

    #[test]
    fn test_plan_ignores_entries_for_foreign_filesystems() {
        let entries = parse("UUID=not-here /opt ext4 defaults 0 2\n");
        let parts = vec![part("/dev/nbd1p1", "u", None)];

        let plan = MountPlan::build(&entries, &parts).unwrap();
        assert!(plan.is_empty());
    }
}
