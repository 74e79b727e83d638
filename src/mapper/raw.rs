//! Raw image backend: `losetup` loop devices plus `kpartx` for
//! partitioned images.

use crate::blockdev::{self, Partition};
use crate::cmd;
use crate::error::{Error, Result};
use std::path::Path;

pub struct RawMapper;

impl RawMapper {
    /// Attach the image to the first free loop device.
    pub fn map(&self, source: &str) -> Result<String> {
        cmd::require("losetup")?;

        let out = cmd::run_unchecked("losetup", &["-f", "--show", source])?;
        if !out.success() {
            if out.stderr.contains("could not find any free loop device") {
                return Err(Error::device_exhausted("loop"));
            }
            return Err(Error::command_failed(
                format!("losetup -f --show {}", source),
                out.stderr,
            ));
        }

        Ok(out.stdout.trim().to_string())
    }

    /// Detach the loop device, hiding any kpartx-exposed partitions
    /// first. Already-detached devices are a no-op.
    pub fn unmap(&self, device: &str) -> Result<()> {
        if !Path::new(device).exists() {
            return Ok(());
        }

        let probe = cmd::run_unchecked("losetup", &[device])?;
        if !probe.success() {
            // node exists but nothing is attached
            return Ok(());
        }

        let _ = cmd::run_unchecked("kpartx", &["-dv", device]);
        cmd::run("losetup", &["-d", device])?;

        Ok(())
    }

    /// Expose the image's partitions through device-mapper and list them.
    pub fn detect_parts(&self, device: &str) -> Result<Vec<Partition>> {
        cmd::require("kpartx")?;

        let out = cmd::run("kpartx", &["-av", device])?;
        if out.stdout.trim().is_empty() {
            // no partition table, the loop device carries the filesystem
            return Ok(Vec::new());
        }

        let parts = blockdev::list_partitions(device)?;
        Ok(parts
            .into_iter()
            .map(|p| Partition {
                path: mapper_node(&p.path, |c| Path::new(c).exists()),
                ..p
            })
            .collect())
    }
}

/// kpartx exposes partitions under /dev/mapper, but lsblk may report
/// them as plain /dev nodes that do not exist. Prefer the mapper node
/// when it is the one actually present.
fn mapper_node(path: &str, exists: impl Fn(&str) -> bool) -> String {
    if exists(path) {
        return path.to_string();
    }

    if let Some(name) = path.strip_prefix("/dev/") {
        let candidate = format!("/dev/mapper/{}", name);
        if exists(&candidate) {
            return candidate;
        }
    }

    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapper_node_prefers_existing_path() {
        let node = mapper_node("/dev/loop0p1", |p| p == "/dev/loop0p1");
        assert_eq!(node, "/dev/loop0p1");
    }

    #[test]
    fn test_mapper_node_falls_back_to_dev_mapper() {
        let node = mapper_node("/dev/loop0p1", |p| p == "/dev/mapper/loop0p1");
        assert_eq!(node, "/dev/mapper/loop0p1");
    }

    #[test]
    fn test_mapper_node_keeps_unresolvable_path() {
        let node = mapper_node("/dev/loop9p9", |_| false);
        assert_eq!(node, "/dev/loop9p9");
    }
}
