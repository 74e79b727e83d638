//! Ceph RBD backend: `rbd map`/`rbd unmap` through the kernel client.

use crate::blockdev::{self, Partition};
use crate::cmd;
use crate::error::Result;
use std::path::Path;

pub struct RbdMapper {
    /// Ceph auth user for this disk's pool, when the datastore declares
    /// one.
    ceph_user: Option<String>,
}

impl RbdMapper {
    pub fn new(ceph_user: Option<String>) -> Self {
        RbdMapper { ceph_user }
    }

    /// Map the image (`pool/name[@snap]`) to a /dev/rbdN node.
    pub fn map(&self, source: &str) -> Result<String> {
        cmd::require("rbd")?;

        let out = cmd::run("rbd", &self.with_auth(&["map", source]))?;
        Ok(out.stdout.trim().to_string())
    }

    /// Unmap the kernel device; already-unmapped is a no-op.
    pub fn unmap(&self, device: &str) -> Result<()> {
        if !Path::new(device).exists() {
            return Ok(());
        }

        cmd::run("rbd", &self.with_auth(&["unmap", device]))?;
        Ok(())
    }

    /// The kernel exposes rbd partitions as ordinary child nodes; the
    /// base lsblk listing is all we need.
    pub fn detect_parts(&self, device: &str) -> Result<Vec<Partition>> {
        blockdev::list_partitions(device)
    }

    fn with_auth<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(user) = &self.ceph_user {
            full.push("--id");
            full.push(user);
        }
        full.extend_from_slice(args);
        full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_args_prepended_when_user_set() {
        let mapper = RbdMapper::new(Some("libvirt".to_string()));
        assert_eq!(
            mapper.with_auth(&["map", "one/one-7-0-3"]),
            vec!["--id", "libvirt", "map", "one/one-7-0-3"]
        );
    }

    #[test]
    fn test_auth_args_absent_without_user() {
        let mapper = RbdMapper::new(None);
        assert_eq!(mapper.with_auth(&["unmap", "/dev/rbd0"]), vec!["unmap", "/dev/rbd0"]);
    }
}
