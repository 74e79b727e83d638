//! VM descriptor boundary types.
//!
//! The driver consumes a structured VM description produced by the
//! surrounding automation (the XML/attribute reader lives there, not
//! here). [`VmDescriptor`] is that document: identity, resource
//! allocation, NIC and disk specs, and the datastore layout the disk
//! files live in. Values are immutable once read; the mapper and the
//! container translation only ever consume them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// One virtual NIC of a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    pub nic_id: u32,
    pub mac: String,
    /// Host bridge the interface attaches to.
    pub bridge: String,
    /// Host-side device name, if the descriptor pins one.
    #[serde(default)]
    pub target: Option<String>,
    /// Average inbound bandwidth in KB/s.
    #[serde(default)]
    pub inbound_avg_bw: Option<u64>,
    /// Average outbound bandwidth in KB/s.
    #[serde(default)]
    pub outbound_avg_bw: Option<u64>,
}

/// IO limits of a disk, as the descriptor states them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoLimits {
    #[serde(default)]
    pub total_bytes_sec: Option<u64>,
    #[serde(default)]
    pub total_iops_sec: Option<u64>,
    #[serde(default)]
    pub read_bytes_sec: Option<u64>,
    #[serde(default)]
    pub write_bytes_sec: Option<u64>,
    #[serde(default)]
    pub read_iops_sec: Option<u64>,
    #[serde(default)]
    pub write_iops_sec: Option<u64>,
}

impl IoLimits {
    /// True when no limit field is set at all.
    pub fn is_empty(&self) -> bool {
        self.total_bytes_sec.is_none()
            && self.total_iops_sec.is_none()
            && self.read_bytes_sec.is_none()
            && self.write_bytes_sec.is_none()
            && self.read_iops_sec.is_none()
            && self.write_iops_sec.is_none()
    }
}

/// One virtual disk of a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    /// Ordinal, unique within the VM.
    pub id: u32,
    /// Storage technology: "FILE" or "RBD".
    #[serde(rename = "type")]
    pub kind: String,
    /// Image driver: "raw" or "qcow2" for FILE disks.
    #[serde(default)]
    pub driver: String,
    /// Filesystem path or RBD image reference.
    pub source: String,
    /// Guest-visible target; non-absolute targets fall back to /media/<id>.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub readonly: bool,
    /// RBD images cloned per VM get a `-<vmid>-<diskid>` suffix.
    #[serde(default)]
    pub clone: bool,
    /// Grow the filesystem to fill the device on map.
    #[serde(default)]
    pub resize: bool,
    #[serde(default)]
    pub io: IoLimits,
    /// Ceph credential for RBD disks.
    #[serde(default)]
    pub ceph_user: Option<String>,
}

/// Closed set of storage backends a disk can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    FileRaw,
    FileQcow2,
    Rbd,
}

impl Disk {
    /// Resolve the backend for this disk's type/driver combination.
    ///
    /// Unsupported combinations are an explicit error, never a silent
    /// default.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        match (self.kind.to_ascii_uppercase().as_str(), self.driver.to_ascii_lowercase().as_str()) {
            ("FILE", "raw") => Ok(BackendKind::FileRaw),
            ("FILE", "qcow2") => Ok(BackendKind::FileQcow2),
            ("RBD", _) => Ok(BackendKind::Rbd),
            _ => Err(Error::UnsupportedDisk {
                disk_type: self.kind.clone(),
                driver: self.driver.clone(),
            }),
        }
    }
}

/// The abstract VM description the driver acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub vm_id: u32,
    /// Deploy identifier; empty/absent means the canonical `one-<vmid>`.
    #[serde(default)]
    pub deploy_id: Option<String>,
    /// Memory allocation in MB.
    pub memory_mb: u64,
    /// Fractional core allocation (1.0 = one full core).
    pub cpu: f64,
    /// vCPU count, if pinned.
    #[serde(default)]
    pub vcpu: Option<u32>,
    /// Datastore root the VM's disk files live under.
    pub datastore_path: PathBuf,
    /// System datastore id.
    pub system_ds_id: u32,
    /// Boot-order field the root disk id is derived from.
    #[serde(default)]
    pub boot_order: Option<String>,
    /// Id of the context image disk, if one is attached.
    #[serde(default)]
    pub context_disk_id: Option<u32>,
    #[serde(default)]
    pub nics: Vec<Nic>,
    #[serde(default)]
    pub disks: Vec<Disk>,
    /// Container profile; defaults to "default".
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub nesting: Option<bool>,
    /// Free-form config keys merged into the container config verbatim.
    #[serde(default)]
    pub raw_config: BTreeMap<String, String>,
}

impl VmDescriptor {
    /// Parse a descriptor document from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::descriptor(e.to_string()))
    }

    /// Read a descriptor from a file path, or stdin for "-".
    pub fn from_path(path: &str) -> Result<Self> {
        let content = if path == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else {
            std::fs::read_to_string(path)?
        };
        Self::from_json(&content)
    }

    /// Container name: the deploy identifier when set, `one-<vmid>`
    /// otherwise.
    pub fn name(&self) -> String {
        match self.deploy_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("one-{}", self.vm_id),
        }
    }

    /// A wild container is one whose deploy identifier was not minted by
    /// this driver; its storage is not ours to manage.
    pub fn is_wild(&self) -> bool {
        match self.deploy_id.as_deref() {
            Some(id) if !id.is_empty() => !id.contains("one-"),
            _ => false,
        }
    }

    /// Disk id of the root filesystem, derived from the boot order.
    /// Defaults to disk id 0.
    pub fn root_disk_id(&self) -> u32 {
        let Some(order) = self.boot_order.as_deref().filter(|o| !o.is_empty()) else {
            return 0;
        };

        let first = order.split(',').next().unwrap_or("");
        let digits: String = first
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        digits.parse().unwrap_or(0)
    }

    /// The root filesystem disk, if the descriptor carries it.
    pub fn root_disk(&self) -> Option<&Disk> {
        let id = self.root_disk_id();
        self.disks.iter().find(|d| d.id == id)
    }

    /// Look up a disk by id.
    pub fn disk(&self, id: u32) -> Result<&Disk> {
        self.disks
            .iter()
            .find(|d| d.id == id)
            .ok_or(Error::DiskNotFound(id))
    }

    /// Look up a NIC by MAC address.
    pub fn nic_by_mac(&self, mac: &str) -> Option<&Nic> {
        self.nics.iter().find(|n| n.mac.eq_ignore_ascii_case(mac))
    }

    /// Datastore directory holding this VM's disk files.
    pub fn vm_dir(&self) -> PathBuf {
        self.datastore_path
            .join(self.system_ds_id.to_string())
            .join(self.vm_id.to_string())
    }

    /// Path of a disk's image file within the datastore.
    pub fn disk_path(&self, disk_id: u32) -> PathBuf {
        self.vm_dir().join(format!("disk.{}", disk_id))
    }

    /// Per-disk mapper mount directory for non-root disks.
    pub fn mapper_dir(&self, disk_id: u32) -> PathBuf {
        self.vm_dir().join("mapper").join(format!("disk.{}", disk_id))
    }

    /// The source the mapper hands to the backend: the datastore file
    /// for FILE disks, the (possibly cloned) image reference for RBD.
    pub fn map_source(&self, disk: &Disk) -> String {
        match disk.backend_kind() {
            Ok(BackendKind::Rbd) => {
                if disk.clone {
                    format!("{}-{}-{}", disk.source, self.vm_id, disk.id)
                } else {
                    disk.source.clone()
                }
            }
            _ => self.disk_path(disk.id).to_string_lossy().into_owned(),
        }
    }

    /// Mount target for a disk: the container root storage directory for
    /// the root disk, the per-disk mapper directory otherwise.
    pub fn mount_target(&self, disk: &Disk, containers_dir: &Path) -> PathBuf {
        if disk.id == self.root_disk_id() {
            containers_dir.join(self.name())
        } else {
            self.mapper_dir(disk.id)
        }
    }
}
