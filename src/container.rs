//! LXD container entity.
//!
//! [`Container`] is the in-memory snapshot of a container resource. The
//! server is the system of record: every mutating call returns a *fresh*
//! snapshot fetched afterwards, since the server owns computed fields
//! (status, expanded config). Nothing here mutates state behind the
//! caller's back.
//!
//! The execution-state machine is Stopped ⇄ Running ⇄ Frozen, driven by
//! [`Container::change_state`]; a freshly created container is Stopped.

use crate::descriptor::{Disk, IoLimits, Nic, VmDescriptor};
use crate::error::{Error, Result};
use crate::rest::{metadata, LxdApi, WaitMode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Containers collection path.
const CONTAINERS: &str = "containers";

/// Device stanza map: device name → attribute map.
pub type DeviceMap = BTreeMap<String, BTreeMap<String, String>>;

/// Execution-state transitions the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateAction::Start => "start",
            StateAction::Stop => "stop",
            StateAction::Restart => "restart",
            StateAction::Freeze => "freeze",
            StateAction::Unfreeze => "unfreeze",
        }
    }
}

/// Snapshot of a container's configuration and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    #[serde(default)]
    pub profiles: Vec<String>,

    /// Resource limits, security flags and free-form runtime options.
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Network and disk device stanzas.
    #[serde(default)]
    pub devices: DeviceMap,

    /// Server-computed status; never sent back on writes.
    #[serde(default, skip_serializing)]
    pub status: String,
}

impl Container {
    fn path(name: &str) -> String {
        format!("{}/{}", CONTAINERS, name)
    }

    fn state_path(name: &str) -> String {
        format!("{}/{}/state", CONTAINERS, name)
    }

    /// Fetch the current server-side snapshot of a named container.
    pub fn fetch(name: &str, api: &impl LxdApi) -> Result<Container> {
        let envelope = api.get(&Self::path(name))?;
        let meta = metadata(&envelope)?;
        serde_json::from_value(meta).map_err(|e| Error::rest(500, e.to_string()))
    }

    /// Probe whether a named container exists.
    ///
    /// A 404 is a negative answer; any other transport error propagates.
    pub fn exists(name: &str, api: &impl LxdApi) -> Result<bool> {
        match api.get(&Self::path(name)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the container with no base image and return the refreshed
    /// snapshot (initial status: Stopped).
    pub fn create(self, api: &impl LxdApi, wait: WaitMode) -> Result<Container> {
        tracing::info!(container = %self.name, "creating container");

        let mut body = serde_json::to_value(&self).map_err(|e| Error::rest(500, e.to_string()))?;
        body["source"] = json!({"type": "none"});

        let response = api.post(CONTAINERS, &body)?;
        api.wait(&response, wait)?;

        Self::fetch(&self.name, api)
    }

    /// Push the full configuration/device map, replacing server state.
    pub fn update(&self, api: &impl LxdApi, wait: WaitMode) -> Result<()> {
        tracing::info!(container = %self.name, "updating container");

        let body = serde_json::to_value(self).map_err(|e| Error::rest(500, e.to_string()))?;
        let response = api.put(&Self::path(&self.name), &body)?;
        api.wait(&response, wait)
    }

    /// Remove the container resource.
    pub fn delete(&self, api: &impl LxdApi, wait: WaitMode) -> Result<()> {
        tracing::info!(container = %self.name, "deleting container");

        let response = api.delete(&Self::path(&self.name))?;
        api.wait(&response, wait)
    }

    /// Re-read server state into a fresh snapshot.
    pub fn refresh(&self, api: &impl LxdApi) -> Result<Container> {
        Self::fetch(&self.name, api)
    }

    /// Submit an execution-state transition and return the refreshed
    /// snapshot; the caller reads the resulting status from it.
    pub fn change_state(
        &self,
        api: &impl LxdApi,
        action: StateAction,
        wait: WaitMode,
    ) -> Result<Container> {
        tracing::info!(container = %self.name, action = action.as_str(), "state transition");

        let body = state_body(action, wait);
        let response = api.put(&Self::state_path(&self.name), &body)?;
        api.wait(&response, wait)?;

        self.refresh(api)
    }

    /// True when the last-fetched status was Running.
    pub fn is_running(&self) -> bool {
        self.status == "Running"
    }

    /// Merge another container's config and devices into this snapshot
    /// (desired values win).
    pub fn merge(&mut self, desired: &Container) {
        self.config
            .extend(desired.config.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.devices
            .extend(desired.devices.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.profiles = desired.profiles.clone();
    }

    /// Translate a VM descriptor into the desired container resource.
    pub fn from_descriptor(vm: &VmDescriptor) -> Result<Container> {
        let mut config = BTreeMap::new();

        config.insert("limits.memory".to_string(), format!("{}MB", vm.memory_mb));
        config.insert(
            "limits.cpu.allowance".to_string(),
            format!("{}%", (vm.cpu * 100.0) as i64),
        );
        if let Some(vcpu) = vm.vcpu {
            config.insert("limits.cpu".to_string(), vcpu.to_string());
        }

        config.insert(
            "security.privileged".to_string(),
            vm.privileged.unwrap_or(false).to_string(),
        );
        config.insert(
            "security.nesting".to_string(),
            vm.nesting.unwrap_or(false).to_string(),
        );

        // Free-form keys override computed ones.
        config.extend(vm.raw_config.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut devices = DeviceMap::new();
        for nic in &vm.nics {
            let (name, stanza) = nic_device(nic);
            devices.insert(name, stanza);
        }

        // A wild container's storage is not ours to describe.
        if !vm.is_wild() {
            for disk in &vm.disks {
                let (name, stanza) = disk_device(vm, disk);
                devices.insert(name, stanza);
            }

            if let Some(cid) = vm.context_disk_id {
                devices.insert("context".to_string(), context_device(vm, cid));
            }
        }

        Ok(Container {
            name: vm.name(),
            architecture: None,
            profiles: vec![vm.profile.clone().unwrap_or_else(|| "default".to_string())],
            config,
            devices,
            status: String::new(),
        })
    }
}

/// Body of a state-transition request.
fn state_body(action: StateAction, wait: WaitMode) -> Value {
    let mut body = json!({
        "action": action.as_str(),
        "force": false,
    });
    if let Some(secs) = wait.timeout_secs() {
        body["timeout"] = json!(secs);
    }
    body
}

/// NIC device stanza: bridged interface named `eth<nic_id>`.
pub(crate) fn nic_device(nic: &Nic) -> (String, BTreeMap<String, String>) {
    let name = format!("eth{}", nic.nic_id);

    let mut stanza = BTreeMap::new();
    stanza.insert("name".to_string(), name.clone());
    stanza.insert("parent".to_string(), nic.bridge.clone());
    stanza.insert("hwaddr".to_string(), nic.mac.clone());
    stanza.insert("nictype".to_string(), "bridged".to_string());
    stanza.insert("type".to_string(), "nic".to_string());
    if let Some(target) = &nic.target {
        stanza.insert("host_name".to_string(), target.clone());
    }

    // Average bandwidth is stated in KB/s; the server wants kbit.
    if let Some(bw) = nic.inbound_avg_bw {
        stanza.insert("limits.ingress".to_string(), format!("{}kbit", bw * 8));
    }
    if let Some(bw) = nic.outbound_avg_bw {
        stanza.insert("limits.egress".to_string(), format!("{}kbit", bw * 8));
    }

    (name, stanza)
}

/// Disk device stanza. The root disk uses the storage-pool shortcut at
/// `/`; data disks expose their mapper directory at the disk target.
pub(crate) fn disk_device(vm: &VmDescriptor, disk: &Disk) -> (String, BTreeMap<String, String>) {
    let mut stanza = BTreeMap::new();
    stanza.insert("type".to_string(), "disk".to_string());

    let name = if disk.id == vm.root_disk_id() {
        stanza.insert("path".to_string(), "/".to_string());
        stanza.insert("pool".to_string(), "default".to_string());
        "root".to_string()
    } else {
        let path = match disk.target.as_deref() {
            Some(t) if t.starts_with('/') => t.to_string(),
            _ => format!("/media/{}", disk.id),
        };
        stanza.insert("path".to_string(), path);
        stanza.insert(
            "source".to_string(),
            vm.mapper_dir(disk.id).to_string_lossy().into_owned(),
        );
        format!("disk{}", disk.id)
    };

    stanza.insert("readonly".to_string(), disk.readonly.to_string());
    apply_io_limits(&disk.io, &mut stanza);

    (name, stanza)
}

/// Context image stanza, exposed read-only at /context.
pub(crate) fn context_device(vm: &VmDescriptor, context_disk_id: u32) -> BTreeMap<String, String> {
    let mut stanza = BTreeMap::new();
    stanza.insert("type".to_string(), "disk".to_string());
    stanza.insert(
        "source".to_string(),
        vm.mapper_dir(context_disk_id).to_string_lossy().into_owned(),
    );
    stanza.insert("path".to_string(), "/context".to_string());
    stanza
}

/// IO-limit translation.
///
/// Precedence: an aggregate limit wins (bytes over IOPS); per-direction
/// limits apply only when no aggregate is set, again bytes over IOPS.
fn apply_io_limits(io: &IoLimits, stanza: &mut BTreeMap<String, String>) {
    if let Some(bytes) = io.total_bytes_sec {
        stanza.insert("limits.max".to_string(), bytes.to_string());
        return;
    }
    if let Some(iops) = io.total_iops_sec {
        stanza.insert("limits.max".to_string(), format!("{}iops", iops));
        return;
    }

    if io.read_bytes_sec.is_some() || io.write_bytes_sec.is_some() {
        if let Some(bytes) = io.read_bytes_sec {
            stanza.insert("limits.read".to_string(), bytes.to_string());
        }
        if let Some(bytes) = io.write_bytes_sec {
            stanza.insert("limits.write".to_string(), bytes.to_string());
        }
        return;
    }

    if let Some(iops) = io.read_iops_sec {
        stanza.insert("limits.read".to_string(), format!("{}iops", iops));
    }
    if let Some(iops) = io.write_iops_sec {
        stanza.insert("limits.write".to_string(), format!("{}iops", iops));
    }
}
