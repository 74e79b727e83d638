//! Container lifecycle orchestration.
//!
//! [`Driver`] sequences storage mapping and container REST calls for one
//! VM. The ordering contract: storage is fully mapped before the
//! container boots, and every failure path releases what was already
//! mapped so a failed deploy leaves no attached devices or stray mounts
//! behind.

use crate::container::{self, Container, StateAction};
use crate::descriptor::{Disk, IoLimits, VmDescriptor};
use crate::error::{Error, Result};
use crate::mapper::{DiskMapper, MapAction};
use crate::rest::{LxdApi, WaitMode};
use std::path::PathBuf;

/// Root directory of container storage on the host.
pub const DEFAULT_CONTAINERS_DIR: &str = "/var/lib/lxd/containers";

/// One disk's mapping work: which backend, where from, where to.
struct MapJob {
    mapper: DiskMapper,
    source: String,
    target: PathBuf,
    disk: Disk,
}

/// Lifecycle orchestrator for a single VM.
pub struct Driver<A: LxdApi> {
    api: A,
    vm: VmDescriptor,
    wait: WaitMode,
    containers_dir: PathBuf,
}

impl<A: LxdApi> Driver<A> {
    pub fn new(api: A, vm: VmDescriptor, wait: WaitMode) -> Self {
        Driver {
            api,
            vm,
            wait,
            containers_dir: PathBuf::from(DEFAULT_CONTAINERS_DIR),
        }
    }

    pub fn with_containers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.containers_dir = dir.into();
        self
    }

    pub fn name(&self) -> String {
        self.vm.name()
    }

    /// Deploy: map storage, converge the container resource, boot.
    ///
    /// Any failure after mapping unwinds the mapped storage; a start
    /// failure additionally deletes the container resource.
    pub fn deploy(&self) -> Result<String> {
        let name = self.name();
        tracing::info!(container = %name, "deploy");

        self.map_all_storage(MapAction::Map)?;

        let container = match self.create_or_override() {
            Ok(c) => c,
            Err(e) => {
                self.release_storage_best_effort();
                return Err(e);
            }
        };

        self.start_container(&container)?;
        Ok(name)
    }

    /// Shutdown: stop the container, release its storage, delete the
    /// resource. A container the server no longer knows about still gets
    /// its storage released.
    pub fn shutdown(&self) -> Result<()> {
        let name = self.name();
        tracing::info!(container = %name, "shutdown");

        match Container::fetch(&name, &self.api) {
            Ok(container) => {
                if container.is_running() {
                    container.change_state(&self.api, StateAction::Stop, self.wait)?;
                }
                self.map_all_storage(MapAction::Unmap)?;
                container.delete(&self.api, self.wait)
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(container = %name, "container gone, releasing storage only");
                self.map_all_storage(MapAction::Unmap)
            }
            Err(e) => Err(e),
        }
    }

    /// Reset: restart in place; storage stays mapped throughout.
    pub fn reset(&self) -> Result<()> {
        let name = self.name();
        tracing::info!(container = %name, "reset");

        let container = Container::fetch(&name, &self.api)?;
        let after = container.change_state(&self.api, StateAction::Restart, self.wait)?;

        if !after.is_running() {
            return Err(Error::ContainerStartFailed {
                name,
                status: after.status,
            });
        }
        Ok(())
    }

    /// Hot-attach a disk: map it, then publish the device stanza. A
    /// failed publish unmaps again.
    pub fn attach_disk(&self, disk_id: u32) -> Result<()> {
        let disk = self.vm.disk(disk_id)?.clone();
        let job = self.job_for(&disk)?;

        job.mapper
            .run(MapAction::Map, &job.target, &job.source, &job.disk)?;

        let result = (|| {
            let mut container = Container::fetch(&self.name(), &self.api)?;
            let (name, stanza) = container::disk_device(&self.vm, &disk);
            container.devices.insert(name, stanza);
            container.update(&self.api, self.wait)
        })();

        if result.is_err() {
            if let Err(e) = job.mapper.run(MapAction::Unmap, &job.target, &job.source, &job.disk) {
                tracing::warn!(disk = disk_id, error = %e, "rollback unmap failed");
            }
        }
        result
    }

    /// Hot-detach a disk: retract the device stanza, then unmap.
    pub fn detach_disk(&self, disk_id: u32) -> Result<()> {
        let disk = self.vm.disk(disk_id)?.clone();

        let mut container = Container::fetch(&self.name(), &self.api)?;
        container.devices.remove(&format!("disk{}", disk_id));
        container.update(&self.api, self.wait)?;

        let job = self.job_for(&disk)?;
        job.mapper
            .run(MapAction::Unmap, &job.target, &job.source, &job.disk)
    }

    /// Hot-attach the NIC with the given MAC from the descriptor.
    pub fn attach_nic(&self, mac: &str) -> Result<()> {
        let nic = self
            .vm
            .nic_by_mac(mac)
            .ok_or_else(|| Error::descriptor(format!("no nic with mac {} in descriptor", mac)))?;

        let mut container = Container::fetch(&self.name(), &self.api)?;
        let (name, stanza) = container::nic_device(nic);
        container.devices.insert(name, stanza);
        container.update(&self.api, self.wait)
    }

    /// Hot-detach the NIC device carrying the given MAC.
    pub fn detach_nic(&self, mac: &str) -> Result<()> {
        let mut container = Container::fetch(&self.name(), &self.api)?;

        let device = container
            .devices
            .iter()
            .find(|(_, stanza)| {
                stanza
                    .get("hwaddr")
                    .map(|h| h.eq_ignore_ascii_case(mac))
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Error::descriptor(format!("no attached nic with mac {}", mac)))?;

        container.devices.remove(&device);
        container.update(&self.api, self.wait)
    }

    /// Re-map the context image (its content changed on the datastore)
    /// and republish the /context stanza.
    pub fn hotplug_context(&self) -> Result<()> {
        let cid = self
            .vm
            .context_disk_id
            .ok_or_else(|| Error::descriptor("descriptor has no context disk"))?;

        let job = self.context_job(cid);
        job.mapper
            .run(MapAction::Unmap, &job.target, &job.source, &job.disk)?;
        job.mapper
            .run(MapAction::Map, &job.target, &job.source, &job.disk)?;

        let mut container = Container::fetch(&self.name(), &self.api)?;
        container
            .devices
            .insert("context".to_string(), container::context_device(&self.vm, cid));
        container.update(&self.api, self.wait)
    }

    /// Map or unmap every disk of the VM, context image included.
    ///
    /// Map works in ascending disk-id order and unwinds already-mapped
    /// disks on failure. Unmap works in reverse order and keeps going
    /// past failures, reporting the first one at the end.
    pub fn map_all_storage(&self, action: MapAction) -> Result<()> {
        if self.vm.is_wild() {
            tracing::info!(container = %self.name(), "wild container, storage not managed here");
            return Ok(());
        }

        let jobs = self.storage_jobs()?;

        match action {
            MapAction::Map => {
                for (index, job) in jobs.iter().enumerate() {
                    if let Err(e) =
                        job.mapper
                            .run(MapAction::Map, &job.target, &job.source, &job.disk)
                    {
                        tracing::error!(disk = job.disk.id, error = %e,
                            "map failed, unwinding mapped disks");
                        for done in jobs[..index].iter().rev() {
                            if let Err(undo) = done.mapper.run(
                                MapAction::Unmap,
                                &done.target,
                                &done.source,
                                &done.disk,
                            ) {
                                tracing::warn!(disk = done.disk.id, error = %undo,
                                    "unwind unmap failed");
                            }
                        }
                        return Err(e);
                    }
                }
                Ok(())
            }
            MapAction::Unmap => {
                let mut first_err = None;
                for job in jobs.iter().rev() {
                    if let Err(e) =
                        job.mapper
                            .run(MapAction::Unmap, &job.target, &job.source, &job.disk)
                    {
                        tracing::warn!(disk = job.disk.id, error = %e, "unmap failed");
                        first_err.get_or_insert(e);
                    }
                }
                match first_err {
                    None => Ok(()),
                    Some(e) => Err(e),
                }
            }
        }
    }

    /// Converge the container resource to the descriptor.
    ///
    /// A stopped leftover with the same name is overridden (merge +
    /// update); a running one is a hard conflict and is left untouched.
    fn create_or_override(&self) -> Result<Container> {
        let desired = Container::from_descriptor(&self.vm)?;

        if Container::exists(&desired.name, &self.api)? {
            let mut existing = Container::fetch(&desired.name, &self.api)?;

            if existing.is_running() {
                return Err(Error::ContainerConflict {
                    name: existing.name,
                });
            }

            tracing::info!(container = %existing.name, "overriding stopped leftover container");
            existing.merge(&desired);
            existing.update(&self.api, self.wait)?;
            return existing.refresh(&self.api);
        }

        desired.create(&self.api, self.wait)
    }

    /// Boot the container; a boot that does not reach Running rolls the
    /// whole deploy back (storage released, resource deleted).
    fn start_container(&self, container: &Container) -> Result<Container> {
        let after = container.change_state(&self.api, StateAction::Start, self.wait)?;
        if after.is_running() {
            return Ok(after);
        }

        tracing::error!(container = %container.name, status = %after.status,
            "container did not reach Running, rolling back");

        self.release_storage_best_effort();
        if let Err(e) = container.delete(&self.api, self.wait) {
            tracing::warn!(container = %container.name, error = %e, "rollback delete failed");
        }

        Err(Error::ContainerStartFailed {
            name: container.name.clone(),
            status: after.status,
        })
    }

    fn release_storage_best_effort(&self) {
        if let Err(e) = self.map_all_storage(MapAction::Unmap) {
            tracing::warn!(error = %e, "storage release failed");
        }
    }

    /// Mapping jobs in ascending disk-id order, context image last.
    fn storage_jobs(&self) -> Result<Vec<MapJob>> {
        let mut disks: Vec<&Disk> = self.vm.disks.iter().collect();
        disks.sort_by_key(|d| d.id);

        let mut jobs = Vec::with_capacity(disks.len() + 1);
        for disk in disks {
            jobs.push(self.job_for(disk)?);
        }

        if let Some(cid) = self.vm.context_disk_id {
            jobs.push(self.context_job(cid));
        }

        Ok(jobs)
    }

    fn job_for(&self, disk: &Disk) -> Result<MapJob> {
        Ok(MapJob {
            mapper: DiskMapper::for_disk(disk)?,
            source: self.vm.map_source(disk),
            target: self.vm.mount_target(disk, &self.containers_dir),
            disk: disk.clone(),
        })
    }

    /// The context image is always a raw filesystem image, whatever the
    /// VM's disk backends are.
    fn context_job(&self, context_disk_id: u32) -> MapJob {
        MapJob {
            mapper: DiskMapper::raw(),
            source: self
                .vm
                .disk_path(context_disk_id)
                .to_string_lossy()
                .into_owned(),
            target: self.vm.mapper_dir(context_disk_id),
            disk: Disk {
                id: context_disk_id,
                kind: "FILE".to_string(),
                driver: "raw".to_string(),
                source: String::new(),
                target: None,
                readonly: true,
                clone: false,
                resize: false,
                io: IoLimits::default(),
                ceph_user: None,
            },
        }
    }
}

impl Driver<crate::rest::UnixClient> {
    /// Production driver over the Unix socket.
    pub fn connect(socket: impl Into<PathBuf>, vm: VmDescriptor, wait: WaitMode) -> Self {
        Self::new(crate::rest::UnixClient::new(socket), vm, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::fake::FakeApi;
    use serde_json::json;

    /// Descriptor with no disks: lifecycle tests exercise the REST
    /// choreography without touching host block devices.
    fn diskless_vm() -> VmDescriptor {
        VmDescriptor::from_json(
            r#"{
                "vm_id": 7,
                "memory_mb": 512,
                "cpu": 1.0,
                "datastore_path": "/var/lib/one/datastores",
                "system_ds_id": 100,
                "nics": [
                    {"nic_id": 0, "mac": "AA:BB:CC:00:00:07", "bridge": "br0"}
                ]
            }"#,
        )
        .unwrap()
    }

    fn driver(api: FakeApi) -> Driver<FakeApi> {
        Driver::new(api, diskless_vm(), WaitMode::default())
    }

    #[test]
    fn test_deploy_creates_and_starts() {
        let api = FakeApi::new();
        api.fail("GET", "containers/one-7", 404, "not found");
        api.respond("POST", "containers", FakeApi::sync(json!({})));
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Stopped"})),
        );
        api.respond("PUT", "containers/one-7/state", FakeApi::sync(json!({})));
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Running"})),
        );

        let name = driver(api).deploy().unwrap();
        assert_eq!(name, "one-7");
    }

    #[test]
    fn test_deploy_conflict_leaves_running_container_untouched() {
        let api = FakeApi::new();
        // exists probe, then the override fetch
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Running"})),
        );
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Running"})),
        );

        let d = driver(api);
        let err = d.deploy().unwrap_err();
        assert!(matches!(err, Error::ContainerConflict { .. }));
        assert!(d.api.calls_of("PUT").is_empty());
        assert!(d.api.calls_of("POST").is_empty());
        assert!(d.api.calls_of("DELETE").is_empty());
    }

    #[test]
    fn test_deploy_overrides_stopped_leftover() {
        let api = FakeApi::new();
        let stopped = json!({
            "name": "one-7", "status": "Stopped",
            "config": {"user.note": "keep"}, "devices": {}, "profiles": ["default"]
        });
        api.respond("GET", "containers/one-7", FakeApi::sync(stopped.clone()));
        api.respond("GET", "containers/one-7", FakeApi::sync(stopped));
        api.respond("PUT", "containers/one-7", FakeApi::sync(json!({})));
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Stopped"})),
        );
        api.respond("PUT", "containers/one-7/state", FakeApi::sync(json!({})));
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Running"})),
        );

        let d = driver(api);
        d.deploy().unwrap();

        // merge kept the existing free-form key and applied the new limits
        let body = d.api.last_body("PUT", "containers/one-7").unwrap();
        assert_eq!(body["config"]["user.note"], "keep");
        assert_eq!(body["config"]["limits.memory"], "512MB");
        assert!(d.api.calls_of("POST").is_empty());
    }

    #[test]
    fn test_deploy_rolls_back_when_start_does_not_reach_running() {
        let api = FakeApi::new();
        api.fail("GET", "containers/one-7", 404, "not found");
        api.respond("POST", "containers", FakeApi::sync(json!({})));
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Stopped"})),
        );
        api.respond("PUT", "containers/one-7/state", FakeApi::sync(json!({})));
        // still Stopped after the start attempt
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Stopped"})),
        );
        api.respond("DELETE", "containers/one-7", FakeApi::sync(json!({})));

        let d = driver(api);
        let err = d.deploy().unwrap_err();

        assert!(matches!(err, Error::ContainerStartFailed { .. }));
        assert!(err.to_string().contains("one-7"));
        // the resource was rolled back
        assert_eq!(d.api.calls_of("DELETE"), vec!["containers/one-7"]);
    }

    #[test]
    fn test_shutdown_stops_then_deletes() {
        let api = FakeApi::new();
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Running"})),
        );
        api.respond("PUT", "containers/one-7/state", FakeApi::sync(json!({})));
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Stopped"})),
        );
        api.respond("DELETE", "containers/one-7", FakeApi::sync(json!({})));

        let d = driver(api);
        d.shutdown().unwrap();

        let body = d.api.last_body("PUT", "containers/one-7/state").unwrap();
        assert_eq!(body["action"], "stop");
        assert_eq!(d.api.calls_of("DELETE"), vec!["containers/one-7"]);
    }

    #[test]
    fn test_shutdown_of_missing_container_is_not_an_error() {
        let api = FakeApi::new();
        api.fail("GET", "containers/one-7", 404, "not found");

        driver(api).shutdown().unwrap();
    }

    #[test]
    fn test_reset_requires_running_afterwards() {
        let api = FakeApi::new();
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Running"})),
        );
        api.respond("PUT", "containers/one-7/state", FakeApi::sync(json!({})));
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Stopped"})),
        );

        let err = driver(api).reset().unwrap_err();
        assert!(matches!(err, Error::ContainerStartFailed { .. }));
    }

    #[test]
    fn test_attach_nic_publishes_device() {
        let api = FakeApi::new();
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({"name": "one-7", "status": "Running", "devices": {}})),
        );
        api.respond("PUT", "containers/one-7", FakeApi::sync(json!({})));

        let d = driver(api);
        d.attach_nic("aa:bb:cc:00:00:07").unwrap();

        let body = d.api.last_body("PUT", "containers/one-7").unwrap();
        assert_eq!(body["devices"]["eth0"]["hwaddr"], "AA:BB:CC:00:00:07");
        assert_eq!(body["devices"]["eth0"]["nictype"], "bridged");
    }

    #[test]
    fn test_attach_nic_unknown_mac_is_descriptor_error() {
        let api = FakeApi::new();
        let err = driver(api).attach_nic("00:00:00:00:00:00").unwrap_err();
        assert!(matches!(err, Error::Descriptor(_)));
    }

    #[test]
    fn test_detach_nic_matches_by_hwaddr() {
        let api = FakeApi::new();
        api.respond(
            "GET",
            "containers/one-7",
            FakeApi::sync(json!({
                "name": "one-7", "status": "Running",
                "devices": {
                    "eth0": {"type": "nic", "hwaddr": "AA:BB:CC:00:00:07"},
                    "root": {"type": "disk", "path": "/"}
                }
            })),
        );
        api.respond("PUT", "containers/one-7", FakeApi::sync(json!({})));

        let d = driver(api);
        d.detach_nic("aa:bb:cc:00:00:07").unwrap();

        let body = d.api.last_body("PUT", "containers/one-7").unwrap();
        assert!(body["devices"].get("eth0").is_none());
        assert!(body["devices"].get("root").is_some());
    }

    #[test]
    fn test_wild_container_storage_is_untouched() {
        let api = FakeApi::new();
        let mut vm = diskless_vm();
        vm.deploy_id = Some("pet-container".to_string());
        // give it a disk that would need a host device if it were ours
        vm.disks.push(
            serde_json::from_value(json!({
                "id": 0, "type": "FILE", "driver": "raw", "source": "/img"
            }))
            .unwrap(),
        );

        let d = Driver::new(api, vm, WaitMode::default());
        // would touch losetup if the wild guard did not short-circuit
        d.map_all_storage(MapAction::Map).unwrap();
        d.map_all_storage(MapAction::Unmap).unwrap();
    }

    #[test]
    fn test_hotplug_context_without_context_disk_fails() {
        let err = driver(FakeApi::new()).hotplug_context().unwrap_err();
        assert!(matches!(err, Error::Descriptor(_)));
    }
}
