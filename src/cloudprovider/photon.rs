// Copyright 2024 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Photon Controller cloud provider.
//!
//! The Photon API itself is reached through [`PhotonClient`]; this module
//! holds the instance lookup and disk bookkeeping built on top of it.

use super::{CloudError, CloudProvider, CloudResult, Instances, Zone, Zones};
use crate::api::core::{NodeAddress, NodeAddressType};
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};
use url::Url;

/// ProviderName is the name of this cloud provider.
pub const PROVIDER_NAME: &str = "photon";

/// Kind of every persistent disk created by this provider.
pub const DISK_SPEC_KIND: &str = "persistent-disk";

/// PcConfig is the `[Global]` section of the Photon cloud config file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PcConfig {
    /// Photon Controller endpoint.
    pub target: String,
    pub project: String,
    /// Set when the kubelet runs with `--hostname-override=<ip>`; instances
    /// are then looked up by IP instead of by name.
    pub override_ip: bool,
    /// VM ID of the local node.
    pub vm_id: String,
    pub authentication: bool,
}

impl PcConfig {
    /// Read the gcfg-formatted config. A missing reader is an error.
    pub fn read(config: Option<&mut dyn Read>) -> CloudResult<Self> {
        let Some(reader) = config else {
            return Err(CloudError::provider(
                "cloud provider config file is missing. Please restart kubelet with --cloud-provider=photon --cloud-config=[path_to_config_file]",
            ));
        };
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|e| CloudError::provider(format!("failed to read cloud config: {}", e)))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> CloudResult<Self> {
        let mut cfg = PcConfig::default();
        let mut in_global = false;
        for (n, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                in_global = line[1..line.len() - 1].trim().eq_ignore_ascii_case("global");
                continue;
            }
            if !in_global {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(CloudError::provider(format!("invalid config line {}: {:?}", n + 1, raw)));
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "target" => cfg.target = value,
                "project" => cfg.project = value,
                "overrideip" => cfg.override_ip = parse_bool(&value)?,
                "vmid" => cfg.vm_id = value,
                "authentication" => cfg.authentication = parse_bool(&value)?,
                other => {
                    return Err(CloudError::provider(format!(
                        "invalid variable {:?} in section \"Global\"",
                        other
                    )))
                }
            }
        }
        Ok(cfg)
    }
}

fn parse_bool(value: &str) -> CloudResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(CloudError::provider(format!("failed to parse bool {:?}", value))),
    }
}

/// VolumeOptions specifies capacity, tags, name and flavor for a volume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VolumeOptions {
    pub capacity_gb: i64,
    pub tags: HashMap<String, String>,
    pub name: String,
    pub flavor: String,
}

/// DiskCreateSpec is sent to Photon Controller to create a disk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiskCreateSpec {
    pub name: String,
    pub flavor: String,
    pub capacity_gb: i64,
    pub kind: String,
}

/// VmSummary is a VM entry of a project listing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VmSummary {
    pub id: String,
    pub name: String,
    pub state: String,
}

/// PhotonClient is the Photon Controller API. Every call waits for the
/// resulting task to finish.
pub trait PhotonClient: Send + Sync {
    fn get_vms(&self, project_id: &str) -> CloudResult<Vec<VmSummary>>;

    /// Returns the IP addresses of the VM's network connections.
    fn get_vm_ip_addresses(&self, vm_id: &str) -> CloudResult<Vec<String>>;

    fn attach_disk(&self, vm_id: &str, disk_id: &str) -> CloudResult<()>;

    fn detach_disk(&self, vm_id: &str, disk_id: &str) -> CloudResult<()>;

    /// Returns the IDs of the VMs the disk is attached to.
    fn get_disk_vms(&self, disk_id: &str) -> CloudResult<Vec<String>>;

    /// Create a disk and return its ID.
    fn create_disk(&self, project_id: &str, spec: &DiskCreateSpec) -> CloudResult<String>;

    fn delete_disk(&self, disk_id: &str) -> CloudResult<()>;
}

/// Disks is the interface for manipulation of Photon persistent disks.
pub trait Disks: Send + Sync {
    fn attach_disk(&self, pd_id: &str, node_name: &str) -> CloudResult<()>;

    fn detach_disk(&self, pd_id: &str, node_name: &str) -> CloudResult<()>;

    fn disk_is_attached(&self, pd_id: &str, node_name: &str) -> CloudResult<bool>;

    /// Batch check of `disk_is_attached`, keyed by disk ID.
    fn disks_are_attached(&self, pd_ids: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>>;

    /// Create a disk and return its ID.
    fn create_disk(&self, options: &VolumeOptions) -> CloudResult<String>;

    fn delete_disk(&self, pd_id: &str) -> CloudResult<()>;
}

/// PhotonCloud implements the cloud provider on top of a [`PhotonClient`].
pub struct PhotonCloud<C: PhotonClient> {
    client: C,
    cfg: PcConfig,
    endpoint: Url,
    local_instance_id: String,
    local_hostname: String,
    local_k8s_hostname: RwLock<String>,
    zone: Zone,
}

impl<C: PhotonClient> PhotonCloud<C> {
    /// Create the provider. The endpoint must be set in the config.
    pub fn new(cfg: PcConfig, client: C, hostname: &str) -> CloudResult<Self> {
        if cfg.target.is_empty() {
            return Err(CloudError::provider("endpoint was not specified"));
        }
        let endpoint = Url::parse(&cfg.target)
            .map_err(|e| CloudError::provider(format!("invalid endpoint {:?}: {}", cfg.target, e)))?;
        Ok(Self {
            client,
            local_instance_id: cfg.vm_id.clone(),
            cfg,
            endpoint,
            local_hostname: hostname.to_string(),
            local_k8s_hostname: RwLock::new(String::new()),
            zone: Zone::default(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn local_hostname(&self) -> &str {
        &self.local_hostname
    }

    /// Record the node name the kubelet registered with.
    pub fn current_node_name(&self, hostname: &str) -> String {
        *self.local_k8s_hostname.write().unwrap() = hostname.to_string();
        hostname.to_string()
    }

    fn vm_id_by_node_name(&self, node_name: &str) -> CloudResult<String> {
        let vms = self.client.get_vms(&self.cfg.project).map_err(|e| {
            error!(
                "Photon Cloud Provider: Failed to GetVMs from project {} with nodeName {}, error: [{}]",
                self.cfg.project, node_name, e
            );
            e
        })?;
        vms.into_iter()
            .find(|vm| vm.name == node_name)
            .map(|vm| vm.id)
            .ok_or_else(|| {
                CloudError::provider(format!("no matching started VM is found with name {}", node_name))
            })
    }

    fn vm_id_by_ip(&self, ip_address: &str) -> CloudResult<String> {
        let vms = self.client.get_vms(&self.cfg.project).map_err(|e| {
            error!(
                "Photon Cloud Provider: Failed to GetVMs for project {}. error: [{}]",
                self.cfg.project, e
            );
            e
        })?;
        for vm in vms {
            match self.client.get_vm_ip_addresses(&vm.id) {
                Ok(ips) if ips.iter().any(|ip| ip == ip_address) => return Ok(vm.id),
                Ok(_) => {}
                Err(e) => warn!(
                    "Photon Cloud Provider: GetNetworks failed for vm.ID {}, error [{}]",
                    vm.id, e
                ),
            }
        }
        Err(CloudError::provider(format!(
            "no matching VM is found with IP {}",
            ip_address
        )))
    }

    fn get_instance_id(&self, name: &str) -> CloudResult<String> {
        let vm_id = if self.cfg.override_ip {
            self.vm_id_by_ip(name)?
        } else {
            self.vm_id_by_node_name(name)?
        };
        if vm_id.is_empty() {
            return Err(CloudError::InstanceNotFound);
        }
        Ok(vm_id)
    }
}

impl<C: PhotonClient> CloudProvider for PhotonCloud<C> {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn instances(&self) -> Option<&dyn Instances> {
        Some(self)
    }

    fn zones(&self) -> Option<&dyn Zones> {
        Some(self)
    }

    fn photon_disks(&self) -> Option<&dyn Disks> {
        Some(self)
    }
}

impl<C: PhotonClient> Instances for PhotonCloud<C> {
    fn instance_id(&self, node_name: &str) -> CloudResult<String> {
        if node_name == self.local_k8s_hostname.read().unwrap().as_str() {
            return Ok(self.local_instance_id.clone());
        }
        self.get_instance_id(node_name).map_err(|e| {
            error!("Photon Cloud Provider: getInstanceID failed for InstanceID. Error[{}]", e);
            e
        })
    }

    fn instance_type(&self, _node_name: &str) -> CloudResult<String> {
        Ok(String::new())
    }

    fn node_addresses(&self, node_name: &str) -> CloudResult<Vec<NodeAddress>> {
        let vm_id = self.get_instance_id(node_name).map_err(|e| {
            error!("Photon Cloud Provider: getInstanceID failed for NodeAddresses. Error[{}]", e);
            e
        })?;
        let ips = self.client.get_vm_ip_addresses(&vm_id)?;
        if ips.is_empty() {
            error!("Failed to find the node {} from Photon Controller endpoint", node_name);
            return Err(CloudError::provider(format!(
                "failed to find the node {} from Photon Controller endpoint",
                node_name
            )));
        }
        let mut addrs = Vec::new();
        for ip in ips {
            for address_type in [NodeAddressType::ExternalIp, NodeAddressType::InternalIp] {
                addrs.push(NodeAddress {
                    address_type,
                    address: ip.clone(),
                });
            }
        }
        Ok(addrs)
    }
}

impl<C: PhotonClient> Zones for PhotonCloud<C> {
    fn get_zone(&self) -> CloudResult<Zone> {
        Ok(self.zone.clone())
    }
}

impl<C: PhotonClient> Disks for PhotonCloud<C> {
    fn attach_disk(&self, pd_id: &str, node_name: &str) -> CloudResult<()> {
        let vm_id = self.instance_id(node_name).map_err(|e| {
            error!("Photon Cloud Provider: pc.InstanceID failed for AttachDisk. Error[{}]", e);
            e
        })?;
        self.client.attach_disk(&vm_id, pd_id).map_err(|e| {
            error!("Photon Cloud Provider: Failed to attach disk with pdID {}. Error[{}]", pd_id, e);
            e
        })
    }

    fn detach_disk(&self, pd_id: &str, node_name: &str) -> CloudResult<()> {
        let vm_id = self.instance_id(node_name).map_err(|e| {
            error!("Photon Cloud Provider: pc.InstanceID failed for DetachDisk. Error[{}]", e);
            e
        })?;
        self.client.detach_disk(&vm_id, pd_id).map_err(|e| {
            error!("Photon Cloud Provider: Failed to detach disk with pdID {}. Error[{}]", pd_id, e);
            e
        })
    }

    fn disk_is_attached(&self, pd_id: &str, node_name: &str) -> CloudResult<bool> {
        let vms = self.client.get_disk_vms(pd_id).map_err(|e| {
            error!("Photon Cloud Provider: Failed to Get disk with pdID {}. Error[{}]", pd_id, e);
            e
        })?;
        let vm_id = match self.instance_id(node_name) {
            Ok(id) => id,
            Err(CloudError::InstanceNotFound) => {
                info!(
                    "Instance {:?} does not exist, disk {} will be detached automatically.",
                    node_name, pd_id
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        Ok(vms.iter().any(|vm| *vm == vm_id))
    }

    fn disks_are_attached(&self, pd_ids: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>> {
        let mut attached: HashMap<String, bool> = pd_ids.iter().map(|id| (id.clone(), false)).collect();

        let vm_id = match self.instance_id(node_name) {
            Ok(id) => id,
            Err(CloudError::InstanceNotFound) => {
                info!(
                    "Instance {:?} does not exist, its disks will be detached automatically.",
                    node_name
                );
                return Ok(attached);
            }
            Err(e) => return Err(e),
        };

        for pd_id in pd_ids {
            match self.client.get_disk_vms(pd_id) {
                Ok(vms) => {
                    if vms.iter().any(|vm| *vm == vm_id) {
                        attached.insert(pd_id.clone(), true);
                    }
                }
                Err(e) => warn!(
                    "Photon Cloud Provider: failed to get VMs for persistent disk {}, err [{}]",
                    pd_id, e
                ),
            }
        }
        Ok(attached)
    }

    fn create_disk(&self, options: &VolumeOptions) -> CloudResult<String> {
        let spec = DiskCreateSpec {
            name: options.name.clone(),
            flavor: options.flavor.clone(),
            capacity_gb: options.capacity_gb,
            kind: DISK_SPEC_KIND.to_string(),
        };
        self.client.create_disk(&self.cfg.project, &spec).map_err(|e| {
            error!("Photon Cloud Provider: Failed to CreateDisk. Error[{}]", e);
            e
        })
    }

    fn delete_disk(&self, pd_id: &str) -> CloudResult<()> {
        self.client.delete_disk(pd_id).map_err(|e| {
            error!("Photon Cloud Provider: Failed to DeleteDisk. Error[{}]", e);
            e
        })
    }
}

/// In-memory [`PhotonClient`] for tests.
#[derive(Default)]
pub struct FakePhotonClient {
    pub vms: Vec<VmSummary>,
    pub vm_ips: HashMap<String, Vec<String>>,
    pub disk_vms: RwLock<HashMap<String, Vec<String>>>,
    pub created: RwLock<Vec<(String, DiskCreateSpec)>>,
}

impl PhotonClient for Arc<FakePhotonClient> {
    fn get_vms(&self, _project_id: &str) -> CloudResult<Vec<VmSummary>> {
        Ok(self.vms.clone())
    }

    fn get_vm_ip_addresses(&self, vm_id: &str) -> CloudResult<Vec<String>> {
        self.vm_ips
            .get(vm_id)
            .cloned()
            .ok_or_else(|| CloudError::provider(format!("no networks for vm {}", vm_id)))
    }

    fn attach_disk(&self, vm_id: &str, disk_id: &str) -> CloudResult<()> {
        self.disk_vms
            .write()
            .unwrap()
            .entry(disk_id.to_string())
            .or_default()
            .push(vm_id.to_string());
        Ok(())
    }

    fn detach_disk(&self, vm_id: &str, disk_id: &str) -> CloudResult<()> {
        if let Some(vms) = self.disk_vms.write().unwrap().get_mut(disk_id) {
            vms.retain(|vm| vm != vm_id);
        }
        Ok(())
    }

    fn get_disk_vms(&self, disk_id: &str) -> CloudResult<Vec<String>> {
        self.disk_vms
            .read()
            .unwrap()
            .get(disk_id)
            .cloned()
            .ok_or_else(|| CloudError::DiskNotFound(disk_id.to_string()))
    }

    fn create_disk(&self, project_id: &str, spec: &DiskCreateSpec) -> CloudResult<String> {
        let id = format!("disk-{}", spec.name);
        self.created
            .write()
            .unwrap()
            .push((project_id.to_string(), spec.clone()));
        self.disk_vms.write().unwrap().insert(id.clone(), Vec::new());
        Ok(id)
    }

    fn delete_disk(&self, disk_id: &str) -> CloudResult<()> {
        self.disk_vms.write().unwrap().remove(disk_id);
        Ok(())
    }
}
