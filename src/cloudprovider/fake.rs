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

//! In-memory cloud provider for tests.

use super::{aws, azure, gce, photon};
use super::{CloudError, CloudProvider, CloudResult, Instances, LoadBalancer, Zone, Zones};
use crate::api::core::{
    AzureDataDiskCachingMode, LoadBalancerIngress, LoadBalancerStatus, Node, NodeAddress, NodeAddressType,
    Service, LABEL_ZONE_FAILURE_DOMAIN, LABEL_ZONE_REGION,
};
use crate::api::resource::Quantity;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

const MAX_LUNS: i32 = 64;

/// FakeCall records a single call made against a [`FakeCloud`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeCall {
    pub method: &'static str,
    pub args: Vec<String>,
}

#[derive(Default)]
struct FakeCloudState {
    calls: Vec<FakeCall>,
    errors: HashMap<&'static str, CloudError>,
    instance_types: HashMap<String, String>,
    instance_ids: HashMap<String, String>,
    addresses: HashMap<String, Vec<NodeAddress>>,
    // disk -> nodes it is attached to
    attachments: BTreeMap<String, BTreeSet<String>>,
    // node -> lun -> disk name
    luns: HashMap<String, BTreeMap<i32, String>>,
    // disk -> size in GiB
    disks: BTreeMap<String, i64>,
    disk_labels: HashMap<String, HashMap<String, String>>,
    disk_paths: HashMap<String, String>,
    aws_volume_options: Vec<aws::VolumeOptions>,
    gce_disk_zones: BTreeMap<String, BTreeSet<String>>,
    gce_disk_types: BTreeMap<String, String>,
    zones_with_nodes: BTreeSet<String>,
    file_shares: Vec<azure::FileShareOptions>,
    photon_volume_options: Vec<photon::VolumeOptions>,
    balancers: BTreeMap<String, LoadBalancerStatus>,
    balancer_hosts: BTreeMap<String, Vec<String>>,
    next_id: u64,
}

/// FakeCloud implements every cloud interface against in-memory state.
///
/// Errors are injected per method name (e.g. `"attach_disk"`) with
/// [`FakeCloud::set_error`] and stay until cleared.
pub struct FakeCloud {
    provider: String,
    supports_instances: bool,
    supports_load_balancer: bool,
    zone: Zone,
    managed_disks: Option<azure::ManagedDiskController>,
    state: Mutex<FakeCloudState>,
}

impl FakeCloud {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            supports_instances: true,
            supports_load_balancer: true,
            zone: Zone {
                failure_domain: "zone-a".to_string(),
                region: "region-1".to_string(),
            },
            managed_disks: None,
            state: Mutex::new(FakeCloudState::default()),
        }
    }

    /// Make `instances()` return None.
    pub fn without_instances(mut self) -> Self {
        self.supports_instances = false;
        self
    }

    /// Make `load_balancer()` return None.
    pub fn without_load_balancer(mut self) -> Self {
        self.supports_load_balancer = false;
        self
    }

    /// Serve `azure_managed_disks()` from `controller`.
    pub fn with_managed_disks(mut self, controller: azure::ManagedDiskController) -> Self {
        self.managed_disks = Some(controller);
        self
    }

    pub fn set_error(&self, method: &'static str, err: CloudError) {
        self.state.lock().unwrap().errors.insert(method, err);
    }

    pub fn clear_error(&self, method: &'static str) {
        self.state.lock().unwrap().errors.remove(method);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Returns the names of the methods called, in order.
    pub fn call_names(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.iter().map(|c| c.method).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn set_instance_type(&self, node_name: &str, instance_type: &str) {
        self.state
            .lock()
            .unwrap()
            .instance_types
            .insert(node_name.to_string(), instance_type.to_string());
    }

    pub fn set_instance_id(&self, node_name: &str, id: &str) {
        self.state
            .lock()
            .unwrap()
            .instance_ids
            .insert(node_name.to_string(), id.to_string());
    }

    pub fn set_node_addresses(&self, node_name: &str, addresses: Vec<NodeAddress>) {
        self.state
            .lock()
            .unwrap()
            .addresses
            .insert(node_name.to_string(), addresses);
    }

    pub fn set_disk_labels(&self, disk: &str, labels: HashMap<String, String>) {
        self.state
            .lock()
            .unwrap()
            .disk_labels
            .insert(disk.to_string(), labels);
    }

    pub fn set_disk_path(&self, disk: &str, path: &str) {
        self.state
            .lock()
            .unwrap()
            .disk_paths
            .insert(disk.to_string(), path.to_string());
    }

    /// Set the zones reported as having nodes. Defaults to the fake's own zone.
    pub fn set_zones_with_nodes(&self, zones: &[&str]) {
        self.state.lock().unwrap().zones_with_nodes = zones.iter().map(|z| z.to_string()).collect();
    }

    /// Mark a disk as attached to a node without going through attach.
    pub fn mark_attached(&self, disk: &str, node_name: &str) {
        self.state
            .lock()
            .unwrap()
            .attachments
            .entry(disk.to_string())
            .or_default()
            .insert(node_name.to_string());
    }

    pub fn is_attached(&self, disk: &str, node_name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .attachments
            .get(disk)
            .is_some_and(|nodes| nodes.contains(node_name))
    }

    /// Returns the created disks and their size in GiB.
    pub fn disks(&self) -> BTreeMap<String, i64> {
        self.state.lock().unwrap().disks.clone()
    }

    pub fn add_disk(&self, disk: &str, size_gib: i64) {
        self.state.lock().unwrap().disks.insert(disk.to_string(), size_gib);
    }

    pub fn aws_volume_options(&self) -> Vec<aws::VolumeOptions> {
        self.state.lock().unwrap().aws_volume_options.clone()
    }

    pub fn gce_disk_zones(&self, disk: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .gce_disk_zones
            .get(disk)
            .cloned()
            .unwrap_or_default()
    }

    pub fn gce_disk_type(&self, disk: &str) -> Option<String> {
        self.state.lock().unwrap().gce_disk_types.get(disk).cloned()
    }

    pub fn file_shares(&self) -> Vec<azure::FileShareOptions> {
        self.state.lock().unwrap().file_shares.clone()
    }

    pub fn photon_volume_options(&self) -> Vec<photon::VolumeOptions> {
        self.state.lock().unwrap().photon_volume_options.clone()
    }

    /// Returns the load balancers by service key.
    pub fn balancers(&self) -> BTreeMap<String, LoadBalancerStatus> {
        self.state.lock().unwrap().balancers.clone()
    }

    /// Returns the host names last pushed to each load balancer.
    pub fn balancer_hosts(&self) -> BTreeMap<String, Vec<String>> {
        self.state.lock().unwrap().balancer_hosts.clone()
    }

    fn record(&self, method: &'static str, args: &[&str]) -> CloudResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(FakeCall {
            method,
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        match state.errors.get(method) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn zones_with_nodes(&self) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        if state.zones_with_nodes.is_empty() {
            return BTreeSet::from([self.zone.failure_domain.clone()]);
        }
        state.zones_with_nodes.clone()
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        state.next_id
    }

    fn attach(&self, disk: &str, node_name: &str) {
        self.mark_attached(disk, node_name);
    }

    fn detach(&self, disk: &str, node_name: &str) {
        if let Some(nodes) = self.state.lock().unwrap().attachments.get_mut(disk) {
            nodes.remove(node_name);
        }
    }

    fn attached_map(&self, disks: &[String], node_name: &str) -> HashMap<String, bool> {
        disks
            .iter()
            .map(|d| (d.clone(), self.is_attached(d, node_name)))
            .collect()
    }

    fn resize(&self, disk: &str, new_size: &Quantity) -> Quantity {
        let gib = crate::volume::util::round_up_to_gib(new_size);
        self.state.lock().unwrap().disks.insert(disk.to_string(), gib);
        Quantity::from_gib(gib)
    }
}

impl CloudProvider for FakeCloud {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn instances(&self) -> Option<&dyn Instances> {
        self.supports_instances.then_some(self as &dyn Instances)
    }

    fn load_balancer(&self) -> Option<&dyn LoadBalancer> {
        self.supports_load_balancer.then_some(self as &dyn LoadBalancer)
    }

    fn zones(&self) -> Option<&dyn Zones> {
        Some(self)
    }

    fn aws_volumes(&self) -> Option<&dyn aws::Volumes> {
        (self.provider == aws::PROVIDER_NAME).then_some(self as &dyn aws::Volumes)
    }

    fn gce_disks(&self) -> Option<&dyn gce::Disks> {
        (self.provider == gce::PROVIDER_NAME).then_some(self as &dyn gce::Disks)
    }

    fn azure_disks(&self) -> Option<&dyn azure::DiskController> {
        (self.provider == azure::PROVIDER_NAME).then_some(self as &dyn azure::DiskController)
    }

    fn azure_managed_disks(&self) -> Option<&azure::ManagedDiskController> {
        self.managed_disks.as_ref()
    }

    fn azure_files(&self) -> Option<&dyn azure::FileClient> {
        (self.provider == azure::PROVIDER_NAME).then_some(self as &dyn azure::FileClient)
    }

    fn photon_disks(&self) -> Option<&dyn photon::Disks> {
        (self.provider == photon::PROVIDER_NAME).then_some(self as &dyn photon::Disks)
    }
}

impl Instances for FakeCloud {
    fn instance_id(&self, node_name: &str) -> CloudResult<String> {
        self.record("instance_id", &[node_name])?;
        let state = self.state.lock().unwrap();
        Ok(state
            .instance_ids
            .get(node_name)
            .cloned()
            .unwrap_or_else(|| format!("i-{}", node_name)))
    }

    fn instance_type(&self, node_name: &str) -> CloudResult<String> {
        self.record("instance_type", &[node_name])?;
        let state = self.state.lock().unwrap();
        state
            .instance_types
            .get(node_name)
            .cloned()
            .ok_or(CloudError::InstanceNotFound)
    }

    fn node_addresses(&self, node_name: &str) -> CloudResult<Vec<NodeAddress>> {
        self.record("node_addresses", &[node_name])?;
        let state = self.state.lock().unwrap();
        Ok(state.addresses.get(node_name).cloned().unwrap_or_else(|| {
            vec![NodeAddress {
                address_type: NodeAddressType::Hostname,
                address: node_name.to_string(),
            }]
        }))
    }
}

impl Zones for FakeCloud {
    fn get_zone(&self) -> CloudResult<Zone> {
        self.record("get_zone", &[])?;
        Ok(self.zone.clone())
    }
}

impl LoadBalancer for FakeCloud {
    fn get_load_balancer(&self, _cluster_name: &str, service: &Service) -> CloudResult<Option<LoadBalancerStatus>> {
        let key = service.metadata.key();
        self.record("get_load_balancer", &[&key])?;
        Ok(self.state.lock().unwrap().balancers.get(&key).cloned())
    }

    fn ensure_load_balancer(
        &self,
        _cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<LoadBalancerStatus> {
        let key = service.metadata.key();
        self.record("ensure_load_balancer", &[&key])?;
        let mut state = self.state.lock().unwrap();
        let status = LoadBalancerStatus {
            ingress: vec![LoadBalancerIngress {
                ip: format!("10.1.0.{}", state.balancers.len() + 1),
                hostname: String::new(),
            }],
        };
        let status = state.balancers.entry(key.clone()).or_insert(status).clone();
        state
            .balancer_hosts
            .insert(key, nodes.iter().map(|n| n.metadata.name.clone()).collect());
        Ok(status)
    }

    fn update_load_balancer(&self, _cluster_name: &str, service: &Service, nodes: &[Node]) -> CloudResult<()> {
        let key = service.metadata.key();
        self.record("update_load_balancer", &[&key])?;
        self.state
            .lock()
            .unwrap()
            .balancer_hosts
            .insert(key, nodes.iter().map(|n| n.metadata.name.clone()).collect());
        Ok(())
    }

    fn ensure_load_balancer_deleted(&self, _cluster_name: &str, service: &Service) -> CloudResult<()> {
        let key = service.metadata.key();
        self.record("ensure_load_balancer_deleted", &[&key])?;
        let mut state = self.state.lock().unwrap();
        state.balancers.remove(&key);
        state.balancer_hosts.remove(&key);
        Ok(())
    }
}

impl aws::Volumes for FakeCloud {
    fn attach_disk(&self, volume_id: &str, node_name: &str) -> CloudResult<String> {
        self.record("attach_disk", &[volume_id, node_name])?;
        self.attach(volume_id, node_name);
        let state = self.state.lock().unwrap();
        Ok(state
            .disk_paths
            .get(volume_id)
            .cloned()
            .unwrap_or_else(|| "/dev/xvdba".to_string()))
    }

    fn detach_disk(&self, volume_id: &str, node_name: &str) -> CloudResult<String> {
        self.record("detach_disk", &[volume_id, node_name])?;
        self.detach(volume_id, node_name);
        Ok("/dev/xvdba".to_string())
    }

    fn create_disk(&self, options: &aws::VolumeOptions) -> CloudResult<String> {
        self.record("create_disk", &[&options.volume_type])?;
        let zone = if options.availability_zone.is_empty() {
            "us-east-1a"
        } else {
            options.availability_zone.as_str()
        };
        let name = format!("aws://{}/vol-{:08}", zone, self.next_id());
        let mut state = self.state.lock().unwrap();
        state.aws_volume_options.push(options.clone());
        state.disks.insert(name.clone(), options.capacity_gib);
        Ok(name)
    }

    fn delete_disk(&self, volume_id: &str) -> CloudResult<bool> {
        self.record("delete_disk", &[volume_id])?;
        Ok(self.state.lock().unwrap().disks.remove(volume_id).is_some())
    }

    fn get_volume_labels(&self, volume_id: &str) -> CloudResult<HashMap<String, String>> {
        self.record("get_volume_labels", &[volume_id])?;
        let state = self.state.lock().unwrap();
        if let Some(labels) = state.disk_labels.get(volume_id) {
            return Ok(labels.clone());
        }
        let mut labels = HashMap::new();
        labels.insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), self.zone.failure_domain.clone());
        labels.insert(LABEL_ZONE_REGION.to_string(), self.zone.region.clone());
        Ok(labels)
    }

    fn get_disk_path(&self, volume_id: &str) -> CloudResult<String> {
        self.record("get_disk_path", &[volume_id])?;
        self.state
            .lock()
            .unwrap()
            .disk_paths
            .get(volume_id)
            .cloned()
            .ok_or_else(|| CloudError::DiskNotFound(volume_id.to_string()))
    }

    fn disk_is_attached(&self, volume_id: &str, node_name: &str) -> CloudResult<bool> {
        self.record("disk_is_attached", &[volume_id, node_name])?;
        Ok(self.is_attached(volume_id, node_name))
    }

    fn disks_are_attached(&self, volume_ids: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>> {
        self.record("disks_are_attached", &[node_name])?;
        Ok(self.attached_map(volume_ids, node_name))
    }

    fn resize_disk(&self, volume_id: &str, _old_size: &Quantity, new_size: &Quantity) -> CloudResult<Quantity> {
        self.record("resize_disk", &[volume_id])?;
        Ok(self.resize(volume_id, new_size))
    }

    fn get_candidate_zones_for_dynamic_volume(&self) -> CloudResult<BTreeSet<String>> {
        self.record("get_candidate_zones_for_dynamic_volume", &[])?;
        Ok(self.zones_with_nodes())
    }
}

impl gce::Disks for FakeCloud {
    fn attach_disk(&self, disk_name: &str, node_name: &str, read_only: bool, _regional: bool) -> CloudResult<()> {
        self.record("attach_disk", &[disk_name, node_name, &read_only.to_string()])?;
        self.attach(disk_name, node_name);
        Ok(())
    }

    fn detach_disk(&self, dev_name: &str, node_name: &str) -> CloudResult<()> {
        self.record("detach_disk", &[dev_name, node_name])?;
        self.detach(dev_name, node_name);
        Ok(())
    }

    fn disk_is_attached(&self, disk_name: &str, node_name: &str) -> CloudResult<bool> {
        self.record("disk_is_attached", &[disk_name, node_name])?;
        Ok(self.is_attached(disk_name, node_name))
    }

    fn disks_are_attached(&self, disk_names: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>> {
        self.record("disks_are_attached", &[node_name])?;
        Ok(self.attached_map(disk_names, node_name))
    }

    fn create_disk(
        &self,
        name: &str,
        disk_type: &str,
        zone: &str,
        size_gb: i64,
        _tags: &HashMap<String, String>,
    ) -> CloudResult<()> {
        self.record("create_disk", &[name, disk_type, zone])?;
        let mut state = self.state.lock().unwrap();
        state.disks.insert(name.to_string(), size_gb);
        state.gce_disk_types.insert(name.to_string(), disk_type.to_string());
        state
            .gce_disk_zones
            .insert(name.to_string(), BTreeSet::from([zone.to_string()]));
        Ok(())
    }

    fn create_regional_disk(
        &self,
        name: &str,
        disk_type: &str,
        replica_zones: &BTreeSet<String>,
        size_gb: i64,
        _tags: &HashMap<String, String>,
    ) -> CloudResult<()> {
        self.record("create_regional_disk", &[name, disk_type])?;
        let mut state = self.state.lock().unwrap();
        state.disks.insert(name.to_string(), size_gb);
        state.gce_disk_types.insert(name.to_string(), disk_type.to_string());
        state.gce_disk_zones.insert(name.to_string(), replica_zones.clone());
        Ok(())
    }

    fn delete_disk(&self, disk_name: &str) -> CloudResult<()> {
        self.record("delete_disk", &[disk_name])?;
        self.state.lock().unwrap().disks.remove(disk_name);
        Ok(())
    }

    fn resize_disk(&self, disk_name: &str, _old_size: &Quantity, new_size: &Quantity) -> CloudResult<Quantity> {
        self.record("resize_disk", &[disk_name])?;
        Ok(self.resize(disk_name, new_size))
    }

    fn get_auto_labels_for_pd(&self, disk_name: &str, _zone: &str) -> CloudResult<HashMap<String, String>> {
        self.record("get_auto_labels_for_pd", &[disk_name])?;
        let state = self.state.lock().unwrap();
        if let Some(labels) = state.disk_labels.get(disk_name) {
            return Ok(labels.clone());
        }
        let zones: Vec<String> = state
            .gce_disk_zones
            .get(disk_name)
            .map(|z| z.iter().cloned().collect())
            .unwrap_or_default();
        let mut labels = HashMap::new();
        if !zones.is_empty() {
            labels.insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), zones.join("__"));
        }
        labels.insert(LABEL_ZONE_REGION.to_string(), self.zone.region.clone());
        Ok(labels)
    }

    fn get_all_current_zones(&self) -> CloudResult<BTreeSet<String>> {
        self.record("get_all_current_zones", &[])?;
        Ok(self.zones_with_nodes())
    }
}

impl azure::DiskController for FakeCloud {
    fn get_disk_lun(&self, disk_name: &str, _disk_uri: &str, node_name: &str) -> CloudResult<i32> {
        self.record("get_disk_lun", &[disk_name, node_name])?;
        let state = self.state.lock().unwrap();
        state
            .luns
            .get(node_name)
            .and_then(|luns| luns.iter().find(|(_, d)| d.as_str() == disk_name).map(|(lun, _)| *lun))
            .ok_or_else(|| CloudError::DiskNotFound(disk_name.to_string()))
    }

    fn get_next_disk_lun(&self, node_name: &str) -> CloudResult<i32> {
        self.record("get_next_disk_lun", &[node_name])?;
        let state = self.state.lock().unwrap();
        let used = state.luns.get(node_name);
        (0..MAX_LUNS)
            .find(|lun| used.map_or(true, |u| !u.contains_key(lun)))
            .ok_or_else(|| CloudError::provider("all luns are used"))
    }

    fn attach_disk(
        &self,
        _is_managed_disk: bool,
        disk_name: &str,
        _disk_uri: &str,
        node_name: &str,
        lun: i32,
        caching_mode: AzureDataDiskCachingMode,
    ) -> CloudResult<()> {
        self.record(
            "attach_disk",
            &[disk_name, node_name, &lun.to_string(), caching_mode.as_str()],
        )?;
        self.state
            .lock()
            .unwrap()
            .luns
            .entry(node_name.to_string())
            .or_default()
            .insert(lun, disk_name.to_string());
        self.attach(disk_name, node_name);
        Ok(())
    }

    fn detach_disk(&self, disk_name: &str, _disk_uri: &str, node_name: &str) -> CloudResult<()> {
        self.record("detach_disk", &[disk_name, node_name])?;
        if let Some(luns) = self.state.lock().unwrap().luns.get_mut(node_name) {
            luns.retain(|_, d| d != disk_name);
        }
        self.detach(disk_name, node_name);
        Ok(())
    }

    fn disks_are_attached(&self, disk_names: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>> {
        self.record("disks_are_attached", &[node_name])?;
        Ok(self.attached_map(disk_names, node_name))
    }
}

impl azure::FileClient for FakeCloud {
    fn create_file_share(&self, options: &azure::FileShareOptions) -> CloudResult<(String, String)> {
        self.record("create_file_share", &[&options.share_name])?;
        let account = if options.account_name.is_empty() {
            "fakeaccount".to_string()
        } else {
            options.account_name.clone()
        };
        let mut state = self.state.lock().unwrap();
        state.file_shares.push(options.clone());
        state.disks.insert(options.share_name.clone(), options.request_gib);
        Ok((account, "fakekey".to_string()))
    }

    fn delete_file_share(&self, account_name: &str, _account_key: &str, share_name: &str) -> CloudResult<()> {
        self.record("delete_file_share", &[account_name, share_name])?;
        self.state.lock().unwrap().disks.remove(share_name);
        Ok(())
    }

    fn resize_file_share(
        &self,
        account_name: &str,
        _account_key: &str,
        share_name: &str,
        size_gib: i64,
    ) -> CloudResult<()> {
        self.record("resize_file_share", &[account_name, share_name, &size_gib.to_string()])?;
        self.state.lock().unwrap().disks.insert(share_name.to_string(), size_gib);
        Ok(())
    }
}

impl photon::Disks for FakeCloud {
    fn attach_disk(&self, pd_id: &str, node_name: &str) -> CloudResult<()> {
        self.record("attach_disk", &[pd_id, node_name])?;
        self.attach(pd_id, node_name);
        Ok(())
    }

    fn detach_disk(&self, pd_id: &str, node_name: &str) -> CloudResult<()> {
        self.record("detach_disk", &[pd_id, node_name])?;
        self.detach(pd_id, node_name);
        Ok(())
    }

    fn disk_is_attached(&self, pd_id: &str, node_name: &str) -> CloudResult<bool> {
        self.record("disk_is_attached", &[pd_id, node_name])?;
        Ok(self.is_attached(pd_id, node_name))
    }

    fn disks_are_attached(&self, pd_ids: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>> {
        self.record("disks_are_attached", &[node_name])?;
        Ok(self.attached_map(pd_ids, node_name))
    }

    fn create_disk(&self, options: &photon::VolumeOptions) -> CloudResult<String> {
        self.record("create_disk", &[&options.name])?;
        let id = format!("pd-{:08}", self.next_id());
        let mut state = self.state.lock().unwrap();
        state.photon_volume_options.push(options.clone());
        state.disks.insert(id.clone(), options.capacity_gb);
        Ok(id)
    }

    fn delete_disk(&self, pd_id: &str) -> CloudResult<()> {
        self.record("delete_disk", &[pd_id])?;
        self.state.lock().unwrap().disks.remove(pd_id);
        Ok(())
    }
}

/// FakeDisksClient keeps managed disks in memory. Created disks report a
/// `Succeeded` provisioning state.
#[derive(Default)]
pub struct FakeDisksClient {
    disks: Mutex<BTreeMap<String, azure::Disk>>,
}

impl FakeDisksClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored disks keyed by name.
    pub fn disks(&self) -> BTreeMap<String, azure::Disk> {
        self.disks.lock().unwrap().clone()
    }
}

impl azure::DisksClient for FakeDisksClient {
    fn create_or_update(&self, resource_group: &str, disk_name: &str, disk: &azure::Disk) -> CloudResult<()> {
        let mut stored = disk.clone();
        stored.id = format!(
            "/subscriptions/sub/resourceGroups/{}/providers/Microsoft.Compute/disks/{}",
            resource_group, disk_name
        );
        stored.provisioning_state = Some("Succeeded".to_string());
        self.disks.lock().unwrap().insert(disk_name.to_string(), stored);
        Ok(())
    }

    fn get(&self, _resource_group: &str, disk_name: &str) -> CloudResult<azure::Disk> {
        self.disks
            .lock()
            .unwrap()
            .get(disk_name)
            .cloned()
            .ok_or_else(|| CloudError::DiskNotFound(disk_name.to_string()))
    }

    fn delete(&self, _resource_group: &str, disk_name: &str) -> CloudResult<()> {
        self.disks.lock().unwrap().remove(disk_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::azure::DiskController;

    #[test]
    fn test_capabilities_follow_provider_name() {
        let cloud = FakeCloud::new(aws::PROVIDER_NAME);
        assert!(cloud.aws_volumes().is_some());
        assert!(cloud.gce_disks().is_none());
        assert!(cloud.instances().is_some());

        let cloud = FakeCloud::new(gce::PROVIDER_NAME).without_instances();
        assert!(cloud.gce_disks().is_some());
        assert!(cloud.instances().is_none());
    }

    #[test]
    fn test_injected_errors() {
        let cloud = FakeCloud::new(aws::PROVIDER_NAME);
        cloud.set_error("attach_disk", CloudError::provider("boom"));
        let volumes = cloud.aws_volumes().unwrap();
        assert_eq!(volumes.attach_disk("vol-1", "node").unwrap_err().to_string(), "boom");
        cloud.clear_error("attach_disk");
        assert!(volumes.attach_disk("vol-1", "node").is_ok());
        assert!(cloud.is_attached("vol-1", "node"));
        assert_eq!(cloud.call_names(), vec!["attach_disk", "attach_disk"]);
    }

    #[test]
    fn test_azure_luns() {
        let cloud = FakeCloud::new(azure::PROVIDER_NAME);
        assert_eq!(cloud.get_next_disk_lun("node").unwrap(), 0);
        cloud
            .attach_disk(true, "disk", "uri", "node", 0, AzureDataDiskCachingMode::ReadOnly)
            .unwrap();
        assert_eq!(cloud.get_disk_lun("disk", "uri", "node").unwrap(), 0);
        assert_eq!(cloud.get_next_disk_lun("node").unwrap(), 1);
        cloud.detach_disk("disk", "uri", "node").unwrap();
        assert!(matches!(
            cloud.get_disk_lun("disk", "uri", "node"),
            Err(CloudError::DiskNotFound(_))
        ));
    }
}
