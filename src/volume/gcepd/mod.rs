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

//! GCE persistent disks.

mod attacher;
mod util;

pub use attacher::{GcePersistentDiskAttacher, GcePersistentDiskDetacher};

use crate::api::core::{
    GcePersistentDiskVolumeSource, Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeAccessMode, PersistentVolumeSource, Pod, TopologySelectorTerm, Volume,
    VolumeNodeAffinity, VolumeSource, LABEL_ZONE_FAILURE_DOMAIN, RESOURCE_STORAGE,
};
use crate::api::resource::Quantity;
use crate::cloudprovider::gce;
use crate::mount::{Interface, MOUNTS_IN_GLOBAL_PD_PATH};
use crate::volume::util::{
    access_modes_contained_in_all, bind_mount_pod_volume, check_persistent_volume_claim_mode_block, get_mount_refs,
    label_zones_to_list, mount_option_from_spec, unmount_path, DEFAULT_MAX_GCE_PD_VOLUMES, GCE_VOLUME_LIMIT_KEY,
    VOLUME_DYNAMICALLY_CREATED_BY_KEY,
};
use crate::volume::{
    AttachableVolumePlugin, Attacher, Attributes, DeletableVolumePlugin, Deleter, Detacher,
    DeviceMountableVolumePlugin, DeviceMounter, DeviceUnmounter, ExpandableVolumePlugin, Mounter,
    PersistentVolumePlugin, ProvisionableVolumePlugin, Provisioner, Spec, Unmounter, VolumeError, VolumeHost,
    VolumeOptions, VolumePlugin, VolumePluginWithAttachLimits, VolumeResult,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

pub const PLUGIN_NAME: &str = "kubernetes.io/gce-pd";

const ONE_CPU: i64 = 1;
const EIGHT_CPUS: i64 = 8;
const VOLUME_LIMIT_32: i64 = 32;
const VOLUME_LIMIT_64: i64 = 64;
const VOLUME_LIMIT_128: i64 = 128;

pub fn probe_volume_plugins() -> Vec<Box<dyn VolumePlugin>> {
    vec![Box::new(GcePersistentDiskPlugin::default())]
}

#[derive(Default)]
pub struct GcePersistentDiskPlugin {
    host: Option<Arc<dyn VolumeHost>>,
}

impl GcePersistentDiskPlugin {
    fn host(&self) -> VolumeResult<&Arc<dyn VolumeHost>> {
        self.host
            .as_ref()
            .ok_or_else(|| VolumeError::internal(format!("volume plugin {} is not initialized", PLUGIN_NAME)))
    }
}

pub(crate) fn get_volume_source(spec: &Spec) -> VolumeResult<(&GcePersistentDiskVolumeSource, bool)> {
    if let Some(pd) = spec
        .volume
        .as_ref()
        .and_then(|v| v.volume_source.gce_persistent_disk.as_ref())
    {
        return Ok((pd, pd.read_only));
    }
    if let Some(pd) = spec
        .persistent_volume
        .as_ref()
        .and_then(|pv| pv.spec.persistent_volume_source.gce_persistent_disk.as_ref())
    {
        return Ok((pd, spec.read_only));
    }
    Err(VolumeError::invalid_spec("spec does not reference a GCE volume type"))
}

/// Returns `<plugin dir>/mounts/<pd name>`.
pub fn make_global_pd_name(host: &dyn VolumeHost, dev_name: &str) -> PathBuf {
    host.plugin_dir(PLUGIN_NAME)
        .join(MOUNTS_IN_GLOBAL_PD_PATH)
        .join(dev_name)
}

/// Maps an `n1-<family>-<cpus>` machine type to its attach limit.
fn limit_for_instance_type(instance_type: &str) -> Option<i64> {
    if !instance_type.starts_with("n1-") {
        return None;
    }
    let splits: Vec<&str> = instance_type.split('-').collect();
    let num: i64 = splits.get(2)?.parse().ok()?;
    Some(if num == ONE_CPU {
        VOLUME_LIMIT_32
    } else if num < EIGHT_CPUS {
        VOLUME_LIMIT_64
    } else {
        VOLUME_LIMIT_128
    })
}

impl VolumePlugin for GcePersistentDiskPlugin {
    fn init(&mut self, host: Arc<dyn VolumeHost>) -> VolumeResult<()> {
        self.host = Some(host);
        Ok(())
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn volume_name(&self, spec: &Spec) -> VolumeResult<String> {
        Ok(get_volume_source(spec)?.0.pd_name.clone())
    }

    fn can_support(&self, spec: &Spec) -> bool {
        get_volume_source(spec).is_ok()
    }

    fn supports_mount_option(&self) -> bool {
        true
    }

    fn supports_bulk_volume_verification(&self) -> bool {
        false
    }

    fn new_mounter(&self, spec: &Spec, pod: &Pod) -> VolumeResult<Box<dyn Mounter>> {
        let host = self.host()?;
        let (pd, read_only) = get_volume_source(spec)?;
        Ok(Box::new(GcePersistentDiskMounter {
            disk: GcePersistentDisk {
                volume_name: spec.name().to_string(),
                pod_uid: pod.metadata.uid.clone(),
                pd_name: pd.pd_name.clone(),
                mounter: host.mounter(PLUGIN_NAME),
                host: host.clone(),
            },
            read_only,
            mount_options: mount_option_from_spec(spec, &[]),
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<Box<dyn Unmounter>> {
        let host = self.host()?;
        Ok(Box::new(GcePersistentDiskUnmounter {
            disk: GcePersistentDisk {
                volume_name: volume_name.to_string(),
                pod_uid: pod_uid.to_string(),
                pd_name: String::new(),
                mounter: host.mounter(PLUGIN_NAME),
                host: host.clone(),
            },
        }))
    }

    fn construct_volume_spec(&self, volume_name: &str, mount_path: &Path) -> VolumeResult<Spec> {
        let host = self.host()?;
        let mounter = host.mounter(PLUGIN_NAME);
        let source_name = mounter.get_device_name_from_mount(mount_path, &host.plugin_dir(PLUGIN_NAME))?;
        Ok(Spec::from_volume(Volume::new(
            volume_name,
            VolumeSource {
                gce_persistent_disk: Some(GcePersistentDiskVolumeSource {
                    pd_name: source_name,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )))
    }

    fn as_persistent(&self) -> Option<&dyn PersistentVolumePlugin> {
        Some(self)
    }

    fn as_attachable(&self) -> Option<&dyn AttachableVolumePlugin> {
        Some(self)
    }

    fn as_device_mountable(&self) -> Option<&dyn DeviceMountableVolumePlugin> {
        Some(self)
    }

    fn as_provisionable(&self) -> Option<&dyn ProvisionableVolumePlugin> {
        Some(self)
    }

    fn as_deletable(&self) -> Option<&dyn DeletableVolumePlugin> {
        Some(self)
    }

    fn as_expandable(&self) -> Option<&dyn ExpandableVolumePlugin> {
        Some(self)
    }

    fn as_attach_limited(&self) -> Option<&dyn VolumePluginWithAttachLimits> {
        Some(self)
    }
}

impl PersistentVolumePlugin for GcePersistentDiskPlugin {
    fn access_modes(&self) -> Vec<PersistentVolumeAccessMode> {
        vec![
            PersistentVolumeAccessMode::ReadWriteOnce,
            PersistentVolumeAccessMode::ReadOnlyMany,
        ]
    }
}

impl VolumePluginWithAttachLimits for GcePersistentDiskPlugin {
    fn volume_limits(&self) -> VolumeResult<HashMap<String, i64>> {
        let host = self.host()?;
        let mut limits = HashMap::from([(GCE_VOLUME_LIMIT_KEY.to_string(), DEFAULT_MAX_GCE_PD_VOLUMES)]);
        let cloud = host
            .cloud_provider()
            .ok_or_else(|| VolumeError::internal("no cloudprovider present"))?;
        if cloud.provider_name() != gce::PROVIDER_NAME {
            return Err(VolumeError::internal(format!(
                "expected gce cloud got {}",
                cloud.provider_name()
            )));
        }

        let Some(instances) = cloud.instances() else {
            warn!("Failed to get instances from cloud provider");
            return Ok(limits);
        };
        let Ok(instance_type) = instances.instance_type(&host.node_name()) else {
            error!("Failed to get instance type from GCE cloud provider");
            return Ok(limits);
        };
        if let Some(limit) = limit_for_instance_type(&instance_type) {
            limits.insert(GCE_VOLUME_LIMIT_KEY.to_string(), limit);
        }
        Ok(limits)
    }

    fn volume_limit_key(&self, _spec: &Spec) -> String {
        GCE_VOLUME_LIMIT_KEY.to_string()
    }
}

impl AttachableVolumePlugin for GcePersistentDiskPlugin {
    fn new_attacher(&self) -> VolumeResult<Box<dyn Attacher>> {
        Ok(Box::new(GcePersistentDiskAttacher::new(self.host()?.clone())?))
    }

    fn new_detacher(&self) -> VolumeResult<Box<dyn Detacher>> {
        Ok(Box::new(GcePersistentDiskDetacher::new(self.host()?.clone())?))
    }
}

impl DeviceMountableVolumePlugin for GcePersistentDiskPlugin {
    fn new_device_mounter(&self) -> VolumeResult<Box<dyn DeviceMounter>> {
        Ok(Box::new(GcePersistentDiskAttacher::new(self.host()?.clone())?))
    }

    fn new_device_unmounter(&self) -> VolumeResult<Box<dyn DeviceUnmounter>> {
        Ok(Box::new(GcePersistentDiskDetacher::new(self.host()?.clone())?))
    }

    fn get_device_mount_refs(&self, device_mount_path: &Path) -> VolumeResult<Vec<PathBuf>> {
        let mounter = self.host()?.mounter(PLUGIN_NAME);
        get_mount_refs(mounter.as_ref(), device_mount_path)
    }
}

impl ProvisionableVolumePlugin for GcePersistentDiskPlugin {
    fn new_provisioner(&self, options: VolumeOptions) -> VolumeResult<Box<dyn Provisioner>> {
        Ok(Box::new(GcePersistentDiskProvisioner {
            host: self.host()?.clone(),
            access_modes: self.access_modes(),
            options,
        }))
    }
}

impl DeletableVolumePlugin for GcePersistentDiskPlugin {
    fn new_deleter(&self, spec: &Spec) -> VolumeResult<Box<dyn Deleter>> {
        let pd = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.gce_persistent_disk.as_ref())
            .ok_or_else(|| VolumeError::invalid_spec("spec.PersistentVolumeSource.GCEPersistentDisk is nil"))?;
        Ok(Box::new(GcePersistentDiskDeleter {
            host: self.host()?.clone(),
            pd_name: pd.pd_name.clone(),
        }))
    }
}

impl ExpandableVolumePlugin for GcePersistentDiskPlugin {
    fn expand_volume_device(&self, spec: &Spec, new_size: Quantity, old_size: Quantity) -> VolumeResult<Quantity> {
        let cloud = util::get_cloud_provider(self.host()?.as_ref())?;
        let disks = util::gce_disks(cloud.as_ref())?;
        let pd = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.gce_persistent_disk.as_ref())
            .ok_or_else(|| VolumeError::invalid_spec("spec.PersistentVolumeSource.GCEPersistentDisk is nil"))?;
        Ok(disks.resize_disk(&pd.pd_name, &old_size, &new_size)?)
    }

    fn requires_fs_resize(&self) -> bool {
        true
    }
}

// ============================================================================
// Mounter / Unmounter
// ============================================================================

struct GcePersistentDisk {
    volume_name: String,
    pod_uid: String,
    // Unique identifier of the PD, used to find the disk resource in the provider.
    pd_name: String,
    mounter: Arc<dyn Interface>,
    host: Arc<dyn VolumeHost>,
}

impl GcePersistentDisk {
    fn get_path(&self) -> PathBuf {
        self.host.pod_volume_dir(&self.pod_uid, PLUGIN_NAME, &self.volume_name)
    }
}

struct GcePersistentDiskMounter {
    disk: GcePersistentDisk,
    read_only: bool,
    mount_options: Vec<String>,
}

impl Mounter for GcePersistentDiskMounter {
    fn get_path(&self) -> PathBuf {
        self.disk.get_path()
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            read_only: self.read_only,
            managed: !self.read_only,
            supports_selinux: true,
        }
    }

    fn set_up_at(&self, dir: &Path, fs_group: Option<i64>) -> VolumeResult<()> {
        let global_pd_path = make_global_pd_name(self.disk.host.as_ref(), &self.disk.pd_name);
        bind_mount_pod_volume(
            self.disk.mounter.as_ref(),
            &global_pd_path,
            dir,
            self.read_only,
            &self.mount_options,
            fs_group,
        )
    }
}

struct GcePersistentDiskUnmounter {
    disk: GcePersistentDisk,
}

impl Unmounter for GcePersistentDiskUnmounter {
    fn get_path(&self) -> PathBuf {
        self.disk.get_path()
    }

    fn tear_down_at(&self, dir: &Path) -> VolumeResult<()> {
        unmount_path(dir, self.disk.mounter.as_ref())
    }
}

// ============================================================================
// Provisioner / Deleter
// ============================================================================

pub struct GcePersistentDiskProvisioner {
    host: Arc<dyn VolumeHost>,
    access_modes: Vec<PersistentVolumeAccessMode>,
    options: VolumeOptions,
}

impl Provisioner for GcePersistentDiskProvisioner {
    fn provision(
        &self,
        selected_node: Option<&Node>,
        allowed_topologies: &[TopologySelectorTerm],
    ) -> VolumeResult<PersistentVolume> {
        let pvc = &self.options.pvc;
        if !access_modes_contained_in_all(&self.access_modes, &pvc.spec.access_modes) {
            return Err(VolumeError::invalid_argument(format!(
                "invalid AccessModes {:?}: only AccessModes {:?} are supported",
                pvc.spec.access_modes, self.access_modes
            )));
        }

        let created = util::create_volume(self.host.as_ref(), &self.options, selected_node, allowed_topologies)?;
        let mut fs_type = if created.fs_type.is_empty() {
            "ext4".to_string()
        } else {
            created.fs_type
        };
        if check_persistent_volume_claim_mode_block(pvc) {
            fs_type = String::new();
        }

        let mut pv = PersistentVolume::new(&self.options.pv_name);
        pv.metadata.annotations.insert(
            VOLUME_DYNAMICALLY_CREATED_BY_KEY.to_string(),
            "gce-pd-dynamic-provisioner".to_string(),
        );
        pv.spec.persistent_volume_reclaim_policy = self.options.reclaim_policy;
        pv.spec.access_modes = if pvc.spec.access_modes.is_empty() {
            self.access_modes.clone()
        } else {
            pvc.spec.access_modes.clone()
        };
        pv.spec
            .capacity
            .insert(RESOURCE_STORAGE.to_string(), Quantity::from_gib(created.size_gb));
        pv.spec.volume_mode = pvc.spec.volume_mode;
        pv.spec.persistent_volume_source = PersistentVolumeSource {
            gce_persistent_disk: Some(GcePersistentDiskVolumeSource {
                pd_name: created.pd_name,
                fs_type,
                partition: 0,
                read_only: false,
            }),
            ..Default::default()
        };
        pv.spec.mount_options = self.options.mount_options.clone();

        let mut labels: Vec<(String, String)> = created.labels.into_iter().collect();
        labels.sort();
        let mut requirements = Vec::with_capacity(labels.len());
        for (k, v) in labels {
            let values = if k == LABEL_ZONE_FAILURE_DOMAIN {
                label_zones_to_list(&v).map_err(|e| {
                    VolumeError::internal(format!(
                        "failed to convert label string for Zone: {} to a List: {}",
                        v, e
                    ))
                })?
            } else {
                vec![v.clone()]
            };
            requirements.push(NodeSelectorRequirement::in_values(&k, values));
            pv.metadata.labels.insert(k, v);
        }
        if !requirements.is_empty() {
            pv.spec.node_affinity = Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: requirements,
                    }],
                }),
            });
        }
        Ok(pv)
    }
}

pub struct GcePersistentDiskDeleter {
    host: Arc<dyn VolumeHost>,
    pd_name: String,
}

impl Deleter for GcePersistentDiskDeleter {
    fn delete(&self) -> VolumeResult<()> {
        util::delete_volume(self.host.as_ref(), &self.pd_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{NodeSelectorOperator, PersistentVolumeClaim};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::cloudprovider::CloudProvider;
    use crate::volume::host::testing::new_fake_host;
    use crate::volume::host::FakeVolumeHost;

    fn init_plugin(host: Arc<FakeVolumeHost>) -> GcePersistentDiskPlugin {
        let mut plugin = GcePersistentDiskPlugin::default();
        plugin.init(host).unwrap();
        plugin
    }

    fn pd_spec(pd_name: &str) -> Spec {
        Spec::from_volume(Volume::new(
            "vol1",
            VolumeSource {
                gce_persistent_disk: Some(GcePersistentDiskVolumeSource {
                    pd_name: pd_name.to_string(),
                    fs_type: "ext4".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
    }

    fn claim(size: &str) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim::new("claim", "ns");
        pvc.spec
            .resources
            .requests
            .insert(RESOURCE_STORAGE.to_string(), Quantity::parse(size).unwrap());
        pvc
    }

    #[test]
    fn test_can_support() {
        let plugin = GcePersistentDiskPlugin::default();
        assert_eq!(plugin.name(), "kubernetes.io/gce-pd");
        assert!(plugin.can_support(&pd_spec("pd")));
        assert!(!plugin.can_support(&Spec::default()));
        assert_eq!(plugin.volume_name(&pd_spec("pd")).unwrap(), "pd");
        assert_eq!(
            get_volume_source(&Spec::default()).unwrap_err().to_string(),
            "spec does not reference a GCE volume type"
        );
    }

    #[test]
    fn test_limit_for_instance_type() {
        struct TestCase {
            instance_type: &'static str,
            expected: Option<i64>,
        }
        let test_cases = vec![
            TestCase {
                instance_type: "n1-standard-1",
                expected: Some(32),
            },
            TestCase {
                instance_type: "n1-standard-4",
                expected: Some(64),
            },
            TestCase {
                instance_type: "n1-highmem-16",
                expected: Some(128),
            },
            TestCase {
                instance_type: "n1-custom",
                expected: None,
            },
            TestCase {
                instance_type: "e2-standard-2",
                expected: None,
            },
        ];
        for tc in test_cases {
            assert_eq!(limit_for_instance_type(tc.instance_type), tc.expected, "{}", tc.instance_type);
        }
    }

    #[test]
    fn test_volume_limits() {
        let (host, _dir) = new_fake_host(None);
        let plugin = init_plugin(host);
        assert_eq!(plugin.volume_limits().unwrap_err().to_string(), "no cloudprovider present");

        let (host, _dir) = new_fake_host(Some(Arc::new(FakeCloud::new("aws"))));
        let plugin = init_plugin(host);
        assert_eq!(plugin.volume_limits().unwrap_err().to_string(), "expected gce cloud got aws");

        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);
        assert_eq!(plugin.volume_limits().unwrap()[GCE_VOLUME_LIMIT_KEY], 16);
        cloud.set_instance_type("node", "n1-standard-2");
        assert_eq!(plugin.volume_limits().unwrap()[GCE_VOLUME_LIMIT_KEY], 64);
    }

    #[test]
    fn test_mount_unmount_and_reconstruct() {
        let (host, _dir) = new_fake_host(None);
        let plugin = init_plugin(host.clone());
        let mut pod = Pod::new("pod", "ns");
        pod.metadata.uid = "poduid".to_string();

        let global = make_global_pd_name(host.as_ref(), "pd");
        host.fake_mounter().mount("/dev/sdb", &global, "ext4", &[]).unwrap();

        let mounter = plugin.new_mounter(&pd_spec("pd"), &pod).unwrap();
        mounter.set_up(None).unwrap();
        let path = mounter.get_path();
        assert!(host.fake_mounter().is_mounted(&path));

        let spec = plugin.construct_volume_spec("vol1", &path).unwrap();
        assert_eq!(get_volume_source(&spec).unwrap().0.pd_name, "pd");

        plugin.new_unmounter("vol1", "poduid").unwrap().tear_down().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_provision_zonal() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);

        let options = VolumeOptions {
            pv_name: "pvc-1".to_string(),
            pvc: claim("3Gi"),
            cluster_name: "kubernetes".to_string(),
            parameters: [("type".to_string(), "pd-ssd".to_string())].into(),
            ..Default::default()
        };
        let pv = plugin.new_provisioner(options).unwrap().provision(None, &[]).unwrap();
        let pd = pv.spec.persistent_volume_source.gce_persistent_disk.clone().unwrap();
        assert_eq!(pd.pd_name, "kubernetes-dynamic-pvc-1");
        assert_eq!(pd.fs_type, "ext4");
        assert_eq!(pv.spec.capacity[RESOURCE_STORAGE].to_string(), "3Gi");
        assert_eq!(
            pv.spec.access_modes,
            vec![
                PersistentVolumeAccessMode::ReadWriteOnce,
                PersistentVolumeAccessMode::ReadOnlyMany
            ]
        );
        assert_eq!(cloud.gce_disk_type("kubernetes-dynamic-pvc-1").as_deref(), Some("pd-ssd"));

        let spec = Spec::from_persistent_volume(pv, false);
        plugin.new_deleter(&spec).unwrap().delete().unwrap();
        assert!(cloud.disks().is_empty());
    }

    #[test]
    fn test_provision_regional_affinity() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        cloud.set_zones_with_nodes(&["zone-a", "zone-b", "zone-c"]);
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);

        let options = VolumeOptions {
            pv_name: "pvc-2".to_string(),
            pvc: claim("1Gi"),
            cluster_name: "kubernetes".to_string(),
            parameters: [
                ("replication-type".to_string(), "regional-pd".to_string()),
                ("zones".to_string(), "zone-a, zone-c".to_string()),
            ]
            .into(),
            ..Default::default()
        };
        let pv = plugin.new_provisioner(options).unwrap().provision(None, &[]).unwrap();
        assert_eq!(
            cloud.gce_disk_zones("kubernetes-dynamic-pvc-2").into_iter().collect::<Vec<_>>(),
            vec!["zone-a".to_string(), "zone-c".to_string()]
        );
        assert_eq!(pv.metadata.labels[LABEL_ZONE_FAILURE_DOMAIN], "zone-a__zone-c");

        let terms = &pv.spec.node_affinity.unwrap().required.unwrap().node_selector_terms;
        let zone_req = terms[0]
            .match_expressions
            .iter()
            .find(|r| r.key == LABEL_ZONE_FAILURE_DOMAIN)
            .unwrap();
        assert_eq!(zone_req.operator, NodeSelectorOperator::In);
        assert_eq!(zone_req.values, vec!["zone-a".to_string(), "zone-c".to_string()]);
    }

    #[test]
    fn test_expand_volume_device() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        cloud.add_disk("pd", 1);
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);

        let mut pv = PersistentVolume::new("pv");
        pv.spec.persistent_volume_source.gce_persistent_disk = Some(GcePersistentDiskVolumeSource {
            pd_name: "pd".to_string(),
            ..Default::default()
        });
        let size = plugin
            .expand_volume_device(
                &Spec::from_persistent_volume(pv, false),
                Quantity::from_gib(10),
                Quantity::from_gib(1),
            )
            .unwrap();
        assert_eq!(size, Quantity::from_gib(10));
        assert_eq!(cloud.disks()["pd"], 10);
    }
}
