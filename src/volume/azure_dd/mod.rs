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

//! Azure data disks.
//!
//! Disks are attached to a LUN of the node's virtual machine. The attacher
//! reports that LUN as the device path and the node resolves it to a block
//! device by scanning the SCSI bus.

mod attacher;
mod common;
mod provision;

pub use attacher::{AzureDiskAttacher, AzureDiskDetacher};
pub use common::{make_global_pd_path, ScsiDiskFinder};
pub use provision::{AzureDiskDeleter, AzureDiskProvisioner};

use crate::api::core::{AzureDataDiskKind, AzureDiskVolumeSource, PersistentVolumeAccessMode, Pod, Volume, VolumeSource};
use crate::api::resource::Quantity;
use crate::cloudprovider::azure;
use crate::mount::Interface;
use crate::volume::util::{bind_mount_pod_volume, get_mount_refs, mount_option_from_spec, unmount_path, AZURE_VOLUME_LIMIT_KEY};
use crate::volume::{
    AttachableVolumePlugin, Attacher, Attributes, DeletableVolumePlugin, Deleter, Detacher,
    DeviceMountableVolumePlugin, DeviceMounter, DeviceUnmounter, ExpandableVolumePlugin, Mounter,
    PersistentVolumePlugin, ProvisionableVolumePlugin, Provisioner, Spec, Unmounter, VolumeError, VolumeHost,
    VolumeOptions, VolumePlugin, VolumePluginWithAttachLimits, VolumeResult,
};
use common::{device_mount_path, get_cloud_provider, get_volume_source, managed_disk_controller};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const PLUGIN_NAME: &str = "kubernetes.io/azure-disk";

const DEFAULT_AZURE_VOLUME_LIMIT: i64 = 16;

// Maximum data disk count per VM size. Sizes missing here get the default.
const MAX_DATA_DISK_COUNTS: &[(&str, i64)] = &[
    ("BASIC_A0", 1),
    ("BASIC_A1", 2),
    ("STANDARD_A1_V2", 2),
    ("STANDARD_A2_V2", 4),
    ("STANDARD_A4_V2", 8),
    ("STANDARD_A8_V2", 16),
    ("STANDARD_B1S", 2),
    ("STANDARD_B2S", 4),
    ("STANDARD_B2MS", 4),
    ("STANDARD_D2_V3", 4),
    ("STANDARD_D4_V3", 8),
    ("STANDARD_D8_V3", 16),
    ("STANDARD_D16_V3", 32),
    ("STANDARD_D32_V3", 32),
    ("STANDARD_D64_V3", 32),
    ("STANDARD_DS1_V2", 4),
    ("STANDARD_DS2_V2", 8),
    ("STANDARD_DS3_V2", 16),
    ("STANDARD_DS4_V2", 32),
    ("STANDARD_DS5_V2", 64),
    ("STANDARD_F2S_V2", 4),
    ("STANDARD_F4S_V2", 8),
    ("STANDARD_F8S_V2", 16),
    ("STANDARD_F16S_V2", 32),
    ("STANDARD_F32S_V2", 32),
    ("STANDARD_F64S_V2", 32),
    ("STANDARD_F72S_V2", 32),
];

pub fn probe_volume_plugins() -> Vec<Box<dyn VolumePlugin>> {
    vec![Box::new(AzureDataDiskPlugin::default())]
}

fn max_data_disk_count(instance_type: &str) -> i64 {
    let vm_size = instance_type.to_uppercase();
    MAX_DATA_DISK_COUNTS
        .iter()
        .find(|(size, _)| *size == vm_size)
        .map_or(DEFAULT_AZURE_VOLUME_LIMIT, |(_, count)| *count)
}

#[derive(Default)]
pub struct AzureDataDiskPlugin {
    host: Option<Arc<dyn VolumeHost>>,
}

impl AzureDataDiskPlugin {
    fn host(&self) -> VolumeResult<&Arc<dyn VolumeHost>> {
        self.host
            .as_ref()
            .ok_or_else(|| VolumeError::internal(format!("volume plugin {} is not initialized", PLUGIN_NAME)))
    }

    fn disk(&self, volume_name: &str, pod_uid: &str, source: AzureDiskVolumeSource) -> VolumeResult<AzureDisk> {
        let host = self.host()?;
        Ok(AzureDisk {
            volume_name: volume_name.to_string(),
            pod_uid: pod_uid.to_string(),
            source,
            mounter: host.mounter(PLUGIN_NAME),
            host: host.clone(),
        })
    }
}

impl VolumePlugin for AzureDataDiskPlugin {
    fn init(&mut self, host: Arc<dyn VolumeHost>) -> VolumeResult<()> {
        self.host = Some(host);
        Ok(())
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn volume_name(&self, spec: &Spec) -> VolumeResult<String> {
        Ok(get_volume_source(spec)?.0.data_disk_uri.clone())
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
        let (source, read_only) = get_volume_source(spec)?;
        Ok(Box::new(AzureDiskMounter {
            disk: self.disk(spec.name(), &pod.metadata.uid, source.clone())?,
            read_only,
            mount_options: mount_option_from_spec(spec, &[]),
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<Box<dyn Unmounter>> {
        Ok(Box::new(AzureDiskUnmounter {
            disk: self.disk(volume_name, pod_uid, AzureDiskVolumeSource::default())?,
        }))
    }

    fn construct_volume_spec(&self, volume_name: &str, mount_path: &Path) -> VolumeResult<Spec> {
        let host = self.host()?;
        let mounter = host.mounter(PLUGIN_NAME);
        let source_name = mounter.get_device_name_from_mount(mount_path, &host.plugin_dir(PLUGIN_NAME))?;
        Ok(Spec::from_volume(Volume::new(
            volume_name,
            VolumeSource {
                azure_disk: Some(AzureDiskVolumeSource {
                    data_disk_uri: source_name,
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

impl PersistentVolumePlugin for AzureDataDiskPlugin {
    fn access_modes(&self) -> Vec<PersistentVolumeAccessMode> {
        vec![PersistentVolumeAccessMode::ReadWriteOnce]
    }
}

impl VolumePluginWithAttachLimits for AzureDataDiskPlugin {
    fn volume_limits(&self) -> VolumeResult<HashMap<String, i64>> {
        let host = self.host()?;
        let mut limits = HashMap::from([(AZURE_VOLUME_LIMIT_KEY.to_string(), DEFAULT_AZURE_VOLUME_LIMIT)]);
        let cloud = host
            .cloud_provider()
            .ok_or_else(|| VolumeError::internal("No cloudprovider present"))?;
        if cloud.provider_name() != azure::PROVIDER_NAME {
            return Err(VolumeError::internal(format!(
                "Expected Azure cloudprovider, got {}",
                cloud.provider_name()
            )));
        }

        let Some(instances) = cloud.instances() else {
            warn!("Failed to get instances from cloud provider");
            return Ok(limits);
        };
        let instance_type = match instances.instance_type(&host.node_name()) {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to get instance type from Azure cloud provider, nodeName: {}, err: {}", host.node_name(), e);
                return Ok(limits);
            }
        };
        limits.insert(AZURE_VOLUME_LIMIT_KEY.to_string(), max_data_disk_count(&instance_type));
        Ok(limits)
    }

    fn volume_limit_key(&self, _spec: &Spec) -> String {
        AZURE_VOLUME_LIMIT_KEY.to_string()
    }
}

impl AttachableVolumePlugin for AzureDataDiskPlugin {
    fn new_attacher(&self) -> VolumeResult<Box<dyn Attacher>> {
        Ok(Box::new(AzureDiskAttacher::new(self.host()?.clone())?))
    }

    fn new_detacher(&self) -> VolumeResult<Box<dyn Detacher>> {
        Ok(Box::new(AzureDiskDetacher::new(self.host()?.clone())?))
    }
}

impl DeviceMountableVolumePlugin for AzureDataDiskPlugin {
    fn new_device_mounter(&self) -> VolumeResult<Box<dyn DeviceMounter>> {
        Ok(Box::new(AzureDiskAttacher::new(self.host()?.clone())?))
    }

    fn new_device_unmounter(&self) -> VolumeResult<Box<dyn DeviceUnmounter>> {
        Ok(Box::new(AzureDiskDetacher::new(self.host()?.clone())?))
    }

    fn get_device_mount_refs(&self, device_mount_path: &Path) -> VolumeResult<Vec<PathBuf>> {
        let mounter = self.host()?.mounter(PLUGIN_NAME);
        get_mount_refs(mounter.as_ref(), device_mount_path)
    }
}

impl ProvisionableVolumePlugin for AzureDataDiskPlugin {
    fn new_provisioner(&self, options: VolumeOptions) -> VolumeResult<Box<dyn Provisioner>> {
        Ok(Box::new(AzureDiskProvisioner::new(
            self.host()?.clone(),
            self.access_modes(),
            options,
        )))
    }
}

impl DeletableVolumePlugin for AzureDataDiskPlugin {
    fn new_deleter(&self, spec: &Spec) -> VolumeResult<Box<dyn Deleter>> {
        let (source, _) = get_volume_source(spec)?;
        if source.kind != Some(AzureDataDiskKind::Managed) {
            return Err(VolumeError::invalid_spec(format!(
                "azureDisk - deleting {} disks is not supported",
                source.kind.map_or("unknown", |k| k.as_str())
            )));
        }
        Ok(Box::new(AzureDiskDeleter::new(
            self.host()?.clone(),
            spec.name(),
            &source.data_disk_uri,
        )))
    }
}

impl ExpandableVolumePlugin for AzureDataDiskPlugin {
    fn expand_volume_device(&self, spec: &Spec, new_size: Quantity, old_size: Quantity) -> VolumeResult<Quantity> {
        let source = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.azure_disk.as_ref())
            .ok_or_else(|| VolumeError::invalid_spec("invalid PV spec"))?;
        if source.kind != Some(AzureDataDiskKind::Managed) {
            return Err(VolumeError::invalid_spec(format!(
                "the disk({}) is not ManagedDisk",
                source.disk_name
            )));
        }

        let cloud = get_cloud_provider(self.host()?.as_ref())?;
        let controller = managed_disk_controller(cloud.as_ref())?;
        Ok(controller.resize_disk(&source.data_disk_uri, &old_size, &new_size)?)
    }

    fn requires_fs_resize(&self) -> bool {
        true
    }
}

// ============================================================================
// Mounter / Unmounter
// ============================================================================

struct AzureDisk {
    volume_name: String,
    pod_uid: String,
    source: AzureDiskVolumeSource,
    mounter: Arc<dyn Interface>,
    host: Arc<dyn VolumeHost>,
}

impl AzureDisk {
    fn get_path(&self) -> PathBuf {
        self.host.pod_volume_dir(&self.pod_uid, PLUGIN_NAME, &self.volume_name)
    }
}

struct AzureDiskMounter {
    disk: AzureDisk,
    read_only: bool,
    mount_options: Vec<String>,
}

impl Mounter for AzureDiskMounter {
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
        let global_pd_path = device_mount_path(self.disk.host.as_ref(), &self.disk.source);
        info!(
            "azureDisk - mounting disk {} at {}",
            self.disk.source.disk_name,
            dir.display()
        );
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

struct AzureDiskUnmounter {
    disk: AzureDisk,
}

impl Unmounter for AzureDiskUnmounter {
    fn get_path(&self) -> PathBuf {
        self.disk.get_path()
    }

    fn tear_down_at(&self, dir: &Path) -> VolumeResult<()> {
        unmount_path(dir, self.disk.mounter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::PersistentVolume;
    use crate::cloudprovider::azure::{Backoff, ManagedDiskController};
    use crate::cloudprovider::fake::{FakeCloud, FakeDisksClient};
    use crate::cloudprovider::CloudProvider;
    use crate::volume::host::testing::new_fake_host;
    use crate::volume::host::FakeVolumeHost;
    use std::time::Duration;

    fn init_plugin(host: Arc<FakeVolumeHost>) -> AzureDataDiskPlugin {
        let mut plugin = AzureDataDiskPlugin::default();
        plugin.init(host).unwrap();
        plugin
    }

    fn managed_pv(uri: &str) -> Spec {
        let mut pv = PersistentVolume::new("pv");
        pv.spec.persistent_volume_source.azure_disk = Some(AzureDiskVolumeSource {
            disk_name: "disk".to_string(),
            data_disk_uri: uri.to_string(),
            kind: Some(AzureDataDiskKind::Managed),
            ..Default::default()
        });
        Spec::from_persistent_volume(pv, false)
    }

    #[test]
    fn test_can_support() {
        let plugin = AzureDataDiskPlugin::default();
        assert_eq!(plugin.name(), "kubernetes.io/azure-disk");
        assert!(plugin.can_support(&managed_pv("uri")));
        assert!(!plugin.can_support(&Spec::default()));
        assert_eq!(plugin.volume_name(&managed_pv("uri")).unwrap(), "uri");
        assert_eq!(plugin.access_modes(), vec![PersistentVolumeAccessMode::ReadWriteOnce]);
    }

    #[test]
    fn test_max_data_disk_count() {
        struct TestCase {
            instance_type: &'static str,
            expected: i64,
        }
        let test_cases = vec![
            TestCase {
                instance_type: "Standard_DS2_v2",
                expected: 8,
            },
            TestCase {
                instance_type: "standard_d16_v3",
                expected: 32,
            },
            TestCase {
                instance_type: "Standard_Unknown",
                expected: 16,
            },
        ];
        for tc in test_cases {
            assert_eq!(max_data_disk_count(tc.instance_type), tc.expected, "{}", tc.instance_type);
        }
    }

    #[test]
    fn test_volume_limits() {
        let (host, _dir) = new_fake_host(None);
        assert_eq!(
            init_plugin(host).volume_limits().unwrap_err().to_string(),
            "No cloudprovider present"
        );

        let (host, _dir) = new_fake_host(Some(Arc::new(FakeCloud::new("gce")) as Arc<dyn CloudProvider>));
        assert_eq!(
            init_plugin(host).volume_limits().unwrap_err().to_string(),
            "Expected Azure cloudprovider, got gce"
        );

        let cloud = Arc::new(FakeCloud::new("azure"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);
        cloud.set_instance_type("node", "Standard_DS3_v2");
        assert_eq!(plugin.volume_limits().unwrap()[AZURE_VOLUME_LIMIT_KEY], 16);
        cloud.set_instance_type("node", "Standard_B1s");
        assert_eq!(plugin.volume_limits().unwrap()[AZURE_VOLUME_LIMIT_KEY], 2);

        let (host, _dir) = new_fake_host(Some(Arc::new(FakeCloud::new("azure").without_instances()) as Arc<dyn CloudProvider>));
        assert_eq!(init_plugin(host).volume_limits().unwrap()[AZURE_VOLUME_LIMIT_KEY], 16);
    }

    #[test]
    fn test_mount_unmount_and_reconstruct() {
        let (host, _dir) = new_fake_host(None);
        let plugin = init_plugin(host.clone());
        let mut pod = Pod::new("pod", "ns");
        pod.metadata.uid = "poduid".to_string();

        let spec = managed_pv("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/disk");
        let global = device_mount_path(host.as_ref(), get_volume_source(&spec).unwrap().0);
        host.fake_mounter().mount("/dev/sdc", &global, "ext4", &[]).unwrap();

        let mounter = plugin.new_mounter(&spec, &pod).unwrap();
        mounter.set_up(None).unwrap();
        let path = mounter.get_path();
        assert!(host.fake_mounter().is_mounted(&path));

        let rebuilt = plugin.construct_volume_spec("pv", &path).unwrap();
        let (source, _) = get_volume_source(&rebuilt).unwrap();
        assert_eq!(Some(source.data_disk_uri.as_str()), global.file_name().and_then(|n| n.to_str()));
        assert_eq!(device_mount_path(host.as_ref(), source), global);

        plugin.new_unmounter("pv", "poduid").unwrap().tear_down().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_expand_and_delete() {
        let client = Arc::new(FakeDisksClient::new());
        let controller = ManagedDiskController::new(client.clone(), "sub", "rg", "eastus").with_backoff(Backoff {
            duration: Duration::from_millis(1),
            factor: 1.0,
            steps: 1,
        });
        let uri = controller
            .create_managed_disk(&azure::ManagedDiskOptions {
                disk_name: "disk".to_string(),
                size_gb: 1,
                storage_account_type: "Standard_LRS".to_string(),
                ..Default::default()
            })
            .unwrap();
        let cloud = Arc::new(FakeCloud::new("azure").with_managed_disks(controller));
        let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);

        let size = plugin
            .expand_volume_device(&managed_pv(&uri), Quantity::from_gib(5), Quantity::from_gib(1))
            .unwrap();
        assert_eq!(size, Quantity::from_gib(5));
        assert_eq!(client.disks()["disk"].size_gb, Some(5));

        let mut blob = managed_pv(&uri);
        if let Some(pv) = blob.persistent_volume.as_mut() {
            if let Some(disk) = pv.spec.persistent_volume_source.azure_disk.as_mut() {
                disk.kind = Some(AzureDataDiskKind::Dedicated);
            }
        }
        assert_eq!(
            plugin
                .expand_volume_device(&blob, Quantity::from_gib(5), Quantity::from_gib(1))
                .unwrap_err()
                .to_string(),
            "the disk(disk) is not ManagedDisk"
        );
        assert!(plugin.new_deleter(&blob).is_err());

        plugin.new_deleter(&managed_pv(&uri)).unwrap().delete().unwrap();
        assert!(client.disks().is_empty());
    }
}
