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

use super::common::{
    device_mount_path, disk_controller, fs_type, get_cloud_provider, get_disk_lun, get_volume_source, ScsiDiskFinder,
};
use super::PLUGIN_NAME;
use crate::api::core::{AzureDataDiskKind, Pod};
use crate::cloudprovider::{CloudError, CloudProvider, CloudResult};
use crate::volume::util::keymutex::instance_mutex;
use crate::volume::util::{
    create_dir_all_with_mode, mount_option_from_spec, new_safe_format_and_mount_from_host, unmount_path,
};
use crate::volume::{
    Attacher, DeviceMounter, DeviceUnmounter, Detacher, Spec, VolumeError, VolumeHost, VolumeResult,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const CHECK_SLEEP_DURATION: Duration = Duration::from_secs(1);

fn instance_id(cloud: &dyn CloudProvider, node_name: &str) -> CloudResult<String> {
    cloud
        .instances()
        .ok_or(CloudError::NotImplemented)?
        .instance_id(node_name)
}

/// AzureDiskAttacher attaches data disks to virtual machines. The device
/// path it reports is the LUN of the disk.
pub struct AzureDiskAttacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
    finder: ScsiDiskFinder,
}

impl AzureDiskAttacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self {
            host,
            cloud,
            finder: ScsiDiskFinder::default(),
        })
    }

    pub fn with_disk_finder(mut self, finder: ScsiDiskFinder) -> Self {
        self.finder = finder;
        self
    }
}

impl Attacher for AzureDiskAttacher {
    fn attach(&self, spec: &Spec, node_name: &str) -> VolumeResult<String> {
        let (source, _) = get_volume_source(spec).inspect_err(|e| {
            warn!("failed to get azure disk spec ({})", e);
        })?;

        let instance_id = instance_id(self.cloud.as_ref(), node_name).map_err(|e| {
            warn!("failed to get azure instance id ({})", e);
            VolumeError::internal(format!(
                "failed to get azure instance id for node {:?} ({})",
                node_name, e
            ))
        })?;

        let controller = disk_controller(self.cloud.as_ref())?;
        let lun = match controller.get_disk_lun(&source.disk_name, &source.data_disk_uri, node_name) {
            Ok(lun) => {
                info!(
                    "Attach operation is successful. volume {:?} is already attached to node {:?} at lun {}.",
                    source.disk_name, instance_id, lun
                );
                lun
            }
            Err(e) => {
                if e == CloudError::InstanceNotFound {
                    warn!(
                        "Error checking if volume is already attached to current node ({:?}). Will continue and try attach anyway. err={}",
                        instance_id, e
                    );
                }
                info!(
                    "GetDiskLun returned: {}. Initiating attaching volume {:?} to node {:?}.",
                    e, source.data_disk_uri, node_name
                );

                let _guard = instance_mutex().lock_key(&instance_id);
                let lun = controller.get_next_disk_lun(node_name).map_err(|e| {
                    warn!("no LUN available for instance {:?} ({})", node_name, e);
                    VolumeError::internal(format!(
                        "all LUNs are used, cannot attach volume {:?} to instance {:?} ({})",
                        source.disk_name, instance_id, e
                    ))
                })?;

                info!("Trying to attach volume {:?} lun {} to node {:?}.", source.data_disk_uri, lun, node_name);
                let is_managed_disk = source.kind == Some(AzureDataDiskKind::Managed);
                controller
                    .attach_disk(
                        is_managed_disk,
                        &source.disk_name,
                        &source.data_disk_uri,
                        node_name,
                        lun,
                        source.caching_mode.unwrap_or_default(),
                    )
                    .map_err(|e| {
                        info!("Attach volume {:?} to instance {:?} failed with {}", source.data_disk_uri, instance_id, e);
                        VolumeError::internal(format!(
                            "attach volume {:?} to instance {:?} failed with {}",
                            source.disk_name, instance_id, e
                        ))
                    })?;
                info!("Attach operation successful: volume {:?} attached to node {:?}.", source.data_disk_uri, node_name);
                lun
            }
        };
        Ok(lun.to_string())
    }

    fn volumes_are_attached(&self, specs: &[Spec], node_name: &str) -> VolumeResult<HashMap<String, bool>> {
        let mut checks = HashMap::new();
        let mut volume_spec_map: HashMap<String, &Spec> = HashMap::new();
        let mut disk_names = Vec::with_capacity(specs.len());
        for spec in specs {
            match get_volume_source(spec) {
                Ok((source, _)) => {
                    disk_names.push(source.disk_name.clone());
                    checks.insert(spec.name().to_string(), true);
                    volume_spec_map.insert(source.disk_name.clone(), spec);
                }
                Err(e) => error!("azureDisk - Error getting volume ({:?}) source : {}", spec.name(), e),
            }
        }

        let controller = disk_controller(self.cloud.as_ref())?;
        let attached = controller.disks_are_attached(&disk_names, node_name).map_err(|e| {
            error!(
                "azureDisk - Error checking if volumes ({:?}) are attached to current node ({:?}). err={}",
                disk_names, node_name, e
            );
            VolumeError::from(e)
        })?;

        for (disk_name, is_attached) in attached {
            if is_attached {
                continue;
            }
            if let Some(spec) = volume_spec_map.get(&disk_name) {
                checks.insert(spec.name().to_string(), false);
                info!(
                    "azureDisk - VolumesAreAttached: check volume {:?} (specName: {:?}) is no longer attached",
                    disk_name,
                    spec.name()
                );
            }
        }
        Ok(checks)
    }

    fn wait_for_attach(
        &self,
        spec: &Spec,
        device_path: &str,
        _pod: Option<&Pod>,
        timeout: Duration,
    ) -> VolumeResult<String> {
        let (source, _) = get_volume_source(spec)?;
        let node_name = self.host.node_name();
        let disk_name = &source.disk_name;
        let lun = get_disk_lun(device_path)?;

        self.finder.rescan();

        let deadline = Instant::now() + timeout;
        loop {
            let found = self.finder.find_disk_by_lun(lun).map_err(|e| {
                VolumeError::internal(format!(
                    "azureDisk - WaitForAttach ticker failed node ({}) disk ({}) lun({}) err({})",
                    node_name, disk_name, lun, e
                ))
            })?;
            if let Some(path) = found {
                info!("azureDisk - found disk {:?} at lun {}: {}", disk_name, lun, path);
                return Ok(path);
            }
            if Instant::now() >= deadline {
                return Err(VolumeError::internal(format!(
                    "azureDisk - WaitForAttach failed within timeout node ({}) diskId:({}) lun:({})",
                    node_name, disk_name, lun
                )));
            }
            thread::sleep(CHECK_SLEEP_DURATION.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

impl DeviceMounter for AzureDiskAttacher {
    fn get_device_mount_path(&self, spec: &Spec) -> VolumeResult<PathBuf> {
        let (source, _) = get_volume_source(spec)?;
        Ok(device_mount_path(self.host.as_ref(), source))
    }

    fn mount_device(&self, spec: &Spec, device_path: &str, device_mount_path: &Path) -> VolumeResult<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        let mut not_mnt = match mounter.is_likely_not_mount_point(device_mount_path) {
            Ok(not_mnt) => not_mnt,
            Err(e) if e.is_not_exist() => {
                create_dir_all_with_mode(device_mount_path, 0o750).map_err(|e| {
                    VolumeError::internal(format!("azureDisk - mountDevice:CreateDirectory failed with {}", e))
                })?;
                true
            }
            Err(e) => {
                return Err(VolumeError::internal(format!(
                    "azureDisk - mountDevice:IsLikelyNotMountPoint failed with {}",
                    e
                )))
            }
        };

        if !not_mnt {
            // Make sure the existing mount is still readable.
            if let Err(e) = fs::read_dir(device_mount_path) {
                warn!(
                    "azureDisk - ReadDir {} failed with {}, unmount this directory",
                    device_mount_path.display(),
                    e
                );
                mounter.unmount(device_mount_path).inspect_err(|e| {
                    error!("azureDisk - Unmount deviceMountPath {} failed with {}", device_mount_path.display(), e);
                })?;
                not_mnt = true;
            }
        }

        let (source, _) = get_volume_source(spec)?;
        if not_mnt {
            let disk_mounter = new_safe_format_and_mount_from_host(PLUGIN_NAME, self.host.as_ref());
            let mount_options = mount_option_from_spec(spec, &[]);
            if let Err(e) = disk_mounter.format_and_mount(device_path, device_mount_path, fs_type(source), &mount_options)
            {
                if let Err(clean_err) = fs::remove_dir(device_mount_path) {
                    return Err(VolumeError::internal(format!(
                        "azureDisk - mountDevice:FormatAndMount failed with {} and clean up failed with :{}",
                        e, clean_err
                    )));
                }
                return Err(VolumeError::internal(format!(
                    "azureDisk - mountDevice:FormatAndMount failed with {}",
                    e
                )));
            }
        }
        Ok(())
    }
}

/// AzureDiskDetacher detaches data disks by URI.
pub struct AzureDiskDetacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
}

impl AzureDiskDetacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self { host, cloud })
    }
}

impl Detacher for AzureDiskDetacher {
    fn detach(&self, disk_uri: &str, node_name: &str) -> VolumeResult<()> {
        if disk_uri.is_empty() {
            return Err(VolumeError::invalid_argument(format!(
                "invalid disk to detach: {:?}",
                disk_uri
            )));
        }

        let instance_id = match instance_id(self.cloud.as_ref(), node_name) {
            Ok(id) => id,
            Err(e) => {
                warn!("no instance id for node {:?}, skip detaching ({})", node_name, e);
                return Ok(());
            }
        };

        info!("detach {} from node {:?}", disk_uri, node_name);
        let controller = disk_controller(self.cloud.as_ref())?;
        let _guard = instance_mutex().lock_key(&instance_id);
        controller.detach_disk("", disk_uri, node_name).map_err(|e| {
            error!("failed to detach azure disk {:?}, err {}", disk_uri, e);
            VolumeError::from(e)
        })?;
        info!("azureDisk - disk:{} was detached from node:{}", disk_uri, node_name);
        Ok(())
    }
}

impl DeviceUnmounter for AzureDiskDetacher {
    fn unmount_device(&self, device_mount_path: &Path) -> VolumeResult<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        match unmount_path(device_mount_path, mounter.as_ref()) {
            Ok(()) => {
                debug!("azureDisk - Device {} was unmounted", device_mount_path.display());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "azureDisk - Device {} failed to unmount with error: {}",
                    device_mount_path.display(),
                    e
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{AzureDataDiskCachingMode, AzureDiskVolumeSource, Volume, VolumeSource};
    use crate::cloudprovider::azure::DiskController;
    use crate::cloudprovider::fake::FakeCloud;
    use crate::mount::{FakeExec, FakeExecResponse};
    use crate::volume::host::testing::new_fake_host;
    use crate::volume::host::FakeVolumeHost;

    fn disk_spec(disk_name: &str, kind: Option<AzureDataDiskKind>) -> Spec {
        Spec::from_volume(Volume::new(
            "vol",
            VolumeSource {
                azure_disk: Some(AzureDiskVolumeSource {
                    disk_name: disk_name.to_string(),
                    data_disk_uri: format!("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/{}", disk_name),
                    caching_mode: Some(AzureDataDiskCachingMode::ReadWrite),
                    kind,
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_attach() {
        let cloud = Arc::new(FakeCloud::new("azure"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let attacher = AzureDiskAttacher::new(host).unwrap();

        let spec = disk_spec("disk-1", Some(AzureDataDiskKind::Managed));
        assert_eq!(attacher.attach(&spec, "node").unwrap(), "0");
        assert_eq!(attacher.attach(&disk_spec("disk-2", None), "node").unwrap(), "1");

        // Already attached disks report their LUN without a new attach.
        cloud.clear_calls();
        assert_eq!(attacher.attach(&spec, "node").unwrap(), "0");
        assert_eq!(cloud.call_names(), vec!["instance_id", "get_disk_lun"]);
    }

    #[test]
    fn test_attach_errors() {
        struct TestCase {
            name: &'static str,
            method: &'static str,
            expected: &'static str,
        }
        let test_cases = vec![
            TestCase {
                name: "instance id",
                method: "instance_id",
                expected: "failed to get azure instance id for node \"node\" (boom)",
            },
            TestCase {
                name: "no free lun",
                method: "get_next_disk_lun",
                expected: "all LUNs are used, cannot attach volume \"disk-1\" to instance \"i-node\" (boom)",
            },
            TestCase {
                name: "attach",
                method: "attach_disk",
                expected: "attach volume \"disk-1\" to instance \"i-node\" failed with boom",
            },
        ];
        for tc in test_cases {
            let cloud = Arc::new(FakeCloud::new("azure"));
            cloud.set_error(tc.method, CloudError::provider("boom"));
            let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
            let attacher = AzureDiskAttacher::new(host).unwrap();
            let err = attacher
                .attach(&disk_spec("disk-1", Some(AzureDataDiskKind::Managed)), "node")
                .unwrap_err();
            assert_eq!(err.to_string(), tc.expected, "{}", tc.name);
        }
    }

    #[test]
    fn test_attach_continues_when_instance_not_found() {
        let cloud = Arc::new(FakeCloud::new("azure"));
        cloud.set_error("get_disk_lun", CloudError::InstanceNotFound);
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let attacher = AzureDiskAttacher::new(host).unwrap();
        assert_eq!(attacher.attach(&disk_spec("disk-1", None), "node").unwrap(), "0");
        assert!(cloud.is_attached("disk-1", "node"));
    }

    #[test]
    fn test_volumes_are_attached() {
        let cloud = Arc::new(FakeCloud::new("azure"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let attacher = AzureDiskAttacher::new(host).unwrap();
        attacher.attach(&disk_spec("disk-1", None), "node").unwrap();

        let mut other = disk_spec("disk-2", None);
        if let Some(v) = other.volume.as_mut() {
            v.name = "other".to_string();
        }
        let attached = attacher
            .volumes_are_attached(&[disk_spec("disk-1", None), other], "node")
            .unwrap();
        assert_eq!(attached["vol"], true);
        assert_eq!(attached["other"], false);
    }

    #[test]
    fn test_wait_for_attach() {
        let cloud = Arc::new(FakeCloud::new("azure"));
        let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
        let root = tempfile::tempdir().unwrap();
        let attacher = AzureDiskAttacher::new(host)
            .unwrap()
            .with_disk_finder(ScsiDiskFinder::with_root(root.path()));
        let spec = disk_spec("disk-1", None);

        assert!(attacher.wait_for_attach(&spec, "sdc", None, Duration::ZERO).is_err());

        let devices = root.path().join("sys/bus/scsi/devices");
        fs::create_dir_all(&devices).unwrap();
        let err = attacher.wait_for_attach(&spec, "2", None, Duration::ZERO).unwrap_err();
        assert_eq!(
            err.to_string(),
            "azureDisk - WaitForAttach failed within timeout node (node) diskId:(disk-1) lun:(2)"
        );

        let dev = devices.join("5:0:0:2");
        fs::create_dir_all(dev.join("block/sdd")).unwrap();
        fs::write(dev.join("vendor"), "Msft").unwrap();
        fs::write(dev.join("model"), "Virtual Disk").unwrap();
        assert_eq!(
            attacher.wait_for_attach(&spec, "2", None, Duration::ZERO).unwrap(),
            root.path().join("dev/sdd").to_string_lossy()
        );
    }

    #[test]
    fn test_mount_and_unmount_device() {
        let cloud = Arc::new(FakeCloud::new("azure"));
        let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
        let attacher = AzureDiskAttacher::new(host.clone()).unwrap();
        let spec = disk_spec("disk-1", Some(AzureDataDiskKind::Managed));

        let mount_path = attacher.get_device_mount_path(&spec).unwrap();
        assert!(mount_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with('m'));
        attacher.mount_device(&spec, "/dev/sdc", &mount_path).unwrap();
        let mounts = host.fake_mounter().mount_points();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fs_type, "ext4");

        // A readable mount is left alone.
        attacher.mount_device(&spec, "/dev/sdc", &mount_path).unwrap();
        assert_eq!(host.fake_mounter().mount_points().len(), 1);

        let detacher = AzureDiskDetacher::new(host.clone()).unwrap();
        detacher.unmount_device(&mount_path).unwrap();
        assert!(!mount_path.exists());
    }

    #[test]
    fn test_mount_device_failure() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(
            FakeVolumeHost::new(dir.path())
                .with_cloud(Arc::new(FakeCloud::new("azure")))
                .with_exec(FakeExec::new(vec![FakeExecResponse::fail("blkid", 4, "i/o error")])),
        );
        let attacher = AzureDiskAttacher::new(host.clone()).unwrap();
        let spec = disk_spec("disk-1", Some(AzureDataDiskKind::Managed));
        let mount_path = attacher.get_device_mount_path(&spec).unwrap();

        host.fake_mounter().fail_next_mount("bad superblock", false);
        let err = attacher.mount_device(&spec, "/dev/sdc", &mount_path).unwrap_err();
        assert!(err.to_string().starts_with("azureDisk - mountDevice:FormatAndMount failed with"));
        assert!(!mount_path.exists());
    }

    #[test]
    fn test_detach() {
        let cloud = Arc::new(FakeCloud::new("azure"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        cloud
            .attach_disk(true, "disk-1", "uri-1", "node", 0, AzureDataDiskCachingMode::None)
            .unwrap();
        let detacher = AzureDiskDetacher::new(host).unwrap();

        assert_eq!(
            detacher.detach("", "node").unwrap_err().to_string(),
            "invalid disk to detach: \"\""
        );

        cloud.set_error("instance_id", CloudError::InstanceNotFound);
        detacher.detach("uri-1", "node").unwrap();
        assert!(!cloud.call_names().contains(&"detach_disk"));

        cloud.clear_error("instance_id");
        detacher.detach("uri-1", "node").unwrap();
        assert!(cloud.call_names().contains(&"detach_disk"));
    }

    #[test]
    fn test_requires_azure_cloud() {
        let (host, _dir) = new_fake_host(Some(Arc::new(FakeCloud::new("gce"))));
        let err = AzureDiskAttacher::new(host.clone()).err().unwrap();
        assert_eq!(err.to_string(), "invalid cloud provider: expected Azure: gce");
        let (host, _dir) = new_fake_host(None);
        assert_eq!(
            AzureDiskDetacher::new(host).err().unwrap().to_string(),
            "cloud provider is nil"
        );
    }
}
