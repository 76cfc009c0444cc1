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

use super::{get_cloud_provider, get_volume_source, make_global_pd_path, photon_disks, PLUGIN_NAME};
use crate::api::core::Pod;
use crate::cloudprovider::CloudProvider;
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

const DISK_BY_ID_PATH: &str = "/dev/disk/by-id";
const DISK_PHOTON_PREFIX: &str = "wwn-0x";

/// PhotonPersistentDiskAttacher attaches Photon disks to node VMs.
pub struct PhotonPersistentDiskAttacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
    disk_by_id_dir: PathBuf,
}

impl PhotonPersistentDiskAttacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self {
            host,
            cloud,
            disk_by_id_dir: PathBuf::from(DISK_BY_ID_PATH),
        })
    }

    pub fn with_disk_by_id_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_by_id_dir = dir.into();
        self
    }
}

impl Attacher for PhotonPersistentDiskAttacher {
    fn attach(&self, spec: &Spec, node_name: &str) -> VolumeResult<String> {
        let (source, _) = get_volume_source(spec).inspect_err(|e| {
            error!("Photon Controller attacher: Attach failed to get volume source");
            debug!("{}", e);
        })?;
        let disks = photon_disks(self.cloud.as_ref())?;

        info!("Photon Controller: Attach disk called for host {}", node_name);
        match disks.disk_is_attached(&source.pd_id, node_name) {
            Ok(true) => {
                info!(
                    "Attach operation is successful. PD {:?} is already attached to node {:?}.",
                    source.pd_id, node_name
                );
            }
            result => {
                if let Err(e) = result {
                    warn!(
                        "Photon Controller: DiskIsAttached failed for pd {:?} on node {:?}: {}",
                        source.pd_id, node_name, e
                    );
                }
                disks.attach_disk(&source.pd_id, node_name).map_err(|e| {
                    error!("Error attaching volume {:?} to node {:?}: {}", source.pd_id, node_name, e);
                    VolumeError::from(e)
                })?;
            }
        }

        // The device shows up under its WWN, which is the disk id without dashes.
        let wwn = source.pd_id.replace('-', "");
        Ok(self
            .disk_by_id_dir
            .join(format!("{}{}", DISK_PHOTON_PREFIX, wwn))
            .to_string_lossy()
            .into_owned())
    }

    fn volumes_are_attached(&self, specs: &[Spec], node_name: &str) -> VolumeResult<HashMap<String, bool>> {
        let mut checks = HashMap::new();
        let mut volume_spec_map: HashMap<String, &Spec> = HashMap::new();
        let mut pd_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            match get_volume_source(spec) {
                Ok((source, _)) => {
                    pd_ids.push(source.pd_id.clone());
                    checks.insert(spec.name().to_string(), true);
                    volume_spec_map.insert(source.pd_id.clone(), spec);
                }
                Err(e) => error!("Error getting volume ({:?}) source : {}", spec.name(), e),
            }
        }

        let disks = photon_disks(self.cloud.as_ref())?;
        let attached = disks.disks_are_attached(&pd_ids, node_name).map_err(|e| {
            error!(
                "Error checking if volumes ({:?}) are attached to current node ({:?}). err={}",
                pd_ids, node_name, e
            );
            VolumeError::from(e)
        })?;

        for (pd_id, is_attached) in attached {
            if is_attached {
                continue;
            }
            if let Some(spec) = volume_spec_map.get(&pd_id) {
                checks.insert(spec.name().to_string(), false);
                info!(
                    "VolumesAreAttached: check volume {:?} (specName: {:?}) is no longer attached",
                    pd_id,
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
        if device_path.is_empty() {
            return Err(VolumeError::invalid_argument(format!(
                "WaitForAttach failed for PD {}: devicePath is empty.",
                source.pd_id
            )));
        }

        let path = Path::new(device_path);
        let deadline = Instant::now() + timeout;
        loop {
            debug!("Checking PD {} is attached", source.pd_id);
            if path.exists() {
                info!("Successfully found attached PD {}.", source.pd_id);
                return Ok(device_path.to_string());
            }
            if Instant::now() >= deadline {
                return Err(VolumeError::internal(format!(
                    "Could not find attached PD {}. Timeout waiting for mount paths to be created.",
                    source.pd_id
                )));
            }
            thread::sleep(CHECK_SLEEP_DURATION.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

impl DeviceMounter for PhotonPersistentDiskAttacher {
    fn get_device_mount_path(&self, spec: &Spec) -> VolumeResult<PathBuf> {
        let (source, _) = get_volume_source(spec)?;
        Ok(make_global_pd_path(self.host.as_ref(), &source.pd_id))
    }

    fn mount_device(&self, spec: &Spec, device_path: &str, device_mount_path: &Path) -> VolumeResult<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        let not_mnt = match mounter.is_likely_not_mount_point(device_mount_path) {
            Ok(not_mnt) => not_mnt,
            Err(e) if e.is_not_exist() => {
                create_dir_all_with_mode(device_mount_path, 0o750).map_err(|e| {
                    error!("Failed to create directory at {:?}. err: {}", device_mount_path, e);
                    VolumeError::io("mkdir", device_mount_path, e)
                })?;
                true
            }
            Err(e) => return Err(e.into()),
        };
        if !not_mnt {
            return Ok(());
        }

        let (source, read_only) = get_volume_source(spec)?;
        let options = if read_only { vec!["ro"] } else { Vec::new() };
        let mount_options = mount_option_from_spec(spec, &options);
        let disk_mounter = new_safe_format_and_mount_from_host(PLUGIN_NAME, self.host.as_ref());
        if let Err(e) = disk_mounter.format_and_mount(device_path, device_mount_path, &source.fs_type, &mount_options) {
            let _ = fs::remove_dir(device_mount_path);
            return Err(e.into());
        }
        info!(
            "formatting spec {} devicePath {} deviceMountPath {} fs {} with options {:?}",
            spec.name(),
            device_path,
            device_mount_path.display(),
            source.fs_type,
            mount_options
        );
        Ok(())
    }
}

/// PhotonPersistentDiskDetacher detaches Photon disks by id.
pub struct PhotonPersistentDiskDetacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
}

impl PhotonPersistentDiskDetacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self { host, cloud })
    }
}

impl Detacher for PhotonPersistentDiskDetacher {
    fn detach(&self, volume_name: &str, node_name: &str) -> VolumeResult<()> {
        let pd_id = volume_name.rsplit('/').next().unwrap_or(volume_name);
        let disks = photon_disks(self.cloud.as_ref())?;

        match disks.disk_is_attached(pd_id, node_name) {
            Ok(false) => {
                info!(
                    "detach operation was successful. PD {:?} is not attached to node {:?}.",
                    pd_id, node_name
                );
                return Ok(());
            }
            Ok(true) => {}
            Err(e) => {
                // Log and try detaching anyway.
                error!(
                    "Error checking if persistent disk ({:?}) is already attached to current node ({:?}). Will continue and try detach anyway. err={}",
                    pd_id, node_name, e
                );
            }
        }

        disks.detach_disk(pd_id, node_name).map_err(|e| {
            error!("Error detaching volume {:?}: {}", pd_id, e);
            VolumeError::from(e)
        })
    }
}

impl DeviceUnmounter for PhotonPersistentDiskDetacher {
    fn unmount_device(&self, device_mount_path: &Path) -> VolumeResult<()> {
        unmount_path(device_mount_path, self.host.mounter(PLUGIN_NAME).as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{PhotonPersistentDiskVolumeSource, Volume, VolumeSource};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::cloudprovider::CloudError;
    use crate::volume::host::testing::new_fake_host;

    fn pd_spec(pd_id: &str) -> Spec {
        Spec::from_volume(Volume::new(
            "vol",
            VolumeSource {
                photon_persistent_disk: Some(PhotonPersistentDiskVolumeSource {
                    pd_id: pd_id.to_string(),
                    fs_type: "ext4".to_string(),
                }),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_attach_and_detach() {
        let cloud = Arc::new(FakeCloud::new("photon"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let attacher = PhotonPersistentDiskAttacher::new(host.clone()).unwrap();

        let device = attacher.attach(&pd_spec("aa-bb-cc"), "node").unwrap();
        assert_eq!(device, "/dev/disk/by-id/wwn-0xaabbcc");
        assert!(cloud.is_attached("aa-bb-cc", "node"));
        assert_eq!(cloud.call_names(), vec!["disk_is_attached", "attach_disk"]);

        cloud.clear_calls();
        attacher.attach(&pd_spec("aa-bb-cc"), "node").unwrap();
        assert_eq!(cloud.call_names(), vec!["disk_is_attached"]);

        let detacher = PhotonPersistentDiskDetacher::new(host).unwrap();
        detacher.detach("aa-bb-cc", "node").unwrap();
        assert!(!cloud.is_attached("aa-bb-cc", "node"));

        cloud.clear_calls();
        detacher.detach("aa-bb-cc", "node").unwrap();
        assert_eq!(cloud.call_names(), vec!["disk_is_attached"]);
    }

    #[test]
    fn test_attach_error() {
        let cloud = Arc::new(FakeCloud::new("photon"));
        cloud.set_error("attach_disk", CloudError::provider("quota exceeded"));
        let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
        let attacher = PhotonPersistentDiskAttacher::new(host).unwrap();
        assert_eq!(
            attacher.attach(&pd_spec("pd"), "node").unwrap_err().to_string(),
            "quota exceeded"
        );
    }

    #[test]
    fn test_volumes_are_attached() {
        let cloud = Arc::new(FakeCloud::new("photon"));
        cloud.mark_attached("pd-1", "node");
        let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
        let attacher = PhotonPersistentDiskAttacher::new(host).unwrap();

        let mut other = pd_spec("pd-2");
        if let Some(v) = other.volume.as_mut() {
            v.name = "other".to_string();
        }
        let checks = attacher.volumes_are_attached(&[pd_spec("pd-1"), other], "node").unwrap();
        assert_eq!(checks["vol"], true);
        assert_eq!(checks["other"], false);
    }

    #[test]
    fn test_wait_for_attach() {
        let cloud = Arc::new(FakeCloud::new("photon"));
        let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
        let by_id = tempfile::tempdir().unwrap();
        let attacher = PhotonPersistentDiskAttacher::new(host)
            .unwrap()
            .with_disk_by_id_dir(by_id.path());

        assert_eq!(
            attacher
                .wait_for_attach(&pd_spec("pd"), "", None, Duration::ZERO)
                .unwrap_err()
                .to_string(),
            "WaitForAttach failed for PD pd: devicePath is empty."
        );

        let device = attacher.attach(&pd_spec("pd-1"), "node").unwrap();
        assert!(attacher
            .wait_for_attach(&pd_spec("pd-1"), &device, None, Duration::ZERO)
            .is_err());
        fs::write(&device, b"").unwrap();
        assert_eq!(
            attacher
                .wait_for_attach(&pd_spec("pd-1"), &device, None, Duration::ZERO)
                .unwrap(),
            device
        );
    }

    #[test]
    fn test_mount_and_unmount_device() {
        let cloud = Arc::new(FakeCloud::new("photon"));
        let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
        let attacher = PhotonPersistentDiskAttacher::new(host.clone()).unwrap();
        let spec = pd_spec("pd-1");

        let mount_path = attacher.get_device_mount_path(&spec).unwrap();
        assert!(mount_path.ends_with("plugins/kubernetes.io~photon-pd/mounts/pd-1"));
        attacher.mount_device(&spec, "/dev/sdb", &mount_path).unwrap();
        assert!(host.fake_mounter().is_mounted(&mount_path));

        let detacher = PhotonPersistentDiskDetacher::new(host.clone()).unwrap();
        detacher.unmount_device(&mount_path).unwrap();
        assert!(!mount_path.exists());
    }
}
