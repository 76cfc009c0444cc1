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

use super::util::{gce_disks, get_cloud_provider};
use super::{get_volume_source, make_global_pd_name, PLUGIN_NAME};
use crate::api::core::{Pod, LABEL_ZONE_FAILURE_DOMAIN};
use crate::cloudprovider::CloudProvider;
use crate::volume::util::{
    create_dir_all_with_mode, mount_option_from_spec, new_safe_format_and_mount_from_host, unmount_path,
    LABEL_MULTI_ZONE_DELIMITER,
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
const DISK_GOOGLE_PREFIX: &str = "google-";
const DISK_SCSI_GOOGLE_PREFIX: &str = "scsi-0Google_PersistentDisk_";
const DISK_PART_SUFFIX: &str = "-part";

/// GcePersistentDiskAttacher attaches persistent disks to nodes and mounts
/// them at their global mount path.
pub struct GcePersistentDiskAttacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
    disk_by_id_dir: PathBuf,
}

impl GcePersistentDiskAttacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self {
            host,
            cloud,
            disk_by_id_dir: PathBuf::from(DISK_BY_ID_PATH),
        })
    }

    /// Look for attached devices under `dir` instead of `/dev/disk/by-id`.
    pub fn with_disk_by_id_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_by_id_dir = dir.into();
        self
    }

    fn disk_paths(&self, pd_name: &str, partition: &str) -> Vec<PathBuf> {
        let suffix = if partition.is_empty() {
            String::new()
        } else {
            format!("{}{}", DISK_PART_SUFFIX, partition)
        };
        vec![
            self.disk_by_id_dir
                .join(format!("{}{}{}", DISK_GOOGLE_PREFIX, pd_name, suffix)),
            self.disk_by_id_dir
                .join(format!("{}{}{}", DISK_SCSI_GOOGLE_PREFIX, pd_name, suffix)),
        ]
    }
}

/// A disk is regional when its persistent volume carries a multi-zone label.
fn is_regional_pd(spec: &Spec) -> bool {
    spec.persistent_volume
        .as_ref()
        .and_then(|pv| pv.metadata.labels.get(LABEL_ZONE_FAILURE_DOMAIN))
        .is_some_and(|zones| zones.contains(LABEL_MULTI_ZONE_DELIMITER))
}

impl Attacher for GcePersistentDiskAttacher {
    fn attach(&self, spec: &Spec, node_name: &str) -> VolumeResult<String> {
        let (source, read_only) = get_volume_source(spec)?;
        let pd_name = &source.pd_name;
        let disks = gce_disks(self.cloud.as_ref())?;

        match disks.disk_is_attached(pd_name, node_name) {
            Ok(true) => {
                info!("Attach operation is successful. PD {:?} is already attached to node {:?}.", pd_name, node_name);
            }
            Ok(false) | Err(_) => {
                if let Err(e) = disks.attach_disk(pd_name, node_name, read_only, is_regional_pd(spec)) {
                    error!("Error attaching PD {:?} to node {:?}: {}", pd_name, node_name, e);
                    return Err(e.into());
                }
            }
        }
        Ok(self
            .disk_by_id_dir
            .join(format!("{}{}", DISK_GOOGLE_PREFIX, pd_name))
            .to_string_lossy()
            .into_owned())
    }

    fn volumes_are_attached(&self, specs: &[Spec], node_name: &str) -> VolumeResult<HashMap<String, bool>> {
        let mut pd_name_spec_map: HashMap<String, &Spec> = HashMap::new();
        let mut pd_names = Vec::with_capacity(specs.len());
        for spec in specs {
            match get_volume_source(spec) {
                Ok((source, _)) => {
                    pd_names.push(source.pd_name.clone());
                    pd_name_spec_map.insert(source.pd_name.clone(), spec);
                }
                Err(e) => error!("Error getting volume ({:?}) source : {}", spec.name(), e),
            }
        }

        let disks = gce_disks(self.cloud.as_ref())?;
        let attached = disks.disks_are_attached(&pd_names, node_name).map_err(|e| {
            error!("Error checking if PDs ({:?}) are already attached to current node ({:?}). err={}", pd_names, node_name, e);
            VolumeError::from(e)
        })?;

        let mut checks = HashMap::new();
        for (pd_name, is_attached) in attached {
            if let Some(spec) = pd_name_spec_map.get(&pd_name) {
                if !is_attached {
                    info!("VolumesAreAttached: check volume {:?} (specName: {:?}) is no longer attached", pd_name, spec.name());
                }
                checks.insert(spec.name().to_string(), is_attached);
            }
        }
        Ok(checks)
    }

    fn wait_for_attach(
        &self,
        spec: &Spec,
        _device_path: &str,
        _pod: Option<&Pod>,
        timeout: Duration,
    ) -> VolumeResult<String> {
        let (source, _) = get_volume_source(spec)?;
        let pd_name = &source.pd_name;
        let partition = if source.partition != 0 {
            source.partition.to_string()
        } else {
            String::new()
        };

        let candidates = self.disk_paths(pd_name, &partition);
        let deadline = Instant::now() + timeout;
        loop {
            debug!("Checking GCE PD {:?} is attached.", pd_name);
            if let Some(path) = candidates.iter().find(|p| p.exists()) {
                info!("Successfully found attached GCE PD {:?}.", pd_name);
                return Ok(path.to_string_lossy().into_owned());
            }
            debug!("GCE PD {:?} is not attached yet", pd_name);
            if Instant::now() >= deadline {
                return Err(VolumeError::internal(format!(
                    "could not find attached GCE PD {:?}. Timeout waiting for mount paths to be created.",
                    pd_name
                )));
            }
            thread::sleep(CHECK_SLEEP_DURATION.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

impl DeviceMounter for GcePersistentDiskAttacher {
    fn get_device_mount_path(&self, spec: &Spec) -> VolumeResult<PathBuf> {
        let (source, _) = get_volume_source(spec)?;
        Ok(make_global_pd_name(self.host.as_ref(), &source.pd_name))
    }

    fn mount_device(&self, spec: &Spec, device_path: &str, device_mount_path: &Path) -> VolumeResult<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        let not_mnt = match mounter.is_likely_not_mount_point(device_mount_path) {
            Ok(not_mnt) => not_mnt,
            Err(e) if e.is_not_exist() => {
                create_dir_all_with_mode(device_mount_path, 0o750)
                    .map_err(|e| VolumeError::io("mkdir", device_mount_path, e))?;
                true
            }
            Err(e) => return Err(e.into()),
        };
        if !not_mnt {
            return Ok(());
        }

        let (source, read_only) = get_volume_source(spec)?;
        let options = if read_only { vec!["ro"] } else { Vec::new() };
        let disk_mounter = new_safe_format_and_mount_from_host(PLUGIN_NAME, self.host.as_ref());
        let mount_options = mount_option_from_spec(spec, &options);
        if let Err(e) = disk_mounter.format_and_mount(device_path, device_mount_path, &source.fs_type, &mount_options) {
            if let Err(rm_err) = fs::remove_dir(device_mount_path) {
                warn!("failed to remove {}: {}", device_mount_path.display(), rm_err);
            }
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

/// GcePersistentDiskDetacher detaches persistent disks and unmounts their
/// global mount path.
pub struct GcePersistentDiskDetacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
}

impl GcePersistentDiskDetacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self { host, cloud })
    }
}

impl Detacher for GcePersistentDiskDetacher {
    /// Detach the disk from the node. A disk that is no longer attached
    /// counts as detached.
    fn detach(&self, volume_name: &str, node_name: &str) -> VolumeResult<()> {
        let pd_name = volume_name.rsplit('/').next().unwrap_or(volume_name);
        let disks = gce_disks(self.cloud.as_ref())?;

        match disks.disk_is_attached(pd_name, node_name) {
            Ok(false) => {
                info!("Detach operation is successful. PD {:?} was not attached to node {:?}.", pd_name, node_name);
                return Ok(());
            }
            Ok(true) => {}
            Err(e) => {
                error!(
                    "Error checking if PD ({:?}) is already attached to current node ({:?}). Will continue and try detach anyway. err={}",
                    pd_name, node_name, e
                );
            }
        }

        disks.detach_disk(pd_name, node_name).map_err(|e| {
            error!("Error detaching PD {:?} from node {:?}: {}", pd_name, node_name, e);
            VolumeError::from(e)
        })
    }
}

impl DeviceUnmounter for GcePersistentDiskDetacher {
    fn unmount_device(&self, device_mount_path: &Path) -> VolumeResult<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        unmount_path(device_mount_path, mounter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{GcePersistentDiskVolumeSource, PersistentVolume, Volume, VolumeSource};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::cloudprovider::CloudError;
    use crate::volume::host::testing::new_fake_host;

    fn pd_spec(name: &str, pd_name: &str, read_only: bool) -> Spec {
        Spec::from_volume(Volume::new(
            name,
            VolumeSource {
                gce_persistent_disk: Some(GcePersistentDiskVolumeSource {
                    pd_name: pd_name.to_string(),
                    fs_type: "ext4".to_string(),
                    read_only,
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_attach_detach() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let attacher = GcePersistentDiskAttacher::new(host.clone()).unwrap();

        let spec = pd_spec("vol", "pd-1", false);
        assert_eq!(attacher.attach(&spec, "node").unwrap(), "/dev/disk/by-id/google-pd-1");
        assert!(cloud.is_attached("pd-1", "node"));

        // A second attach finds the disk attached.
        cloud.clear_calls();
        attacher.attach(&spec, "node").unwrap();
        assert_eq!(cloud.call_names(), vec!["disk_is_attached"]);

        let attached = attacher
            .volumes_are_attached(&[spec, pd_spec("other", "pd-2", false)], "node")
            .unwrap();
        assert_eq!(attached["vol"], true);
        assert_eq!(attached["other"], false);

        let detacher = GcePersistentDiskDetacher::new(host).unwrap();
        detacher.detach("kubernetes.io/gce-pd/pd-1", "node").unwrap();
        assert!(!cloud.is_attached("pd-1", "node"));

        // Detaching a detached disk skips the cloud call.
        cloud.clear_calls();
        detacher.detach("pd-1", "node").unwrap();
        assert_eq!(cloud.call_names(), vec!["disk_is_attached"]);
    }

    #[test]
    fn test_attach_error() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        cloud.set_error("attach_disk", CloudError::provider("quota exceeded"));
        let (host, _dir) = new_fake_host(Some(cloud));
        let attacher = GcePersistentDiskAttacher::new(host).unwrap();
        let err = attacher.attach(&pd_spec("vol", "pd-1", false), "node").unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn test_detach_continues_after_check_error() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        cloud.mark_attached("pd-1", "node");
        cloud.set_error("disk_is_attached", CloudError::provider("api down"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let detacher = GcePersistentDiskDetacher::new(host).unwrap();
        detacher.detach("pd-1", "node").unwrap();
        assert!(!cloud.is_attached("pd-1", "node"));
    }

    #[test]
    fn test_is_regional_pd() {
        let mut pv = PersistentVolume::new("pv");
        pv.spec.persistent_volume_source.gce_persistent_disk = Some(GcePersistentDiskVolumeSource {
            pd_name: "pd".to_string(),
            ..Default::default()
        });
        pv.metadata
            .labels
            .insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), "zone-a".to_string());
        assert!(!is_regional_pd(&Spec::from_persistent_volume(pv.clone(), false)));

        pv.metadata
            .labels
            .insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), "zone-a__zone-b".to_string());
        assert!(is_regional_pd(&Spec::from_persistent_volume(pv, false)));
        assert!(!is_regional_pd(&pd_spec("vol", "pd", false)));
    }

    #[test]
    fn test_wait_for_attach() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, dir) = new_fake_host(Some(cloud));
        let by_id = dir.path().join("by-id");
        fs::create_dir_all(&by_id).unwrap();
        let attacher = GcePersistentDiskAttacher::new(host)
            .unwrap()
            .with_disk_by_id_dir(&by_id);

        let mut spec = pd_spec("vol", "pd-1", false);
        let err = attacher.wait_for_attach(&spec, "", None, Duration::ZERO).unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not find attached GCE PD \"pd-1\". Timeout waiting for mount paths to be created."
        );

        let scsi = by_id.join("scsi-0Google_PersistentDisk_pd-1");
        fs::write(&scsi, b"").unwrap();
        assert_eq!(
            attacher.wait_for_attach(&spec, "", None, Duration::ZERO).unwrap(),
            scsi.to_string_lossy()
        );

        if let Some(v) = spec.volume.as_mut() {
            v.volume_source.gce_persistent_disk.as_mut().unwrap().partition = 1;
        }
        let part = by_id.join("google-pd-1-part1");
        fs::write(&part, b"").unwrap();
        assert_eq!(
            attacher.wait_for_attach(&spec, "", None, Duration::ZERO).unwrap(),
            part.to_string_lossy()
        );
    }

    #[test]
    fn test_mount_and_unmount_device() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, _dir) = new_fake_host(Some(cloud));
        let attacher = GcePersistentDiskAttacher::new(host.clone()).unwrap();
        let spec = pd_spec("vol", "pd-1", false);

        let mount_path = attacher.get_device_mount_path(&spec).unwrap();
        assert!(mount_path.ends_with("plugins/kubernetes.io~gce-pd/mounts/pd-1"));

        attacher
            .mount_device(&spec, "/dev/disk/by-id/google-pd-1", &mount_path)
            .unwrap();
        let mounts = host.fake_mounter().mount_points();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].device, "/dev/disk/by-id/google-pd-1");
        assert!(mounts[0].opts.contains(&"defaults".to_string()));

        let detacher = GcePersistentDiskDetacher::new(host.clone()).unwrap();
        detacher.unmount_device(&mount_path).unwrap();
        assert!(!mount_path.exists());
        assert!(host.fake_mounter().mount_points().is_empty());
    }
}
