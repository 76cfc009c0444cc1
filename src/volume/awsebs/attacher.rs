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

use super::util::{aws_volumes, get_cloud_provider, map_to_aws_volume_id};
use super::{get_volume_source, make_global_pd_path, PLUGIN_NAME};
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

const NVME_BY_ID_PREFIX: &str = "/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_";

/// AwsElasticBlockStoreAttacher attaches EBS volumes to nodes and mounts
/// them at their global mount path.
pub struct AwsElasticBlockStoreAttacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
}

impl AwsElasticBlockStoreAttacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self { host, cloud })
    }
}

/// Returns the first path in `candidates` that exists. Nitro instances
/// expose volumes as NVMe devices named after the volume id, which is
/// resolved to the real device node.
fn verify_device_path(candidates: &[PathBuf]) -> Option<String> {
    for path in candidates {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if let Ok(resolved) = fs::canonicalize(path) {
                    return Some(resolved.to_string_lossy().into_owned());
                }
            }
            Ok(_) => return Some(path.to_string_lossy().into_owned()),
            Err(_) => {}
        }
    }
    None
}

fn device_path_candidates(device_path: &str, partition: &str, volume_id: &str) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(format!("{}{}", device_path, partition))];
    if let Ok(aws_id) = map_to_aws_volume_id(volume_id) {
        let nvme = format!("{}{}", NVME_BY_ID_PREFIX, aws_id.replace('-', ""));
        candidates.push(PathBuf::from(format!("{}{}", nvme, partition)));
    }
    candidates
}

impl Attacher for AwsElasticBlockStoreAttacher {
    fn attach(&self, spec: &Spec, node_name: &str) -> VolumeResult<String> {
        let (source, _) = get_volume_source(spec)?;
        let volumes = aws_volumes(self.cloud.as_ref())?;
        // The attach is idempotent; the cloud reports the device of an
        // existing attachment.
        volumes.attach_disk(&source.volume_id, node_name).map_err(|e| {
            error!(
                "Error attaching volume {:?} to node {:?}: {}",
                source.volume_id, node_name, e
            );
            e.into()
        })
    }

    fn volumes_are_attached(&self, specs: &[Spec], node_name: &str) -> VolumeResult<HashMap<String, bool>> {
        debug!("Attacher.VolumesAreAttached called for node {:?}", node_name);
        let mut volume_spec_map: HashMap<String, &Spec> = HashMap::new();
        let mut volume_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            match get_volume_source(spec) {
                Ok((source, _)) => {
                    volume_ids.push(source.volume_id.clone());
                    volume_spec_map.insert(source.volume_id.clone(), spec);
                }
                Err(e) => error!("Error getting volume ({:?}) source : {}", spec.name(), e),
            }
        }

        let volumes = aws_volumes(self.cloud.as_ref())?;
        let attached = volumes.disks_are_attached(&volume_ids, node_name).map_err(|e| {
            error!("Error checking if volumes are attached to node {:?}: {}", node_name, e);
            VolumeError::from(e)
        })?;

        let mut checks = HashMap::new();
        for (volume_id, is_attached) in attached {
            if let Some(spec) = volume_spec_map.get(&volume_id) {
                if !is_attached {
                    info!("VolumesAreAttached: check volume {:?} (specName: {:?}) is no longer attached", volume_id, spec.name());
                }
                checks.insert(spec.name().to_string(), is_attached);
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
        let volume_id = &source.volume_id;
        let partition = if source.partition != 0 {
            source.partition.to_string()
        } else {
            String::new()
        };

        if device_path.is_empty() {
            return Err(VolumeError::invalid_argument(format!(
                "waitForAttach failed for AWS Volume {:?}: devicePath is empty.",
                volume_id
            )));
        }

        let candidates = device_path_candidates(device_path, &partition, volume_id);
        let deadline = Instant::now() + timeout;
        loop {
            debug!("Checking AWS Volume {:?} is attached.", volume_id);
            if let Some(path) = verify_device_path(&candidates) {
                info!("Successfully found attached AWS Volume {:?} at {:?}.", volume_id, path);
                return Ok(path);
            }
            debug!("AWS Volume {:?} is not attached yet", volume_id);
            if Instant::now() >= deadline {
                return Err(VolumeError::internal(format!(
                    "could not find attached AWS Volume {:?}. Timeout waiting for mount paths to be created.",
                    volume_id
                )));
            }
            thread::sleep(CHECK_SLEEP_DURATION.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

impl DeviceMounter for AwsElasticBlockStoreAttacher {
    fn get_device_mount_path(&self, spec: &Spec) -> VolumeResult<PathBuf> {
        let (source, _) = get_volume_source(spec)?;
        Ok(make_global_pd_path(self.host.as_ref(), &source.volume_id))
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

        let (source, read_only) = get_volume_source(spec)?;
        let mut options = Vec::new();
        if read_only {
            options.push("ro");
        }
        if not_mnt {
            let disk_mounter = new_safe_format_and_mount_from_host(PLUGIN_NAME, self.host.as_ref());
            let mount_options = mount_option_from_spec(spec, &options);
            if let Err(e) =
                disk_mounter.format_and_mount(device_path, device_mount_path, &source.fs_type, &mount_options)
            {
                if let Err(rm_err) = fs::remove_dir(device_mount_path) {
                    warn!("failed to remove {}: {}", device_mount_path.display(), rm_err);
                }
                return Err(e.into());
            }
            info!(
                "Successfully mounted device {} at {}",
                device_path,
                device_mount_path.display()
            );
        }
        Ok(())
    }
}

/// AwsElasticBlockStoreDetacher detaches EBS volumes and unmounts their
/// global mount path.
pub struct AwsElasticBlockStoreDetacher {
    host: Arc<dyn VolumeHost>,
    cloud: Arc<dyn CloudProvider>,
}

impl AwsElasticBlockStoreDetacher {
    pub fn new(host: Arc<dyn VolumeHost>) -> VolumeResult<Self> {
        let cloud = get_cloud_provider(host.as_ref())?;
        Ok(Self { host, cloud })
    }
}

impl Detacher for AwsElasticBlockStoreDetacher {
    fn detach(&self, volume_name: &str, node_name: &str) -> VolumeResult<()> {
        let volume_id = volume_name.rsplit('/').next().unwrap_or(volume_name);
        let volumes = aws_volumes(self.cloud.as_ref())?;
        volumes.detach_disk(volume_id, node_name).map_err(|e| {
            error!("Error detaching volumeID {:?}: {}", volume_id, e);
            VolumeError::from(e)
        })?;
        Ok(())
    }
}

impl DeviceUnmounter for AwsElasticBlockStoreDetacher {
    fn unmount_device(&self, device_mount_path: &Path) -> VolumeResult<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        unmount_path(device_mount_path, mounter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{AwsElasticBlockStoreVolumeSource, Volume, VolumeSource};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::cloudprovider::CloudError;
    use crate::mount::Interface;
    use crate::volume::host::testing::new_fake_host;

    fn ebs_spec(name: &str, volume_id: &str, read_only: bool) -> Spec {
        Spec::from_volume(Volume::new(
            name,
            VolumeSource {
                aws_elastic_block_store: Some(AwsElasticBlockStoreVolumeSource {
                    volume_id: volume_id.to_string(),
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
        let cloud = Arc::new(FakeCloud::new("aws"));
        cloud.set_disk_path("vol-1", "/dev/xvdf");
        let (host, _dir) = new_fake_host(Some(cloud.clone()));

        let attacher = AwsElasticBlockStoreAttacher::new(host.clone()).unwrap();
        let spec = ebs_spec("vol", "vol-1", false);
        assert_eq!(attacher.attach(&spec, "node").unwrap(), "/dev/xvdf");
        assert!(cloud.is_attached("vol-1", "node"));

        let attached = attacher
            .volumes_are_attached(&[spec.clone(), ebs_spec("other", "vol-2", false)], "node")
            .unwrap();
        assert_eq!(attached["vol"], true);
        assert_eq!(attached["other"], false);

        let detacher = AwsElasticBlockStoreDetacher::new(host).unwrap();
        detacher.detach("kubernetes.io/aws-ebs/vol-1", "node").unwrap();
        assert!(!cloud.is_attached("vol-1", "node"));
    }

    #[test]
    fn test_attach_error() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        cloud.set_error("attach_disk", CloudError::provider("attach failed"));
        let (host, _dir) = new_fake_host(Some(cloud));
        let attacher = AwsElasticBlockStoreAttacher::new(host).unwrap();
        let err = attacher.attach(&ebs_spec("vol", "vol-1", false), "node").unwrap_err();
        assert_eq!(err.to_string(), "attach failed");
    }

    #[test]
    fn test_requires_aws_cloud() {
        let (host, _dir) = new_fake_host(None);
        assert!(AwsElasticBlockStoreAttacher::new(host.clone()).is_err());
        assert!(AwsElasticBlockStoreDetacher::new(host).is_err());
    }

    #[test]
    fn test_wait_for_attach() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        let (host, dir) = new_fake_host(Some(cloud));
        let attacher = AwsElasticBlockStoreAttacher::new(host).unwrap();
        let spec = ebs_spec("vol", "aws://zone-a/vol-1", false);

        let err = attacher
            .wait_for_attach(&spec, "", None, Duration::ZERO)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "waitForAttach failed for AWS Volume \"aws://zone-a/vol-1\": devicePath is empty."
        );

        let device = dir.path().join("xvdf");
        fs::write(&device, b"").unwrap();
        let found = attacher
            .wait_for_attach(&spec, &device.to_string_lossy(), None, Duration::ZERO)
            .unwrap();
        assert_eq!(found, device.to_string_lossy());

        let missing = dir.path().join("xvdg");
        let err = attacher
            .wait_for_attach(&spec, &missing.to_string_lossy(), None, Duration::ZERO)
            .unwrap_err();
        assert!(err.to_string().contains("Timeout waiting for mount paths to be created"));
    }

    #[test]
    fn test_mount_and_unmount_device() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        let (host, _dir) = new_fake_host(Some(cloud));
        let attacher = AwsElasticBlockStoreAttacher::new(host.clone()).unwrap();
        let spec = ebs_spec("vol", "aws://zone-a/vol-1", true);

        let mount_path = attacher.get_device_mount_path(&spec).unwrap();
        assert!(mount_path.ends_with("plugins/kubernetes.io~aws-ebs/mounts/aws/zone-a/vol-1"));

        attacher.mount_device(&spec, "/dev/xvdf", &mount_path).unwrap();
        let fake = host.fake_mounter();
        let mounts = fake.mount_points();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].device, "/dev/xvdf");
        assert_eq!(mounts[0].fs_type, "ext4");
        assert!(mounts[0].opts.contains(&"ro".to_string()));

        // Mounting again is a no-op.
        attacher.mount_device(&spec, "/dev/xvdf", &mount_path).unwrap();
        assert_eq!(fake.list().unwrap().len(), 1);

        let detacher = AwsElasticBlockStoreDetacher::new(host).unwrap();
        detacher.unmount_device(&mount_path).unwrap();
        assert!(!mount_path.exists());
        assert!(fake.mount_points().is_empty());
    }

    #[test]
    fn test_mount_device_failure_removes_dir() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        let (host, _dir) = new_fake_host(Some(cloud));
        let attacher = AwsElasticBlockStoreAttacher::new(host.clone()).unwrap();
        let spec = ebs_spec("vol", "vol-1", true);
        let mount_path = attacher.get_device_mount_path(&spec).unwrap();

        host.fake_mounter().fail_next_mount("mount failed", false);
        let err = attacher.mount_device(&spec, "/dev/xvdf", &mount_path).unwrap_err();
        assert_eq!(err.to_string(), "mount failed");
        assert!(!mount_path.exists());
    }
}
