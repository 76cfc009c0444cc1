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

//! Photon Controller persistent disks.

mod attacher;

pub use attacher::{PhotonPersistentDiskAttacher, PhotonPersistentDiskDetacher};

use crate::api::core::{
    Node, PersistentVolume, PersistentVolumeAccessMode, PersistentVolumeSource, PhotonPersistentDiskVolumeSource,
    Pod, TopologySelectorTerm, Volume, VolumeSource, RESOURCE_STORAGE,
};
use crate::api::resource::Quantity;
use crate::cloudprovider::{photon, CloudProvider};
use crate::mount::{Interface, MOUNTS_IN_GLOBAL_PD_PATH};
use crate::volume::util::{
    access_modes_contained_in_all, bind_mount_pod_volume, check_persistent_volume_claim_mode_block,
    generate_volume_name, get_mount_refs, mount_option_from_spec, round_up_to_gib, unmount_path,
    VOLUME_DYNAMICALLY_CREATED_BY_KEY,
};
use crate::volume::{
    AttachableVolumePlugin, Attacher, Attributes, DeletableVolumePlugin, Deleter, Detacher,
    DeviceMountableVolumePlugin, DeviceMounter, DeviceUnmounter, Mounter, PersistentVolumePlugin,
    ProvisionableVolumePlugin, Provisioner, Spec, Unmounter, VolumeError, VolumeHost, VolumeOptions, VolumePlugin,
    VolumeResult,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

pub const PLUGIN_NAME: &str = "kubernetes.io/photon-pd";

const MAX_VOLUME_NAME_LENGTH: usize = 255;

pub fn probe_volume_plugins() -> Vec<Box<dyn VolumePlugin>> {
    vec![Box::new(PhotonPersistentDiskPlugin::default())]
}

#[derive(Default)]
pub struct PhotonPersistentDiskPlugin {
    host: Option<Arc<dyn VolumeHost>>,
}

impl PhotonPersistentDiskPlugin {
    fn host(&self) -> VolumeResult<&Arc<dyn VolumeHost>> {
        self.host
            .as_ref()
            .ok_or_else(|| VolumeError::internal(format!("volume plugin {} is not initialized", PLUGIN_NAME)))
    }
}

pub(crate) fn get_volume_source(spec: &Spec) -> VolumeResult<(&PhotonPersistentDiskVolumeSource, bool)> {
    if let Some(pd) = spec
        .volume
        .as_ref()
        .and_then(|v| v.volume_source.photon_persistent_disk.as_ref())
    {
        return Ok((pd, false));
    }
    if let Some(pd) = spec
        .persistent_volume
        .as_ref()
        .and_then(|pv| pv.spec.persistent_volume_source.photon_persistent_disk.as_ref())
    {
        return Ok((pd, spec.read_only));
    }
    Err(VolumeError::invalid_spec(
        "spec does not reference a Photon Controller persistent disk type",
    ))
}

/// Returns `<plugin dir>/mounts/<pd id>`.
pub fn make_global_pd_path(host: &dyn VolumeHost, pd_id: &str) -> PathBuf {
    host.plugin_dir(PLUGIN_NAME)
        .join(MOUNTS_IN_GLOBAL_PD_PATH)
        .join(pd_id)
}

pub(super) fn get_cloud_provider(host: &dyn VolumeHost) -> VolumeResult<Arc<dyn CloudProvider>> {
    match host.cloud_provider() {
        Some(cloud) if cloud.photon_disks().is_some() => Ok(cloud),
        other => {
            let name = other.map(|c| c.provider_name().to_string()).unwrap_or_else(|| "nil".to_string());
            error!("Photon Controller Cloud Provider: GetCloudProvider returned {} instead", name);
            Err(VolumeError::internal(format!(
                "Photon Controller Cloud Provider: GetCloudProvider returned {} instead",
                name
            )))
        }
    }
}

pub(super) fn photon_disks(cloud: &dyn CloudProvider) -> VolumeResult<&dyn photon::Disks> {
    cloud
        .photon_disks()
        .ok_or_else(|| VolumeError::internal("cloud provider does not support Photon persistent disks"))
}

impl VolumePlugin for PhotonPersistentDiskPlugin {
    fn init(&mut self, host: Arc<dyn VolumeHost>) -> VolumeResult<()> {
        self.host = Some(host);
        Ok(())
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn volume_name(&self, spec: &Spec) -> VolumeResult<String> {
        get_volume_source(spec)
            .map(|(pd, _)| pd.pd_id.clone())
            .inspect_err(|e| error!("Photon volume plugin: GetVolumeName failed to get volume source: {}", e))
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
        Ok(Box::new(PhotonPersistentDiskMounter {
            disk: PhotonPersistentDisk {
                volume_name: spec.name().to_string(),
                pod_uid: pod.metadata.uid.clone(),
                pd_id: pd.pd_id.clone(),
                mounter: host.mounter(PLUGIN_NAME),
                host: host.clone(),
            },
            read_only,
            mount_options: mount_option_from_spec(spec, &[]),
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<Box<dyn Unmounter>> {
        let host = self.host()?;
        Ok(Box::new(PhotonPersistentDiskUnmounter {
            disk: PhotonPersistentDisk {
                volume_name: volume_name.to_string(),
                pod_uid: pod_uid.to_string(),
                pd_id: String::new(),
                mounter: host.mounter(PLUGIN_NAME),
                host: host.clone(),
            },
        }))
    }

    fn construct_volume_spec(&self, volume_name: &str, mount_path: &Path) -> VolumeResult<Spec> {
        let host = self.host()?;
        let mounter = host.mounter(PLUGIN_NAME);
        let pd_id = mounter
            .get_device_name_from_mount(mount_path, &host.plugin_dir(PLUGIN_NAME))
            .inspect_err(|e| error!("Photon volume plugin: ConstructVolumeSpec failed: {}", e))?;
        Ok(Spec::from_volume(Volume::new(
            volume_name,
            VolumeSource {
                photon_persistent_disk: Some(PhotonPersistentDiskVolumeSource {
                    pd_id,
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
}

impl PersistentVolumePlugin for PhotonPersistentDiskPlugin {
    fn access_modes(&self) -> Vec<PersistentVolumeAccessMode> {
        vec![PersistentVolumeAccessMode::ReadWriteOnce]
    }
}

impl AttachableVolumePlugin for PhotonPersistentDiskPlugin {
    fn new_attacher(&self) -> VolumeResult<Box<dyn Attacher>> {
        Ok(Box::new(PhotonPersistentDiskAttacher::new(self.host()?.clone())?))
    }

    fn new_detacher(&self) -> VolumeResult<Box<dyn Detacher>> {
        Ok(Box::new(PhotonPersistentDiskDetacher::new(self.host()?.clone())?))
    }
}

impl DeviceMountableVolumePlugin for PhotonPersistentDiskPlugin {
    fn new_device_mounter(&self) -> VolumeResult<Box<dyn DeviceMounter>> {
        Ok(Box::new(PhotonPersistentDiskAttacher::new(self.host()?.clone())?))
    }

    fn new_device_unmounter(&self) -> VolumeResult<Box<dyn DeviceUnmounter>> {
        Ok(Box::new(PhotonPersistentDiskDetacher::new(self.host()?.clone())?))
    }

    fn get_device_mount_refs(&self, device_mount_path: &Path) -> VolumeResult<Vec<PathBuf>> {
        let mounter = self.host()?.mounter(PLUGIN_NAME);
        get_mount_refs(mounter.as_ref(), device_mount_path)
    }
}

impl ProvisionableVolumePlugin for PhotonPersistentDiskPlugin {
    fn new_provisioner(&self, options: VolumeOptions) -> VolumeResult<Box<dyn Provisioner>> {
        Ok(Box::new(PhotonPersistentDiskProvisioner {
            host: self.host()?.clone(),
            access_modes: self.access_modes(),
            options,
        }))
    }
}

impl DeletableVolumePlugin for PhotonPersistentDiskPlugin {
    fn new_deleter(&self, spec: &Spec) -> VolumeResult<Box<dyn Deleter>> {
        let pd = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.photon_persistent_disk.as_ref())
            .ok_or_else(|| VolumeError::invalid_spec("spec.PersistentVolumeSource.PhotonPersistentDisk is nil"))?;
        Ok(Box::new(PhotonPersistentDiskDeleter {
            host: self.host()?.clone(),
            pd_id: pd.pd_id.clone(),
        }))
    }
}

// ============================================================================
// Mounter / Unmounter
// ============================================================================

struct PhotonPersistentDisk {
    volume_name: String,
    pod_uid: String,
    pd_id: String,
    mounter: Arc<dyn Interface>,
    host: Arc<dyn VolumeHost>,
}

impl PhotonPersistentDisk {
    fn get_path(&self) -> PathBuf {
        self.host.pod_volume_dir(&self.pod_uid, PLUGIN_NAME, &self.volume_name)
    }
}

struct PhotonPersistentDiskMounter {
    disk: PhotonPersistentDisk,
    read_only: bool,
    mount_options: Vec<String>,
}

impl Mounter for PhotonPersistentDiskMounter {
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
        let global_pd_path = make_global_pd_path(self.disk.host.as_ref(), &self.disk.pd_id);
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

struct PhotonPersistentDiskUnmounter {
    disk: PhotonPersistentDisk,
}

impl Unmounter for PhotonPersistentDiskUnmounter {
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

pub struct PhotonPersistentDiskProvisioner {
    host: Arc<dyn VolumeHost>,
    access_modes: Vec<PersistentVolumeAccessMode>,
    options: VolumeOptions,
}

impl PhotonPersistentDiskProvisioner {
    fn create_volume(&self) -> VolumeResult<(String, i64, String)> {
        let cloud = get_cloud_provider(self.host.as_ref())?;
        let disks = photon_disks(cloud.as_ref())?;

        let capacity = self
            .options
            .pvc
            .storage_request()
            .cloned()
            .unwrap_or_else(|| Quantity::from_gib(0));
        let size_gb = round_up_to_gib(&capacity);

        let mut volume_options = photon::VolumeOptions {
            capacity_gb: size_gb,
            tags: self.options.cloud_tags.clone(),
            name: generate_volume_name(&self.options.cluster_name, &self.options.pv_name, MAX_VOLUME_NAME_LENGTH),
            flavor: String::new(),
        };
        let mut fs_type = String::new();
        for (k, v) in &self.options.parameters {
            match k.to_lowercase().as_str() {
                "flavor" => volume_options.flavor = v.clone(),
                "fstype" => fs_type = v.clone(),
                _ => {
                    return Err(VolumeError::invalid_argument(format!(
                        "invalid option {} for volume plugin {}.",
                        k, PLUGIN_NAME
                    )))
                }
            }
        }

        let pd_id = disks.create_disk(&volume_options).inspect_err(|e| {
            error!("Photon Controller Util: failed to CreateDisk. Error [{}]", e);
        })?;
        info!("Photon Controller Util: created persistent disk with ID: {}", pd_id);
        Ok((pd_id, size_gb, fs_type))
    }
}

impl Provisioner for PhotonPersistentDiskProvisioner {
    fn provision(
        &self,
        _selected_node: Option<&Node>,
        _allowed_topologies: &[TopologySelectorTerm],
    ) -> VolumeResult<PersistentVolume> {
        let pvc = &self.options.pvc;
        if !access_modes_contained_in_all(&self.access_modes, &pvc.spec.access_modes) {
            return Err(VolumeError::invalid_argument(format!(
                "invalid AccessModes {:?}: only AccessModes {:?} are supported",
                pvc.spec.access_modes, self.access_modes
            )));
        }
        if pvc.spec.selector.is_some() {
            return Err(VolumeError::invalid_argument(
                "claim.Spec.Selector is not supported for dynamic provisioning on Photon",
            ));
        }

        let (pd_id, size_gb, fs_type) = self.create_volume()?;
        let fs_type = if check_persistent_volume_claim_mode_block(pvc) {
            String::new()
        } else if fs_type.is_empty() {
            "ext4".to_string()
        } else {
            fs_type
        };

        let mut pv = PersistentVolume::new(&self.options.pv_name);
        pv.metadata.annotations.insert(
            VOLUME_DYNAMICALLY_CREATED_BY_KEY.to_string(),
            "photon-volume-dynamic-provisioner".to_string(),
        );
        pv.spec.persistent_volume_reclaim_policy = self.options.reclaim_policy;
        pv.spec.access_modes = if pvc.spec.access_modes.is_empty() {
            self.access_modes.clone()
        } else {
            pvc.spec.access_modes.clone()
        };
        pv.spec
            .capacity
            .insert(RESOURCE_STORAGE.to_string(), Quantity::from_gib(size_gb));
        pv.spec.volume_mode = pvc.spec.volume_mode;
        pv.spec.persistent_volume_source = PersistentVolumeSource {
            photon_persistent_disk: Some(PhotonPersistentDiskVolumeSource { pd_id, fs_type }),
            ..Default::default()
        };
        pv.spec.mount_options = self.options.mount_options.clone();
        Ok(pv)
    }
}

pub struct PhotonPersistentDiskDeleter {
    host: Arc<dyn VolumeHost>,
    pd_id: String,
}

impl Deleter for PhotonPersistentDiskDeleter {
    fn delete(&self) -> VolumeResult<()> {
        let cloud = get_cloud_provider(self.host.as_ref())?;
        let disks = photon_disks(cloud.as_ref())?;
        disks.delete_disk(&self.pd_id).inspect_err(|e| {
            error!("Photon Controller Util: failed to DeleteDisk for pdID {}. Error[{}]", self.pd_id, e);
        })?;
        info!("Photon Controller Util: successfully deleted PD {}", self.pd_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{LabelSelector, PersistentVolumeClaim, PersistentVolumeMode};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::volume::host::testing::new_fake_host;
    use crate::volume::host::FakeVolumeHost;

    fn init_plugin(host: Arc<FakeVolumeHost>) -> PhotonPersistentDiskPlugin {
        let mut plugin = PhotonPersistentDiskPlugin::default();
        plugin.init(host).unwrap();
        plugin
    }

    fn pd_spec(pd_id: &str) -> Spec {
        Spec::from_volume(Volume::new(
            "vol1",
            VolumeSource {
                photon_persistent_disk: Some(PhotonPersistentDiskVolumeSource {
                    pd_id: pd_id.to_string(),
                    fs_type: "ext4".to_string(),
                }),
                ..Default::default()
            },
        ))
    }

    fn options(size: &str, parameters: &[(&str, &str)]) -> VolumeOptions {
        let mut pvc = PersistentVolumeClaim::new("claim", "ns");
        pvc.spec
            .resources
            .requests
            .insert(RESOURCE_STORAGE.to_string(), Quantity::parse(size).unwrap());
        VolumeOptions {
            pv_name: "pvc-1".to_string(),
            pvc,
            cluster_name: "kubernetes".to_string(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_can_support() {
        let plugin = PhotonPersistentDiskPlugin::default();
        assert_eq!(plugin.name(), "kubernetes.io/photon-pd");
        assert!(plugin.can_support(&pd_spec("pd")));
        assert!(!plugin.can_support(&Spec::default()));
        assert_eq!(plugin.volume_name(&pd_spec("pd")).unwrap(), "pd");
        assert_eq!(plugin.access_modes(), vec![PersistentVolumeAccessMode::ReadWriteOnce]);
        assert_eq!(
            get_volume_source(&Spec::default()).unwrap_err().to_string(),
            "spec does not reference a Photon Controller persistent disk type"
        );
    }

    #[test]
    fn test_requires_photon_cloud() {
        let (host, _dir) = new_fake_host(Some(Arc::new(FakeCloud::new("gce"))));
        assert_eq!(
            PhotonPersistentDiskAttacher::new(host).err().unwrap().to_string(),
            "Photon Controller Cloud Provider: GetCloudProvider returned gce instead"
        );
        let (host, _dir) = new_fake_host(None);
        assert!(PhotonPersistentDiskDetacher::new(host).is_err());
    }

    #[test]
    fn test_mount_unmount_and_reconstruct() {
        let (host, _dir) = new_fake_host(None);
        let plugin = init_plugin(host.clone());
        let mut pod = Pod::new("pod", "ns");
        pod.metadata.uid = "poduid".to_string();

        let global = make_global_pd_path(host.as_ref(), "pd");
        host.fake_mounter().mount("/dev/sdb", &global, "ext4", &[]).unwrap();

        let mounter = plugin.new_mounter(&pd_spec("pd"), &pod).unwrap();
        mounter.set_up(None).unwrap();
        let path = mounter.get_path();
        assert!(host.fake_mounter().is_mounted(&path));

        let spec = plugin.construct_volume_spec("vol1", &path).unwrap();
        assert_eq!(get_volume_source(&spec).unwrap().0.pd_id, "pd");

        plugin.new_unmounter("vol1", "poduid").unwrap().tear_down().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_provision_and_delete() {
        let cloud = Arc::new(FakeCloud::new("photon"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);

        let pv = plugin
            .new_provisioner(options("1500Mi", &[("flavor", "fast")]))
            .unwrap()
            .provision(None, &[])
            .unwrap();
        let pd = pv.spec.persistent_volume_source.photon_persistent_disk.clone().unwrap();
        assert_eq!(pd.fs_type, "ext4");
        assert_eq!(pv.spec.capacity[RESOURCE_STORAGE], Quantity::from_gib(2));
        assert_eq!(
            pv.metadata.annotations[VOLUME_DYNAMICALLY_CREATED_BY_KEY],
            "photon-volume-dynamic-provisioner"
        );
        assert_eq!(pv.spec.access_modes, vec![PersistentVolumeAccessMode::ReadWriteOnce]);

        let created = cloud.photon_volume_options();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "kubernetes-dynamic-pvc-1");
        assert_eq!(created[0].flavor, "fast");
        assert_eq!(created[0].capacity_gb, 2);
        assert_eq!(cloud.disks()[&pd.pd_id], 2);

        let spec = Spec::from_persistent_volume(pv, false);
        plugin.new_deleter(&spec).unwrap().delete().unwrap();
        assert!(cloud.disks().is_empty());
    }

    #[test]
    fn test_provision_fs_type() {
        struct TestCase {
            name: &'static str,
            parameters: Vec<(&'static str, &'static str)>,
            block: bool,
            expected_fs: &'static str,
        }
        let test_cases = vec![
            TestCase {
                name: "explicit fstype",
                parameters: vec![("fstype", "xfs")],
                block: false,
                expected_fs: "xfs",
            },
            TestCase {
                name: "block mode",
                parameters: vec![("fstype", "xfs")],
                block: true,
                expected_fs: "",
            },
        ];
        for tc in test_cases {
            let cloud = Arc::new(FakeCloud::new("photon"));
            let (host, _dir) = new_fake_host(Some(cloud as Arc<dyn CloudProvider>));
            let plugin = init_plugin(host);
            let mut opts = options("1Gi", &tc.parameters);
            if tc.block {
                opts.pvc.spec.volume_mode = Some(PersistentVolumeMode::Block);
            }
            let pv = plugin.new_provisioner(opts).unwrap().provision(None, &[]).unwrap();
            let pd = pv.spec.persistent_volume_source.photon_persistent_disk.unwrap();
            assert_eq!(pd.fs_type, tc.expected_fs, "{}: unexpected fs type", tc.name);
        }
    }

    #[test]
    fn test_provision_errors() {
        let cloud = Arc::new(FakeCloud::new("photon"));
        let (host, _dir) = new_fake_host(Some(cloud.clone() as Arc<dyn CloudProvider>));
        let plugin = init_plugin(host);

        let err = plugin
            .new_provisioner(options("1Gi", &[("zone", "a")]))
            .unwrap()
            .provision(None, &[])
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid option zone for volume plugin kubernetes.io/photon-pd.");

        let mut opts = options("1Gi", &[]);
        opts.pvc.spec.selector = Some(LabelSelector::default());
        let err = plugin.new_provisioner(opts).unwrap().provision(None, &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "claim.Spec.Selector is not supported for dynamic provisioning on Photon"
        );

        let mut opts = options("1Gi", &[]);
        opts.pvc.spec.access_modes = vec![PersistentVolumeAccessMode::ReadWriteMany];
        assert!(plugin.new_provisioner(opts).unwrap().provision(None, &[]).is_err());
        assert!(cloud.photon_volume_options().is_empty());

        let err = plugin.new_deleter(&pd_spec("pd")).err().unwrap();
        assert_eq!(err.to_string(), "spec.PersistentVolumeSource.PhotonPersistentDisk is nil");
    }
}
