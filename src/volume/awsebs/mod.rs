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

//! AWS Elastic Block Store volumes.
//!
//! An EBS volume is attached to the node by the attach/detach controller,
//! mounted once per node under the plugin's global mount directory, and bind
//! mounted into every pod that uses it.

mod attacher;
mod util;

pub use attacher::{AwsElasticBlockStoreAttacher, AwsElasticBlockStoreDetacher};
pub use util::{map_to_aws_volume_id, CreatedVolume};

use crate::api::core::{
    AwsElasticBlockStoreVolumeSource, Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeAccessMode, PersistentVolumeSource, Pod,
    TopologySelectorTerm, Volume, VolumeNodeAffinity, VolumeSource, RESOURCE_STORAGE,
};
use crate::api::resource::Quantity;
use crate::cloudprovider::aws;
use crate::mount::{Interface, MOUNTS_IN_GLOBAL_PD_PATH};
use crate::volume::util::{
    access_modes_contained_in_all, bind_mount_pod_volume, check_persistent_volume_claim_mode_block,
    get_mount_refs, mount_option_from_spec, unmount_path, DEFAULT_MAX_EBS_NITRO_VOLUME_LIMIT, DEFAULT_MAX_EBS_VOLUMES,
    EBS_NITRO_LIMIT_REGEX, EBS_VOLUME_LIMIT_KEY, VOLUME_DYNAMICALLY_CREATED_BY_KEY,
};
use crate::volume::{
    AttachableVolumePlugin, Attacher, Attributes, DeletableVolumePlugin, Deleter, Detacher, DeviceMountableVolumePlugin,
    DeviceMounter, DeviceUnmounter, ExpandableVolumePlugin, Mounter, PersistentVolumePlugin, ProvisionableVolumePlugin,
    Provisioner, Spec, Unmounter, VolumeError, VolumeHost, VolumeOptions, VolumePlugin, VolumePluginWithAttachLimits,
    VolumeResult,
};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

pub const PLUGIN_NAME: &str = "kubernetes.io/aws-ebs";

const AWS_URL_NAME_PREFIX: &str = "aws://";

/// Returns the plugins of this module.
pub fn probe_volume_plugins() -> Vec<Box<dyn VolumePlugin>> {
    vec![Box::new(AwsElasticBlockStorePlugin::default())]
}

/// AwsElasticBlockStorePlugin mounts, attaches and provisions EBS volumes.
#[derive(Default)]
pub struct AwsElasticBlockStorePlugin {
    host: Option<Arc<dyn VolumeHost>>,
}

impl AwsElasticBlockStorePlugin {
    fn host(&self) -> VolumeResult<&Arc<dyn VolumeHost>> {
        self.host
            .as_ref()
            .ok_or_else(|| VolumeError::internal(format!("volume plugin {} is not initialized", PLUGIN_NAME)))
    }
}

/// Returns the EBS source of the spec and whether it is mounted read-only.
/// Inline volumes carry their own flag, persistent volumes take the spec's.
pub(crate) fn get_volume_source(spec: &Spec) -> VolumeResult<(&AwsElasticBlockStoreVolumeSource, bool)> {
    if let Some(ebs) = spec
        .volume
        .as_ref()
        .and_then(|v| v.volume_source.aws_elastic_block_store.as_ref())
    {
        return Ok((ebs, ebs.read_only));
    }
    if let Some(ebs) = spec
        .persistent_volume
        .as_ref()
        .and_then(|pv| pv.spec.persistent_volume_source.aws_elastic_block_store.as_ref())
    {
        return Ok((ebs, spec.read_only));
    }
    Err(VolumeError::invalid_spec("spec does not reference an AWS EBS volume type"))
}

fn get_path(host: &dyn VolumeHost, pod_uid: &str, volume_name: &str) -> PathBuf {
    host.pod_volume_dir(pod_uid, PLUGIN_NAME, volume_name)
}

/// Returns the node-wide mount path of a volume. `aws://zone/vol-x` maps to
/// `<plugin dir>/mounts/aws/zone/vol-x`.
pub fn make_global_pd_path(host: &dyn VolumeHost, volume_id: &str) -> PathBuf {
    let name = volume_id.replace("://", "/");
    host.plugin_dir(PLUGIN_NAME)
        .join(MOUNTS_IN_GLOBAL_PD_PATH)
        .join(name)
}

/// Reverses [`make_global_pd_path`].
pub fn get_volume_id_from_global_mount(host: &dyn VolumeHost, global_path: &Path) -> VolumeResult<String> {
    let base_path = host.plugin_dir(PLUGIN_NAME).join(MOUNTS_IN_GLOBAL_PD_PATH);
    let unexpected = || {
        error!("Unexpected mount path: {}", global_path.display());
        VolumeError::internal(format!("unexpected mount path: {}", global_path.display()))
    };
    let rel = global_path.strip_prefix(&base_path).map_err(|_| unexpected())?;
    let rel = rel.to_string_lossy();
    if rel.contains("../") || rel == ".." {
        return Err(unexpected());
    }
    let volume_id = match rel.strip_prefix("aws/") {
        Some(rest) => format!("{}{}", AWS_URL_NAME_PREFIX, rest),
        None => rel.into_owned(),
    };
    info!("Mapping mount dir {} to volumeID {}", global_path.display(), volume_id);
    Ok(volume_id)
}

fn ebs_nitro_regex() -> VolumeResult<Regex> {
    Regex::new(EBS_NITRO_LIMIT_REGEX).map_err(|e| VolumeError::internal(e.to_string()))
}

impl VolumePlugin for AwsElasticBlockStorePlugin {
    fn init(&mut self, host: Arc<dyn VolumeHost>) -> VolumeResult<()> {
        self.host = Some(host);
        Ok(())
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn volume_name(&self, spec: &Spec) -> VolumeResult<String> {
        let (source, _) = get_volume_source(spec)?;
        Ok(source.volume_id.clone())
    }

    fn can_support(&self, spec: &Spec) -> bool {
        get_volume_source(spec).is_ok()
    }

    fn supports_mount_option(&self) -> bool {
        true
    }

    fn supports_bulk_volume_verification(&self) -> bool {
        true
    }

    fn new_mounter(&self, spec: &Spec, pod: &Pod) -> VolumeResult<Box<dyn Mounter>> {
        let host = self.host()?;
        let (ebs, read_only) = get_volume_source(spec)?;
        Ok(Box::new(AwsElasticBlockStoreMounter {
            disk: AwsElasticBlockStore {
                volume_name: spec.name().to_string(),
                pod_uid: pod.metadata.uid.clone(),
                volume_id: ebs.volume_id.clone(),
                mounter: host.mounter(PLUGIN_NAME),
                host: host.clone(),
            },
            read_only,
            mount_options: mount_option_from_spec(spec, &[]),
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<Box<dyn Unmounter>> {
        let host = self.host()?;
        Ok(Box::new(AwsElasticBlockStoreUnmounter {
            disk: AwsElasticBlockStore {
                volume_name: volume_name.to_string(),
                pod_uid: pod_uid.to_string(),
                volume_id: String::new(),
                mounter: host.mounter(PLUGIN_NAME),
                host: host.clone(),
            },
        }))
    }

    fn construct_volume_spec(&self, volume_name: &str, mount_path: &Path) -> VolumeResult<Spec> {
        let host = self.host()?;
        let mounter = host.mounter(PLUGIN_NAME);
        let plugin_dir = host.plugin_dir(PLUGIN_NAME);
        let volume_id = mounter.get_device_name_from_mount(mount_path, &plugin_dir)?;

        // The global mount path drops the "://" of the volume id:
        //   aws:///vol-1234           -> aws/vol-1234
        //   aws://us-east-1/vol-1234  -> aws/us-east-1/vol-1234
        let mut source_name = volume_id.clone();
        if volume_id.starts_with("aws/") {
            let names: Vec<&str> = volume_id.split('/').collect();
            let length = names.len();
            if !(2..=3).contains(&length) {
                return Err(VolumeError::invalid_spec(format!(
                    "failed to get AWS volume id from mount path {:?}: invalid volume name format {:?}",
                    mount_path.display().to_string(),
                    volume_id
                )));
            }
            let vol_name = names[length - 1];
            if !vol_name.starts_with("vol-") {
                return Err(VolumeError::invalid_spec(format!(
                    "invalid volume name format for AWS volume ({:?}) retrieved from mount path {:?}",
                    vol_name,
                    mount_path.display().to_string()
                )));
            }
            source_name = if length == 2 {
                format!("{}/{}", AWS_URL_NAME_PREFIX, vol_name)
            } else {
                format!("{}{}/{}", AWS_URL_NAME_PREFIX, names[1], vol_name)
            };
            debug!("Convert aws volume name from {:?} to {:?}", volume_id, source_name);
        }

        Ok(Spec::from_volume(Volume::new(
            volume_name,
            VolumeSource {
                aws_elastic_block_store: Some(AwsElasticBlockStoreVolumeSource {
                    volume_id: source_name,
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

impl PersistentVolumePlugin for AwsElasticBlockStorePlugin {
    fn access_modes(&self) -> Vec<PersistentVolumeAccessMode> {
        vec![PersistentVolumeAccessMode::ReadWriteOnce]
    }
}

impl AttachableVolumePlugin for AwsElasticBlockStorePlugin {
    fn new_attacher(&self) -> VolumeResult<Box<dyn Attacher>> {
        Ok(Box::new(AwsElasticBlockStoreAttacher::new(self.host()?.clone())?))
    }

    fn new_detacher(&self) -> VolumeResult<Box<dyn Detacher>> {
        Ok(Box::new(AwsElasticBlockStoreDetacher::new(self.host()?.clone())?))
    }
}

impl DeviceMountableVolumePlugin for AwsElasticBlockStorePlugin {
    fn new_device_mounter(&self) -> VolumeResult<Box<dyn DeviceMounter>> {
        Ok(Box::new(AwsElasticBlockStoreAttacher::new(self.host()?.clone())?))
    }

    fn new_device_unmounter(&self) -> VolumeResult<Box<dyn DeviceUnmounter>> {
        Ok(Box::new(AwsElasticBlockStoreDetacher::new(self.host()?.clone())?))
    }

    fn get_device_mount_refs(&self, device_mount_path: &Path) -> VolumeResult<Vec<PathBuf>> {
        let mounter = self.host()?.mounter(PLUGIN_NAME);
        get_mount_refs(mounter.as_ref(), device_mount_path)
    }
}

impl VolumePluginWithAttachLimits for AwsElasticBlockStorePlugin {
    fn volume_limits(&self) -> VolumeResult<HashMap<String, i64>> {
        let host = self.host()?;
        let mut limits = HashMap::from([(EBS_VOLUME_LIMIT_KEY.to_string(), DEFAULT_MAX_EBS_VOLUMES)]);

        // Without a cloud provider the limit is left for an external
        // controller or the admin to set.
        let cloud = host
            .cloud_provider()
            .ok_or_else(|| VolumeError::internal("no cloudprovider present"))?;
        if cloud.provider_name() != aws::PROVIDER_NAME {
            return Err(VolumeError::internal(format!(
                "expected aws cloud, found {}",
                cloud.provider_name()
            )));
        }

        let Some(instances) = cloud.instances() else {
            debug!("Failed to get instances from cloud provider");
            return Ok(limits);
        };
        let instance_type = match instances.instance_type(&host.node_name()) {
            Ok(t) => t,
            Err(_) => {
                error!("Failed to get instance type from AWS cloud provider");
                return Ok(limits);
            }
        };
        if ebs_nitro_regex()?.is_match(&instance_type) {
            limits.insert(EBS_VOLUME_LIMIT_KEY.to_string(), DEFAULT_MAX_EBS_NITRO_VOLUME_LIMIT);
        }
        Ok(limits)
    }

    fn volume_limit_key(&self, _spec: &Spec) -> String {
        EBS_VOLUME_LIMIT_KEY.to_string()
    }
}

impl ProvisionableVolumePlugin for AwsElasticBlockStorePlugin {
    fn new_provisioner(&self, options: VolumeOptions) -> VolumeResult<Box<dyn Provisioner>> {
        Ok(Box::new(AwsElasticBlockStoreProvisioner {
            host: self.host()?.clone(),
            options,
        }))
    }
}

impl DeletableVolumePlugin for AwsElasticBlockStorePlugin {
    fn new_deleter(&self, spec: &Spec) -> VolumeResult<Box<dyn Deleter>> {
        let Some(ebs) = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.aws_elastic_block_store.as_ref())
        else {
            error!("spec.PersistentVolumeSource.AWSElasticBlockStore is nil");
            return Err(VolumeError::invalid_spec(
                "spec.PersistentVolumeSource.AWSElasticBlockStore is nil",
            ));
        };
        Ok(Box::new(AwsElasticBlockStoreDeleter {
            host: self.host()?.clone(),
            volume_id: ebs.volume_id.clone(),
        }))
    }
}

impl ExpandableVolumePlugin for AwsElasticBlockStorePlugin {
    fn expand_volume_device(&self, spec: &Spec, new_size: Quantity, old_size: Quantity) -> VolumeResult<Quantity> {
        let cloud = util::get_cloud_provider(self.host()?.as_ref())?;
        let volumes = util::aws_volumes(cloud.as_ref())?;

        let volume_id = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.aws_elastic_block_store.as_ref())
            .map(|ebs| ebs.volume_id.as_str())
            .unwrap_or_default();
        if volume_id.is_empty() {
            return Err(VolumeError::invalid_spec(format!("invalid volume id for {}", spec.name())));
        }
        Ok(volumes.resize_disk(volume_id, &old_size, &new_size)?)
    }

    fn requires_fs_resize(&self) -> bool {
        true
    }
}

// ============================================================================
// Mounter / Unmounter
// ============================================================================

/// State shared by the mounter and unmounter of one pod volume.
struct AwsElasticBlockStore {
    volume_name: String,
    pod_uid: String,
    volume_id: String,
    mounter: Arc<dyn Interface>,
    host: Arc<dyn VolumeHost>,
}

impl AwsElasticBlockStore {
    fn get_path(&self) -> PathBuf {
        get_path(self.host.as_ref(), &self.pod_uid, &self.volume_name)
    }
}

struct AwsElasticBlockStoreMounter {
    disk: AwsElasticBlockStore,
    read_only: bool,
    mount_options: Vec<String>,
}

impl Mounter for AwsElasticBlockStoreMounter {
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
        let global_pd_path = make_global_pd_path(self.disk.host.as_ref(), &self.disk.volume_id);
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

struct AwsElasticBlockStoreUnmounter {
    disk: AwsElasticBlockStore,
}

impl Unmounter for AwsElasticBlockStoreUnmounter {
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

/// AwsElasticBlockStoreProvisioner creates an EBS volume for a claim.
pub struct AwsElasticBlockStoreProvisioner {
    host: Arc<dyn VolumeHost>,
    options: VolumeOptions,
}

impl Provisioner for AwsElasticBlockStoreProvisioner {
    fn provision(
        &self,
        selected_node: Option<&Node>,
        allowed_topologies: &[TopologySelectorTerm],
    ) -> VolumeResult<PersistentVolume> {
        let supported = vec![PersistentVolumeAccessMode::ReadWriteOnce];
        let pvc = &self.options.pvc;
        if !access_modes_contained_in_all(&supported, &pvc.spec.access_modes) {
            return Err(VolumeError::invalid_argument(format!(
                "invalid AccessModes {:?}: only AccessModes {:?} are supported",
                pvc.spec.access_modes, supported
            )));
        }

        let created = util::create_volume(self.host.as_ref(), &self.options, selected_node, allowed_topologies)
            .inspect_err(|e| error!("Provision failed: {}", e))?;

        let mut fs_type = if created.fs_type.is_empty() {
            "ext4".to_string()
        } else {
            created.fs_type
        };
        let volume_mode = pvc.spec.volume_mode;
        if check_persistent_volume_claim_mode_block(pvc) {
            // Block volumes have no filesystem.
            fs_type = String::new();
        }

        let mut pv = PersistentVolume::new(&self.options.pv_name);
        pv.metadata.annotations.insert(
            VOLUME_DYNAMICALLY_CREATED_BY_KEY.to_string(),
            "aws-ebs-dynamic-provisioner".to_string(),
        );
        pv.spec.persistent_volume_reclaim_policy = self.options.reclaim_policy;
        pv.spec.access_modes = if pvc.spec.access_modes.is_empty() {
            supported
        } else {
            pvc.spec.access_modes.clone()
        };
        pv.spec
            .capacity
            .insert(RESOURCE_STORAGE.to_string(), Quantity::from_gib(created.size_gib));
        pv.spec.volume_mode = volume_mode;
        pv.spec.persistent_volume_source = PersistentVolumeSource {
            aws_elastic_block_store: Some(AwsElasticBlockStoreVolumeSource {
                volume_id: created.volume_id,
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
            requirements.push(NodeSelectorRequirement::in_values(&k, vec![v.clone()]));
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

/// AwsElasticBlockStoreDeleter deletes the EBS volume of a released volume.
pub struct AwsElasticBlockStoreDeleter {
    host: Arc<dyn VolumeHost>,
    volume_id: String,
}

impl Deleter for AwsElasticBlockStoreDeleter {
    fn delete(&self) -> VolumeResult<()> {
        util::delete_volume(self.host.as_ref(), &self.volume_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{PersistentVolumeClaim, ResourceRequirements};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::cloudprovider::CloudProvider;
    use crate::volume::host::testing::new_fake_host;
    use crate::volume::host::FakeVolumeHost;

    fn init_plugin(host: Arc<FakeVolumeHost>) -> AwsElasticBlockStorePlugin {
        let mut plugin = AwsElasticBlockStorePlugin::default();
        plugin.init(host).unwrap();
        plugin
    }

    fn ebs_spec(volume_id: &str, fs_type: &str) -> Spec {
        Spec::from_volume(Volume::new(
            "vol1",
            VolumeSource {
                aws_elastic_block_store: Some(AwsElasticBlockStoreVolumeSource {
                    volume_id: volume_id.to_string(),
                    fs_type: fs_type.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
    }

    fn ebs_pv(volume_id: &str) -> PersistentVolume {
        let mut pv = PersistentVolume::new("pv1");
        pv.spec.persistent_volume_source.aws_elastic_block_store = Some(AwsElasticBlockStoreVolumeSource {
            volume_id: volume_id.to_string(),
            ..Default::default()
        });
        pv
    }

    #[test]
    fn test_can_support() {
        let plugin = AwsElasticBlockStorePlugin::default();
        assert_eq!(plugin.name(), "kubernetes.io/aws-ebs");
        assert!(plugin.can_support(&ebs_spec("vol-1", "")));
        assert!(plugin.can_support(&Spec::from_persistent_volume(ebs_pv("vol-1"), false)));
        assert!(!plugin.can_support(&Spec::from_volume(Volume::new("v", VolumeSource::default()))));
        assert_eq!(
            plugin.access_modes(),
            vec![PersistentVolumeAccessMode::ReadWriteOnce]
        );
    }

    #[test]
    fn test_get_volume_source_read_only() {
        let mut spec = ebs_spec("vol-1", "ext4");
        if let Some(v) = spec.volume.as_mut() {
            v.volume_source.aws_elastic_block_store.as_mut().unwrap().read_only = true;
        }
        assert!(get_volume_source(&spec).unwrap().1);

        let spec = Spec::from_persistent_volume(ebs_pv("vol-1"), true);
        assert!(get_volume_source(&spec).unwrap().1);

        let err = get_volume_source(&Spec::default()).unwrap_err();
        assert_eq!(err.to_string(), "spec does not reference an AWS EBS volume type");
    }

    #[test]
    fn test_mount_and_unmount() {
        let (host, _dir) = new_fake_host(None);
        let plugin = init_plugin(host.clone());
        let mut pod = Pod::new("pod", "ns");
        pod.metadata.uid = "poduid".to_string();

        let mounter = plugin.new_mounter(&ebs_spec("vol-1", "ext4"), &pod).unwrap();
        let path = mounter.get_path();
        assert_eq!(
            path,
            host.kubelet_root_dir()
                .join("pods/poduid/volumes/kubernetes.io~aws-ebs/vol1")
        );
        mounter.set_up(None).unwrap();
        assert!(path.exists());
        let fake = host.fake_mounter();
        let mounts = fake.mount_points();
        assert_eq!(mounts.len(), 1);
        assert_eq!(
            mounts[0].device,
            make_global_pd_path(host.as_ref(), "vol-1").to_string_lossy()
        );

        let unmounter = plugin.new_unmounter("vol1", "poduid").unwrap();
        unmounter.tear_down().unwrap();
        assert!(!path.exists());
        assert!(!fake.is_mounted(&path));
    }

    #[test]
    fn test_global_pd_path() {
        let (host, _dir) = new_fake_host(None);
        let base = host.plugin_dir(PLUGIN_NAME).join("mounts");

        struct TestCase {
            name: &'static str,
            volume_id: &'static str,
            expected_path: &'static str,
        }
        let test_cases = vec![
            TestCase {
                name: "plain id",
                volume_id: "vol-1",
                expected_path: "vol-1",
            },
            TestCase {
                name: "url with zone",
                volume_id: "aws://us-east-1a/vol-1",
                expected_path: "aws/us-east-1a/vol-1",
            },
        ];
        for tc in test_cases {
            let path = make_global_pd_path(host.as_ref(), tc.volume_id);
            assert_eq!(path, base.join(tc.expected_path), "{}: path", tc.name);
            assert_eq!(
                get_volume_id_from_global_mount(host.as_ref(), &path).unwrap(),
                tc.volume_id,
                "{}: volume id",
                tc.name
            );
        }

        let outside = host.plugin_dir(PLUGIN_NAME).join("other/vol-1");
        let err = get_volume_id_from_global_mount(host.as_ref(), &outside).unwrap_err();
        assert_eq!(err.to_string(), format!("unexpected mount path: {}", outside.display()));
    }

    #[test]
    fn test_construct_volume_spec() {
        let (host, _dir) = new_fake_host(None);
        let plugin = init_plugin(host.clone());
        let fake = host.fake_mounter();

        let global = make_global_pd_path(host.as_ref(), "aws://us-east-1a/vol-1");
        let pod_path = host.pod_volume_dir("uid", PLUGIN_NAME, "vol1");
        fake.mount("/dev/xvdf", &global, "ext4", &[]).unwrap();
        fake.mount(&global.to_string_lossy(), &pod_path, "", &["bind".to_string()])
            .unwrap();

        let spec = plugin.construct_volume_spec("vol1", &pod_path).unwrap();
        assert_eq!(spec.name(), "vol1");
        assert_eq!(get_volume_source(&spec).unwrap().0.volume_id, "aws://us-east-1a/vol-1");

        let bad_global = make_global_pd_path(host.as_ref(), "aws://us-east-1a/disk-1");
        let bad_pod_path = host.pod_volume_dir("uid", PLUGIN_NAME, "vol2");
        fake.mount("/dev/xvdg", &bad_global, "ext4", &[]).unwrap();
        fake.mount(&bad_global.to_string_lossy(), &bad_pod_path, "", &["bind".to_string()])
            .unwrap();
        let err = plugin.construct_volume_spec("vol2", &bad_pod_path).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("invalid volume name format for AWS volume (\"disk-1\")"));
    }

    #[test]
    fn test_volume_limits() {
        struct TestCase {
            name: &'static str,
            cloud: Option<&'static str>,
            instance_type: Option<&'static str>,
            expected: Result<i64, &'static str>,
        }
        let test_cases = vec![
            TestCase {
                name: "no cloud",
                cloud: None,
                instance_type: None,
                expected: Err("no cloudprovider present"),
            },
            TestCase {
                name: "other cloud",
                cloud: Some("gce"),
                instance_type: None,
                expected: Err("expected aws cloud, found gce"),
            },
            TestCase {
                name: "unknown instance type",
                cloud: Some("aws"),
                instance_type: None,
                expected: Ok(DEFAULT_MAX_EBS_VOLUMES),
            },
            TestCase {
                name: "nitro instance",
                cloud: Some("aws"),
                instance_type: Some("m5.large"),
                expected: Ok(DEFAULT_MAX_EBS_NITRO_VOLUME_LIMIT),
            },
            TestCase {
                name: "older instance",
                cloud: Some("aws"),
                instance_type: Some("t2.micro"),
                expected: Ok(DEFAULT_MAX_EBS_VOLUMES),
            },
        ];

        for tc in test_cases {
            let cloud = tc.cloud.map(|name| {
                let cloud = FakeCloud::new(name);
                if let Some(t) = tc.instance_type {
                    cloud.set_instance_type("node", t);
                }
                Arc::new(cloud) as Arc<dyn CloudProvider>
            });
            let (host, _dir) = new_fake_host(cloud);
            let plugin = init_plugin(host);
            match tc.expected {
                Ok(limit) => assert_eq!(
                    plugin.volume_limits().unwrap()[EBS_VOLUME_LIMIT_KEY],
                    limit,
                    "{}: limit",
                    tc.name
                ),
                Err(msg) => assert_eq!(plugin.volume_limits().unwrap_err().to_string(), msg, "{}: error", tc.name),
            }
        }
    }

    #[test]
    fn test_provision_and_delete() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let plugin = init_plugin(host);

        let mut pvc = PersistentVolumeClaim::new("claim", "ns");
        pvc.spec.access_modes = vec![PersistentVolumeAccessMode::ReadWriteOnce];
        pvc.spec.resources = ResourceRequirements {
            requests: [(RESOURCE_STORAGE.to_string(), Quantity::parse("1500Mi").unwrap())].into(),
            ..Default::default()
        };
        let options = VolumeOptions {
            pv_name: "pvc-123".to_string(),
            pvc,
            cluster_name: "kubernetes".to_string(),
            parameters: [("type".to_string(), "io1".to_string())].into(),
            ..Default::default()
        };

        let pv = plugin
            .new_provisioner(options)
            .unwrap()
            .provision(None, &[])
            .unwrap();
        let ebs = pv.spec.persistent_volume_source.aws_elastic_block_store.clone().unwrap();
        assert!(ebs.volume_id.starts_with("aws://zone-a/vol-"));
        assert_eq!(ebs.fs_type, "ext4");
        assert_eq!(pv.spec.capacity[RESOURCE_STORAGE].to_string(), "2Gi");
        assert_eq!(
            pv.metadata.annotations[VOLUME_DYNAMICALLY_CREATED_BY_KEY],
            "aws-ebs-dynamic-provisioner"
        );
        assert_eq!(pv.metadata.labels.len(), 2);
        let terms = &pv.spec.node_affinity.as_ref().unwrap().required.as_ref().unwrap().node_selector_terms;
        assert_eq!(terms[0].match_expressions.len(), 2);
        assert_eq!(cloud.aws_volume_options()[0].volume_type, "io1");
        assert_eq!(cloud.aws_volume_options()[0].capacity_gib, 2);

        let spec = Spec::from_persistent_volume(pv, false);
        plugin.new_deleter(&spec).unwrap().delete().unwrap();
        assert!(cloud.disks().is_empty());
    }

    #[test]
    fn test_provision_rejects_access_modes() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        let (host, _dir) = new_fake_host(Some(cloud));
        let plugin = init_plugin(host);
        let mut pvc = PersistentVolumeClaim::new("claim", "ns");
        pvc.spec.access_modes = vec![PersistentVolumeAccessMode::ReadWriteMany];
        let options = VolumeOptions {
            pvc,
            ..Default::default()
        };
        let err = plugin
            .new_provisioner(options)
            .unwrap()
            .provision(None, &[])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid AccessModes [ReadWriteMany]: only AccessModes [ReadWriteOnce] are supported"
        );
    }

    #[test]
    fn test_new_deleter_requires_ebs() {
        let (host, _dir) = new_fake_host(None);
        let plugin = init_plugin(host);
        let err = plugin
            .new_deleter(&Spec::from_persistent_volume(PersistentVolume::new("pv"), false))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "spec.PersistentVolumeSource.AWSElasticBlockStore is nil");
    }

    #[test]
    fn test_expand_volume_device() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        cloud.add_disk("vol-1", 1);
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let plugin = init_plugin(host);

        let spec = Spec::from_persistent_volume(ebs_pv("vol-1"), false);
        let new_size = plugin
            .expand_volume_device(&spec, Quantity::parse("3Gi").unwrap(), Quantity::parse("1Gi").unwrap())
            .unwrap();
        assert_eq!(new_size.to_string(), "3Gi");
        assert_eq!(cloud.disks()["vol-1"], 3);
        assert!(plugin.requires_fs_resize());

        let spec = Spec::from_persistent_volume(ebs_pv(""), false);
        assert!(plugin
            .expand_volume_device(&spec, Quantity::parse("3Gi").unwrap(), Quantity::parse("1Gi").unwrap())
            .is_err());
    }
}
