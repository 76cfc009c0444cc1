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

//! Volume plugin framework.
//!
//! A volume plugin translates a [`Spec`] into mounts on the node, and
//! optionally into attach/detach and provision/delete calls against a cloud.
//! Optional capabilities are exposed through the `as_*` accessors on
//! [`VolumePlugin`].

pub mod errors;
pub mod host;
pub mod ownership;
pub mod plugins;
pub mod util;

pub mod awsebs;
pub mod azure_dd;
pub mod azure_file;
pub mod flexvolume;
pub mod gcepd;
pub mod photon_pd;

pub use errors::{VolumeError, VolumeResult};
pub use host::{escape_qualified_name, KubeletVolumeHost, VolumeHost};
pub use ownership::set_volume_ownership;
pub use plugins::VolumePluginMgr;

use crate::api::core::{
    Node, PersistentVolume, PersistentVolumeAccessMode, PersistentVolumeClaim,
    PersistentVolumeReclaimPolicy, Pod, TopologySelectorTerm, Volume,
};
use crate::api::resource::Quantity;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Name used for a persistent volume that is still being provisioned.
pub const PROVISIONED_VOLUME_NAME: &str = "placeholder-for-provisioning";

/// Spec is an internal representation of a volume. All API volume types
/// translate to Spec.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Spec {
    pub volume: Option<Volume>,
    pub persistent_volume: Option<PersistentVolume>,
    pub read_only: bool,
}

impl Spec {
    /// Create a Spec from an inline pod volume.
    pub fn from_volume(volume: Volume) -> Self {
        Self {
            volume: Some(volume),
            persistent_volume: None,
            read_only: false,
        }
    }

    /// Create a Spec from a persistent volume.
    pub fn from_persistent_volume(pv: PersistentVolume, read_only: bool) -> Self {
        Self {
            volume: None,
            persistent_volume: Some(pv),
            read_only,
        }
    }

    /// Returns the name of the underlying volume object.
    pub fn name(&self) -> &str {
        if let Some(volume) = &self.volume {
            return &volume.name;
        }
        if let Some(pv) = &self.persistent_volume {
            return &pv.metadata.name;
        }
        ""
    }
}

/// VolumeOptions contains option information about a volume being provisioned.
#[derive(Debug, Clone, Default)]
pub struct VolumeOptions {
    /// Name of the persistent volume to create.
    pub pv_name: String,
    /// Claim the volume is provisioned for.
    pub pvc: PersistentVolumeClaim,
    pub cluster_name: String,
    pub reclaim_policy: PersistentVolumeReclaimPolicy,
    pub mount_options: Vec<String>,
    /// Storage class parameters.
    pub parameters: HashMap<String, String>,
    /// Tags to attach to the real volume in the cloud provider.
    pub cloud_tags: HashMap<String, String>,
}

/// Attributes represents the attributes of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes {
    pub read_only: bool,
    /// The volume's ownership should be managed by the kubelet.
    pub managed: bool,
    pub supports_selinux: bool,
}

/// VolumePlugin is the interface every volume plugin implements.
pub trait VolumePlugin: Send + Sync {
    /// Initialize the plugin with its host. Called once before any other method.
    fn init(&mut self, host: Arc<dyn VolumeHost>) -> VolumeResult<()>;

    /// Returns the plugin's name, e.g. "kubernetes.io/aws-ebs".
    fn name(&self) -> &str;

    /// Returns the name that uniquely identifies the volume within this plugin.
    fn volume_name(&self, spec: &Spec) -> VolumeResult<String>;

    fn can_support(&self, spec: &Spec) -> bool;

    fn requires_remount(&self) -> bool {
        false
    }

    fn supports_mount_option(&self) -> bool;

    fn supports_bulk_volume_verification(&self) -> bool;

    fn new_mounter(&self, spec: &Spec, pod: &Pod) -> VolumeResult<Box<dyn Mounter>>;

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<Box<dyn Unmounter>>;

    /// Rebuild a Spec from what is left on the node after a restart.
    fn construct_volume_spec(&self, volume_name: &str, mount_path: &Path) -> VolumeResult<Spec>;

    fn as_persistent(&self) -> Option<&dyn PersistentVolumePlugin> {
        None
    }

    fn as_attachable(&self) -> Option<&dyn AttachableVolumePlugin> {
        None
    }

    fn as_device_mountable(&self) -> Option<&dyn DeviceMountableVolumePlugin> {
        None
    }

    fn as_provisionable(&self) -> Option<&dyn ProvisionableVolumePlugin> {
        None
    }

    fn as_deletable(&self) -> Option<&dyn DeletableVolumePlugin> {
        None
    }

    fn as_expandable(&self) -> Option<&dyn ExpandableVolumePlugin> {
        None
    }

    fn as_attach_limited(&self) -> Option<&dyn VolumePluginWithAttachLimits> {
        None
    }
}

/// PersistentVolumePlugin can back persistent volumes.
pub trait PersistentVolumePlugin: VolumePlugin {
    fn access_modes(&self) -> Vec<PersistentVolumeAccessMode>;
}

/// AttachableVolumePlugin needs attaching to a node before it can be mounted.
pub trait AttachableVolumePlugin: VolumePlugin {
    fn new_attacher(&self) -> VolumeResult<Box<dyn Attacher>>;
    fn new_detacher(&self) -> VolumeResult<Box<dyn Detacher>>;
}

/// DeviceMountableVolumePlugin mounts a device at a global path before
/// bind mounting it into pods.
pub trait DeviceMountableVolumePlugin: VolumePlugin {
    fn new_device_mounter(&self) -> VolumeResult<Box<dyn DeviceMounter>>;
    fn new_device_unmounter(&self) -> VolumeResult<Box<dyn DeviceUnmounter>>;
    fn get_device_mount_refs(&self, device_mount_path: &Path) -> VolumeResult<Vec<PathBuf>>;
}

/// ProvisionableVolumePlugin can create new backing volumes.
pub trait ProvisionableVolumePlugin: VolumePlugin {
    fn new_provisioner(&self, options: VolumeOptions) -> VolumeResult<Box<dyn Provisioner>>;
}

/// DeletableVolumePlugin can delete backing volumes.
pub trait DeletableVolumePlugin: VolumePlugin {
    fn new_deleter(&self, spec: &Spec) -> VolumeResult<Box<dyn Deleter>>;
}

/// ExpandableVolumePlugin can grow backing volumes.
pub trait ExpandableVolumePlugin: VolumePlugin {
    /// Grow the device and return the new size as understood by the cloud.
    fn expand_volume_device(&self, spec: &Spec, new_size: Quantity, old_size: Quantity) -> VolumeResult<Quantity>;

    /// True if the filesystem must be resized after the device is expanded.
    fn requires_fs_resize(&self) -> bool;
}

/// VolumePluginWithAttachLimits reports how many volumes a node can attach.
pub trait VolumePluginWithAttachLimits: VolumePlugin {
    fn volume_limits(&self) -> VolumeResult<HashMap<String, i64>>;
    fn volume_limit_key(&self, spec: &Spec) -> String;
}

/// Mounter sets up a volume in a pod directory.
pub trait Mounter: Send {
    /// Returns the pod directory the volume is mounted at.
    fn get_path(&self) -> PathBuf;

    fn attributes(&self) -> Attributes;

    /// Checks that the node has what is needed to mount the volume.
    fn can_mount(&self) -> VolumeResult<()> {
        Ok(())
    }

    fn set_up(&self, fs_group: Option<i64>) -> VolumeResult<()> {
        self.set_up_at(&self.get_path(), fs_group)
    }

    fn set_up_at(&self, dir: &Path, fs_group: Option<i64>) -> VolumeResult<()>;
}

/// Unmounter tears down a volume from a pod directory.
pub trait Unmounter: Send {
    fn get_path(&self) -> PathBuf;

    fn tear_down(&self) -> VolumeResult<()> {
        self.tear_down_at(&self.get_path())
    }

    fn tear_down_at(&self, dir: &Path) -> VolumeResult<()>;
}

/// DeviceMounter mounts an attached device at a global, per-node path.
pub trait DeviceMounter: Send {
    fn get_device_mount_path(&self, spec: &Spec) -> VolumeResult<PathBuf>;

    fn mount_device(&self, spec: &Spec, device_path: &str, device_mount_path: &Path) -> VolumeResult<()>;
}

/// Attacher attaches a volume to a node.
pub trait Attacher: DeviceMounter {
    /// Attach the volume and return the device path where it will appear.
    fn attach(&self, spec: &Spec, node_name: &str) -> VolumeResult<String>;

    /// Returns, per spec name, whether the volume is still attached.
    fn volumes_are_attached(&self, specs: &[Spec], node_name: &str) -> VolumeResult<HashMap<String, bool>>;

    /// Wait until the device shows up on the node and return its path.
    fn wait_for_attach(
        &self,
        spec: &Spec,
        device_path: &str,
        pod: Option<&Pod>,
        timeout: Duration,
    ) -> VolumeResult<String>;
}

/// DeviceUnmounter unmounts the global device mount.
pub trait DeviceUnmounter: Send {
    fn unmount_device(&self, device_mount_path: &Path) -> VolumeResult<()>;
}

/// Detacher detaches a volume from a node.
pub trait Detacher: DeviceUnmounter {
    fn detach(&self, volume_name: &str, node_name: &str) -> VolumeResult<()>;
}

/// Provisioner creates a new backing volume and its PersistentVolume object.
pub trait Provisioner: Send {
    fn provision(
        &self,
        selected_node: Option<&Node>,
        allowed_topologies: &[TopologySelectorTerm],
    ) -> VolumeResult<PersistentVolume>;
}

/// Deleter removes a backing volume.
pub trait Deleter: Send {
    fn delete(&self) -> VolumeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::VolumeSource;

    #[test]
    fn test_spec_name() {
        let spec = Spec::from_volume(Volume::new("vol1", VolumeSource::default()));
        assert_eq!(spec.name(), "vol1");

        let spec = Spec::from_persistent_volume(PersistentVolume::new("pv1"), true);
        assert_eq!(spec.name(), "pv1");
        assert!(spec.read_only);

        assert_eq!(Spec::default().name(), "");
    }
}
