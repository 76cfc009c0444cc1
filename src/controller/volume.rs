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

//! Volume host for the persistent volume controller.
//!
//! The controller only provisions and deletes volumes, so it has no local
//! directories and never mounts anything.

use crate::client::SecretClient;
use crate::cloudprovider::CloudProvider;
use crate::mount::{Exec, ExecError, Interface, MountPoint, MountResult};
use crate::volume::{VolumeError, VolumeHost, VolumeResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// NoopMounter accepts every call and reports an empty mount table.
#[derive(Debug, Default)]
pub struct NoopMounter;

impl Interface for NoopMounter {
    fn mount(&self, source: &str, target: &Path, _fstype: &str, _options: &[String]) -> MountResult<()> {
        debug!("Ignoring mount of {} at {}", source, target.display());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> MountResult<()> {
        debug!("Ignoring unmount of {}", target.display());
        Ok(())
    }

    fn list(&self) -> MountResult<Vec<MountPoint>> {
        Ok(Vec::new())
    }

    fn is_likely_not_mount_point(&self, _file: &Path) -> MountResult<bool> {
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct NoopExec;

impl Exec for NoopExec {
    fn run(&self, cmd: &str, _args: &[String]) -> Result<Vec<u8>, ExecError> {
        debug!("Ignoring exec of {}", cmd);
        Ok(Vec::new())
    }
}

/// PersistentVolumeControllerHost is the [`VolumeHost`] handed to plugins
/// by the persistent volume controller.
pub struct PersistentVolumeControllerHost {
    cloud: Option<Arc<dyn CloudProvider>>,
    client: Arc<dyn SecretClient>,
    node_name: String,
    mounter: Arc<NoopMounter>,
    exec: Arc<NoopExec>,
}

impl PersistentVolumeControllerHost {
    pub fn new(client: Arc<dyn SecretClient>, cloud: Option<Arc<dyn CloudProvider>>) -> Self {
        Self {
            cloud,
            client,
            node_name: String::new(),
            mounter: Arc::new(NoopMounter),
            exec: Arc::new(NoopExec),
        }
    }

    pub fn with_node_name(mut self, node_name: &str) -> Self {
        self.node_name = node_name.to_string();
        self
    }
}

impl VolumeHost for PersistentVolumeControllerHost {
    fn plugin_dir(&self, _plugin_name: &str) -> PathBuf {
        PathBuf::new()
    }

    fn pod_volume_dir(&self, _pod_uid: &str, _plugin_name: &str, _volume_name: &str) -> PathBuf {
        PathBuf::new()
    }

    fn pod_plugin_dir(&self, _pod_uid: &str, _plugin_name: &str) -> PathBuf {
        PathBuf::new()
    }

    fn kubelet_root_dir(&self) -> PathBuf {
        PathBuf::new()
    }

    fn mounter(&self, _plugin_name: &str) -> Arc<dyn Interface> {
        self.mounter.clone()
    }

    fn exec(&self, _plugin_name: &str) -> Arc<dyn Exec> {
        self.exec.clone()
    }

    fn cloud_provider(&self) -> Option<Arc<dyn CloudProvider>> {
        self.cloud.clone()
    }

    fn node_name(&self) -> String {
        self.node_name.clone()
    }

    fn host_name(&self) -> String {
        String::new()
    }

    fn node_labels(&self) -> VolumeResult<HashMap<String, String>> {
        Err(VolumeError::internal("unsupported in PersistentVolumeController"))
    }

    fn secret_client(&self) -> Option<Arc<dyn SecretClient>> {
        Some(self.client.clone())
    }
}
