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

//! The environment volume plugins run in.

use super::{VolumeError, VolumeResult};
use crate::api::core::Secret;
use crate::client::fake::FakeClientset;
use crate::client::SecretClient;
use crate::cloudprovider::CloudProvider;
use crate::config::NodeConfig;
use crate::mount::{Exec, FakeExec, FakeMounter, Interface};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Replace `/` in a qualified plugin name so it can be used as a directory name.
pub fn escape_qualified_name(name: &str) -> String {
    name.replace('/', "~")
}

/// VolumeHost is the interface plugins use to access the node agent.
pub trait VolumeHost: Send + Sync {
    /// Returns the directory a plugin keeps its global state in.
    fn plugin_dir(&self, plugin_name: &str) -> PathBuf;

    /// Returns the directory a volume of a pod is mounted at.
    fn pod_volume_dir(&self, pod_uid: &str, plugin_name: &str, volume_name: &str) -> PathBuf;

    /// Returns the per-pod directory of a plugin.
    fn pod_plugin_dir(&self, pod_uid: &str, plugin_name: &str) -> PathBuf;

    fn kubelet_root_dir(&self) -> PathBuf;

    fn mounter(&self, plugin_name: &str) -> Arc<dyn Interface>;

    fn exec(&self, plugin_name: &str) -> Arc<dyn Exec>;

    fn cloud_provider(&self) -> Option<Arc<dyn CloudProvider>>;

    fn node_name(&self) -> String;

    fn host_name(&self) -> String;

    fn node_labels(&self) -> VolumeResult<HashMap<String, String>>;

    fn secret_client(&self) -> Option<Arc<dyn SecretClient>>;

    fn get_secret(&self, namespace: &str, name: &str) -> VolumeResult<Secret> {
        let client = self
            .secret_client()
            .ok_or_else(|| VolumeError::internal("cannot get kube client"))?;
        Ok(client.get_secret(namespace, name)?)
    }

    fn create_secret(&self, secret: &Secret) -> VolumeResult<Secret> {
        let client = self
            .secret_client()
            .ok_or_else(|| VolumeError::internal("cannot get kube client"))?;
        Ok(client.create_secret(secret)?)
    }

    fn delete_secret(&self, namespace: &str, name: &str) -> VolumeResult<()> {
        let client = self
            .secret_client()
            .ok_or_else(|| VolumeError::internal("cannot get kube client"))?;
        Ok(client.delete_secret(namespace, name)?)
    }
}

/// KubeletVolumeHost lays plugin state out under the kubelet root directory.
pub struct KubeletVolumeHost {
    root_dir: PathBuf,
    node_name: String,
    host_name: String,
    node_labels: RwLock<HashMap<String, String>>,
    mounter: Arc<dyn Interface>,
    exec: Arc<dyn Exec>,
    cloud: Option<Arc<dyn CloudProvider>>,
    secrets: Option<Arc<dyn SecretClient>>,
}

impl KubeletVolumeHost {
    pub fn new(config: &NodeConfig, mounter: Arc<dyn Interface>, exec: Arc<dyn Exec>) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            node_name: config.node_name.clone(),
            host_name: config.host_name.clone(),
            node_labels: RwLock::new(HashMap::new()),
            mounter,
            exec,
            cloud: None,
            secrets: None,
        }
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_secret_client(mut self, client: Arc<dyn SecretClient>) -> Self {
        self.secrets = Some(client);
        self
    }

    /// Replace the labels reported for this node.
    pub fn set_node_labels(&self, labels: HashMap<String, String>) {
        *self.node_labels.write().unwrap() = labels;
    }
}

fn plugin_dir_under(root: &Path, plugin_name: &str) -> PathBuf {
    root.join("plugins").join(escape_qualified_name(plugin_name))
}

fn pod_volume_dir_under(root: &Path, pod_uid: &str, plugin_name: &str, volume_name: &str) -> PathBuf {
    root.join("pods")
        .join(pod_uid)
        .join("volumes")
        .join(escape_qualified_name(plugin_name))
        .join(volume_name)
}

fn pod_plugin_dir_under(root: &Path, pod_uid: &str, plugin_name: &str) -> PathBuf {
    root.join("pods")
        .join(pod_uid)
        .join("plugins")
        .join(escape_qualified_name(plugin_name))
}

impl VolumeHost for KubeletVolumeHost {
    fn plugin_dir(&self, plugin_name: &str) -> PathBuf {
        plugin_dir_under(&self.root_dir, plugin_name)
    }

    fn pod_volume_dir(&self, pod_uid: &str, plugin_name: &str, volume_name: &str) -> PathBuf {
        pod_volume_dir_under(&self.root_dir, pod_uid, plugin_name, volume_name)
    }

    fn pod_plugin_dir(&self, pod_uid: &str, plugin_name: &str) -> PathBuf {
        pod_plugin_dir_under(&self.root_dir, pod_uid, plugin_name)
    }

    fn kubelet_root_dir(&self) -> PathBuf {
        self.root_dir.clone()
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
        self.host_name.clone()
    }

    fn node_labels(&self) -> VolumeResult<HashMap<String, String>> {
        Ok(self.node_labels.read().unwrap().clone())
    }

    fn secret_client(&self) -> Option<Arc<dyn SecretClient>> {
        self.secrets.clone()
    }
}

/// FakeVolumeHost is a [`VolumeHost`] over a [`FakeMounter`], a [`FakeExec`]
/// and a [`FakeClientset`], rooted at a caller-provided directory.
pub struct FakeVolumeHost {
    root_dir: PathBuf,
    node_name: String,
    node_labels: HashMap<String, String>,
    mounter: Arc<FakeMounter>,
    exec: Arc<FakeExec>,
    client: Arc<FakeClientset>,
    cloud: Option<Arc<dyn CloudProvider>>,
}

impl FakeVolumeHost {
    pub fn new(root_dir: &Path) -> Self {
        Self {
            root_dir: root_dir.to_path_buf(),
            node_name: "node".to_string(),
            node_labels: HashMap::new(),
            mounter: Arc::new(FakeMounter::new()),
            exec: Arc::new(FakeExec::default()),
            client: Arc::new(FakeClientset::new()),
            cloud: None,
        }
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_exec(mut self, exec: FakeExec) -> Self {
        self.exec = Arc::new(exec);
        self
    }

    pub fn with_node_name(mut self, node_name: &str) -> Self {
        self.node_name = node_name.to_string();
        self
    }

    pub fn with_node_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.node_labels = labels;
        self
    }

    pub fn fake_mounter(&self) -> Arc<FakeMounter> {
        self.mounter.clone()
    }

    pub fn fake_exec(&self) -> Arc<FakeExec> {
        self.exec.clone()
    }

    pub fn client(&self) -> Arc<FakeClientset> {
        self.client.clone()
    }
}

impl VolumeHost for FakeVolumeHost {
    fn plugin_dir(&self, plugin_name: &str) -> PathBuf {
        plugin_dir_under(&self.root_dir, plugin_name)
    }

    fn pod_volume_dir(&self, pod_uid: &str, plugin_name: &str, volume_name: &str) -> PathBuf {
        pod_volume_dir_under(&self.root_dir, pod_uid, plugin_name, volume_name)
    }

    fn pod_plugin_dir(&self, pod_uid: &str, plugin_name: &str) -> PathBuf {
        pod_plugin_dir_under(&self.root_dir, pod_uid, plugin_name)
    }

    fn kubelet_root_dir(&self) -> PathBuf {
        self.root_dir.clone()
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
        self.node_name.clone()
    }

    fn node_labels(&self) -> VolumeResult<HashMap<String, String>> {
        Ok(self.node_labels.clone())
    }

    fn secret_client(&self) -> Option<Arc<dyn SecretClient>> {
        Some(self.client.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::CommandExec;

    #[test]
    fn test_kubelet_volume_host_paths() {
        let config = NodeConfig {
            root_dir: PathBuf::from("/var/lib/kubelet"),
            node_name: "node1".into(),
            ..Default::default()
        };
        let host = KubeletVolumeHost::new(&config, Arc::new(FakeMounter::new()), Arc::new(CommandExec::new()));

        assert_eq!(
            host.plugin_dir("kubernetes.io/aws-ebs"),
            PathBuf::from("/var/lib/kubelet/plugins/kubernetes.io~aws-ebs")
        );
        assert_eq!(
            host.pod_volume_dir("uid1", "kubernetes.io/aws-ebs", "vol1"),
            PathBuf::from("/var/lib/kubelet/pods/uid1/volumes/kubernetes.io~aws-ebs/vol1")
        );
        assert_eq!(
            host.pod_plugin_dir("uid1", "kubernetes.io/azure-file"),
            PathBuf::from("/var/lib/kubelet/pods/uid1/plugins/kubernetes.io~azure-file")
        );
        assert_eq!(host.node_name(), "node1");
        assert!(host.cloud_provider().is_none());
        assert!(host.get_secret("ns", "name").is_err());
    }

    #[test]
    fn test_fake_host_secrets() {
        let (host, _dir) = testing::new_fake_host(None);
        let secret = Secret::new("s", "ns");
        host.create_secret(&secret).unwrap();
        assert_eq!(host.get_secret("ns", "s").unwrap().metadata.name, "s");
        host.delete_secret("ns", "s").unwrap();
        assert!(host.get_secret("ns", "s").is_err());
    }
}
