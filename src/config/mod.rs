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

//! Node agent configuration.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_ROOT_DIR: &str = "/var/lib/kubelet";
pub const DEFAULT_CLUSTER_NAME: &str = "kubernetes";
pub const DEFAULT_CNI_CONF_DIR: &str = "/etc/cni/net.d";
pub const DEFAULT_CNI_BIN_DIR: &str = "/opt/cni/bin";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read node configuration: {0}")]
    Io(#[from] io::Error),

    #[error("failed to decode node configuration: {0}")]
    Decode(#[from] serde_yaml::Error),
}

/// NodeConfig holds the settings shared by the node components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub root_dir: PathBuf,
    pub node_name: String,
    pub host_name: String,
    pub cluster_name: String,
    pub cni_conf_dir: PathBuf,
    pub cni_bin_dirs: Vec<PathBuf>,
    /// Name of the cloud provider, empty for none.
    pub cloud_provider: String,
    pub flex_volume_plugin_dir: Option<PathBuf>,
    pub cert_dir: PathBuf,
    pub kubeconfig: PathBuf,
    pub bootstrap_kubeconfig: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let root_dir = PathBuf::from(DEFAULT_ROOT_DIR);
        Self {
            cert_dir: root_dir.join("pki"),
            root_dir,
            node_name: String::new(),
            host_name: String::new(),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            cni_conf_dir: PathBuf::from(DEFAULT_CNI_CONF_DIR),
            cni_bin_dirs: vec![PathBuf::from(DEFAULT_CNI_BIN_DIR)],
            cloud_provider: String::new(),
            flex_volume_plugin_dir: None,
            kubeconfig: PathBuf::new(),
            bootstrap_kubeconfig: PathBuf::new(),
        }
    }
}

impl NodeConfig {
    /// Load the configuration from YAML. With no reader the defaults are used.
    pub fn from_reader(config: Option<&mut dyn Read>) -> ConfigResult<Self> {
        let Some(reader) = config else {
            return Ok(Self::default());
        };
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut cfg: NodeConfig = serde_yaml::from_str(&content)?;
        if cfg.host_name.is_empty() {
            cfg.host_name = cfg.node_name.clone();
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_reader() {
        struct TestCase {
            name: &'static str,
            input: Option<&'static str>,
            expected_root: &'static str,
            expected_node: &'static str,
            expected_host: &'static str,
            expected_cluster: &'static str,
        }

        let test_cases = vec![
            TestCase {
                name: "no reader",
                input: None,
                expected_root: DEFAULT_ROOT_DIR,
                expected_node: "",
                expected_host: "",
                expected_cluster: "kubernetes",
            },
            TestCase {
                name: "partial config keeps defaults",
                input: Some("nodeName: node-1\n"),
                expected_root: DEFAULT_ROOT_DIR,
                expected_node: "node-1",
                expected_host: "node-1",
                expected_cluster: "kubernetes",
            },
            TestCase {
                name: "full override",
                input: Some("rootDir: /tmp/kubelet\nnodeName: n\nhostName: h\nclusterName: prod\n"),
                expected_root: "/tmp/kubelet",
                expected_node: "n",
                expected_host: "h",
                expected_cluster: "prod",
            },
        ];

        for tc in test_cases {
            let cfg = match tc.input {
                Some(s) => {
                    let mut reader = s.as_bytes();
                    NodeConfig::from_reader(Some(&mut reader)).unwrap()
                }
                None => NodeConfig::from_reader(None).unwrap(),
            };
            assert_eq!(cfg.root_dir, PathBuf::from(tc.expected_root), "{}: root dir", tc.name);
            assert_eq!(cfg.node_name, tc.expected_node, "{}: node name", tc.name);
            assert_eq!(cfg.host_name, tc.expected_host, "{}: host name", tc.name);
            assert_eq!(cfg.cluster_name, tc.expected_cluster, "{}: cluster name", tc.name);
        }
    }

    #[test]
    fn test_from_reader_invalid() {
        let mut reader = "rootDir: [".as_bytes();
        let err = NodeConfig::from_reader(Some(&mut reader)).unwrap_err();
        assert!(err.to_string().starts_with("failed to decode node configuration"));
    }
}
