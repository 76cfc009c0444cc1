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

//! Pod network plugins.

pub mod bandwidth;
pub mod cni;

use crate::api::core::Protocol;
use crate::api::resource::ResourceError;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Event sent when the node's pod CIDR is assigned.
pub const NET_PLUGIN_EVENT_POD_CIDR_CHANGE: &str = "pod-cidr-change";
/// Detail key carrying the CIDR of a [`NET_PLUGIN_EVENT_POD_CIDR_CHANGE`].
pub const NET_PLUGIN_EVENT_POD_CIDR_CHANGE_DETAIL_CIDR: &str = "pod-cidr";

/// Interface name inside the pod sandbox.
pub const DEFAULT_INTERFACE_NAME: &str = "eth0";

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{0}")]
    Plugin(String),

    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("error parsing configuration from {}: {source}", path.display())]
    Config { path: PathBuf, source: serde_json::Error },

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl NetworkError {
    pub fn plugin(msg: impl Into<String>) -> Self {
        NetworkError::Plugin(msg.into())
    }
}

/// PortMapping is a host port forwarded into a pod sandbox.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub container_port: i32,
    pub host_port: i32,
    pub host_ip: String,
}

/// PodNetworkStatus is the network state of a pod sandbox.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodNetworkStatus {
    pub ip: String,
}

/// Host is the runtime side a network plugin calls back into.
pub trait Host: Send + Sync {
    /// Returns the network namespace path of a sandbox.
    fn get_net_ns(&self, container_id: &str) -> NetworkResult<String>;

    fn get_pod_port_mappings(&self, container_id: &str) -> NetworkResult<Vec<PortMapping>>;
}

/// NetworkPlugin sets up and tears down pod networking.
pub trait NetworkPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Handle a runtime event, such as a pod CIDR assignment.
    fn event(&self, name: &str, details: &HashMap<String, String>);

    /// Returns an error when the plugin cannot set up pods yet.
    fn status(&self) -> NetworkResult<()>;

    fn set_up_pod(
        &self,
        namespace: &str,
        name: &str,
        container_id: &str,
        annotations: &HashMap<String, String>,
    ) -> NetworkResult<()>;

    fn tear_down_pod(&self, namespace: &str, name: &str, container_id: &str) -> NetworkResult<()>;

    fn get_pod_network_status(&self, namespace: &str, name: &str, container_id: &str)
        -> NetworkResult<PodNetworkStatus>;
}
