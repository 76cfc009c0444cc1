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

//! API server client interfaces.
//!
//! Every component talks to the API server through the narrow traits in this
//! module. [`fake::FakeClientset`] implements all of them in memory.

pub mod fake;
pub mod record;

use crate::api::core::{DaemonSet, Node, Pod, Secret, Service};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Read;
use thiserror::Error;

/// Result type for API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// ApiError is a status error returned by the API server.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// The object does not exist. `kind` is the plural resource, e.g. "pods".
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    /// The object was modified since it was read.
    #[error("{0}")]
    Conflict(String),

    /// The request was throttled, e.g. an eviction blocked by a disruption budget.
    #[error("{0}")]
    TooManyRequests(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        ApiError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError::Conflict(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        ApiError::Other(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }

    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, ApiError::TooManyRequests(_))
    }
}

/// PodLogOptions is the query for a pod log stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodLogOptions {
    pub container: String,
    pub follow: bool,
    pub previous: bool,
    pub timestamps: bool,
    pub since_seconds: Option<i64>,
    pub since_time: Option<DateTime<Utc>>,
    pub limit_bytes: Option<i64>,
    pub tail_lines: Option<i64>,
}

pub trait NodeClient: Send + Sync {
    fn get_node(&self, name: &str) -> ApiResult<Node>;

    fn list_nodes(&self) -> ApiResult<Vec<Node>>;

    /// Patch `spec.unschedulable` and return the updated node.
    fn patch_node_unschedulable(&self, name: &str, unschedulable: bool) -> ApiResult<Node>;
}

pub trait PodClient: Send + Sync {
    fn get_pod(&self, namespace: &str, name: &str) -> ApiResult<Pod>;

    /// List the pods in `namespace` whose labels contain every selector pair.
    /// An empty namespace lists all namespaces.
    fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> ApiResult<Vec<Pod>>;

    /// List the pods of every namespace that are bound to `node_name`.
    fn list_pods_on_node(&self, node_name: &str) -> ApiResult<Vec<Pod>>;

    fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: Option<i64>) -> ApiResult<()>;

    /// Create an eviction for the pod. Returns `TooManyRequests` when a
    /// disruption budget blocks it.
    fn evict_pod(&self, namespace: &str, name: &str, grace_period_seconds: Option<i64>) -> ApiResult<()>;
}

pub trait ServiceClient: Send + Sync {
    fn get_service(&self, namespace: &str, name: &str) -> ApiResult<Service>;

    fn list_services(&self) -> ApiResult<Vec<Service>>;

    /// Write the service's status subresource.
    fn update_service_status(&self, service: &Service) -> ApiResult<Service>;
}

pub trait SecretClient: Send + Sync {
    fn get_secret(&self, namespace: &str, name: &str) -> ApiResult<Secret>;

    fn create_secret(&self, secret: &Secret) -> ApiResult<Secret>;

    fn delete_secret(&self, namespace: &str, name: &str) -> ApiResult<()>;
}

pub trait DaemonSetClient: Send + Sync {
    fn get_daemon_set(&self, namespace: &str, name: &str) -> ApiResult<DaemonSet>;
}

pub trait LogsClient: Send + Sync {
    /// Open the log stream of a pod container.
    fn stream_logs(&self, namespace: &str, pod: &str, options: &PodLogOptions) -> ApiResult<Box<dyn Read + Send>>;
}
