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

//! Cloud provider interfaces.
//!
//! Vendor SDKs are never called directly. Each provider module defines the
//! trait its volume plugin consumes, and [`CloudProvider`] exposes those
//! capabilities through accessors that default to `None`.

pub mod aws;
pub mod azure;
pub mod fake;
pub mod gce;
pub mod photon;
pub mod vsphere;

use crate::api::core::{LoadBalancerStatus, Node, NodeAddress, Service};
use thiserror::Error;

/// Result type for cloud provider operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// CloudError represents errors returned by cloud providers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CloudError {
    #[error("instance not found")]
    InstanceNotFound,

    #[error("unimplemented")]
    NotImplemented,

    #[error("disk not found: {0}")]
    DiskNotFound(String),

    #[error("{0}")]
    Provider(String),
}

impl CloudError {
    pub fn provider(msg: impl Into<String>) -> Self {
        CloudError::Provider(msg.into())
    }
}

/// Zone describes the failure domain and region of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Zone {
    pub failure_domain: String,
    pub region: String,
}

/// CloudProvider is an abstract, pluggable interface for cloud providers.
pub trait CloudProvider: Send + Sync {
    /// Returns the cloud provider ID, e.g. "aws".
    fn provider_name(&self) -> &str;

    fn instances(&self) -> Option<&dyn Instances> {
        None
    }

    fn load_balancer(&self) -> Option<&dyn LoadBalancer> {
        None
    }

    fn zones(&self) -> Option<&dyn Zones> {
        None
    }

    fn aws_volumes(&self) -> Option<&dyn aws::Volumes> {
        None
    }

    fn gce_disks(&self) -> Option<&dyn gce::Disks> {
        None
    }

    fn azure_disks(&self) -> Option<&dyn azure::DiskController> {
        None
    }

    fn azure_managed_disks(&self) -> Option<&azure::ManagedDiskController> {
        None
    }

    fn azure_files(&self) -> Option<&dyn azure::FileClient> {
        None
    }

    fn photon_disks(&self) -> Option<&dyn photon::Disks> {
        None
    }
}

/// Instances is an abstract interface for querying compute instances.
pub trait Instances: Send + Sync {
    /// Returns the cloud provider ID of the node with the specified name.
    fn instance_id(&self, node_name: &str) -> CloudResult<String>;

    fn instance_type(&self, node_name: &str) -> CloudResult<String>;

    fn node_addresses(&self, node_name: &str) -> CloudResult<Vec<NodeAddress>>;
}

/// LoadBalancer is an abstract interface for managing service load balancers.
pub trait LoadBalancer: Send + Sync {
    /// Returns the status of the load balancer if it exists.
    fn get_load_balancer(&self, cluster_name: &str, service: &Service) -> CloudResult<Option<LoadBalancerStatus>>;

    /// Creates a new load balancer or updates the existing one.
    fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<LoadBalancerStatus>;

    /// Updates the hosts under the load balancer.
    fn update_load_balancer(&self, cluster_name: &str, service: &Service, nodes: &[Node]) -> CloudResult<()>;

    /// Deletes the load balancer if it exists. Must succeed when it does not.
    fn ensure_load_balancer_deleted(&self, cluster_name: &str, service: &Service) -> CloudResult<()>;
}

/// Zones returns the zone of the current instance.
pub trait Zones: Send + Sync {
    fn get_zone(&self) -> CloudResult<Zone>;
}
