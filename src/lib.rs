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

//! Kubernetes node-side components reimplemented in Rust
//!
//! This crate provides the kubelet volume plugins for cloud disks and file
//! shares, a CNI network plugin driver, TLS bootstrapping of the node client
//! certificate, the service load balancer controller and the kubectl
//! drain, logs and TLS secret commands. Cluster and cloud access goes
//! through traits so every component runs against in-memory fakes in tests.

pub mod api;
pub mod certificate;
pub mod client;
pub mod cloudprovider;
pub mod config;
pub mod controller;
pub mod kubectl;
pub mod kubelet;
pub mod mount;
pub mod network;
pub mod volume;

// Re-export commonly used types
pub use api::core::{Node, Pod, PodSpec, Secret, Service, Volume};
pub use client::{ApiError, ApiResult};
pub use cloudprovider::CloudProvider;
pub use volume::{VolumeError, VolumeHost, VolumePlugin};
