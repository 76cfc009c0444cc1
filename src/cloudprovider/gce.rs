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

//! GCE persistent disk operations.

use super::CloudResult;
use crate::api::resource::Quantity;
use std::collections::{BTreeSet, HashMap};

/// ProviderName is the name of this cloud provider.
pub const PROVIDER_NAME: &str = "gce";

pub const DISK_TYPE_STANDARD: &str = "pd-standard";
pub const DISK_TYPE_SSD: &str = "pd-ssd";

/// Replication type of a disk replicated across two zones of a region.
pub const REPLICATION_TYPE_REGIONAL_PD: &str = "regional-pd";

/// Disks is an interface for manipulation of GCE persistent disks.
pub trait Disks: Send + Sync {
    /// Attach the disk to the node. `regional` selects a regional disk.
    fn attach_disk(&self, disk_name: &str, node_name: &str, read_only: bool, regional: bool) -> CloudResult<()>;

    fn detach_disk(&self, dev_name: &str, node_name: &str) -> CloudResult<()>;

    fn disk_is_attached(&self, disk_name: &str, node_name: &str) -> CloudResult<bool>;

    /// Batch check of `disk_is_attached`, keyed by disk name.
    fn disks_are_attached(&self, disk_names: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>>;

    fn create_disk(
        &self,
        name: &str,
        disk_type: &str,
        zone: &str,
        size_gb: i64,
        tags: &HashMap<String, String>,
    ) -> CloudResult<()>;

    fn create_regional_disk(
        &self,
        name: &str,
        disk_type: &str,
        replica_zones: &BTreeSet<String>,
        size_gb: i64,
        tags: &HashMap<String, String>,
    ) -> CloudResult<()>;

    fn delete_disk(&self, disk_name: &str) -> CloudResult<()>;

    fn resize_disk(&self, disk_name: &str, old_size: &Quantity, new_size: &Quantity) -> CloudResult<Quantity>;

    /// Returns the zone and region labels of the disk. A regional disk
    /// reports its zones joined with `__`.
    fn get_auto_labels_for_pd(&self, disk_name: &str, zone: &str) -> CloudResult<HashMap<String, String>>;

    /// Returns the zones that have at least one node.
    fn get_all_current_zones(&self) -> CloudResult<BTreeSet<String>>;
}
