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

//! AWS EBS volume operations.

use super::CloudResult;
use crate::api::resource::Quantity;
use std::collections::{BTreeSet, HashMap};

/// ProviderName is the name of this cloud provider.
pub const PROVIDER_NAME: &str = "aws";

/// Volume type used when the storage class does not name one.
pub const DEFAULT_VOLUME_TYPE: &str = "gp2";

/// VolumeOptions specifies capacity and tags for a volume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VolumeOptions {
    pub capacity_gib: i64,
    pub tags: HashMap<String, String>,
    pub volume_type: String,
    pub availability_zone: String,
    /// IOPS per GiB, only used for io1 volumes.
    pub iops_per_gb: i64,
    pub encrypted: bool,
    /// Key used to encrypt the volume; empty selects the account default.
    pub kms_key_id: String,
}

/// Volumes is an interface for managing cloud-provisioned volumes.
pub trait Volumes: Send + Sync {
    /// Attach the disk to the node and return the device path.
    fn attach_disk(&self, volume_id: &str, node_name: &str) -> CloudResult<String>;

    /// Detach the disk from the node and return the device path it had.
    fn detach_disk(&self, volume_id: &str, node_name: &str) -> CloudResult<String>;

    /// Create a volume and return its `aws://<zone>/<vol-id>` name.
    fn create_disk(&self, options: &VolumeOptions) -> CloudResult<String>;

    /// Delete the volume. Returns false when it did not exist.
    fn delete_disk(&self, volume_id: &str) -> CloudResult<bool>;

    /// Returns the zone and region labels of the volume.
    fn get_volume_labels(&self, volume_id: &str) -> CloudResult<HashMap<String, String>>;

    /// Returns the device path the volume is attached at.
    fn get_disk_path(&self, volume_id: &str) -> CloudResult<String>;

    fn disk_is_attached(&self, volume_id: &str, node_name: &str) -> CloudResult<bool>;

    /// Batch check of `disk_is_attached`, keyed by volume id.
    fn disks_are_attached(&self, volume_ids: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>>;

    /// Grow the volume and return its new size.
    fn resize_disk(&self, volume_id: &str, old_size: &Quantity, new_size: &Quantity) -> CloudResult<Quantity>;

    /// Returns the zones that have nodes a new volume could be used from.
    fn get_candidate_zones_for_dynamic_volume(&self) -> CloudResult<BTreeSet<String>>;
}
