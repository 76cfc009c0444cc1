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

//! Azure disk and file share operations.
//!
//! Unmanaged (blob) and managed disks are attached through [`DiskController`].
//! Managed disks are created, deleted and resized by
//! [`ManagedDiskController`] on top of a [`DisksClient`].

use super::{CloudError, CloudResult};
use crate::api::core::{AzureDataDiskCachingMode, LABEL_ZONE_FAILURE_DOMAIN, LABEL_ZONE_REGION};
use crate::api::resource::Quantity;
use crate::volume::util::{round_up_size, GIB};
use crc::{Algorithm, Crc};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// ProviderName is the name of this cloud provider.
pub const PROVIDER_NAME: &str = "azure";

/// Storage endpoint suffix of the Azure public cloud.
pub const PUBLIC_CLOUD_STORAGE_ENDPOINT_SUFFIX: &str = "core.windows.net";

const AZURE_DD_TAG: &str = "kubernetes-azure-dd";

// ============================================================================
// Disk attachment
// ============================================================================

/// DiskController attaches and detaches data disks on virtual machines.
pub trait DiskController: Send + Sync {
    /// Returns the LUN the disk is attached at on the node, or
    /// [`CloudError::DiskNotFound`] when it is not attached.
    fn get_disk_lun(&self, disk_name: &str, disk_uri: &str, node_name: &str) -> CloudResult<i32>;

    /// Returns the lowest free LUN on the node.
    fn get_next_disk_lun(&self, node_name: &str) -> CloudResult<i32>;

    fn attach_disk(
        &self,
        is_managed_disk: bool,
        disk_name: &str,
        disk_uri: &str,
        node_name: &str,
        lun: i32,
        caching_mode: AzureDataDiskCachingMode,
    ) -> CloudResult<()>;

    fn detach_disk(&self, disk_name: &str, disk_uri: &str, node_name: &str) -> CloudResult<()>;

    /// Batch attachment check, keyed by disk name.
    fn disks_are_attached(&self, disk_names: &[String], node_name: &str) -> CloudResult<HashMap<String, bool>>;
}

// ============================================================================
// File shares
// ============================================================================

/// FileShareOptions describes a file share to create.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileShareOptions {
    pub share_name: String,
    /// Storage account to use; empty lets the provider pick or create one.
    pub account_name: String,
    pub sku: String,
    pub account_kind: String,
    pub resource_group: String,
    pub location: String,
    pub request_gib: i64,
}

/// FileClient manages Azure file shares.
pub trait FileClient: Send + Sync {
    /// Create a file share and return the storage account name and key.
    fn create_file_share(&self, options: &FileShareOptions) -> CloudResult<(String, String)>;

    fn delete_file_share(&self, account_name: &str, account_key: &str, share_name: &str) -> CloudResult<()>;

    fn resize_file_share(&self, account_name: &str, account_key: &str, share_name: &str, size_gib: i64)
        -> CloudResult<()>;

    /// Suffix of the storage endpoints of the cloud environment.
    fn storage_endpoint_suffix(&self) -> &str {
        PUBLIC_CLOUD_STORAGE_ENDPOINT_SUFFIX
    }
}

// ============================================================================
// Managed disks
// ============================================================================

/// Disk is the subset of a managed disk resource used here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Disk {
    pub id: String,
    pub name: String,
    pub location: String,
    pub sku: String,
    pub size_gb: Option<i64>,
    pub provisioning_state: Option<String>,
    pub zones: Vec<String>,
    pub tags: HashMap<String, String>,
}

/// DisksClient is the managed disks REST surface.
pub trait DisksClient: Send + Sync {
    fn create_or_update(&self, resource_group: &str, disk_name: &str, disk: &Disk) -> CloudResult<()>;
    fn get(&self, resource_group: &str, disk_name: &str) -> CloudResult<Disk>;
    fn delete(&self, resource_group: &str, disk_name: &str) -> CloudResult<()>;
}

/// ManagedDiskOptions specifies the options of managed disks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ManagedDiskOptions {
    pub disk_name: String,
    pub size_gb: i64,
    pub pvc_name: String,
    /// Empty selects the controller's resource group.
    pub resource_group: String,
    /// Zone label value such as "eastus-1"; empty creates a non-zoned disk.
    pub availability_zone: String,
    pub tags: HashMap<String, String>,
    pub storage_account_type: String,
}

/// Backoff describes an exponential polling schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub duration: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(2),
            factor: 1.5,
            steps: 10,
        }
    }
}

/// ManagedDiskController creates, deletes and resizes managed disks.
pub struct ManagedDiskController {
    client: Arc<dyn DisksClient>,
    subscription_id: String,
    resource_group: String,
    location: String,
    backoff: Backoff,
}

impl ManagedDiskController {
    pub fn new(client: Arc<dyn DisksClient>, subscription_id: &str, resource_group: &str, location: &str) -> Self {
        Self {
            client,
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
            location: location.to_string(),
            backoff: Backoff::default(),
        }
    }

    /// Override the provisioning-state polling schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Create a managed disk and return its URI. The disk is handed back
    /// even if its provisioning state could not be confirmed.
    pub fn create_managed_disk(&self, options: &ManagedDiskOptions) -> CloudResult<String> {
        debug!(
            "azureDisk - creating new managed Name:{} StorageAccountType:{} Size:{}",
            options.disk_name, options.storage_account_type, options.size_gb
        );

        // Fault domains carry no zone id and create a non-zoned disk.
        let zone_id = get_zone_id(&self.location, &options.availability_zone);
        let zones = if zone_id.is_empty() { Vec::new() } else { vec![zone_id] };

        let mut tags = HashMap::new();
        tags.insert("created-by".to_string(), AZURE_DD_TAG.to_string());
        for (k, v) in &options.tags {
            // Azure does not allow '/' in tags.
            tags.insert(k.replace('/', "-"), v.replace('/', "-"));
        }

        let resource_group = if options.resource_group.is_empty() {
            self.resource_group.as_str()
        } else {
            options.resource_group.as_str()
        };

        let model = Disk {
            id: String::new(),
            name: options.disk_name.clone(),
            location: self.location.clone(),
            sku: options.storage_account_type.clone(),
            size_gb: Some(options.size_gb),
            provisioning_state: None,
            zones,
            tags,
        };
        self.client.create_or_update(resource_group, &options.disk_name, &model)?;

        let mut disk_id = String::new();
        let mut confirmed = false;
        let mut wait = self.backoff.duration;
        for step in 0..self.backoff.steps {
            let disk = self.client.get(resource_group, &options.disk_name)?;
            disk_id = disk.id;
            if disk
                .provisioning_state
                .is_some_and(|s| s.eq_ignore_ascii_case("succeeded"))
            {
                confirmed = true;
                break;
            }
            if step + 1 < self.backoff.steps {
                thread::sleep(wait);
                wait = wait.mul_f64(self.backoff.factor);
            }
        }

        if confirmed {
            info!(
                "azureDisk - created new MD Name:{} StorageAccountType:{} Size:{}",
                options.disk_name, options.storage_account_type, options.size_gb
            );
        } else {
            info!(
                "azureDisk - created new MD Name:{} StorageAccountType:{} Size:{} but was unable to confirm provisioningState in poll process",
                options.disk_name, options.storage_account_type, options.size_gb
            );
        }
        if disk_id.is_empty() {
            disk_id = self.disk_uri(resource_group, &options.disk_name);
        }
        Ok(disk_id)
    }

    /// Delete a managed disk by URI. ARM finishes the deletion asynchronously.
    pub fn delete_managed_disk(&self, disk_uri: &str) -> CloudResult<()> {
        let disk_name = base_name(disk_uri);
        let resource_group = get_resource_group_from_disk_uri(disk_uri)?;
        self.client.delete(&resource_group, disk_name)?;
        info!("azureDisk - deleted a managed disk: {}", disk_uri);
        Ok(())
    }

    /// Expand the disk to `new_size`, rounded up to GiB.
    pub fn resize_disk(&self, disk_uri: &str, old_size: &Quantity, new_size: &Quantity) -> CloudResult<Quantity> {
        let disk_name = base_name(disk_uri);
        let resource_group = get_resource_group_from_disk_uri(disk_uri)?;

        let mut disk = self.client.get(&resource_group, disk_name)?;
        let Some(current_gb) = disk.size_gb else {
            return Err(CloudError::provider(format!(
                "invliad nil for DiskProperties of disk({})",
                disk_name
            )));
        };

        let request_gib = round_up_size(new_size.value(), GIB);
        let new_size_quant = Quantity::from_gib(request_gib);

        info!(
            "azureDisk - begin to resize disk({}) with new size({}), old size({})",
            disk_name, request_gib, old_size
        );
        if current_gb >= request_gib {
            return Ok(new_size_quant);
        }

        disk.size_gb = Some(request_gib);
        self.client.create_or_update(&resource_group, disk_name, &disk)?;
        info!("azureDisk - resize disk({}) with new size({}) completed", disk_name, request_gib);
        Ok(new_size_quant)
    }

    /// Returns the zone labels of a zoned disk, or an empty map.
    pub fn get_azure_disk_labels(&self, disk_uri: &str) -> CloudResult<HashMap<String, String>> {
        let disk_name = base_name(disk_uri);
        let resource_group = get_resource_group_from_disk_uri(disk_uri).map_err(|e| {
            error!("Failed to get resource group for AzureDisk {:?}: {}", disk_name, e);
            e
        })?;
        let disk = self.client.get(&resource_group, disk_name).map_err(|e| {
            error!("Failed to get information for AzureDisk {:?}: {}", disk_name, e);
            e
        })?;

        let Some(first) = disk.zones.first() else {
            debug!("Azure disk {:?} is not zoned", disk_name);
            return Ok(HashMap::new());
        };
        let zone_id: i64 = first.parse().map_err(|e| {
            CloudError::provider(format!(
                "failed to parse zone {:?} for AzureDisk {}: {}",
                disk.zones, disk_name, e
            ))
        })?;

        let zone = make_zone(&self.location, zone_id);
        debug!("Got zone {:?} for Azure disk {:?}", zone, disk_name);
        let mut labels = HashMap::new();
        labels.insert(LABEL_ZONE_REGION.to_string(), self.location.clone());
        labels.insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), zone);
        Ok(labels)
    }

    fn disk_uri(&self, resource_group: &str, disk_name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/disks/{}",
            self.subscription_id, resource_group, disk_name
        )
    }
}

fn base_name(uri: &str) -> &str {
    uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri)
}

/// Returns the resource group of a managed disk URI of the form
/// `/subscriptions/{sub}/resourceGroups/{group}/providers/Microsoft.Compute/disks/{name}`.
pub fn get_resource_group_from_disk_uri(disk_uri: &str) -> CloudResult<String> {
    let fields: Vec<&str> = disk_uri.split('/').collect();
    if fields.len() != 9 || fields[3] != "resourceGroups" {
        return Err(CloudError::provider(format!("invalid disk URI: {}", disk_uri)));
    }
    Ok(fields[4].to_string())
}

/// CRC-32 with the Koopman polynomial, reflected, as used for disk mount
/// path hashes.
const CRC_32_KOOPMAN: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x741b8cd7,
    init: 0xffffffff,
    refin: true,
    refout: true,
    xorout: 0xffffffff,
    check: 0x2d3dd0ae,
    residue: 0x00000000,
};

/// Returns the decimal Koopman CRC-32 of `s`.
pub fn make_crc32(s: &str) -> String {
    let crc = Crc::<u32>::new(&CRC_32_KOOPMAN);
    crc.checksum(s.as_bytes()).to_string()
}

/// Returns the zone label value for an availability zone id, e.g. "eastus-1".
pub fn make_zone(location: &str, zone_id: i64) -> String {
    format!("{}-{}", location.to_lowercase(), zone_id)
}

/// Returns true if `zone` is an availability zone of `location`.
pub fn is_availability_zone(location: &str, zone: &str) -> bool {
    zone.starts_with(&format!("{}-", location))
}

/// Returns the zone id of an availability zone label, or an empty string
/// for fault domains.
pub fn get_zone_id(location: &str, zone_label: &str) -> String {
    if !is_availability_zone(location, zone_label) {
        return String::new();
    }
    zone_label
        .strip_prefix(&format!("{}-", location))
        .unwrap_or_default()
        .to_string()
}
