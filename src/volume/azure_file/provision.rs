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

use super::{file_client, get_file_client, ACCOUNT_KEY_KEY, ACCOUNT_NAME_KEY, PLUGIN_NAME};
use crate::api::core::{
    AzureFilePersistentVolumeSource, Node, PersistentVolume, PersistentVolumeAccessMode, PersistentVolumeSource,
    Secret, TopologySelectorTerm, RESOURCE_STORAGE,
};
use crate::api::resource::Quantity;
use crate::cloudprovider::azure::FileShareOptions;
use crate::volume::util::{
    access_modes_contained_in_all, check_persistent_volume_claim_mode_block, generate_volume_name, round_up_size,
    GIB, VOLUME_DYNAMICALLY_CREATED_BY_KEY,
};
use crate::volume::{Deleter, Provisioner, VolumeError, VolumeHost, VolumeOptions, VolumeResult};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_SHARE_NAME_LENGTH: usize = 63;

const ACCOUNT_KIND_STORAGE_V2: &str = "StorageV2";
const ACCOUNT_KIND_FILE_STORAGE: &str = "FileStorage";

/// Store the storage account credentials in a secret and return its name.
/// An existing secret with the same name is reused.
fn set_azure_credentials(host: &dyn VolumeHost, namespace: &str, account_name: &str, account_key: &str) -> VolumeResult<String> {
    let secret_name = format!("azure-storage-account-{}-secret", account_name);
    let mut secret = Secret::new(&secret_name, namespace);
    secret
        .data
        .insert(ACCOUNT_NAME_KEY.to_string(), account_name.as_bytes().to_vec());
    secret
        .data
        .insert(ACCOUNT_KEY_KEY.to_string(), account_key.as_bytes().to_vec());
    match host.create_secret(&secret) {
        Ok(_) => Ok(secret_name),
        Err(VolumeError::Api(e)) if e.is_conflict() => Ok(secret_name),
        Err(e) => Err(VolumeError::internal(format!("Couldn't create secret {}", e))),
    }
}

/// AzureFileProvisioner creates a file share and the secret to mount it.
pub struct AzureFileProvisioner {
    host: Arc<dyn VolumeHost>,
    access_modes: Vec<PersistentVolumeAccessMode>,
    options: VolumeOptions,
}

impl AzureFileProvisioner {
    pub(super) fn new(
        host: Arc<dyn VolumeHost>,
        access_modes: Vec<PersistentVolumeAccessMode>,
        options: VolumeOptions,
    ) -> Self {
        Self {
            host,
            access_modes,
            options,
        }
    }
}

impl Provisioner for AzureFileProvisioner {
    fn provision(
        &self,
        _selected_node: Option<&Node>,
        _allowed_topologies: &[TopologySelectorTerm],
    ) -> VolumeResult<PersistentVolume> {
        let pvc = &self.options.pvc;
        if !access_modes_contained_in_all(&self.access_modes, &pvc.spec.access_modes) {
            return Err(VolumeError::invalid_argument(format!(
                "invalid AccessModes {:?}: only AccessModes {:?} are supported",
                pvc.spec.access_modes, self.access_modes
            )));
        }
        if check_persistent_volume_claim_mode_block(pvc) {
            return Err(VolumeError::invalid_argument(format!(
                "{} does not support block volume provisioning",
                PLUGIN_NAME
            )));
        }

        let name = generate_volume_name(&self.options.cluster_name, &self.options.pv_name, MAX_SHARE_NAME_LENGTH)
            .replace("--", "-");
        let capacity = pvc
            .storage_request()
            .cloned()
            .unwrap_or_else(|| Quantity::from_gib(0));
        let request_gib = round_up_size(capacity.value(), GIB);

        let mut share = FileShareOptions {
            share_name: name.clone(),
            request_gib,
            ..Default::default()
        };
        let mut secret_namespace = pvc.metadata.namespace.clone();
        for (k, v) in &self.options.parameters {
            match k.to_lowercase().as_str() {
                "skuname" => share.sku = v.clone(),
                "location" => share.location = v.clone(),
                "storageaccount" => share.account_name = v.clone(),
                "secretnamespace" => secret_namespace = v.clone(),
                "resourcegroup" => share.resource_group = v.clone(),
                _ => {
                    return Err(VolumeError::invalid_argument(format!(
                        "invalid option {:?} for volume plugin {}",
                        k, PLUGIN_NAME
                    )))
                }
            }
        }
        if pvc.spec.selector.is_some() {
            return Err(VolumeError::invalid_argument(
                "claim.Spec.Selector is not supported for dynamic provisioning on Azure file",
            ));
        }

        share.account_kind = if share.sku.to_lowercase().starts_with("premium") {
            ACCOUNT_KIND_FILE_STORAGE.to_string()
        } else {
            ACCOUNT_KIND_STORAGE_V2.to_string()
        };

        let cloud = get_file_client(self.host.cloud_provider())?;
        let (account, key) = file_client(cloud.as_ref())?.create_file_share(&share)?;
        info!("azureFile - created share {} in storage account {}", name, account);

        let secret_name = set_azure_credentials(self.host.as_ref(), &secret_namespace, &account, &key)?;

        let mut pv = PersistentVolume::new(&self.options.pv_name);
        pv.metadata.annotations.insert(
            VOLUME_DYNAMICALLY_CREATED_BY_KEY.to_string(),
            "azure-file-dynamic-provisioner".to_string(),
        );
        pv.spec.persistent_volume_reclaim_policy = self.options.reclaim_policy;
        pv.spec.access_modes = pvc.spec.access_modes.clone();
        pv.spec
            .capacity
            .insert(RESOURCE_STORAGE.to_string(), Quantity::from_gib(request_gib));
        pv.spec.persistent_volume_source = PersistentVolumeSource {
            azure_file: Some(AzureFilePersistentVolumeSource {
                secret_name,
                share_name: name,
                read_only: false,
                secret_namespace: Some(secret_namespace),
            }),
            ..Default::default()
        };
        pv.spec.mount_options = self.options.mount_options.clone();
        Ok(pv)
    }
}

/// AzureFileDeleter deletes a file share with the credentials of its secret.
pub struct AzureFileDeleter {
    host: Arc<dyn VolumeHost>,
    volume_name: String,
    share_name: String,
    account_name: String,
    account_key: String,
}

impl AzureFileDeleter {
    pub(super) fn new(
        host: Arc<dyn VolumeHost>,
        volume_name: &str,
        share_name: &str,
        account_name: String,
        account_key: String,
    ) -> Self {
        Self {
            host,
            volume_name: volume_name.to_string(),
            share_name: share_name.to_string(),
            account_name,
            account_key,
        }
    }
}

impl Deleter for AzureFileDeleter {
    fn delete(&self) -> VolumeResult<()> {
        debug!("deleting volume {} (share {})", self.volume_name, self.share_name);
        let cloud = get_file_client(self.host.cloud_provider())?;
        file_client(cloud.as_ref())?.delete_file_share(&self.account_name, &self.account_key, &self.share_name)?;
        Ok(())
    }
}
