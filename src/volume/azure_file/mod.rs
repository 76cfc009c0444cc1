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

//! Azure File shares mounted over CIFS.

mod provision;

pub use provision::{AzureFileDeleter, AzureFileProvisioner};

use crate::api::core::{AzureFileVolumeSource, PersistentVolumeAccessMode, Pod, Volume, VolumeSource};
use crate::api::resource::Quantity;
use crate::cloudprovider::{azure, CloudProvider};
use crate::mount::Interface;
use crate::volume::util::{
    create_dir_all_with_mode, join_mount_options, mount_option_from_spec, round_up_to_gib, unmount_path,
};
use crate::volume::{
    Attributes, DeletableVolumePlugin, Deleter, ExpandableVolumePlugin, Mounter, PersistentVolumePlugin,
    ProvisionableVolumePlugin, Provisioner, Spec, Unmounter, VolumeError, VolumeHost, VolumeOptions, VolumePlugin,
    VolumeResult,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const PLUGIN_NAME: &str = "kubernetes.io/azure-file";

const ACCOUNT_NAME_KEY: &str = "azurestorageaccountname";
const ACCOUNT_KEY_KEY: &str = "azurestorageaccountkey";
const DEFAULT_SECRET_NAMESPACE: &str = "default";

const FILE_MODE: &str = "file_mode";
const DIR_MODE: &str = "dir_mode";
const GID: &str = "gid";
const VERS: &str = "vers";
const DEFAULT_FILE_MODE: &str = "0777";
const DEFAULT_DIR_MODE: &str = "0777";
const LEGACY_FILE_MODE: &str = "0755";
const LEGACY_DIR_MODE: &str = "0755";
const DEFAULT_VERS: &str = "3.0";

pub fn probe_volume_plugins() -> Vec<Box<dyn VolumePlugin>> {
    vec![Box::new(AzureFilePlugin::default())]
}

/// AzureFilePlugin mounts Azure File shares. With `legacy_modes` set the
/// default file and dir modes are 0755 instead of 0777.
#[derive(Default)]
pub struct AzureFilePlugin {
    host: Option<Arc<dyn VolumeHost>>,
    legacy_modes: bool,
}

impl AzureFilePlugin {
    pub fn with_legacy_modes(mut self) -> Self {
        self.legacy_modes = true;
        self
    }

    fn host(&self) -> VolumeResult<&Arc<dyn VolumeHost>> {
        self.host
            .as_ref()
            .ok_or_else(|| VolumeError::internal(format!("volume plugin {} is not initialized", PLUGIN_NAME)))
    }

    fn file(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<AzureFile> {
        let host = self.host()?;
        Ok(AzureFile {
            volume_name: volume_name.to_string(),
            pod_uid: pod_uid.to_string(),
            mounter: host.mounter(PLUGIN_NAME),
            host: host.clone(),
        })
    }
}

/// Returns the share name and whether the share is mounted read-only.
fn get_volume_source(spec: &Spec) -> VolumeResult<(&str, bool)> {
    if let Some(file) = spec.volume.as_ref().and_then(|v| v.volume_source.azure_file.as_ref()) {
        return Ok((&file.share_name, file.read_only));
    }
    if let Some(file) = spec
        .persistent_volume
        .as_ref()
        .and_then(|pv| pv.spec.persistent_volume_source.azure_file.as_ref())
    {
        return Ok((&file.share_name, spec.read_only));
    }
    Err(VolumeError::invalid_spec("spec does not reference an AzureFile volume type"))
}

/// Returns the name and namespace of the secret holding the storage account
/// credentials. Inline volumes read the secret from `default_namespace`.
pub(crate) fn get_secret_name_and_namespace(spec: &Spec, default_namespace: &str) -> VolumeResult<(String, String)> {
    let (secret_name, secret_namespace) =
        if let Some(file) = spec.volume.as_ref().and_then(|v| v.volume_source.azure_file.as_ref()) {
            (file.secret_name.clone(), default_namespace.to_string())
        } else if let Some(file) = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.azure_file.as_ref())
        {
            let namespace = file
                .secret_namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_SECRET_NAMESPACE.to_string());
            (file.secret_name.clone(), namespace)
        } else {
            return Err(VolumeError::invalid_spec("spec does not reference an AzureFile volume type"));
        };

    if secret_namespace.is_empty() {
        return Err(VolumeError::invalid_spec("invalid Azure volume: nil namespace"));
    }
    Ok((secret_name, secret_namespace))
}

/// Reads the storage account name and key from a secret.
pub(crate) fn get_azure_credentials(host: &dyn VolumeHost, namespace: &str, name: &str) -> VolumeResult<(String, String)> {
    let secret = host.get_secret(namespace, name).map_err(|e| {
        VolumeError::internal(format!("Couldn't get secret {}/{}: {}", namespace, name, e))
    })?;
    let read = |key: &str| {
        secret
            .data
            .get(key)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
            .unwrap_or_default()
    };
    let account_name = read(ACCOUNT_NAME_KEY);
    let account_key = read(ACCOUNT_KEY_KEY);
    if account_name.is_empty() || account_key.is_empty() {
        return Err(VolumeError::invalid_argument(format!(
            "Invalid {}/{}, couldn't extract {} or {}",
            namespace, name, ACCOUNT_NAME_KEY, ACCOUNT_KEY_KEY
        )));
    }
    Ok((account_name, account_key))
}

pub(crate) fn get_file_client(cloud: Option<Arc<dyn CloudProvider>>) -> VolumeResult<Arc<dyn CloudProvider>> {
    match cloud {
        Some(cloud) if cloud.azure_files().is_some() => Ok(cloud),
        other => {
            let name = other.map(|c| c.provider_name().to_string()).unwrap_or_else(|| "nil".to_string());
            Err(VolumeError::internal(format!(
                "failed to get Azure Cloud Provider. GetCloudProvider returned {} instead",
                name
            )))
        }
    }
}

pub(crate) fn file_client(cloud: &dyn CloudProvider) -> VolumeResult<&dyn azure::FileClient> {
    cloud
        .azure_files()
        .ok_or_else(|| VolumeError::internal("cloud provider does not support Azure file shares"))
}

fn storage_endpoint_suffix(host: &dyn VolumeHost) -> String {
    match host.cloud_provider() {
        Some(cloud) if cloud.azure_files().is_some() => cloud
            .azure_files()
            .map(|f| f.storage_endpoint_suffix().to_string())
            .unwrap_or_else(|| azure::PUBLIC_CLOUD_STORAGE_ENDPOINT_SUFFIX.to_string()),
        _ => {
            warn!(
                "No Azure cloud provider found. Using the Azure public cloud endpoint: {}",
                azure::PUBLIC_CLOUD_STORAGE_ENDPOINT_SUFFIX
            );
            azure::PUBLIC_CLOUD_STORAGE_ENDPOINT_SUFFIX.to_string()
        }
    }
}

/// Appends the file mode, dir mode, SMB version and gid options unless the
/// caller already set them.
fn append_default_mount_options(mut options: Vec<String>, fs_group: Option<i64>, legacy_modes: bool) -> Vec<String> {
    let has = |options: &[String], key: &str| options.iter().any(|o| o.starts_with(key));
    let (file_mode, dir_mode) = if legacy_modes {
        (LEGACY_FILE_MODE, LEGACY_DIR_MODE)
    } else {
        (DEFAULT_FILE_MODE, DEFAULT_DIR_MODE)
    };

    let file_mode_set = has(&options, FILE_MODE);
    let dir_mode_set = has(&options, DIR_MODE);
    let vers_set = has(&options, VERS);
    let gid_set = has(&options, GID);
    if !file_mode_set {
        options.push(format!("{}={}", FILE_MODE, file_mode));
    }
    if !dir_mode_set {
        options.push(format!("{}={}", DIR_MODE, dir_mode));
    }
    if !vers_set {
        options.push(format!("{}={}", VERS, DEFAULT_VERS));
    }
    if let (false, Some(gid)) = (gid_set, fs_group) {
        options.push(format!("{}={}", GID, gid));
    }
    options
}

impl VolumePlugin for AzureFilePlugin {
    fn init(&mut self, host: Arc<dyn VolumeHost>) -> VolumeResult<()> {
        self.host = Some(host);
        Ok(())
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn volume_name(&self, spec: &Spec) -> VolumeResult<String> {
        Ok(get_volume_source(spec)?.0.to_string())
    }

    fn can_support(&self, spec: &Spec) -> bool {
        get_volume_source(spec).is_ok()
    }

    fn supports_mount_option(&self) -> bool {
        true
    }

    fn supports_bulk_volume_verification(&self) -> bool {
        false
    }

    fn new_mounter(&self, spec: &Spec, pod: &Pod) -> VolumeResult<Box<dyn Mounter>> {
        let (share_name, read_only) = get_volume_source(spec)?;
        let (secret_name, secret_namespace) = get_secret_name_and_namespace(spec, &pod.metadata.namespace)?;
        Ok(Box::new(AzureFileMounter {
            file: self.file(spec.name(), &pod.metadata.uid)?,
            secret_name,
            secret_namespace,
            share_name: share_name.to_string(),
            read_only,
            mount_options: mount_option_from_spec(spec, &[]),
            legacy_modes: self.legacy_modes,
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<Box<dyn Unmounter>> {
        Ok(Box::new(AzureFileUnmounter {
            file: self.file(volume_name, pod_uid)?,
        }))
    }

    fn construct_volume_spec(&self, volume_name: &str, _mount_path: &Path) -> VolumeResult<Spec> {
        Ok(Spec::from_volume(Volume::new(
            volume_name,
            VolumeSource {
                azure_file: Some(AzureFileVolumeSource {
                    secret_name: volume_name.to_string(),
                    share_name: volume_name.to_string(),
                    read_only: false,
                }),
                ..Default::default()
            },
        )))
    }

    fn as_persistent(&self) -> Option<&dyn PersistentVolumePlugin> {
        Some(self)
    }

    fn as_provisionable(&self) -> Option<&dyn ProvisionableVolumePlugin> {
        Some(self)
    }

    fn as_deletable(&self) -> Option<&dyn DeletableVolumePlugin> {
        Some(self)
    }

    fn as_expandable(&self) -> Option<&dyn ExpandableVolumePlugin> {
        Some(self)
    }
}

impl PersistentVolumePlugin for AzureFilePlugin {
    fn access_modes(&self) -> Vec<PersistentVolumeAccessMode> {
        vec![
            PersistentVolumeAccessMode::ReadWriteOnce,
            PersistentVolumeAccessMode::ReadOnlyMany,
            PersistentVolumeAccessMode::ReadWriteMany,
        ]
    }
}

impl ProvisionableVolumePlugin for AzureFilePlugin {
    fn new_provisioner(&self, mut options: VolumeOptions) -> VolumeResult<Box<dyn Provisioner>> {
        let host = self.host()?;
        get_file_client(host.cloud_provider()).inspect_err(|_| debug!("failed to get azure provider"))?;
        if options.pvc.spec.access_modes.is_empty() {
            options.pvc.spec.access_modes = self.access_modes();
        }
        Ok(Box::new(AzureFileProvisioner::new(host.clone(), self.access_modes(), options)))
    }
}

impl DeletableVolumePlugin for AzureFilePlugin {
    fn new_deleter(&self, spec: &Spec) -> VolumeResult<Box<dyn Deleter>> {
        let host = self.host()?;
        get_file_client(host.cloud_provider()).inspect_err(|_| debug!("failed to get azure provider"))?;
        let file = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.azure_file.as_ref())
            .ok_or_else(|| VolumeError::invalid_spec("invalid PV spec"))?;

        let (secret_name, secret_namespace) = get_secret_name_and_namespace(spec, "")?;
        let (account_name, account_key) = get_azure_credentials(host.as_ref(), &secret_namespace, &secret_name)?;
        Ok(Box::new(AzureFileDeleter::new(
            host.clone(),
            spec.name(),
            &file.share_name,
            account_name,
            account_key,
        )))
    }
}

impl ExpandableVolumePlugin for AzureFilePlugin {
    fn expand_volume_device(&self, spec: &Spec, new_size: Quantity, _old_size: Quantity) -> VolumeResult<Quantity> {
        let file = spec
            .persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.persistent_volume_source.azure_file.as_ref())
            .ok_or_else(|| VolumeError::invalid_spec("invalid PV spec"))?;
        let host = self.host()?;
        let cloud = get_file_client(host.cloud_provider())?;

        let (secret_name, secret_namespace) = get_secret_name_and_namespace(spec, "")?;
        let (account_name, account_key) = get_azure_credentials(host.as_ref(), &secret_namespace, &secret_name)?;
        file_client(cloud.as_ref())?.resize_file_share(
            &account_name,
            &account_key,
            &file.share_name,
            round_up_to_gib(&new_size),
        )?;
        Ok(new_size)
    }

    fn requires_fs_resize(&self) -> bool {
        false
    }
}

// ============================================================================
// Mounter / Unmounter
// ============================================================================

struct AzureFile {
    volume_name: String,
    pod_uid: String,
    mounter: Arc<dyn Interface>,
    host: Arc<dyn VolumeHost>,
}

impl AzureFile {
    fn get_path(&self) -> PathBuf {
        self.host.pod_volume_dir(&self.pod_uid, PLUGIN_NAME, &self.volume_name)
    }
}

struct AzureFileMounter {
    file: AzureFile,
    secret_name: String,
    secret_namespace: String,
    share_name: String,
    read_only: bool,
    mount_options: Vec<String>,
    legacy_modes: bool,
}

impl AzureFileMounter {
    /// Undo a failed mount so the next sync starts from an empty directory.
    fn clean_up_failed_mount(&self, dir: &Path) {
        let mounter = self.file.mounter.as_ref();
        match mounter.is_likely_not_mount_point(dir) {
            Err(e) => {
                error!("IsLikelyNotMountPoint check failed: {}", e);
                return;
            }
            Ok(false) => {
                if let Err(e) = mounter.unmount(dir) {
                    error!("Failed to unmount: {}", e);
                    return;
                }
                match mounter.is_likely_not_mount_point(dir) {
                    Err(e) => {
                        error!("IsLikelyNotMountPoint check failed: {}", e);
                        return;
                    }
                    Ok(false) => {
                        error!(
                            "{} is still mounted, despite call to unmount().  Will try again next sync loop.",
                            dir.display()
                        );
                        return;
                    }
                    Ok(true) => {}
                }
            }
            Ok(true) => {}
        }
        let _ = fs::remove_dir(dir);
    }
}

impl Mounter for AzureFileMounter {
    fn get_path(&self) -> PathBuf {
        self.file.get_path()
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            read_only: self.read_only,
            managed: !self.read_only,
            supports_selinux: false,
        }
    }

    fn set_up_at(&self, dir: &Path, fs_group: Option<i64>) -> VolumeResult<()> {
        let mounter = self.file.mounter.as_ref();
        let not_mnt = match mounter.is_likely_not_mount_point(dir) {
            Ok(not_mnt) => not_mnt,
            Err(e) if e.is_not_exist() => true,
            Err(e) => return Err(e.into()),
        };
        debug!("AzureFile mount set up: {} {}", dir.display(), !not_mnt);
        if !not_mnt {
            match fs::read_dir(dir) {
                Ok(_) => {
                    debug!("azureFile - already mounted to target {}", dir.display());
                    return Ok(());
                }
                Err(e) => {
                    warn!("azureFile - ReadDir {} failed with {}, unmount this directory", dir.display(), e);
                    mounter.unmount(dir).inspect_err(|e| {
                        error!("azureFile - Unmount directory {} failed with {}", dir.display(), e);
                    })?;
                }
            }
        }

        let (account_name, account_key) =
            get_azure_credentials(self.file.host.as_ref(), &self.secret_namespace, &self.secret_name)?;
        let source = format!(
            "//{}.file.{}/{}",
            account_name,
            storage_endpoint_suffix(self.file.host.as_ref()),
            self.share_name
        );

        create_dir_all_with_mode(dir, 0o700).map_err(|e| VolumeError::io("mkdir", dir, e))?;
        let mut options = vec![format!("username={},password={}", account_name, account_key)];
        if self.read_only {
            options.push("ro".to_string());
        }
        let mount_options = append_default_mount_options(
            join_mount_options(&self.mount_options, &options),
            fs_group,
            self.legacy_modes,
        );

        if let Err(e) = mounter.mount(&source, dir, "cifs", &mount_options) {
            self.clean_up_failed_mount(dir);
            return Err(e.into());
        }
        Ok(())
    }
}

struct AzureFileUnmounter {
    file: AzureFile,
}

impl Unmounter for AzureFileUnmounter {
    fn get_path(&self) -> PathBuf {
        self.file.get_path()
    }

    fn tear_down_at(&self, dir: &Path) -> VolumeResult<()> {
        unmount_path(dir, self.file.mounter.as_ref())
    }
}
