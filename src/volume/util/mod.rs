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

//! Helpers shared by volume plugins.

pub mod fs;
pub mod keymutex;
pub mod zones;

pub use zones::{
    choose_zone_for_volume, choose_zones_for_volume, choose_zones_for_volume_including_zone,
    label_zones_to_list, label_zones_to_set, select_zone_for_volume, select_zones_for_volume,
    validate_zone, zones_from_allowed_topologies, zones_set_to_label_value, zones_to_set,
};

use super::{set_volume_ownership, Spec, VolumeError, VolumeHost, VolumePlugin, VolumeResult};
use crate::api::core::{
    PersistentVolume, PersistentVolumeAccessMode, PersistentVolumeClaim, PersistentVolumeMode, Pod,
    RESOURCE_STORAGE,
};
use crate::api::resource::Quantity;
use crate::client::SecretClient;
use crate::mount::{self, Interface, MountResult, SafeFormatAndMount};
use std::collections::{BTreeSet, HashMap};
use std::fs as stdfs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// GB is a gigabyte.
pub const GB: i64 = 1000 * 1000 * 1000;
/// GIB is a gibibyte.
pub const GIB: i64 = 1024 * 1024 * 1024;

const READY_FILE_NAME: &str = "ready";

/// Node annotation that hands attach/detach to the attach/detach controller.
pub const CONTROLLER_MANAGED_ATTACH_ANNOTATION: &str = "volumes.kubernetes.io/controller-managed-attach-detach";

/// Node annotation that keeps pod volumes mounted after the pod terminates.
pub const KEEP_TERMINATED_POD_VOLUMES_ANNOTATION: &str = "volumes.kubernetes.io/keep-terminated-pod-volumes";

/// PersistentVolume annotation that specifies a supplemental GID.
pub const VOLUME_GID_ANNOTATION_KEY: &str = "pv.beta.kubernetes.io/gid";

/// PersistentVolume annotation naming the provisioner that created it.
pub const VOLUME_DYNAMICALLY_CREATED_BY_KEY: &str = "kubernetes.io/createdby";

/// PersistentVolume annotation carrying comma separated mount options.
pub const MOUNT_OPTION_ANNOTATION: &str = "volume.beta.kubernetes.io/mount-options";

/// Separator of multiple zones in a zone label value.
pub const LABEL_MULTI_ZONE_DELIMITER: &str = "__";

// ============================================================================
// Attach limits
// ============================================================================

/// Node allocatable key for the number of attachable EBS volumes.
pub const EBS_VOLUME_LIMIT_KEY: &str = "attachable-volumes-aws-ebs";
/// Attach limit of instances that are not Nitro based.
pub const DEFAULT_MAX_EBS_VOLUMES: i64 = 39;
/// Attach limit of Nitro instances.
pub const DEFAULT_MAX_EBS_NITRO_VOLUME_LIMIT: i64 = 25;
/// Instance types with the Nitro attach limit.
pub const EBS_NITRO_LIMIT_REGEX: &str = "^[cm]5.*";

pub const AZURE_VOLUME_LIMIT_KEY: &str = "attachable-volumes-azure-disk";

pub const GCE_VOLUME_LIMIT_KEY: &str = "attachable-volumes-gce-pd";
pub const DEFAULT_MAX_GCE_PD_VOLUMES: i64 = 16;

// ============================================================================
// Ready files
// ============================================================================

/// Returns true if a regular file named `ready` exists in `dir`.
pub fn is_ready(dir: &Path) -> bool {
    let ready_file = dir.join(READY_FILE_NAME);
    match stdfs::metadata(&ready_file) {
        Ok(meta) if meta.is_file() => true,
        Ok(_) => {
            error!("ready-file is not a file: {}", ready_file.display());
            false
        }
        Err(_) => false,
    }
}

/// Create the `ready` file in `dir`, creating the directory first. Failures
/// are logged.
pub fn set_ready(dir: &Path) {
    if let Err(e) = create_dir_all_with_mode(dir, 0o750) {
        error!("Can't mkdir {}: {}", dir.display(), e);
        return;
    }
    let ready_file = dir.join(READY_FILE_NAME);
    if let Err(e) = stdfs::File::create(&ready_file) {
        error!("Can't touch {}: {}", ready_file.display(), e);
    }
}

/// Create `dir` and its parents with the given permission bits.
pub fn create_dir_all_with_mode(dir: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        stdfs::DirBuilder::new().recursive(true).mode(mode).create(dir)
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        stdfs::create_dir_all(dir)
    }
}

// ============================================================================
// Unmounting
// ============================================================================

/// PathStatus is the result of checking a path that may be a mount point.
#[derive(Debug)]
pub enum PathStatus {
    Exists,
    NotExist,
    /// The path is a mount point whose backend is gone.
    Corrupted(io::Error),
}

/// Stat `path`, separating a corrupted mount from other errors.
pub fn path_status(path: &Path) -> io::Result<PathStatus> {
    match stdfs::metadata(path) {
        Ok(_) => Ok(PathStatus::Exists),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PathStatus::NotExist),
        Err(e) if is_corrupted_mnt(&e) => Ok(PathStatus::Corrupted(e)),
        Err(e) => Err(e),
    }
}

/// Returns true if the path exists. A corrupted mount point exists.
pub fn path_exists(path: &Path) -> io::Result<bool> {
    Ok(!matches!(path_status(path)?, PathStatus::NotExist))
}

/// Returns true if the error means the mount point is corrupted.
pub fn is_corrupted_mnt(err: &io::Error) -> bool {
    mount::is_corrupted_io_error(err)
}

/// Like `is_likely_not_mount_point`, but also consults the mount table so
/// bind mounts are detected.
pub fn is_not_mount_point(mounter: &dyn Interface, path: &Path) -> MountResult<bool> {
    if !mounter.is_likely_not_mount_point(path)? {
        return Ok(false);
    }
    let mounts = mounter.list()?;
    Ok(!mounts.iter().any(|mp| mp.path == path))
}

/// Unmount `mount_path` and remove the directory left behind.
pub fn unmount_path(mount_path: &Path, mounter: &dyn Interface) -> VolumeResult<()> {
    unmount_mount_point(mount_path, mounter, false)
}

/// Unmount `mount_path` and remove the directory left behind. With
/// `extensive_check` the mount table is consulted as well.
pub fn unmount_mount_point(mount_path: &Path, mounter: &dyn Interface, extensive_check: bool) -> VolumeResult<()> {
    let corrupted = match path_status(mount_path) {
        Ok(PathStatus::NotExist) => {
            warn!(
                "Warning: Unmount skipped because path does not exist: {}",
                mount_path.display()
            );
            return Ok(());
        }
        Ok(PathStatus::Exists) => false,
        Ok(PathStatus::Corrupted(_)) => true,
        Err(e) => {
            return Err(VolumeError::internal(format!("error checking path: {}", e)));
        }
    };
    do_unmount_mount_point(mount_path, mounter, extensive_check, corrupted)
}

fn do_unmount_mount_point(
    mount_path: &Path,
    mounter: &dyn Interface,
    extensive_check: bool,
    corrupted: bool,
) -> VolumeResult<()> {
    if !corrupted {
        let not_mnt = if extensive_check {
            is_not_mount_point(mounter, mount_path)?
        } else {
            mounter.is_likely_not_mount_point(mount_path)?
        };
        if not_mnt {
            warn!("Warning: {:?} is not a mountpoint, deleting", mount_path);
            return remove_dir(mount_path);
        }
    }

    debug!("{:?} is a mountpoint, unmounting", mount_path);
    mounter.unmount(mount_path)?;
    if mounter.is_likely_not_mount_point(mount_path)? {
        debug!("{:?} is unmounted, deleting the directory", mount_path);
        return remove_dir(mount_path);
    }
    Err(VolumeError::internal(format!(
        "Failed to unmount path {}",
        mount_path.display()
    )))
}

fn remove_dir(path: &Path) -> VolumeResult<()> {
    stdfs::remove_dir(path).map_err(|e| VolumeError::io("remove", path, e))
}

// ============================================================================
// Bind mounts
// ============================================================================

/// Bind mount the global device mount `global_path` into the pod directory
/// `dir`. A directory that is already a mount point is left alone. A failed
/// mount is unmounted once and the directory removed so the next sync starts
/// clean. Ownership is applied to writable volumes.
pub fn bind_mount_pod_volume(
    mounter: &dyn Interface,
    global_path: &Path,
    dir: &Path,
    read_only: bool,
    mount_options: &[String],
    fs_group: Option<i64>,
) -> VolumeResult<()> {
    let not_mnt = match mounter.is_likely_not_mount_point(dir) {
        Ok(not_mnt) => not_mnt,
        Err(e) if e.is_not_exist() => true,
        Err(e) => {
            error!("cannot validate mount point: {} {}", dir.display(), e);
            return Err(e.into());
        }
    };
    debug!("PersistentDisk set up: {} {}", dir.display(), !not_mnt);
    if !not_mnt {
        return Ok(());
    }

    create_dir_all_with_mode(dir, 0o750).map_err(|e| VolumeError::io("mkdir", dir, e))?;

    let mut options = vec!["bind".to_string()];
    if read_only {
        options.push("ro".to_string());
    }
    let options = join_mount_options(&options, mount_options);
    if let Err(err) = mounter.mount(&global_path.to_string_lossy(), dir, "", &options) {
        match mounter.is_likely_not_mount_point(dir) {
            Err(mnt_err) => {
                error!("IsLikelyNotMountPoint check failed for {}: {}", dir.display(), mnt_err);
                return Err(err.into());
            }
            Ok(false) => {
                if let Err(mnt_err) = mounter.unmount(dir) {
                    error!("failed to unmount {}: {}", dir.display(), mnt_err);
                    return Err(err.into());
                }
                match mounter.is_likely_not_mount_point(dir) {
                    Err(mnt_err) => {
                        error!("IsLikelyNotMountPoint check failed for {}: {}", dir.display(), mnt_err);
                        return Err(err.into());
                    }
                    Ok(false) => {
                        error!(
                            "{} is still mounted, despite call to unmount().  Will try again next sync loop.",
                            dir.display()
                        );
                        return Err(err.into());
                    }
                    Ok(true) => {}
                }
            }
            Ok(true) => {}
        }
        let _ = stdfs::remove_dir(dir);
        error!("Mount of disk {} failed: {}", dir.display(), err);
        return Err(err.into());
    }

    if !read_only {
        set_volume_ownership(dir, fs_group, read_only)?;
    }
    debug!("Successfully mounted {}", dir.display());
    Ok(())
}

/// Returns the other mount points of the device mounted at `path`.
pub fn get_mount_refs(mounter: &dyn Interface, path: &Path) -> VolumeResult<Vec<PathBuf>> {
    let mounts = mounter.list()?;
    let Some(device) = mounts.iter().find(|mp| mp.path == path).map(|mp| mp.device.clone()) else {
        return Ok(Vec::new());
    };
    Ok(mounts
        .into_iter()
        .filter(|mp| mp.device == device && mp.path != path)
        .map(|mp| mp.path)
        .collect())
}

// ============================================================================
// Sizes and names
// ============================================================================

/// Returns how many allocation units are needed to hold `volume_size_bytes`,
/// e.g. 1500MiB needs 2 GiB units.
pub fn round_up_size(volume_size_bytes: i64, allocation_unit_bytes: i64) -> i64 {
    let mut rounded_up = volume_size_bytes / allocation_unit_bytes;
    if volume_size_bytes % allocation_unit_bytes > 0 {
        rounded_up += 1;
    }
    rounded_up
}

pub fn round_up_to_gb(size: &Quantity) -> i64 {
    round_up_size(size.value(), GB)
}

pub fn round_up_to_gib(size: &Quantity) -> i64 {
    round_up_size(size.value(), GIB)
}

/// Like [`round_up_size`] but fails when the result does not fit an `i32`.
pub fn round_up_size_int(volume_size_bytes: i64, allocation_unit_bytes: i64) -> VolumeResult<i32> {
    let rounded_up = round_up_size(volume_size_bytes, allocation_unit_bytes);
    i32::try_from(rounded_up).map_err(|_| {
        VolumeError::invalid_argument(format!(
            "capacity {} is too great, casting results in integer overflow",
            rounded_up
        ))
    })
}

pub fn round_up_to_gb_int(size: &Quantity) -> VolumeResult<i32> {
    round_up_size_int(size.value(), GB)
}

pub fn round_up_to_gib_int(size: &Quantity) -> VolumeResult<i32> {
    round_up_size_int(size.value(), GIB)
}

/// Returns `<cluster>-dynamic-<pv>`, cutting the prefix so the result fits
/// `max_length`.
pub fn generate_volume_name(cluster_name: &str, pv_name: &str, max_length: usize) -> String {
    let mut prefix = format!("{}-dynamic", cluster_name);
    if pv_name.len() + 1 + prefix.len() > max_length {
        prefix.truncate(max_length.saturating_sub(pv_name.len() + 1));
    }
    format!("{}-{}", prefix, pv_name)
}

/// Returns the timeout for a recycler pod: `timeout_increment` per GiB of the
/// volume, and at least `minimum_timeout`.
pub fn calculate_timeout_for_volume(minimum_timeout: i64, timeout_increment: i64, pv: &PersistentVolume) -> i64 {
    let pv_size = pv
        .spec
        .capacity
        .get(RESOURCE_STORAGE)
        .map(|q| q.value())
        .unwrap_or(0);
    let timeout = (pv_size / GIB) * timeout_increment;
    timeout.max(minimum_timeout)
}

// ============================================================================
// Mount options
// ============================================================================

/// Join user and system mount options, dropping empty and duplicate entries.
/// The result is sorted.
pub fn join_mount_options<S: AsRef<str>, T: AsRef<str>>(user_options: &[S], system_options: &[T]) -> Vec<String> {
    let mut all: BTreeSet<String> = user_options
        .iter()
        .map(|o| o.as_ref())
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    all.extend(system_options.iter().map(|o| o.as_ref().to_string()));
    all.into_iter().collect()
}

/// Returns the mount options of the spec's persistent volume joined with
/// `options`. The beta annotation takes precedence over the spec field.
pub fn mount_option_from_spec(spec: &Spec, options: &[&str]) -> Vec<String> {
    if let Some(pv) = &spec.persistent_volume {
        if let Some(mo) = pv.metadata.annotations.get(MOUNT_OPTION_ANNOTATION) {
            let list: Vec<&str> = mo.split(',').collect();
            return join_mount_options(&list, options);
        }
        if !pv.spec.mount_options.is_empty() {
            return join_mount_options(&pv.spec.mount_options, options);
        }
    }
    options.iter().map(|o| o.to_string()).collect()
}

// ============================================================================
// Access modes and volume mode
// ============================================================================

pub fn access_modes_contains(modes: &[PersistentVolumeAccessMode], mode: PersistentVolumeAccessMode) -> bool {
    modes.contains(&mode)
}

/// Returns whether every requested mode is in `indexed_modes`.
pub fn access_modes_contained_in_all(
    indexed_modes: &[PersistentVolumeAccessMode],
    requested_modes: &[PersistentVolumeAccessMode],
) -> bool {
    requested_modes
        .iter()
        .all(|m| access_modes_contains(indexed_modes, *m))
}

/// Returns the volume mode of the spec. Inline volumes are filesystems.
pub fn get_volume_mode(spec: &Spec) -> VolumeResult<PersistentVolumeMode> {
    let Some(pv) = &spec.persistent_volume else {
        return Ok(PersistentVolumeMode::Filesystem);
    };
    pv.spec
        .volume_mode
        .ok_or_else(|| VolumeError::invalid_spec(format!("cannot get volumeMode for volume: {}", spec.name())))
}

pub fn get_persistent_volume_claim_volume_mode(claim: &PersistentVolumeClaim) -> VolumeResult<PersistentVolumeMode> {
    claim.spec.volume_mode.ok_or_else(|| {
        VolumeError::invalid_spec(format!("cannot get volumeMode from pvc: {}", claim.metadata.name))
    })
}

/// Returns true unless the spec is a block volume.
pub fn check_volume_mode_filesystem(spec: &Spec) -> VolumeResult<bool> {
    Ok(get_volume_mode(spec)? != PersistentVolumeMode::Block)
}

pub fn check_persistent_volume_claim_mode_block(pvc: &PersistentVolumeClaim) -> bool {
    pvc.spec.volume_mode == Some(PersistentVolumeMode::Block)
}

/// A pod is terminated once it failed or succeeded, or once it is being
/// deleted.
pub fn is_pod_terminated(pod: &Pod) -> bool {
    pod.is_terminated() || pod.metadata.deletion_timestamp.is_some()
}

/// Checks that the node labels satisfy the persistent volume's node affinity.
pub fn check_node_affinity(pv: &PersistentVolume, node_labels: &HashMap<String, String>) -> VolumeResult<()> {
    let Some(affinity) = &pv.spec.node_affinity else {
        return Ok(());
    };
    if let Some(required) = &affinity.required {
        debug!("Match for Required node selector terms {:?}", required.node_selector_terms);
        if !required.matches(node_labels) {
            return Err(VolumeError::internal("no matching NodeSelectorTerms"));
        }
    }
    Ok(())
}

// ============================================================================
// Unique names
// ============================================================================

/// Returns "<plugin>/<volume>".
pub fn get_unique_volume_name(plugin_name: &str, volume_name: &str) -> String {
    format!("{}/{}", plugin_name, volume_name)
}

/// Returns the unique name of the volume a spec refers to.
pub fn get_unique_volume_name_from_spec(plugin: &dyn VolumePlugin, spec: &Spec) -> VolumeResult<String> {
    match plugin.volume_name(spec) {
        Ok(name) if !name.is_empty() => Ok(get_unique_volume_name(plugin.name(), &name)),
        Ok(_) => Err(VolumeError::internal(format!(
            "failed to GetVolumeName from volumePlugin for volumeSpec {:?}: empty name",
            spec.name()
        ))),
        Err(e) => Err(VolumeError::internal(format!(
            "failed to GetVolumeName from volumePlugin for volumeSpec {:?} err={}",
            spec.name(),
            e
        ))),
    }
}

/// Split "<namespace>/<plugin>/<volume>" into the plugin and the volume name.
pub fn split_unique_name(unique_name: &str) -> VolumeResult<(String, String)> {
    let components: Vec<&str> = unique_name.splitn(3, '/').collect();
    if components.len() != 3 {
        return Err(VolumeError::invalid_argument(format!(
            "cannot split volume unique name {} to plugin/volume components",
            unique_name
        )));
    }
    Ok((
        format!("{}/{}", components[0], components[1]),
        components[2].to_string(),
    ))
}

// ============================================================================
// Secrets
// ============================================================================

/// Returns the data of a secret whose type must equal the plugin name.
pub fn get_secret_for_pv(
    secret_namespace: &str,
    secret_name: &str,
    volume_plugin_name: &str,
    client: &dyn SecretClient,
) -> VolumeResult<HashMap<String, String>> {
    let secret = client.get_secret(secret_namespace, secret_name)?;
    if secret.secret_type != volume_plugin_name {
        return Err(VolumeError::internal(format!(
            "cannot get secret of type {}",
            volume_plugin_name
        )));
    }
    Ok(secret
        .data
        .iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
        .collect())
}

/// Build a [`SafeFormatAndMount`] from the host's mounter and exec.
pub fn new_safe_format_and_mount_from_host(plugin_name: &str, host: &dyn VolumeHost) -> SafeFormatAndMount {
    SafeFormatAndMount::new(host.mounter(plugin_name), host.exec(plugin_name))
}

// ============================================================================
// Paths
// ============================================================================

/// Convert `path` to an absolute path for the given OS.
pub fn make_absolute_path(goos: &str, path: &str) -> String {
    if goos != "windows" {
        return clean_path(&format!("/{}", path));
    }
    if path.contains(':') {
        return path.to_string();
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return format!("c:{}", path);
    }
    format!("c:\\{}", path)
}

/// Returns the Windows form of a slash separated path.
pub fn get_windows_path(path: &str) -> String {
    let windows_path = path.replace('/', "\\");
    if windows_path.starts_with('\\') {
        return format!("c:{}", windows_path);
    }
    windows_path
}

// Lexical cleanup of an absolute slash separated path.
fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}
