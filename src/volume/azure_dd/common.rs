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

//! Helpers shared by the Azure disk mounter, attacher and provisioner.

use super::PLUGIN_NAME;
use crate::api::core::{AzureDataDiskCachingMode, AzureDataDiskKind, AzureDiskVolumeSource};
use crate::cloudprovider::{azure, CloudProvider};
use crate::mount::MOUNTS_IN_GLOBAL_PD_PATH;
use crate::volume::{Spec, VolumeError, VolumeHost, VolumeResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub(super) const DEFAULT_FS_TYPE: &str = "ext4";
pub(super) const DEFAULT_STORAGE_ACCOUNT_TYPE: &str = "Standard_LRS";
pub(super) const DEFAULT_STORAGE_ACCOUNT_KIND: AzureDataDiskKind = AzureDataDiskKind::Managed;

const SUPPORTED_STORAGE_ACCOUNT_TYPES: &[&str] = &["Standard_LRS", "Premium_LRS", "StandardSSD_LRS", "UltraSSD_LRS"];

/// Returns the Azure disk source of the spec and whether it is read-only.
pub(crate) fn get_volume_source(spec: &Spec) -> VolumeResult<(&AzureDiskVolumeSource, bool)> {
    if let Some(disk) = spec.volume.as_ref().and_then(|v| v.volume_source.azure_disk.as_ref()) {
        return Ok((disk, disk.read_only.unwrap_or(false)));
    }
    if let Some(disk) = spec
        .persistent_volume
        .as_ref()
        .and_then(|pv| pv.spec.persistent_volume_source.azure_disk.as_ref())
    {
        return Ok((disk, spec.read_only));
    }
    Err(VolumeError::invalid_spec(
        "azureDisk - Spec does not reference an Azure disk volume type",
    ))
}

pub(super) fn fs_type(source: &AzureDiskVolumeSource) -> &str {
    match source.fs_type.as_deref() {
        Some(fs) if !fs.is_empty() => fs,
        _ => DEFAULT_FS_TYPE,
    }
}

/// Returns the global mount path of a disk. The URI is hashed so similar
/// `.vhd` names cannot collide, and prefixed with `m` for managed and `b`
/// for blob disks.
pub fn make_global_pd_path(host: &dyn VolumeHost, disk_uri: &str, is_managed: bool) -> PathBuf {
    // Users may enter the uri in caps.
    let hashed_disk_uri = azure::make_crc32(&disk_uri.to_lowercase());
    let prefix = if is_managed { "m" } else { "b" };
    host.plugin_dir(PLUGIN_NAME)
        .join(MOUNTS_IN_GLOBAL_PD_PATH)
        .join(format!("{}{}", prefix, hashed_disk_uri))
}

/// Global mount path of a source. Specs rebuilt from the node carry no kind
/// and are mounted under the raw URI.
pub(super) fn device_mount_path(host: &dyn VolumeHost, source: &AzureDiskVolumeSource) -> PathBuf {
    match source.kind {
        None => host
            .plugin_dir(PLUGIN_NAME)
            .join(MOUNTS_IN_GLOBAL_PD_PATH)
            .join(source.data_disk_uri.trim_start_matches('/')),
        Some(kind) => make_global_pd_path(host, &source.data_disk_uri, kind == AzureDataDiskKind::Managed),
    }
}

pub(super) fn get_cloud_provider(host: &dyn VolumeHost) -> VolumeResult<Arc<dyn CloudProvider>> {
    match host.cloud_provider() {
        Some(cloud) if cloud.provider_name() == azure::PROVIDER_NAME => Ok(cloud),
        Some(cloud) => Err(VolumeError::internal(format!(
            "invalid cloud provider: expected Azure: {}",
            cloud.provider_name()
        ))),
        None => Err(VolumeError::internal("cloud provider is nil")),
    }
}

pub(super) fn disk_controller(cloud: &dyn CloudProvider) -> VolumeResult<&dyn azure::DiskController> {
    cloud
        .azure_disks()
        .ok_or_else(|| VolumeError::internal("cloud provider does not support Azure data disks"))
}

pub(super) fn managed_disk_controller(cloud: &dyn CloudProvider) -> VolumeResult<&azure::ManagedDiskController> {
    cloud
        .azure_managed_disks()
        .ok_or_else(|| VolumeError::internal("cloud provider does not support Azure managed disks"))
}

/// Validate a storage account type, case-insensitively. Empty selects
/// `Standard_LRS`.
pub(super) fn normalize_storage_account_type(storage_account_type: &str) -> VolumeResult<String> {
    if storage_account_type.is_empty() {
        return Ok(DEFAULT_STORAGE_ACCOUNT_TYPE.to_string());
    }
    SUPPORTED_STORAGE_ACCOUNT_TYPES
        .iter()
        .find(|t| t.eq_ignore_ascii_case(storage_account_type))
        .map(|t| t.to_string())
        .ok_or_else(|| {
            VolumeError::invalid_argument(format!(
                "azureDisk - {} is not supported sku/storageaccounttype. Supported values are {:?}",
                storage_account_type, SUPPORTED_STORAGE_ACCOUNT_TYPES
            ))
        })
}

pub(super) fn normalize_kind(kind: &str) -> VolumeResult<AzureDataDiskKind> {
    if kind.is_empty() {
        return Ok(DEFAULT_STORAGE_ACCOUNT_KIND);
    }
    AzureDataDiskKind::from_str(kind).ok_or_else(|| {
        VolumeError::invalid_argument(format!(
            "azureDisk - {} is not supported disk kind. Supported values are [Shared Dedicated Managed]",
            kind
        ))
    })
}

pub(super) fn normalize_caching_mode(caching_mode: &str) -> VolumeResult<AzureDataDiskCachingMode> {
    if caching_mode.is_empty() {
        return Ok(AzureDataDiskCachingMode::default());
    }
    AzureDataDiskCachingMode::from_str(caching_mode).ok_or_else(|| {
        VolumeError::invalid_argument(format!(
            "azureDisk - {} is not supported cachingmode. Supported values are [None ReadOnly ReadWrite]",
            caching_mode
        ))
    })
}

/// Parse the `zoned` parameter. Unset means zoned for managed disks only.
pub(super) fn parse_zoned(zoned: &str, kind: AzureDataDiskKind) -> VolumeResult<bool> {
    if zoned.is_empty() {
        return Ok(kind == AzureDataDiskKind::Managed);
    }
    let zoned = match zoned.to_lowercase().as_str() {
        "true" | "1" | "t" => true,
        "false" | "0" | "f" => false,
        _ => {
            return Err(VolumeError::invalid_argument(format!(
                "failed to parse 'zoned': strconv.ParseBool: parsing {:?}: invalid syntax",
                zoned
            )))
        }
    };
    if zoned && kind != AzureDataDiskKind::Managed {
        return Err(VolumeError::invalid_argument("zoned is only supported by managed disks"));
    }
    Ok(zoned)
}

/// The attacher reports the LUN as the device path.
pub(super) fn get_disk_lun(device_path: &str) -> VolumeResult<i32> {
    device_path.trim().parse().map_err(|e| {
        VolumeError::invalid_argument(format!("failed to parse lun from device path {:?}: {}", device_path, e))
    })
}

// ============================================================================
// SCSI device discovery
// ============================================================================

const AZURE_DISK_DIR: &str = "/dev/disk/azure";
const SCSI_DEVICES_DIR: &str = "/sys/bus/scsi/devices";
const SCSI_HOST_DIR: &str = "/sys/class/scsi_host";
const DEV_DIR: &str = "/dev";

/// ScsiDiskFinder locates data disks by LUN through sysfs.
#[derive(Debug, Clone)]
pub struct ScsiDiskFinder {
    azure_disk_dir: PathBuf,
    scsi_devices_dir: PathBuf,
    scsi_host_dir: PathBuf,
    dev_dir: PathBuf,
}

impl Default for ScsiDiskFinder {
    fn default() -> Self {
        Self {
            azure_disk_dir: PathBuf::from(AZURE_DISK_DIR),
            scsi_devices_dir: PathBuf::from(SCSI_DEVICES_DIR),
            scsi_host_dir: PathBuf::from(SCSI_HOST_DIR),
            dev_dir: PathBuf::from(DEV_DIR),
        }
    }
}

impl ScsiDiskFinder {
    /// Resolve every system path under `root` instead of `/`.
    pub fn with_root(root: &Path) -> Self {
        let under = |p: &str| root.join(p.trim_start_matches('/'));
        Self {
            azure_disk_dir: under(AZURE_DISK_DIR),
            scsi_devices_dir: under(SCSI_DEVICES_DIR),
            scsi_host_dir: under(SCSI_HOST_DIR),
            dev_dir: under(DEV_DIR),
        }
    }

    /// Ask every SCSI host to rescan so newly attached disks show up.
    pub fn rescan(&self) {
        let Ok(entries) = fs::read_dir(&self.scsi_host_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("host") {
                continue;
            }
            let scan = entry.path().join("scan");
            if let Err(e) = fs::write(&scan, b"- - -") {
                warn!("failed to rescan scsi host {}: {}", scan.display(), e);
            }
        }
    }

    /// Device names the udev rules link under /dev/disk/azure. These are the
    /// OS and resource disks.
    fn system_disks(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.azure_disk_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| fs::read_link(e.path()).ok())
            .filter_map(|link| link.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }

    /// Returns the device path of the data disk at `lun`, or None if no such
    /// disk is visible yet.
    pub fn find_disk_by_lun(&self, lun: i32) -> VolumeResult<Option<String>> {
        let system_disks = self.system_disks();
        let entries = match fs::read_dir(&self.scsi_devices_dir) {
            Ok(entries) => entries,
            Err(e) => return Err(VolumeError::io("read dir", &self.scsi_devices_dir, e)),
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Entries look like 3:0:0:1, host:channel:target:lun.
            let arr: Vec<&str> = name.split(':').collect();
            if arr.len() < 4 {
                continue;
            }
            if system_disks.is_empty() {
                debug!("/dev/disk/azure is not populated, now try to parse {} directly", name);
                // Targets 0-3 are used by OS disks.
                match arr[0].parse::<i32>() {
                    Ok(target) if target <= 3 => continue,
                    Ok(_) => {}
                    Err(_) => continue,
                }
            }
            if arr[3].parse::<i32>().ok() != Some(lun) {
                continue;
            }

            let dir = entry.path();
            if !read_trimmed(&dir.join("vendor")).eq_ignore_ascii_case("MSFT") {
                debug!("vendor doesn't match VHD for {}", name);
                continue;
            }
            if !read_trimmed(&dir.join("model")).eq_ignore_ascii_case("VIRTUAL DISK") {
                debug!("model doesn't match VHD for {}", name);
                continue;
            }

            let Ok(mut block) = fs::read_dir(dir.join("block")) else {
                continue;
            };
            let Some(Ok(dev)) = block.next() else {
                continue;
            };
            let dev_name = dev.file_name().to_string_lossy().into_owned();
            if system_disks.contains(&dev_name) {
                continue;
            }
            return Ok(Some(self.dev_dir.join(dev_name).to_string_lossy().into_owned()));
        }
        Ok(None)
    }
}

fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path).map(|s| s.trim().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{Volume, VolumeSource};
    use crate::volume::host::testing::new_fake_host;

    fn add_scsi_device(root: &Path, name: &str, vendor: &str, model: &str, dev: &str) {
        let dir = root.join("sys/bus/scsi/devices").join(name);
        fs::create_dir_all(dir.join("block").join(dev)).unwrap();
        fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("model"), format!("{}   \n", model)).unwrap();
    }

    #[test]
    fn test_get_volume_source() {
        let spec = Spec::from_volume(Volume::new(
            "vol",
            VolumeSource {
                azure_disk: Some(AzureDiskVolumeSource {
                    disk_name: "disk".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ));
        let (source, read_only) = get_volume_source(&spec).unwrap();
        assert_eq!(source.disk_name, "disk");
        assert!(read_only);
        assert_eq!(fs_type(source), "ext4");
        assert!(get_volume_source(&Spec::default()).is_err());
    }

    #[test]
    fn test_global_pd_path() {
        let (host, _dir) = new_fake_host(None);
        let uri = "https://account.blob.core.windows.net/vhds/disk.vhd";
        let managed = make_global_pd_path(host.as_ref(), uri, true);
        let blob = make_global_pd_path(host.as_ref(), uri, false);
        let base = host.plugin_dir(PLUGIN_NAME).join("mounts");
        assert_eq!(managed, base.join(format!("m{}", azure::make_crc32(uri))));
        assert_eq!(blob, base.join(format!("b{}", azure::make_crc32(uri))));
        // The uri is lower-cased before hashing.
        assert_eq!(make_global_pd_path(host.as_ref(), &uri.to_uppercase(), true), managed);

        let raw = AzureDiskVolumeSource {
            data_disk_uri: "/subscriptions/s/disks/d".to_string(),
            ..Default::default()
        };
        assert_eq!(device_mount_path(host.as_ref(), &raw), base.join("subscriptions/s/disks/d"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_storage_account_type("").unwrap(), "Standard_LRS");
        assert_eq!(normalize_storage_account_type("premium_lrs").unwrap(), "Premium_LRS");
        assert!(normalize_storage_account_type("Gold_LRS")
            .unwrap_err()
            .to_string()
            .starts_with("azureDisk - Gold_LRS is not supported sku/storageaccounttype."));

        assert_eq!(normalize_kind("").unwrap(), AzureDataDiskKind::Managed);
        assert_eq!(normalize_kind("dedicated").unwrap(), AzureDataDiskKind::Dedicated);
        assert!(normalize_kind("striped").is_err());

        assert_eq!(normalize_caching_mode("").unwrap(), AzureDataDiskCachingMode::ReadOnly);
        assert_eq!(normalize_caching_mode("none").unwrap(), AzureDataDiskCachingMode::None);
        assert!(normalize_caching_mode("writeback").is_err());
    }

    #[test]
    fn test_parse_zoned() {
        struct TestCase {
            name: &'static str,
            zoned: &'static str,
            kind: AzureDataDiskKind,
            expected: Result<bool, &'static str>,
        }
        let test_cases = vec![
            TestCase {
                name: "managed defaults to zoned",
                zoned: "",
                kind: AzureDataDiskKind::Managed,
                expected: Ok(true),
            },
            TestCase {
                name: "blob defaults to unzoned",
                zoned: "",
                kind: AzureDataDiskKind::Shared,
                expected: Ok(false),
            },
            TestCase {
                name: "explicit false",
                zoned: "false",
                kind: AzureDataDiskKind::Managed,
                expected: Ok(false),
            },
            TestCase {
                name: "zoned blob",
                zoned: "true",
                kind: AzureDataDiskKind::Dedicated,
                expected: Err("zoned is only supported by managed disks"),
            },
        ];
        for tc in test_cases {
            match tc.expected {
                Ok(v) => assert_eq!(parse_zoned(tc.zoned, tc.kind).unwrap(), v, "{}", tc.name),
                Err(msg) => assert_eq!(parse_zoned(tc.zoned, tc.kind).unwrap_err().to_string(), msg, "{}", tc.name),
            }
        }
        assert!(parse_zoned("maybe", AzureDataDiskKind::Managed).is_err());
    }

    #[test]
    fn test_get_disk_lun() {
        assert_eq!(get_disk_lun("3").unwrap(), 3);
        assert!(get_disk_lun("/dev/sdc").is_err());
    }

    #[test]
    fn test_find_disk_by_lun() {
        let root = tempfile::tempdir().unwrap();
        let finder = ScsiDiskFinder::with_root(root.path());

        // No sysfs at all.
        assert!(finder.find_disk_by_lun(1).is_err());

        add_scsi_device(root.path(), "2:0:0:1", "Msft", "Virtual Disk", "sda");
        add_scsi_device(root.path(), "5:0:0:0", "Msft", "Virtual Disk", "sdc");
        add_scsi_device(root.path(), "5:0:0:1", "Vendor", "Virtual Disk", "sdd");
        add_scsi_device(root.path(), "6:0:0:1", "MSFT", "Virtual Disk", "sde");

        assert_eq!(
            finder.find_disk_by_lun(0).unwrap(),
            Some(root.path().join("dev/sdc").to_string_lossy().into_owned())
        );
        assert_eq!(
            finder.find_disk_by_lun(1).unwrap(),
            Some(root.path().join("dev/sde").to_string_lossy().into_owned())
        );
        assert_eq!(finder.find_disk_by_lun(7).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_disk_skips_system_disks() {
        let root = tempfile::tempdir().unwrap();
        let finder = ScsiDiskFinder::with_root(root.path());
        let azure_dir = root.path().join("dev/disk/azure");
        fs::create_dir_all(&azure_dir).unwrap();
        std::os::unix::fs::symlink("../../sda", azure_dir.join("root")).unwrap();

        // With /dev/disk/azure populated, low targets are considered too.
        add_scsi_device(root.path(), "0:0:0:0", "Msft", "Virtual Disk", "sda");
        add_scsi_device(root.path(), "1:0:0:0", "Msft", "Virtual Disk", "sdb");
        assert_eq!(
            finder.find_disk_by_lun(0).unwrap(),
            Some(root.path().join("dev/sdb").to_string_lossy().into_owned())
        );
    }

    #[test]
    fn test_rescan_writes_scan_files() {
        let root = tempfile::tempdir().unwrap();
        let host_dir = root.path().join("sys/class/scsi_host/host0");
        fs::create_dir_all(&host_dir).unwrap();
        ScsiDiskFinder::with_root(root.path()).rescan();
        assert_eq!(fs::read_to_string(host_dir.join("scan")).unwrap(), "- - -");
    }
}
