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

use super::driver_call::{DETACH_CMD, UNMOUNT_DEVICE_CMD};
use super::FlexVolumeDriver;
use crate::volume::util::{path_exists, path_status, unmount_path, PathStatus};
use crate::volume::{DeviceUnmounter, Detacher, VolumeError, VolumeResult};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// FlexVolumeDetacher detaches and unmounts devices through a flex driver.
pub struct FlexVolumeDetacher {
    driver: Arc<FlexVolumeDriver>,
}

impl FlexVolumeDetacher {
    pub(super) fn new(driver: Arc<FlexVolumeDriver>) -> Self {
        Self { driver }
    }

    fn default_detach(&self, volume_name: &str, node_name: &str) -> VolumeResult<()> {
        warn!(
            "using default Detach for volume {}, host {}: the flex driver {} does not implement detach",
            volume_name, node_name, self.driver.driver_name
        );
        Ok(())
    }

    fn default_unmount_device(&self, device_mount_path: &Path) -> VolumeResult<()> {
        warn!(
            "using default UnmountDevice for device mount path {}",
            device_mount_path.display()
        );
        unmount_path(device_mount_path, self.driver.mounter().as_ref())
    }
}

impl Detacher for FlexVolumeDetacher {
    fn detach(&self, volume_name: &str, node_name: &str) -> VolumeResult<()> {
        let mut call = self.driver.new_driver_call(DETACH_CMD);
        call.append(volume_name).append(node_name);
        match call.run() {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_supported() => self.default_detach(volume_name, node_name),
            Err(e) => Err(e.into()),
        }
    }
}

impl DeviceUnmounter for FlexVolumeDetacher {
    fn unmount_device(&self, device_mount_path: &Path) -> VolumeResult<()> {
        match path_status(device_mount_path) {
            Ok(PathStatus::NotExist) => {
                warn!(
                    "Warning: Unmount skipped because path does not exist: {}",
                    device_mount_path.display()
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(VolumeError::internal(format!("error checking path: {}", e))),
        }

        let not_mnt = match self.driver.mounter().is_likely_not_mount_point(device_mount_path) {
            Ok(not_mnt) => not_mnt,
            // A corrupted mount is still mounted.
            Err(e) if e.is_corrupted() => false,
            Err(e) => return Err(e.into()),
        };

        if not_mnt {
            warn!("Warning: Path: {} already unmounted", device_mount_path.display());
        } else {
            let mut call = self.driver.new_driver_call(UNMOUNT_DEVICE_CMD);
            call.append(device_mount_path.to_string_lossy());
            match call.run() {
                Ok(_) => {}
                Err(e) if e.is_not_supported() => self.default_unmount_device(device_mount_path)?,
                Err(e) => return Err(e.into()),
            }
        }

        // The driver may remove the directory itself.
        match path_exists(device_mount_path) {
            Ok(false) => Ok(()),
            Ok(true) => fs::remove_dir(device_mount_path)
                .or_else(|e| if e.kind() == io::ErrorKind::NotFound { Ok(()) } else { Err(e) })
                .map_err(|e| VolumeError::io("remove", device_mount_path, e)),
            Err(e) => Err(VolumeError::internal(format!("error checking if path exists: {}", e))),
        }
    }
}
