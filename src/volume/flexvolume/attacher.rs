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

use super::driver_call::{ATTACH_CMD, IS_ATTACHED_CMD, MOUNT_DEVICE_CMD, WAIT_FOR_ATTACH_CMD};
use super::{get_volume_source, FlexVolumeDriver};
use crate::api::core::Pod;
use crate::volume::util::create_dir_all_with_mode;
use crate::volume::{Attacher, DeviceMounter, Spec, VolumeError, VolumeResult};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// FlexVolumeAttacher drives attach and device mount through a flex driver,
/// falling back to built-in behavior for commands the driver lacks.
pub struct FlexVolumeAttacher {
    driver: Arc<FlexVolumeDriver>,
}

impl FlexVolumeAttacher {
    pub(super) fn new(driver: Arc<FlexVolumeDriver>) -> Self {
        Self { driver }
    }
}

impl Attacher for FlexVolumeAttacher {
    fn attach(&self, spec: &Spec, node_name: &str) -> VolumeResult<String> {
        let source = get_volume_source(spec)?;
        let mut call = self.driver.new_driver_call(ATTACH_CMD);
        call.append_spec(source, &BTreeMap::new())?.append(node_name);
        match call.run() {
            Ok(status) => Ok(status.device),
            Err(e) if e.is_not_supported() => {
                warn!("using default Attach for volume {}, node {}", spec.name(), node_name);
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn volumes_are_attached(&self, specs: &[Spec], node_name: &str) -> VolumeResult<HashMap<String, bool>> {
        let mut checks = HashMap::with_capacity(specs.len());
        for spec in specs {
            let source = match get_volume_source(spec) {
                Ok(source) => source,
                Err(e) => {
                    error!("Error getting volume ({:?}) source : {}", spec.name(), e);
                    continue;
                }
            };
            let mut call = self.driver.new_driver_call(IS_ATTACHED_CMD);
            call.append_spec(source, &BTreeMap::new())?.append(node_name);
            let attached = match call.run() {
                Ok(status) => status.attached,
                // Drivers without isattached are assumed to keep volumes attached.
                Err(e) if e.is_not_supported() => true,
                Err(e) => {
                    error!("Checking volume {:?} attachment failed: {}", spec.name(), e);
                    true
                }
            };
            checks.insert(spec.name().to_string(), attached);
        }
        Ok(checks)
    }

    fn wait_for_attach(
        &self,
        spec: &Spec,
        device_path: &str,
        _pod: Option<&Pod>,
        _timeout: Duration,
    ) -> VolumeResult<String> {
        let source = get_volume_source(spec)?;
        let mut call = self.driver.new_driver_call(WAIT_FOR_ATTACH_CMD);
        call.append(device_path).append_spec(source, &BTreeMap::new())?;
        match call.run() {
            Ok(status) => Ok(status.device),
            Err(e) if e.is_not_supported() => Ok(device_path.to_string()),
            Err(e) => Err(e.into()),
        }
    }
}

impl DeviceMounter for FlexVolumeAttacher {
    fn get_device_mount_path(&self, spec: &Spec) -> VolumeResult<PathBuf> {
        get_volume_source(spec)?;
        Ok(self.driver.device_mount_path(spec.name()))
    }

    fn mount_device(&self, spec: &Spec, device_path: &str, device_mount_path: &Path) -> VolumeResult<()> {
        let source = get_volume_source(spec)?;
        let mounter = self.driver.mounter();
        match mounter.is_likely_not_mount_point(device_mount_path) {
            Ok(false) => {
                warn!(
                    "Attempting to mount an already mounted device: {}",
                    device_mount_path.display()
                );
                return Ok(());
            }
            Ok(true) => {}
            Err(e) if e.is_not_exist() => {
                create_dir_all_with_mode(device_mount_path, 0o750)
                    .map_err(|e| VolumeError::io("mkdir", device_mount_path, e))?;
            }
            Err(e) => return Err(e.into()),
        }

        let mut call = self.driver.new_driver_call(MOUNT_DEVICE_CMD);
        call.append(device_mount_path.to_string_lossy())
            .append(device_path)
            .append_spec(source, &BTreeMap::new())?;
        let result = match call.run() {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_supported() => self.default_mount_device(spec, device_path, device_mount_path),
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            let _ = fs::remove_dir(device_mount_path);
        }
        result
    }
}

impl FlexVolumeAttacher {
    fn default_mount_device(&self, spec: &Spec, device_path: &str, device_mount_path: &Path) -> VolumeResult<()> {
        if device_path.is_empty() {
            return Err(VolumeError::invalid_argument(format!(
                "MountDevice failed for {}: device path is empty and the driver does not implement mountdevice",
                spec.name()
            )));
        }
        let source = get_volume_source(spec)?;
        warn!("using default MountDevice for volume {}, device {}", spec.name(), device_path);
        let options = if source.read_only { vec!["ro".to_string()] } else { Vec::new() };
        self.driver
            .safe_format_and_mount()
            .format_and_mount(device_path, device_mount_path, &source.fs_type, &options)?;
        Ok(())
    }
}
