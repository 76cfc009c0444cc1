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

//! Exec based volume drivers.
//!
//! A driver named `vendor/driver` is an executable found at
//! `<plugin dir>/vendor~driver/driver`. Every operation runs the executable
//! with a command name and arguments; the driver answers with a JSON
//! [`DriverStatus`]. Commands a driver reports as `Not supported` fall back
//! to the built-in behavior.

mod attacher;
mod detacher;
mod driver_call;

pub use attacher::FlexVolumeAttacher;
pub use detacher::FlexVolumeDetacher;
pub use driver_call::{DriverCall, DriverCapabilities, DriverStatus, FlexError};

use crate::api::core::{FlexVolumeSource, Pod, Volume, VolumeSource};
use crate::mount::{Interface, SafeFormatAndMount, MOUNTS_IN_GLOBAL_PD_PATH};
use crate::volume::util::{
    bind_mount_pod_volume, get_mount_refs, new_safe_format_and_mount_from_host, unmount_path,
};
use crate::volume::{
    AttachableVolumePlugin, Attacher, Attributes, Detacher, DeviceMountableVolumePlugin, DeviceMounter,
    DeviceUnmounter, Mounter, Spec, Unmounter, VolumeError, VolumeHost, VolumePlugin, VolumeResult,
};
use driver_call::{
    INIT_CMD, MOUNT_CMD, OPTION_POD_NAME, OPTION_POD_NAMESPACE, OPTION_POD_UID, UNMOUNT_CMD,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Prefix of every flex plugin name.
pub const FLEX_VOLUME_PLUGIN_NAME_PREFIX: &str = "flexvolume-";

/// Scan `plugin_dir` for `vendor~driver/driver` executables.
pub fn probe_volume_plugins(plugin_dir: &Path) -> Vec<Box<dyn VolumePlugin>> {
    let entries = match fs::read_dir(plugin_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Error reading flex volume plugin directory {}: {}", plugin_dir.display(), e);
            return Vec::new();
        }
    };

    let mut plugins: Vec<Box<dyn VolumePlugin>> = Vec::new();
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    for dir in dirs {
        let Some(dir_name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let executable_name = dir_name.rsplit('~').next().unwrap_or(&dir_name).to_string();
        let executable = dir.join(&executable_name);
        if !executable.is_file() {
            warn!("Flex driver executable {} does not exist, skipping", executable.display());
            continue;
        }
        let driver_name = dir_name.replace('~', "/");
        info!("Found flex volume driver {} at {}", driver_name, executable.display());
        plugins.push(Box::new(FlexVolumePlugin::new(&driver_name, executable)));
    }
    plugins
}

pub(crate) fn get_volume_source(spec: &Spec) -> VolumeResult<&FlexVolumeSource> {
    if let Some(source) = spec.volume.as_ref().and_then(|v| v.volume_source.flex_volume.as_ref()) {
        return Ok(source);
    }
    if let Some(source) = spec
        .persistent_volume
        .as_ref()
        .and_then(|pv| pv.spec.persistent_volume_source.flex_volume.as_ref())
    {
        return Ok(source);
    }
    Err(VolumeError::invalid_spec("Spec does not reference a FlexVolume type"))
}

// ============================================================================
// Driver
// ============================================================================

/// FlexVolumeDriver binds a driver executable to a volume host.
pub struct FlexVolumeDriver {
    driver_name: String,
    plugin_name: String,
    executable: PathBuf,
    host: Arc<dyn VolumeHost>,
}

impl FlexVolumeDriver {
    pub fn new(driver_name: &str, executable: PathBuf, host: Arc<dyn VolumeHost>) -> Self {
        Self {
            driver_name: driver_name.to_string(),
            plugin_name: format!("{}{}", FLEX_VOLUME_PLUGIN_NAME_PREFIX, driver_name),
            executable,
            host,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn new_driver_call(&self, command: &'static str) -> DriverCall {
        DriverCall::new(self.host.exec(&self.plugin_name), self.executable.clone(), command)
    }

    fn mounter(&self) -> Arc<dyn Interface> {
        self.host.mounter(&self.plugin_name)
    }

    fn safe_format_and_mount(&self) -> SafeFormatAndMount {
        new_safe_format_and_mount_from_host(&self.plugin_name, self.host.as_ref())
    }

    /// Returns `<plugin dir>/mounts/<volume name>`.
    fn device_mount_path(&self, volume_name: &str) -> PathBuf {
        self.host
            .plugin_dir(&self.plugin_name)
            .join(MOUNTS_IN_GLOBAL_PD_PATH)
            .join(volume_name)
    }

    /// Run `init` and return the reported capabilities. Drivers without
    /// `init` get the defaults.
    fn init(&self) -> VolumeResult<DriverCapabilities> {
        match self.new_driver_call(INIT_CMD).run() {
            Ok(status) => Ok(status.capabilities.unwrap_or_default()),
            Err(e) if e.is_not_supported() => Ok(DriverCapabilities::default()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Plugin
// ============================================================================

pub struct FlexVolumePlugin {
    driver_name: String,
    plugin_name: String,
    executable: PathBuf,
    driver: Option<Arc<FlexVolumeDriver>>,
    capabilities: DriverCapabilities,
}

impl FlexVolumePlugin {
    pub fn new(driver_name: &str, executable: PathBuf) -> Self {
        Self {
            driver_name: driver_name.to_string(),
            plugin_name: format!("{}{}", FLEX_VOLUME_PLUGIN_NAME_PREFIX, driver_name),
            executable,
            driver: None,
            capabilities: DriverCapabilities::default(),
        }
    }

    fn driver(&self) -> VolumeResult<&Arc<FlexVolumeDriver>> {
        self.driver
            .as_ref()
            .ok_or_else(|| VolumeError::internal(format!("volume plugin {} is not initialized", self.plugin_name)))
    }
}

impl VolumePlugin for FlexVolumePlugin {
    fn init(&mut self, host: Arc<dyn VolumeHost>) -> VolumeResult<()> {
        let driver = FlexVolumeDriver::new(&self.driver_name, self.executable.clone(), host);
        self.capabilities = driver.init()?;
        self.driver = Some(Arc::new(driver));
        Ok(())
    }

    fn name(&self) -> &str {
        &self.plugin_name
    }

    fn volume_name(&self, spec: &Spec) -> VolumeResult<String> {
        get_volume_source(spec)?;
        Ok(spec.name().to_string())
    }

    fn can_support(&self, spec: &Spec) -> bool {
        get_volume_source(spec).is_ok_and(|source| source.driver == self.driver_name)
    }

    fn supports_mount_option(&self) -> bool {
        false
    }

    fn supports_bulk_volume_verification(&self) -> bool {
        false
    }

    fn new_mounter(&self, spec: &Spec, pod: &Pod) -> VolumeResult<Box<dyn Mounter>> {
        let driver = self.driver()?;
        let source = get_volume_source(spec)?;
        Ok(Box::new(FlexVolumeMounter {
            driver: driver.clone(),
            volume_name: spec.name().to_string(),
            pod_uid: pod.metadata.uid.clone(),
            pod_name: pod.metadata.name.clone(),
            pod_namespace: pod.metadata.namespace.clone(),
            source: source.clone(),
            selinux_relabel: self.capabilities.selinux_relabel,
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> VolumeResult<Box<dyn Unmounter>> {
        Ok(Box::new(FlexVolumeUnmounter {
            driver: self.driver()?.clone(),
            volume_name: volume_name.to_string(),
            pod_uid: pod_uid.to_string(),
        }))
    }

    fn construct_volume_spec(&self, volume_name: &str, _mount_path: &Path) -> VolumeResult<Spec> {
        Ok(Spec::from_volume(Volume::new(
            volume_name,
            VolumeSource {
                flex_volume: Some(FlexVolumeSource {
                    driver: self.driver_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )))
    }

    fn as_attachable(&self) -> Option<&dyn AttachableVolumePlugin> {
        self.capabilities.attach.then_some(self as &dyn AttachableVolumePlugin)
    }

    fn as_device_mountable(&self) -> Option<&dyn DeviceMountableVolumePlugin> {
        self.capabilities.attach.then_some(self as &dyn DeviceMountableVolumePlugin)
    }
}

impl AttachableVolumePlugin for FlexVolumePlugin {
    fn new_attacher(&self) -> VolumeResult<Box<dyn Attacher>> {
        Ok(Box::new(FlexVolumeAttacher::new(self.driver()?.clone())))
    }

    fn new_detacher(&self) -> VolumeResult<Box<dyn Detacher>> {
        Ok(Box::new(FlexVolumeDetacher::new(self.driver()?.clone())))
    }
}

impl DeviceMountableVolumePlugin for FlexVolumePlugin {
    fn new_device_mounter(&self) -> VolumeResult<Box<dyn DeviceMounter>> {
        Ok(Box::new(FlexVolumeAttacher::new(self.driver()?.clone())))
    }

    fn new_device_unmounter(&self) -> VolumeResult<Box<dyn DeviceUnmounter>> {
        Ok(Box::new(FlexVolumeDetacher::new(self.driver()?.clone())))
    }

    fn get_device_mount_refs(&self, device_mount_path: &Path) -> VolumeResult<Vec<PathBuf>> {
        get_mount_refs(self.driver()?.mounter().as_ref(), device_mount_path)
    }
}

// ============================================================================
// Mounter / Unmounter
// ============================================================================

struct FlexVolumeMounter {
    driver: Arc<FlexVolumeDriver>,
    volume_name: String,
    pod_uid: String,
    pod_name: String,
    pod_namespace: String,
    source: FlexVolumeSource,
    selinux_relabel: bool,
}

impl Mounter for FlexVolumeMounter {
    fn get_path(&self) -> PathBuf {
        self.driver
            .host
            .pod_volume_dir(&self.pod_uid, &self.driver.plugin_name, &self.volume_name)
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            read_only: self.source.read_only,
            managed: !self.source.read_only,
            supports_selinux: self.selinux_relabel,
        }
    }

    fn set_up_at(&self, dir: &Path, fs_group: Option<i64>) -> VolumeResult<()> {
        let extra_options = BTreeMap::from([
            (OPTION_POD_NAME.to_string(), self.pod_name.clone()),
            (OPTION_POD_NAMESPACE.to_string(), self.pod_namespace.clone()),
            (OPTION_POD_UID.to_string(), self.pod_uid.clone()),
        ]);
        let mut call = self.driver.new_driver_call(MOUNT_CMD);
        call.append(dir.to_string_lossy()).append_spec(&self.source, &extra_options)?;
        match call.run() {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_supported() => {
                // Bind mount the device mounted by mountdevice.
                warn!("using default SetUpAt for {}", dir.display());
                let device_mount_path = self.driver.device_mount_path(&self.volume_name);
                bind_mount_pod_volume(
                    self.driver.mounter().as_ref(),
                    &device_mount_path,
                    dir,
                    self.source.read_only,
                    &[],
                    fs_group,
                )
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct FlexVolumeUnmounter {
    driver: Arc<FlexVolumeDriver>,
    volume_name: String,
    pod_uid: String,
}

impl Unmounter for FlexVolumeUnmounter {
    fn get_path(&self) -> PathBuf {
        self.driver
            .host
            .pod_volume_dir(&self.pod_uid, &self.driver.plugin_name, &self.volume_name)
    }

    fn tear_down_at(&self, dir: &Path) -> VolumeResult<()> {
        let mut call = self.driver.new_driver_call(UNMOUNT_CMD);
        call.append(dir.to_string_lossy());
        match call.run() {
            Ok(_) => {}
            Err(e) if e.is_not_supported() => return unmount_path(dir, self.driver.mounter().as_ref()),
            Err(e) => return Err(e.into()),
        }
        match fs::remove_dir(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::io("remove", dir, e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::mount::FakeExec;
    use crate::volume::host::FakeVolumeHost;
    use tempfile::TempDir;

    pub fn flex_spec() -> Spec {
        Spec::from_volume(Volume::new(
            "vol1",
            VolumeSource {
                flex_volume: Some(FlexVolumeSource {
                    driver: "acme/nfs".to_string(),
                    fs_type: "ext4".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
    }

    /// Returns a driver for `acme/nfs` whose calls go to `exec`.
    pub fn new_test_driver(
        exec: FakeExec,
    ) -> (Arc<FlexVolumeDriver>, Arc<FakeExec>, Arc<FakeVolumeHost>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeVolumeHost::new(dir.path()).with_exec(exec));
        let executable = dir.path().join("flex/acme~nfs/nfs");
        let driver = Arc::new(FlexVolumeDriver::new("acme/nfs", executable, host.clone()));
        (driver, host.fake_exec(), host, dir)
    }
}
