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

use crate::api::core::FlexVolumeSource;
use crate::mount::{Exec, ExecError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

// Driver commands.
pub const INIT_CMD: &str = "init";
pub const ATTACH_CMD: &str = "attach";
pub const WAIT_FOR_ATTACH_CMD: &str = "waitforattach";
pub const MOUNT_DEVICE_CMD: &str = "mountdevice";
pub const DETACH_CMD: &str = "detach";
pub const IS_ATTACHED_CMD: &str = "isattached";
pub const UNMOUNT_DEVICE_CMD: &str = "unmountdevice";
pub const MOUNT_CMD: &str = "mount";
pub const UNMOUNT_CMD: &str = "unmount";

// Option keys passed to the driver alongside the user options.
pub const OPTION_FS_TYPE: &str = "kubernetes.io/fsType";
pub const OPTION_READ_WRITE: &str = "kubernetes.io/readwrite";
pub const OPTION_POD_NAME: &str = "kubernetes.io/pod.name";
pub const OPTION_POD_NAMESPACE: &str = "kubernetes.io/pod.namespace";
pub const OPTION_POD_UID: &str = "kubernetes.io/pod.uid";

const STATUS_SUCCESS: &str = "Success";
const STATUS_NOT_SUPPORTED: &str = "Not supported";

#[derive(Debug, Error)]
pub enum FlexError {
    /// The driver does not implement the command; callers fall back to
    /// the built-in behavior.
    #[error("Not supported")]
    NotSupported,

    /// The driver reported a failure.
    #[error("{0}")]
    Driver(String),

    #[error("failed to unmarshal output for command: {cmd}, output: {output:?}, error: {source}")]
    Output {
        cmd: String,
        output: String,
        source: serde_json::Error,
    },

    #[error("failed to marshal spec, error: {0}")]
    Options(serde_json::Error),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl FlexError {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, FlexError::NotSupported)
    }
}

/// DriverCapabilities is reported by the driver's `init` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverCapabilities {
    #[serde(default = "default_attach")]
    pub attach: bool,
    #[serde(default)]
    pub selinux_relabel: bool,
}

fn default_attach() -> bool {
    true
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            attach: true,
            selinux_relabel: true,
        }
    }
}

/// DriverStatus is the JSON object a driver prints on stdout.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverStatus {
    /// One of `Success`, `Failure` or `Not supported`.
    pub status: String,
    pub message: String,
    /// Path to the device attached, for attach and waitforattach.
    pub device: String,
    pub volume_name: String,
    /// Set by isattached.
    pub attached: bool,
    pub capabilities: Option<DriverCapabilities>,
}

/// DriverCall runs a single command against a flex driver executable.
pub struct DriverCall {
    exec: Arc<dyn Exec>,
    executable: PathBuf,
    command: &'static str,
    args: Vec<String>,
}

impl DriverCall {
    pub fn new(exec: Arc<dyn Exec>, executable: PathBuf, command: &'static str) -> Self {
        Self {
            exec,
            executable,
            command,
            args: Vec::new(),
        }
    }

    pub fn append(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Append the options as a single JSON argument.
    pub fn append_spec(
        &mut self,
        source: &FlexVolumeSource,
        extra_options: &BTreeMap<String, String>,
    ) -> Result<&mut Self, FlexError> {
        let options = flex_options(source, extra_options);
        let json = serde_json::to_string(&options).map_err(FlexError::Options)?;
        Ok(self.append(json))
    }

    pub fn run(&self) -> Result<DriverStatus, FlexError> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.command.to_string());
        args.extend(self.args.iter().cloned());

        let executable = self.executable.to_string_lossy();
        debug!("FlexVolume: calling {} {:?}", executable, args);
        let output = match self.exec.run(&executable, &args) {
            Ok(out) => String::from_utf8_lossy(&out).into_owned(),
            // Drivers report failures as JSON on stdout with a non-zero exit.
            Err(ExecError::Exit { output, .. }) if !output.trim().is_empty() => {
                warn!("FlexVolume: driver call failed: executable: {}, args: {:?}", executable, args);
                output
            }
            Err(e) => return Err(e.into()),
        };

        let status = handle_cmd_response(self.command, &output)?;
        debug!("FlexVolume: {} returned {:?}", self.command, status);
        Ok(status)
    }
}

/// Merge the volume options with the well-known keys every call carries.
pub fn flex_options(source: &FlexVolumeSource, extra_options: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut options: BTreeMap<String, String> = source
        .options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    options.extend(extra_options.iter().map(|(k, v)| (k.clone(), v.clone())));
    options.insert(OPTION_FS_TYPE.to_string(), source.fs_type.clone());
    let rw = if source.read_only { "ro" } else { "rw" };
    options.insert(OPTION_READ_WRITE.to_string(), rw.to_string());
    options
}

fn handle_cmd_response(cmd: &str, output: &str) -> Result<DriverStatus, FlexError> {
    let status: DriverStatus = serde_json::from_str(output).map_err(|source| FlexError::Output {
        cmd: cmd.to_string(),
        output: output.to_string(),
        source,
    })?;
    match status.status.as_str() {
        STATUS_SUCCESS => Ok(status),
        STATUS_NOT_SUPPORTED => {
            debug!("{} command is not supported by the driver", cmd);
            Err(FlexError::NotSupported)
        }
        _ => {
            warn!("FlexVolume: {} failed: {}", cmd, status.message);
            Err(FlexError::Driver(status.message))
        }
    }
}
