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

//! Mount abstraction used by volume plugins.
//!
//! The [`Interface`] trait hides the operating system. [`Mounter`] drives the
//! `mount`/`umount` binaries through an [`Exec`]; [`FakeMounter`] keeps an
//! in-memory mount table for tests.

mod exec;
mod fake;
mod mounter;
mod safe_format;

pub use exec::{CommandExec, Exec, ExecError, FakeExec, FakeExecResponse};
pub use fake::{FakeAction, FakeMounter};
pub use mounter::Mounter;
pub use safe_format::SafeFormatAndMount;

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory under a plugin dir where devices are mounted globally before
/// being bind-mounted into pods.
pub const MOUNTS_IN_GLOBAL_PD_PATH: &str = "mounts";

/// Result type for mount operations.
pub type MountResult<T> = Result<T, MountError>;

/// MountError represents errors returned by mount operations.
#[derive(Debug, Error)]
pub enum MountError {
    /// The path does not exist.
    #[error("path {0:?} does not exist")]
    NotExist(PathBuf),

    /// The path is a mount point whose backing store went away.
    #[error("corrupted mount point {path:?}: {source}")]
    Corrupted { path: PathBuf, source: io::Error },

    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    /// An external command failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("failed to mount the volume as {want:?}, it already contains {have}. Mount error: {mount_error}")]
    FormatMismatch {
        want: String,
        have: String,
        mount_error: String,
    },

    #[error("{0}")]
    Other(String),
}

impl MountError {
    /// Classify an I/O error raised while inspecting `path`.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            return MountError::NotExist(path.to_path_buf());
        }
        if is_corrupted_io_error(&err) {
            return MountError::Corrupted {
                path: path.to_path_buf(),
                source: err,
            };
        }
        MountError::Io {
            context: format!("failed to stat {}", path.display()),
            source: err,
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        MountError::Other(msg.into())
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self, MountError::NotExist(_))
    }

    pub fn is_corrupted(&self) -> bool {
        matches!(self, MountError::Corrupted { .. })
    }
}

/// Returns true for ENOTCONN, ESTALE and EIO, which mean the mount point is
/// still present but its backend is gone.
#[cfg(unix)]
pub fn is_corrupted_io_error(err: &io::Error) -> bool {
    use nix::errno::Errno;
    matches!(
        err.raw_os_error(),
        Some(code) if code == Errno::ENOTCONN as i32
            || code == Errno::ESTALE as i32
            || code == Errno::EIO as i32
    )
}

#[cfg(not(unix))]
pub fn is_corrupted_io_error(_err: &io::Error) -> bool {
    false
}

/// MountPoint is a single entry of the mount table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MountPoint {
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub opts: Vec<String>,
}

/// Interface defines the set of methods to allow for mount operations on a system.
pub trait Interface: Send + Sync {
    /// Mount `source` at `target` with the given filesystem type and options.
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[String]) -> MountResult<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> MountResult<()>;

    /// List all mounted filesystems.
    fn list(&self) -> MountResult<Vec<MountPoint>>;

    /// Fast check that may report bind mounts as not mounted. Returns
    /// [`MountError::NotExist`] when the path is missing.
    fn is_likely_not_mount_point(&self, file: &Path) -> MountResult<bool>;

    /// Returns the device name backing `mount_path`, expressed relative to
    /// `<plugin_dir>/mounts` when a global mount of the same device exists.
    fn get_device_name_from_mount(&self, mount_path: &Path, plugin_dir: &Path) -> MountResult<String> {
        let mounts = self.list()?;
        let device = mounts
            .iter()
            .find(|mp| mp.path == mount_path)
            .map(|mp| mp.device.clone());

        let base_mount_path = plugin_dir.join(MOUNTS_IN_GLOBAL_PD_PATH);
        if let Some(device) = device {
            for mp in mounts.iter().filter(|mp| mp.device == device && mp.path != mount_path) {
                if let Ok(rel) = mp.path.strip_prefix(&base_mount_path) {
                    return Ok(rel.to_string_lossy().into_owned());
                }
            }
        }

        Ok(mount_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }
}
