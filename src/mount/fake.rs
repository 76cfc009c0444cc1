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

use super::{Interface, MountError, MountPoint, MountResult};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// FakeAction records a single call made against a [`FakeMounter`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeAction {
    /// "mount" or "unmount".
    pub action: &'static str,
    pub target: PathBuf,
    pub source: String,
    pub fs_type: String,
}

#[derive(Debug, Default)]
struct FakeMounterState {
    mount_points: Vec<MountPoint>,
    log: Vec<FakeAction>,
    corrupted: HashSet<PathBuf>,
    next_mount_error: Option<(String, bool)>,
    unmount_error: Option<String>,
}

/// FakeMounter implements [`Interface`] against an in-memory mount table.
///
/// Paths must exist on disk for `is_likely_not_mount_point` to succeed, which
/// lets tests exercise directory creation and removal with a temp dir.
#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<FakeMounterState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fake with pre-populated mount points.
    pub fn with_mount_points(mount_points: Vec<MountPoint>) -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().mount_points = mount_points;
        fake
    }

    /// Make the next mount fail with `msg`. With `leave_mounted` the target is
    /// still recorded as mounted, as happens with a half-finished mount.
    pub fn fail_next_mount(&self, msg: &str, leave_mounted: bool) {
        self.state.lock().unwrap().next_mount_error = Some((msg.to_string(), leave_mounted));
    }

    /// Make every unmount fail with `msg`.
    pub fn fail_unmounts(&self, msg: &str) {
        self.state.lock().unwrap().unmount_error = Some(msg.to_string());
    }

    /// Mark `path` as a corrupted mount point.
    pub fn mark_corrupted(&self, path: &Path) {
        self.state.lock().unwrap().corrupted.insert(path.to_path_buf());
    }

    pub fn log(&self) -> Vec<FakeAction> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn reset_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn mount_points(&self) -> Vec<MountPoint> {
        self.state.lock().unwrap().mount_points.clone()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state
            .lock()
            .unwrap()
            .mount_points
            .iter()
            .any(|mp| mp.path == path)
    }
}

impl Interface for FakeMounter {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[String]) -> MountResult<()> {
        let mut state = self.state.lock().unwrap();
        let failure = state.next_mount_error.take();

        let leave_mounted = failure.as_ref().map_or(true, |(_, leave)| *leave);
        if leave_mounted {
            // Bind mounts report the device of the source mount.
            let device = if options.iter().any(|o| o == "bind") {
                state
                    .mount_points
                    .iter()
                    .find(|mp| mp.path == Path::new(source))
                    .map(|mp| mp.device.clone())
                    .unwrap_or_else(|| source.to_string())
            } else {
                source.to_string()
            };
            state.mount_points.push(MountPoint {
                device,
                path: target.to_path_buf(),
                fs_type: fstype.to_string(),
                opts: options.to_vec(),
            });
        }
        state.log.push(FakeAction {
            action: "mount",
            target: target.to_path_buf(),
            source: source.to_string(),
            fs_type: fstype.to_string(),
        });

        match failure {
            Some((msg, _)) => Err(MountError::other(msg)),
            None => Ok(()),
        }
    }

    fn unmount(&self, target: &Path) -> MountResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.unmount_error.clone() {
            return Err(MountError::other(msg));
        }
        state.mount_points.retain(|mp| mp.path != target);
        state.corrupted.remove(target);
        state.log.push(FakeAction {
            action: "unmount",
            target: target.to_path_buf(),
            source: String::new(),
            fs_type: String::new(),
        });
        Ok(())
    }

    fn list(&self) -> MountResult<Vec<MountPoint>> {
        Ok(self.mount_points())
    }

    fn is_likely_not_mount_point(&self, file: &Path) -> MountResult<bool> {
        {
            let state = self.state.lock().unwrap();
            if state.corrupted.contains(file) {
                return Err(MountError::Corrupted {
                    path: file.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::Other, "transport endpoint is not connected"),
                });
            }
        }
        fs::metadata(file).map_err(|e| MountError::from_io(file, e))?;
        Ok(!self.is_mounted(file))
    }
}
