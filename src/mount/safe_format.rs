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

use super::{Exec, Interface, MountError, MountResult};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_FS_TYPE: &str = "ext4";

/// blkid exits with 2 when the device carries no recognizable signature.
const BLKID_NO_SIGNATURE: i32 = 2;

/// SafeFormatAndMount formats a disk before the first mount if it is unformatted.
pub struct SafeFormatAndMount {
    pub mounter: Arc<dyn Interface>,
    pub exec: Arc<dyn Exec>,
}

impl SafeFormatAndMount {
    pub fn new(mounter: Arc<dyn Interface>, exec: Arc<dyn Exec>) -> Self {
        Self { mounter, exec }
    }

    /// Mount `source` at `target`, formatting it first when the mount fails
    /// because the disk is blank. Read-only mounts are never formatted.
    pub fn format_and_mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> MountResult<()> {
        let read_only = options.iter().any(|o| o == "ro");
        let mut options = options.to_vec();
        if !read_only {
            options.push("defaults".to_string());
        }

        let mount_err = match self.mounter.mount(source, target, fstype, &options) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if read_only {
            return Err(mount_err);
        }

        let existing = self.get_disk_format(source)?;
        if existing.is_empty() {
            let fstype = if fstype.is_empty() { DEFAULT_FS_TYPE } else { fstype };
            let args = if fstype == "ext4" || fstype == "ext3" {
                vec!["-F".to_string(), "-m0".to_string(), source.to_string()]
            } else {
                vec![source.to_string()]
            };
            info!(
                "Disk {:?} appears to be unformatted, attempting to format as type: {:?} with options: {:?}",
                source, fstype, args
            );
            self.exec.run(&format!("mkfs.{}", fstype), &args).map_err(|e| {
                MountError::other(format!("format of disk {:?} failed: {}", source, e))
            })?;
            info!("Disk successfully formatted (mkfs): {} - {} {}", fstype, source, target.display());
            return self.mounter.mount(source, target, fstype, &options);
        }

        if !fstype.is_empty() && fstype != existing {
            return Err(MountError::FormatMismatch {
                want: fstype.to_string(),
                have: existing,
                mount_error: mount_err.to_string(),
            });
        }
        Err(mount_err)
    }

    /// Returns the filesystem on `disk`, or an empty string when it is blank.
    pub fn get_disk_format(&self, disk: &str) -> MountResult<String> {
        let args: Vec<String> = ["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", disk]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = match self.exec.run("blkid", &args) {
            Ok(out) => String::from_utf8_lossy(&out).into_owned(),
            Err(e) if e.exit_status() == Some(BLKID_NO_SIGNATURE) => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        let mut fstype = String::new();
        let mut pttype = String::new();
        for line in output.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            match key {
                "TYPE" => fstype = value.to_string(),
                "PTTYPE" => pttype = value.to_string(),
                _ => {}
            }
        }

        if !pttype.is_empty() {
            warn!("Disk {} detected partition table type: {}", disk, pttype);
            return Ok("unknown data, probably partitions".to_string());
        }
        Ok(fstype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{FakeExec, FakeExecResponse, FakeMounter};

    struct TestCase {
        name: &'static str,
        fstype: &'static str,
        options: Vec<&'static str>,
        mount_fails: bool,
        exec: Vec<FakeExecResponse>,
        expect_err: Option<&'static str>,
        expect_mounted: bool,
        expect_commands: Vec<&'static str>,
    }

    #[test]
    fn test_format_and_mount() {
        let test_cases = vec![
            TestCase {
                name: "already formatted disk mounts directly",
                fstype: "ext4",
                options: vec![],
                mount_fails: false,
                exec: vec![],
                expect_err: None,
                expect_mounted: true,
                expect_commands: vec![],
            },
            TestCase {
                name: "blank disk is formatted then mounted",
                fstype: "ext4",
                options: vec![],
                mount_fails: true,
                exec: vec![
                    FakeExecResponse::fail("blkid", 2, ""),
                    FakeExecResponse::ok("mkfs.ext4", ""),
                ],
                expect_err: None,
                expect_mounted: true,
                expect_commands: vec!["blkid", "mkfs.ext4"],
            },
            TestCase {
                name: "read only mount is never formatted",
                fstype: "ext4",
                options: vec!["ro"],
                mount_fails: true,
                exec: vec![],
                expect_err: Some("unknown filesystem"),
                expect_mounted: false,
                expect_commands: vec![],
            },
            TestCase {
                name: "existing filesystem of another type",
                fstype: "xfs",
                options: vec![],
                mount_fails: true,
                exec: vec![FakeExecResponse::ok("blkid", "DEVNAME=/dev/sdb\nTYPE=ext4\n")],
                expect_err: Some("failed to mount the volume as \"xfs\", it already contains ext4"),
                expect_mounted: false,
                expect_commands: vec!["blkid"],
            },
            TestCase {
                name: "partitioned disk",
                fstype: "ext4",
                options: vec![],
                mount_fails: true,
                exec: vec![FakeExecResponse::ok("blkid", "PTTYPE=dos\n")],
                expect_err: Some("it already contains unknown data, probably partitions"),
                expect_mounted: false,
                expect_commands: vec!["blkid"],
            },
        ];

        for tc in test_cases {
            let mounter = Arc::new(FakeMounter::new());
            if tc.mount_fails {
                mounter.fail_next_mount("unknown filesystem", false);
            }
            let exec = Arc::new(FakeExec::new(tc.exec));
            let sfm = SafeFormatAndMount::new(mounter.clone(), exec.clone());
            let options: Vec<String> = tc.options.iter().map(|s| s.to_string()).collect();

            let result = sfm.format_and_mount("/dev/sdb", Path::new("/mnt/disk"), tc.fstype, &options);
            match tc.expect_err {
                Some(msg) => {
                    let err = result.expect_err(tc.name);
                    assert!(err.to_string().contains(msg), "{}: got {}", tc.name, err);
                }
                None => assert!(result.is_ok(), "{}: {:?}", tc.name, result),
            }
            assert_eq!(
                mounter.is_mounted(Path::new("/mnt/disk")),
                tc.expect_mounted,
                "{}: mounted",
                tc.name
            );
            let commands: Vec<String> = exec.calls().into_iter().map(|(cmd, _)| cmd).collect();
            assert_eq!(commands, tc.expect_commands, "{}: commands", tc.name);
        }
    }
}
