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

use super::{Exec, Interface, MountError, MountPoint, MountResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const PROC_MOUNTS_PATH: &str = "/proc/mounts";

/// Mounter drives the host `mount` and `umount` binaries.
pub struct Mounter {
    exec: Arc<dyn Exec>,
    proc_mounts: PathBuf,
}

impl Mounter {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            proc_mounts: PathBuf::from(PROC_MOUNTS_PATH),
        }
    }

    /// Read the mount table from a different file.
    pub fn with_proc_mounts(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_mounts = path.into();
        self
    }
}

/// Builds the argument list for `mount`.
pub(crate) fn make_mount_args(source: &str, target: &Path, fstype: &str, options: &[String]) -> Vec<String> {
    let mut args = Vec::new();
    if !fstype.is_empty() {
        args.push("-t".to_string());
        args.push(fstype.to_string());
    }
    if !options.is_empty() {
        args.push("-o".to_string());
        args.push(options.join(","));
    }
    args.push(source.to_string());
    args.push(target.to_string_lossy().into_owned());
    args
}

/// Parses the contents of /proc/mounts.
pub(crate) fn parse_proc_mounts(content: &str) -> MountResult<Vec<MountPoint>> {
    let mut out = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(MountError::other(format!(
                "wrong number of fields (expected 6, got {}): {}",
                fields.len(),
                line
            )));
        }
        out.push(MountPoint {
            device: fields[0].to_string(),
            path: PathBuf::from(fields[1]),
            fs_type: fields[2].to_string(),
            opts: fields[3].split(',').map(String::from).collect(),
        });
    }
    Ok(out)
}

impl Interface for Mounter {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[String]) -> MountResult<()> {
        let args = make_mount_args(source, target, fstype, options);
        debug!(source, target = %target.display(), fstype, "mounting");
        self.exec.run("mount", &args)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> MountResult<()> {
        debug!(target = %target.display(), "unmounting");
        self.exec
            .run("umount", &[target.to_string_lossy().into_owned()])?;
        Ok(())
    }

    fn list(&self) -> MountResult<Vec<MountPoint>> {
        let content = fs::read_to_string(&self.proc_mounts)
            .map_err(|e| MountError::from_io(&self.proc_mounts, e))?;
        parse_proc_mounts(&content)
    }

    #[cfg(unix)]
    fn is_likely_not_mount_point(&self, file: &Path) -> MountResult<bool> {
        use std::os::unix::fs::MetadataExt;

        let stat = fs::metadata(file).map_err(|e| MountError::from_io(file, e))?;
        let parent = file.parent().unwrap_or(Path::new("/"));
        let root_stat = fs::symlink_metadata(parent).map_err(|e| MountError::from_io(parent, e))?;
        // A different device than the parent means a mount point.
        Ok(stat.dev() == root_stat.dev())
    }

    #[cfg(not(unix))]
    fn is_likely_not_mount_point(&self, file: &Path) -> MountResult<bool> {
        fs::metadata(file).map_err(|e| MountError::from_io(file, e))?;
        let mounts = self.list()?;
        Ok(!mounts.iter().any(|mp| mp.path == file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::FakeExec;

    #[test]
    fn test_make_mount_args() {
        let args = make_mount_args(
            "/dev/sdb",
            Path::new("/mnt/disk"),
            "ext4",
            &["ro".to_string(), "bind".to_string()],
        );
        assert_eq!(args, vec!["-t", "ext4", "-o", "ro,bind", "/dev/sdb", "/mnt/disk"]);

        let args = make_mount_args("/src", Path::new("/dst"), "", &[]);
        assert_eq!(args, vec!["/src", "/dst"]);
    }

    #[test]
    fn test_parse_proc_mounts() {
        let content = "/dev/sda1 / ext4 rw,relatime 0 0\n\
                       tmpfs /run tmpfs rw,nosuid 0 0\n";
        let mounts = parse_proc_mounts(content).unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].device, "tmpfs");
        assert_eq!(mounts[1].opts, vec!["rw", "nosuid"]);

        assert!(parse_proc_mounts("bad line\n").is_err());
    }

    #[test]
    fn test_mounter_runs_commands() {
        let exec = Arc::new(FakeExec::default());
        let mounter = Mounter::new(exec.clone());
        mounter
            .mount("/dev/sdb", Path::new("/mnt"), "xfs", &[])
            .unwrap();
        mounter.unmount(Path::new("/mnt")).unwrap();

        let calls = exec.calls();
        assert_eq!(calls[0].0, "mount");
        assert_eq!(calls[0].1, vec!["-t", "xfs", "/dev/sdb", "/mnt"]);
        assert_eq!(calls[1], ("umount".to_string(), vec!["/mnt".to_string()]));
    }

    #[test]
    fn test_mounter_list_and_device_name() {
        let dir = tempfile::tempdir().unwrap();
        let proc_mounts = dir.path().join("mounts");
        fs::write(
            &proc_mounts,
            "/dev/xvdf /var/lib/kubelet/plugins/kubernetes.io/aws-ebs/mounts/aws/us-east-1a/vol-1 ext4 rw 0 0\n\
             /dev/xvdf /var/lib/kubelet/pods/uid/volumes/kubernetes.io~aws-ebs/pv1 ext4 rw 0 0\n",
        )
        .unwrap();
        let mounter = Mounter::new(Arc::new(FakeExec::default())).with_proc_mounts(&proc_mounts);

        let name = mounter
            .get_device_name_from_mount(
                Path::new("/var/lib/kubelet/pods/uid/volumes/kubernetes.io~aws-ebs/pv1"),
                Path::new("/var/lib/kubelet/plugins/kubernetes.io/aws-ebs"),
            )
            .unwrap();
        assert_eq!(name, "aws/us-east-1a/vol-1");
    }

    #[test]
    fn test_is_likely_not_mount_point_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Mounter::new(Arc::new(FakeExec::default()));
        let err = mounter
            .is_likely_not_mount_point(&dir.path().join("missing"))
            .unwrap_err();
        assert!(err.is_not_exist());
        assert!(mounter.is_likely_not_mount_point(dir.path()).unwrap());
    }
}
