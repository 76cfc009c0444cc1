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

//! Group ownership of volume contents.

use super::VolumeResult;
use std::path::Path;

#[cfg(unix)]
mod imp {
    use crate::volume::{VolumeError, VolumeResult};
    use nix::unistd::{chown, Gid};
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::Path;
    use tracing::error;

    const RW_MASK: u32 = 0o660;
    const RO_MASK: u32 = 0o440;
    const DIR_MASK: u32 = 0o2000 | 0o110;

    fn visit(path: &Path, gid: Gid, mask: u32) -> VolumeResult<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| VolumeError::io("lstat", path, e))?;
        // Symlinks point at files that are handled on their own.
        if meta.file_type().is_symlink() {
            return Ok(());
        }

        if let Err(e) = chown(path, None, Some(gid)) {
            error!("Chown failed on {}: {}", path.display(), e);
        }

        let mut mode = meta.mode() | mask;
        if meta.is_dir() {
            mode |= DIR_MASK;
        }
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
            error!("Chmod failed on {}: {}", path.display(), e);
        }

        if meta.is_dir() {
            let entries = fs::read_dir(path).map_err(|e| VolumeError::io("read dir", path, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| VolumeError::io("read dir", path, e))?;
                visit(&entry.path(), gid, mask)?;
            }
        }
        Ok(())
    }

    pub fn set_volume_ownership(dir: &Path, fs_group: i64, read_only: bool) -> VolumeResult<()> {
        let gid = u32::try_from(fs_group)
            .map_err(|_| VolumeError::invalid_argument(format!("invalid fsGroup {}", fs_group)))?;
        let mask = if read_only { RO_MASK } else { RW_MASK };
        visit(dir, Gid::from_raw(gid), mask)
    }
}

#[cfg(not(unix))]
mod imp {
    use crate::volume::VolumeResult;
    use std::path::Path;

    pub fn set_volume_ownership(_dir: &Path, _fs_group: i64, _read_only: bool) -> VolumeResult<()> {
        Ok(())
    }
}

/// Make the volume at `dir` accessible to `fs_group`: every file gets the
/// group and group read (and write unless `read_only`) permission, and
/// directories get setgid so new files inherit the group. Nothing is done
/// without a group.
pub fn set_volume_ownership(dir: &Path, fs_group: Option<i64>, read_only: bool) -> VolumeResult<()> {
    match fs_group {
        Some(group) => imp::set_volume_ownership(dir, group, read_only),
        None => Ok(()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nix::unistd::getegid;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn test_set_volume_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o700)).unwrap();
        let file = sub.join("data");
        fs::write(&file, b"x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        let gid = i64::from(getegid().as_raw());
        set_volume_ownership(&sub, Some(gid), false).unwrap();
        assert_eq!(mode(&sub), 0o2770);
        assert_eq!(mode(&file), 0o660);

        set_volume_ownership(&file, Some(gid), true).unwrap();
        assert_eq!(mode(&file), 0o660);
    }

    #[test]
    fn test_set_volume_ownership_without_group() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        fs::write(&file, b"x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
        set_volume_ownership(&file, None, false).unwrap();
        assert_eq!(mode(&file), 0o600);
    }
}
