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

//! Filesystem usage statistics for volume metrics.

use crate::api::resource::{Format, Quantity};
use crate::volume::{VolumeError, VolumeResult};
use std::path::Path;

/// FsInfo describes the filesystem backing a path. Sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsInfo {
    pub available: i64,
    pub capacity: i64,
    pub used: i64,
    pub inodes: i64,
    pub inodes_free: i64,
    pub inodes_used: i64,
}

#[cfg(unix)]
mod imp {
    use super::*;
    use nix::sys::statvfs::statvfs;
    use std::collections::HashSet;
    use std::fs;
    use std::os::unix::fs::MetadataExt;

    pub fn fs_info(path: &Path) -> VolumeResult<FsInfo> {
        let stat = statvfs(path).map_err(|e| VolumeError::io("statvfs", path, e.into()))?;
        let bsize = stat.fragment_size() as i64;
        let blocks = stat.blocks() as i64;
        let free = stat.blocks_free() as i64;
        let inodes = stat.files() as i64;
        let inodes_free = stat.files_free() as i64;
        Ok(FsInfo {
            available: stat.blocks_available() as i64 * bsize,
            capacity: blocks * bsize,
            used: (blocks - free) * bsize,
            inodes,
            inodes_free,
            inodes_used: inodes - inodes_free,
        })
    }

    // Walk the tree without crossing into other filesystems or following
    // symlinks, calling `visit` once per distinct inode.
    fn walk(path: &Path, dev: u64, seen: &mut HashSet<(u64, u64)>, visit: &mut dyn FnMut(&fs::Metadata)) -> VolumeResult<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| VolumeError::io("lstat", path, e))?;
        if meta.dev() != dev {
            return Ok(());
        }
        if seen.insert((meta.dev(), meta.ino())) {
            visit(&meta);
        }
        if meta.is_dir() {
            let entries = fs::read_dir(path).map_err(|e| VolumeError::io("read dir", path, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| VolumeError::io("read dir", path, e))?;
                walk(&entry.path(), dev, seen, visit)?;
            }
        }
        Ok(())
    }

    fn walk_root(path: &Path, visit: &mut dyn FnMut(&fs::Metadata)) -> VolumeResult<()> {
        let root = fs::symlink_metadata(path).map_err(|e| VolumeError::io("lstat", path, e))?;
        walk(path, root.dev(), &mut HashSet::new(), visit)
    }

    pub fn disk_usage(path: &Path) -> VolumeResult<Quantity> {
        let mut bytes: i64 = 0;
        walk_root(path, &mut |meta| bytes += meta.blocks() as i64 * 512)?;
        Ok(Quantity::from_value(bytes, Format::BinarySi))
    }

    pub fn find(path: &Path) -> VolumeResult<i64> {
        let mut count: i64 = 0;
        walk_root(path, &mut |_| count += 1)?;
        Ok(count)
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    fn unsupported() -> VolumeError {
        VolumeError::internal("not supported for this build")
    }

    pub fn fs_info(_path: &Path) -> VolumeResult<FsInfo> {
        Err(unsupported())
    }

    pub fn disk_usage(_path: &Path) -> VolumeResult<Quantity> {
        Err(unsupported())
    }

    pub fn find(_path: &Path) -> VolumeResult<i64> {
        Err(unsupported())
    }
}

/// Returns capacity and inode statistics of the filesystem holding `path`.
pub fn fs_info(path: &Path) -> VolumeResult<FsInfo> {
    imp::fs_info(path)
}

/// Returns the space allocated to the files under `path`.
pub fn disk_usage(path: &Path) -> VolumeResult<Quantity> {
    imp::disk_usage(path)
}

/// Returns the number of inodes used by the files under `path`.
pub fn find(path: &Path) -> VolumeResult<i64> {
    imp::find(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_fs_info() {
        let dir = tempfile::tempdir().unwrap();
        let info = fs_info(dir.path()).unwrap();
        assert!(info.capacity > 0);
        assert!(info.available <= info.capacity);
        assert_eq!(info.inodes_used, info.inodes - info.inodes_free);
    }

    #[test]
    fn test_find_and_disk_usage() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a"), vec![1u8; 8192]).unwrap();
        fs::hard_link(dir.path().join("sub/a"), dir.path().join("b")).unwrap();

        // Root, sub and one inode shared by two links.
        assert_eq!(find(dir.path()).unwrap(), 3);
        assert!(disk_usage(dir.path()).unwrap().value() > 0);
    }

    #[test]
    fn test_missing_path() {
        assert!(find(Path::new("/nonexistent/volume/path")).is_err());
    }
}
