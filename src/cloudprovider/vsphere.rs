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

//! vSphere client library errors.

use super::CloudError;
use thiserror::Error;

pub const FILE_ALREADY_EXIST_ERR_MSG: &str = "file requested already exist";
pub const NO_DISK_UUID_FOUND_ERR_MSG: &str = "no disk UUID found";
pub const NO_DEVICES_FOUND_ERR_MSG: &str = "no devices found";
pub const DISK_NOT_FOUND_ERR_MSG: &str = "no vSphere disk ID found";
pub const INVALID_VOLUME_OPTIONS_ERR_MSG: &str = "nolumeOptions verification failed";
pub const NO_VM_FOUND_ERR_MSG: &str = "no VM found";

/// VclibError represents the well-known vSphere client failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VclibError {
    #[error("{}", FILE_ALREADY_EXIST_ERR_MSG)]
    FileAlreadyExist,

    #[error("{}", NO_DISK_UUID_FOUND_ERR_MSG)]
    NoDiskUuidFound,

    #[error("{}", NO_DEVICES_FOUND_ERR_MSG)]
    NoDevicesFound,

    #[error("{}", DISK_NOT_FOUND_ERR_MSG)]
    NoDiskIdFound,

    #[error("{}", INVALID_VOLUME_OPTIONS_ERR_MSG)]
    InvalidVolumeOptions,

    #[error("{}", NO_VM_FOUND_ERR_MSG)]
    NoVmFound,
}

impl VclibError {
    /// Recognize a vSphere error from its message.
    pub fn from_message(msg: &str) -> Option<Self> {
        match msg {
            FILE_ALREADY_EXIST_ERR_MSG => Some(VclibError::FileAlreadyExist),
            NO_DISK_UUID_FOUND_ERR_MSG => Some(VclibError::NoDiskUuidFound),
            NO_DEVICES_FOUND_ERR_MSG => Some(VclibError::NoDevicesFound),
            DISK_NOT_FOUND_ERR_MSG => Some(VclibError::NoDiskIdFound),
            INVALID_VOLUME_OPTIONS_ERR_MSG => Some(VclibError::InvalidVolumeOptions),
            NO_VM_FOUND_ERR_MSG => Some(VclibError::NoVmFound),
            _ => None,
        }
    }
}

impl From<VclibError> for CloudError {
    fn from(err: VclibError) -> Self {
        match err {
            VclibError::NoVmFound => CloudError::InstanceNotFound,
            VclibError::NoDiskIdFound => CloudError::DiskNotFound(err.to_string()),
            other => CloudError::Provider(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vclib_error_messages() {
        let all = [
            VclibError::FileAlreadyExist,
            VclibError::NoDiskUuidFound,
            VclibError::NoDevicesFound,
            VclibError::NoDiskIdFound,
            VclibError::InvalidVolumeOptions,
            VclibError::NoVmFound,
        ];
        for err in all {
            assert_eq!(VclibError::from_message(&err.to_string()), Some(err));
        }
        assert_eq!(VclibError::InvalidVolumeOptions.to_string(), "nolumeOptions verification failed");
        assert_eq!(CloudError::from(VclibError::NoVmFound), CloudError::InstanceNotFound);
        assert_eq!(VclibError::from_message("other"), None);
    }
}
