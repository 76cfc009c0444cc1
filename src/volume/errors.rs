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

//! Volume error types.

use crate::api::resource::ResourceError;
use crate::client::ApiError;
use crate::cloudprovider::CloudError;
use crate::mount::{ExecError, MountError};
use crate::volume::flexvolume::FlexError;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Result type for volume operations.
pub type VolumeResult<T> = Result<T, VolumeError>;

/// VolumeError represents errors that can occur in volume plugins.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The spec does not carry the source a plugin expects.
    #[error("{0}")]
    InvalidSpec(String),

    /// A provisioning parameter or claim field was rejected.
    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Flex(#[from] FlexError),

    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    #[error("{0}")]
    Internal(String),

    /// Aggregate represents multiple errors.
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<VolumeError>),
}

fn format_aggregate(errors: &[VolumeError]) -> String {
    if errors.len() == 1 {
        return errors[0].to_string();
    }
    let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("[{}]", msgs.join(", "))
}

impl VolumeError {
    /// Create a new InvalidSpec error.
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        VolumeError::InvalidSpec(msg.into())
    }

    /// Create a new InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        VolumeError::InvalidArgument(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        VolumeError::Internal(msg.into())
    }

    /// Create an aggregate error; None when there is nothing to report.
    pub fn aggregate(mut errors: Vec<VolumeError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(VolumeError::Aggregate(errors)),
        }
    }

    /// Wrap an I/O error that happened while operating on `path`.
    pub fn io(action: &str, path: &Path, source: io::Error) -> Self {
        VolumeError::Io {
            context: format!("{} {}", action, path.display()),
            source,
        }
    }

    /// Returns true if the underlying cause is a missing path.
    pub fn is_not_exist(&self) -> bool {
        match self {
            VolumeError::Mount(e) => e.is_not_exist(),
            VolumeError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns true if the underlying cause is a corrupted mount point.
    pub fn is_corrupted_mnt(&self) -> bool {
        match self {
            VolumeError::Mount(e) => e.is_corrupted(),
            VolumeError::Io { source, .. } => crate::mount::is_corrupted_io_error(source),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_classification() {
        let not_exist = VolumeError::from(MountError::NotExist(PathBuf::from("/x")));
        assert!(not_exist.is_not_exist());
        assert!(!not_exist.is_corrupted_mnt());

        let io_missing = VolumeError::io(
            "remove",
            Path::new("/x"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(io_missing.is_not_exist());
        assert_eq!(io_missing.to_string(), "remove /x: gone");

        assert!(VolumeError::aggregate(vec![]).is_none());
        let agg = VolumeError::aggregate(vec![
            VolumeError::internal("error 1"),
            VolumeError::internal("error 2"),
        ])
        .unwrap();
        assert_eq!(agg.to_string(), "[error 1, error 2]");

        let invalid = VolumeError::invalid_spec("spec does not reference an AWS EBS volume type");
        assert_eq!(invalid.to_string(), "spec does not reference an AWS EBS volume type");
    }
}
