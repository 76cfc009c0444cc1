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

use super::{parse_certs_pem, private_key_pem, BootstrapError, BootstrapResult};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const CURRENT_SUFFIX: &str = "current";
const UPDATING_SUFFIX: &str = "updating";

/// CertKeyPair is a certificate chain and its private key, both PEM.
#[derive(Debug, Clone, PartialEq)]
pub struct CertKeyPair {
    pub cert_pem: Vec<u8>,
    pub key_pem: String,
}

/// FileStore keeps timestamped cert/key bundles in a directory and points
/// `<pair>-current.pem` at the newest one.
#[derive(Debug, Clone)]
pub struct FileStore {
    pair_name_prefix: String,
    cert_directory: PathBuf,
}

impl FileStore {
    pub fn new(pair_name_prefix: &str, cert_directory: &Path) -> BootstrapResult<Self> {
        fs::create_dir_all(cert_directory)
            .map_err(|e| BootstrapError::io("could not create directory", cert_directory, e))?;
        Ok(Self {
            pair_name_prefix: pair_name_prefix.to_string(),
            cert_directory: cert_directory.to_path_buf(),
        })
    }

    fn filename(&self, qualifier: &str) -> String {
        format!("{}-{}.pem", self.pair_name_prefix, qualifier)
    }

    pub fn current_path(&self) -> PathBuf {
        self.cert_directory.join(self.filename(CURRENT_SUFFIX))
    }

    /// Load the current pair.
    pub fn current(&self) -> BootstrapResult<CertKeyPair> {
        let path = self.current_path();
        let data = fs::read(&path).map_err(|e| BootstrapError::io("could not read", &path, e))?;
        parse_certs_pem(&data)?;
        let key_pem = private_key_pem(&data).ok_or_else(|| {
            BootstrapError::certificate(format!("could not read private key from {}", path.display()))
        })?;
        Ok(CertKeyPair {
            cert_pem: data,
            key_pem,
        })
    }

    /// Write a new timestamped bundle and make it current.
    pub fn update(&self, cert_pem: &[u8], key_pem: &[u8]) -> BootstrapResult<CertKeyPair> {
        let ts = Utc::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        let pem_filename = self.filename(&ts);
        let pem_path = self.cert_directory.join(&pem_filename);

        let mut bundle = cert_pem.to_vec();
        if !bundle.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(key_pem);
        super::write_key_file(&pem_path, &bundle)?;

        self.update_symlink(&pem_filename)?;
        debug!("Updated {} to {}", self.current_path().display(), pem_path.display());
        self.current()
    }

    #[cfg(unix)]
    fn update_symlink(&self, target: &str) -> BootstrapResult<()> {
        let current = self.current_path();
        let updating = self.cert_directory.join(self.filename(UPDATING_SUFFIX));
        match fs::remove_file(&updating) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BootstrapError::io("unable to remove", &updating, e)),
        }
        // Relative so the directory can move.
        std::os::unix::fs::symlink(target, &updating)
            .map_err(|e| BootstrapError::io("unable to create symlink", &updating, e))?;
        fs::rename(&updating, &current).map_err(|e| BootstrapError::io("unable to rename symlink to", &current, e))
    }

    #[cfg(not(unix))]
    fn update_symlink(&self, target: &str) -> BootstrapResult<()> {
        let current = self.current_path();
        let updating = self.cert_directory.join(self.filename(UPDATING_SUFFIX));
        fs::copy(self.cert_directory.join(target), &updating)
            .map_err(|e| BootstrapError::io("unable to copy to", &updating, e))?;
        fs::rename(&updating, &current).map_err(|e| BootstrapError::io("unable to rename to", &current, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::testing::self_signed;

    #[test]
    fn test_update_and_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new("kubelet-client", dir.path()).unwrap();
        assert!(store.current().is_err());

        let (cert, key) = self_signed(false);
        let pair = store.update(cert.as_bytes(), key.as_bytes()).unwrap();
        assert_eq!(pair.key_pem, key);
        assert_eq!(store.current_path(), dir.path().join("kubelet-client-current.pem"));

        #[cfg(unix)]
        {
            let target = fs::read_link(store.current_path()).unwrap();
            let name = target.to_string_lossy().to_string();
            assert!(name.starts_with("kubelet-client-2"), "unexpected target {}", name);
        }

        // A second update repoints current.
        let (cert2, key2) = self_signed(false);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.update(cert2.as_bytes(), key2.as_bytes()).unwrap();
        assert_eq!(store.current().unwrap().key_pem, key2);
    }

    #[test]
    fn test_current_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new("kubelet-client", dir.path()).unwrap();
        let (cert, _) = self_signed(false);
        fs::write(store.current_path(), cert).unwrap();
        let err = store.current().unwrap_err();
        assert!(err.to_string().starts_with("could not read private key from"), "{}", err);
    }
}
