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

//! Node client certificates.
//!
//! The kubelet starts with a bootstrap kubeconfig, requests a client
//! certificate for `system:node:<name>` and writes a kubeconfig that points at
//! the issued certificate. See [`bootstrap::load_client_cert`].

pub mod bootstrap;
pub mod kubeconfig;
pub mod store;

use crate::client::{ApiError, ApiResult};
use chrono::{DateTime, TimeZone, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub type BootstrapResult<T> = Result<T, BootstrapError>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    #[error("error loading config file \"{}\": {source}", path.display())]
    Kubeconfig { path: PathBuf, source: serde_yaml::Error },

    #[error("unable to load bootstrap kubeconfig: {0}")]
    BootstrapConfig(Box<BootstrapError>),

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Certificate(String),

    #[error(transparent)]
    Crypto(#[from] rcgen::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl BootstrapError {
    pub fn io(action: &str, path: &Path, source: io::Error) -> Self {
        BootstrapError::Io {
            context: format!("{} {}", action, path.display()),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BootstrapError::Config(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        BootstrapError::Certificate(msg.into())
    }
}

// ============================================================================
// PEM helpers
// ============================================================================

/// Returns the DER certificates in a PEM bundle. Non-certificate blocks are
/// skipped.
pub fn parse_certs_pem(data: &[u8]) -> BootstrapResult<Vec<Vec<u8>>> {
    let mut reader = BufReader::new(data);
    let certs = rustls_pemfile::certs(&mut reader)
        .map(|c| c.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BootstrapError::certificate(format!("error reading certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(BootstrapError::certificate("data does not contain any valid RSA or ECDSA certificates"));
    }
    Ok(certs)
}

/// Returns true when `data` holds a parseable private key.
pub fn verify_key_data(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    std::str::from_utf8(data)
        .ok()
        .is_some_and(|pem| KeyPair::from_pem(pem).is_ok())
}

/// Returns the PKCS#8 private key of a PEM bundle, re-encoded alone.
pub fn private_key_pem(data: &[u8]) -> Option<String> {
    let mut reader = BufReader::new(data);
    let key = rustls_pemfile::private_key(&mut reader).ok()??;
    KeyPair::try_from(key.secret_der()).ok().map(|k| k.serialize_pem())
}

/// Returns the expiry of a DER certificate.
pub fn cert_not_after(der: &[u8]) -> BootstrapResult<DateTime<Utc>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| BootstrapError::certificate(format!("failed to parse certificate: {}", e)))?;
    let ts = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| BootstrapError::certificate(format!("invalid certificate expiry {}", ts)))
}

/// Returns true when the public key of the certificate matches `key_pem`.
pub fn key_matches_cert(cert_der: &[u8], key_pem: &str) -> BootstrapResult<bool> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| BootstrapError::certificate(format!("failed to parse certificate: {}", e)))?;
    let key = KeyPair::from_pem(key_pem)?;
    Ok(cert.public_key().subject_public_key.data.as_ref() == key.public_key_raw())
}

/// Load the private key at `path`, or generate and write a new one.
pub fn load_or_generate_key_file(path: &Path) -> BootstrapResult<(String, bool)> {
    match std::fs::read(path) {
        Ok(data) if verify_key_data(&data) => {
            return Ok((String::from_utf8_lossy(&data).into_owned(), false));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(BootstrapError::io("error loading key from", path, e)),
    }

    let key = KeyPair::generate()?;
    let pem = key.serialize_pem();
    write_key_file(path, pem.as_bytes())?;
    Ok((pem, true))
}

pub(crate) fn write_key_file(path: &Path, data: &[u8]) -> BootstrapResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| BootstrapError::io("error creating directory", dir, e))?;
    }
    std::fs::write(path, data).map_err(|e| BootstrapError::io("error writing key to", path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| BootstrapError::io("error setting permissions on", path, e))?;
    }
    Ok(())
}

// ============================================================================
// Certificate signing requests
// ============================================================================

/// CertificateSigningRequestClient talks to the API server with the bootstrap
/// credentials.
pub trait CertificateSigningRequestClient: Send + Sync {
    /// Probe the server's `/healthz` endpoint.
    fn healthz(&self) -> ApiResult<()>;

    /// Submit a PEM CSR and block until it is approved. Returns the issued
    /// PEM certificate chain.
    fn request_certificate(&self, csr_pem: &str, usages: &[&str]) -> ApiResult<Vec<u8>>;
}

/// Build the CSR of a node client certificate.
pub fn make_node_csr(key_pem: &str, node_name: &str) -> BootstrapResult<String> {
    let key = KeyPair::from_pem(key_pem)?;
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "system:nodes");
    dn.push(DnType::CommonName, format!("system:node:{}", node_name));
    params.distinguished_name = dn;
    Ok(params.serialize_request(&key)?.pem()?)
}

/// Request a client certificate for `node_name` signed for `key_pem`.
pub fn request_node_certificate(
    client: &dyn CertificateSigningRequestClient,
    key_pem: &str,
    node_name: &str,
) -> BootstrapResult<Vec<u8>> {
    let csr = make_node_csr(key_pem, node_name)?;
    let usages = ["digital signature", "key encipherment", "client auth"];
    Ok(client.request_certificate(&csr, &usages)?)
}

/// FakeCsrClient signs every request with a throwaway CA.
#[derive(Default)]
pub struct FakeCsrClient {
    healthz_failures: Mutex<usize>,
    requests: Mutex<Vec<String>>,
    error: Mutex<Option<ApiError>>,
}

impl FakeCsrClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` healthz probes.
    pub fn fail_healthz(&self, n: usize) {
        *self.healthz_failures.lock().unwrap() = n;
    }

    pub fn set_error(&self, err: ApiError) {
        *self.error.lock().unwrap() = Some(err);
    }

    /// Returns the CSRs received, in PEM.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl CertificateSigningRequestClient for FakeCsrClient {
    fn healthz(&self) -> ApiResult<()> {
        let mut failures = self.healthz_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(ApiError::other("connection refused"));
        }
        Ok(())
    }

    fn request_certificate(&self, csr_pem: &str, _usages: &[&str]) -> ApiResult<Vec<u8>> {
        self.requests.lock().unwrap().push(csr_pem.to_string());
        if let Some(err) = self.error.lock().unwrap().clone() {
            return Err(err);
        }
        let sign = || -> Result<String, rcgen::Error> {
            let csr = rcgen::CertificateSigningRequestParams::from_pem(csr_pem)?;
            let ca_key = KeyPair::generate()?;
            let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
            ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(DnType::CommonName, "kubernetes");
            let ca = ca_params.self_signed(&ca_key)?;
            Ok(csr.signed_by(&ca, &ca_key)?.pem())
        };
        sign()
            .map(String::into_bytes)
            .map_err(|e| ApiError::other(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use rcgen::{CertificateParams, KeyPair};

    /// Returns a self-signed (cert, key) pair in PEM.
    pub fn self_signed(expired: bool) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["node-1".to_string()]).unwrap();
        if expired {
            params.not_before = rcgen::date_time_ymd(2000, 1, 1);
            params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        }
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_certs_pem() {
        let (cert, key) = testing::self_signed(false);
        let certs = parse_certs_pem(format!("{}{}", cert, key).as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(cert_not_after(&certs[0]).unwrap() > Utc::now());

        assert!(parse_certs_pem(key.as_bytes()).is_err());
        assert!(parse_certs_pem(b"").is_err());
    }

    #[test]
    fn test_expired_cert() {
        let (cert, _) = testing::self_signed(true);
        let certs = parse_certs_pem(cert.as_bytes()).unwrap();
        assert!(cert_not_after(&certs[0]).unwrap() < Utc::now());
    }

    #[test]
    fn test_key_matches_cert() {
        let (cert, key) = testing::self_signed(false);
        let (_, other_key) = testing::self_signed(false);
        let der = &parse_certs_pem(cert.as_bytes()).unwrap()[0];
        assert!(key_matches_cert(der, &key).unwrap());
        assert!(!key_matches_cert(der, &other_key).unwrap());
    }

    #[test]
    fn test_verify_key_data() {
        let (cert, key) = testing::self_signed(false);
        assert!(verify_key_data(key.as_bytes()));
        assert!(!verify_key_data(cert.as_bytes()));
        assert!(!verify_key_data(b""));
    }

    #[test]
    fn test_load_or_generate_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pki").join("kubelet-client.key.tmp");
        let (first, generated) = load_or_generate_key_file(&path).unwrap();
        assert!(generated);
        let (second, generated) = load_or_generate_key_file(&path).unwrap();
        assert!(!generated);
        assert_eq!(first, second);

        std::fs::write(&path, "garbage").unwrap();
        let (third, generated) = load_or_generate_key_file(&path).unwrap();
        assert!(generated);
        assert_ne!(third, first);
    }

    #[test]
    fn test_request_node_certificate() {
        let client = FakeCsrClient::new();
        let (_, key) = testing::self_signed(false);
        let cert = request_node_certificate(&client, &key, "node-1").unwrap();

        let der = &parse_certs_pem(&cert).unwrap()[0];
        assert!(key_matches_cert(der, &key).unwrap());
        let (_, parsed) = x509_parser::parse_x509_certificate(der).unwrap();
        let subject = parsed.subject().to_string();
        assert!(subject.contains("CN=system:node:node-1"), "unexpected subject {}", subject);
        assert!(subject.contains("O=system:nodes"), "unexpected subject {}", subject);

        client.set_error(ApiError::other("csr denied"));
        let err = request_node_certificate(&client, &key, "node-1").unwrap_err();
        assert_eq!(err.to_string(), "csr denied");
        assert_eq!(client.requests().len(), 2);
    }
}
