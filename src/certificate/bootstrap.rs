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

use super::kubeconfig::{
    self, AuthInfo, Cluster, Config, Context, NamedAuthInfo, NamedCluster, NamedContext, RestConfig,
};
use super::store::FileStore;
use super::{
    cert_not_after, load_or_generate_key_file, parse_certs_pem, request_node_certificate, verify_key_data,
    BootstrapError, BootstrapResult, CertificateSigningRequestClient,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const TMP_PRIVATE_KEY_FILE: &str = "kubelet-client.key.tmp";
const CLIENT_PAIR_NAME: &str = "kubelet-client";

const SERVER_POLL_PERIOD: Duration = Duration::from_secs(2);
const SERVER_POLL_JITTER: f64 = 0.2;

/// BootstrapDeps builds the API clients bootstrap needs.
pub struct BootstrapDeps<'a> {
    /// Returns a CSR client authenticated with the given config.
    pub csr_client: &'a dyn Fn(&RestConfig) -> BootstrapResult<Box<dyn CertificateSigningRequestClient>>,
    /// How long to wait for the API server before requesting anyway.
    pub server_wait: Duration,
}

/// Request a client certificate if `kubeconfig_path` has no valid one.
///
/// The bootstrap kubeconfig authenticates the request. On success the
/// certificate and key land in `cert_dir` and a kubeconfig referencing them is
/// written to `kubeconfig_path`.
pub fn load_client_cert(
    kubeconfig_path: &Path,
    bootstrap_path: &Path,
    cert_dir: &Path,
    node_name: &str,
    deps: &BootstrapDeps<'_>,
) -> BootstrapResult<()> {
    if is_client_config_still_valid(kubeconfig_path)? {
        debug!("Kubeconfig {} exists and is valid, skipping bootstrap", kubeconfig_path.display());
        return Ok(());
    }

    debug!("Using bootstrap kubeconfig to generate TLS client cert, key and kubeconfig file");
    let bootstrap_config = kubeconfig::load_rest_client_config(bootstrap_path)
        .map_err(|e| BootstrapError::BootstrapConfig(Box::new(e)))?;
    let client = (deps.csr_client)(&bootstrap_config)?;

    let store = FileStore::new(CLIENT_PAIR_NAME, cert_dir)
        .map_err(|_| BootstrapError::config("unable to build bootstrap cert store"))?;

    let mut key_data = store.current().ok().map(|pair| pair.key_pem);
    // The key is cached in its own file until the CSR succeeds, since the
    // current path is a symlink managed by the store.
    let priv_key_path = cert_dir.join(TMP_PRIVATE_KEY_FILE);
    if !key_data.as_deref().is_some_and(|k| verify_key_data(k.as_bytes())) {
        debug!("No valid private key and/or certificate found, reusing existing private key or creating a new one");
        let (key, _) = load_or_generate_key_file(&priv_key_path)?;
        key_data = Some(key);
    }
    let key_data = key_data.unwrap_or_default();

    if let Err(e) = wait_for_server(client.as_ref(), deps.server_wait) {
        warn!("Error waiting for apiserver to come up: {}", e);
    }

    let cert_data = request_node_certificate(client.as_ref(), &key_data, node_name)?;
    store.update(&cert_data, key_data.as_bytes())?;
    match fs::remove_file(&priv_key_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => info!("failed cleaning up private key file {:?}: {}", priv_key_path, e),
    }

    let pem_path = store.current_path();
    kubeconfig::write_to_file(&client_kubeconfig(&bootstrap_config, &pem_path), kubeconfig_path)
}

/// Build the kubeconfig that authenticates with the issued certificate.
fn client_kubeconfig(bootstrap: &RestConfig, pem_path: &Path) -> Config {
    let pem_path = pem_path.to_string_lossy().to_string();
    // A CA file wins over inline CA data.
    let (ca_file, ca_data) = match &bootstrap.ca_file {
        Some(file) => (file.to_string_lossy().to_string(), String::new()),
        None if !bootstrap.ca_data.is_empty() => (String::new(), STANDARD.encode(&bootstrap.ca_data)),
        None => (String::new(), String::new()),
    };

    Config {
        clusters: vec![NamedCluster {
            name: "default-cluster".to_string(),
            cluster: Cluster {
                server: bootstrap.host.clone(),
                insecure_skip_tls_verify: bootstrap.insecure,
                certificate_authority: ca_file,
                certificate_authority_data: ca_data,
            },
        }],
        users: vec![NamedAuthInfo {
            name: "default-auth".to_string(),
            user: AuthInfo {
                client_certificate: pem_path.clone(),
                client_key: pem_path,
                ..Default::default()
            },
        }],
        contexts: vec![NamedContext {
            name: "default-context".to_string(),
            context: Context {
                cluster: "default-cluster".to_string(),
                user: "default-auth".to_string(),
                namespace: "default".to_string(),
            },
        }],
        current_context: "default-context".to_string(),
        ..Default::default()
    }
}

/// Returns true when the kubeconfig exists and its client certificates are
/// all unexpired. Unreadable configs are not valid; only a failed stat is an
/// error.
pub fn is_client_config_still_valid(kubeconfig_path: &Path) -> BootstrapResult<bool> {
    match fs::metadata(kubeconfig_path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(BootstrapError::io(
                "error reading existing bootstrap kubeconfig",
                kubeconfig_path,
                e,
            ))
        }
    }

    let config = match kubeconfig::load_rest_client_config(kubeconfig_path) {
        Ok(config) => config,
        Err(e) => {
            error!("unable to read existing bootstrap client config: {}", e);
            return Ok(false);
        }
    };
    let cert_data = match config.client_cert_data() {
        Ok(data) => data,
        Err(e) => {
            error!("unable to load TLS configuration from existing bootstrap client config: {}", e);
            return Ok(false);
        }
    };
    let certs = match parse_certs_pem(&cert_data) {
        Ok(certs) => certs,
        Err(e) => {
            error!("unable to load TLS certificates from existing bootstrap client config: {}", e);
            return Ok(false);
        }
    };

    let now = Utc::now();
    for cert in &certs {
        match cert_not_after(cert) {
            Ok(not_after) if now < not_after => {}
            Ok(not_after) => {
                error!("part of the existing bootstrap client certificate is expired: {}", not_after);
                return Ok(false);
            }
            Err(e) => {
                error!("unable to parse existing bootstrap client certificate: {}", e);
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Poll the server's healthz with jitter until it answers or `deadline`
/// passes.
pub fn wait_for_server(client: &dyn CertificateSigningRequestClient, deadline: Duration) -> BootstrapResult<()> {
    let start = Instant::now();
    let mut rng = rand::rng();
    loop {
        match client.healthz() {
            Ok(()) => return Ok(()),
            Err(e) => info!("Failed to connect to apiserver: {}", e),
        }

        let elapsed = start.elapsed();
        if elapsed >= deadline {
            break;
        }
        let jitter = SERVER_POLL_PERIOD.mul_f64(rng.random_range(0.0..SERVER_POLL_JITTER));
        std::thread::sleep((SERVER_POLL_PERIOD + jitter).min(deadline - elapsed));
    }
    Err(BootstrapError::config("timed out waiting to connect to apiserver"))
}

/// Returns the current pair path and the temporary key path in `cert_dir`.
pub fn bootstrap_files(cert_dir: &Path) -> (PathBuf, PathBuf) {
    (
        cert_dir.join(format!("{}-current.pem", CLIENT_PAIR_NAME)),
        cert_dir.join(TMP_PRIVATE_KEY_FILE),
    )
}
