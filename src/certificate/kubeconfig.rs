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

//! kubeconfig files.

use super::{BootstrapError, BootstrapResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Cluster {
    pub server: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub certificate_authority: String,
    /// Base64 encoded.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_certificate: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_certificate_data: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_key_data: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    pub cluster: String,
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedAuthInfo {
    pub name: String,
    pub user: AuthInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

/// Config is a kubeconfig file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedAuthInfo>,
    pub contexts: Vec<NamedContext>,
    pub current_context: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: Vec::new(),
            users: Vec::new(),
            contexts: Vec::new(),
            current_context: String::new(),
        }
    }
}

/// RestConfig is the flattened connection info of the current context. File
/// references are absolute.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RestConfig {
    pub host: String,
    pub insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub ca_data: Vec<u8>,
    pub cert_file: Option<PathBuf>,
    pub cert_data: Vec<u8>,
    pub key_file: Option<PathBuf>,
    pub key_data: Vec<u8>,
    pub bearer_token: String,
}

impl RestConfig {
    /// Returns the client certificate PEM, reading the file if needed.
    pub fn client_cert_data(&self) -> BootstrapResult<Vec<u8>> {
        match &self.cert_file {
            Some(path) if self.cert_data.is_empty() => {
                fs::read(path).map_err(|e| BootstrapError::io("unable to read client certificate", path, e))
            }
            _ => Ok(self.cert_data.clone()),
        }
    }

    pub fn client_key_data(&self) -> BootstrapResult<Vec<u8>> {
        match &self.key_file {
            Some(path) if self.key_data.is_empty() => {
                fs::read(path).map_err(|e| BootstrapError::io("unable to read client key", path, e))
            }
            _ => Ok(self.key_data.clone()),
        }
    }
}

fn decode_data(field: &str, data: &str) -> BootstrapResult<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(data.trim())
        .map_err(|e| BootstrapError::config(format!("invalid {}: {}", field, e)))
}

fn resolve(base: &Path, file: &str) -> Option<PathBuf> {
    if file.is_empty() {
        return None;
    }
    let path = Path::new(file);
    Some(if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    })
}

impl Config {
    /// Flatten the current context. Relative paths resolve against `base`,
    /// the directory of the file the config was loaded from.
    pub fn client_config(&self, base: &Path) -> BootstrapResult<RestConfig> {
        if self.current_context.is_empty() {
            return Err(BootstrapError::config("invalid configuration: no configuration has been provided"));
        }
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .map(|c| &c.context)
            .ok_or_else(|| {
                BootstrapError::config(format!("context was not found for specified context: {}", self.current_context))
            })?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| BootstrapError::config(format!("cluster {:?} not found", context.cluster)))?;
        if cluster.server.is_empty() {
            return Err(BootstrapError::config("invalid configuration: no server found for cluster"));
        }
        // A context without a user connects anonymously.
        let auth = self
            .users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| u.user.clone())
            .unwrap_or_default();

        Ok(RestConfig {
            host: cluster.server.clone(),
            insecure: cluster.insecure_skip_tls_verify,
            ca_file: resolve(base, &cluster.certificate_authority),
            ca_data: decode_data("certificate-authority-data", &cluster.certificate_authority_data)?,
            cert_file: resolve(base, &auth.client_certificate),
            cert_data: decode_data("client-certificate-data", &auth.client_certificate_data)?,
            key_file: resolve(base, &auth.client_key),
            key_data: decode_data("client-key-data", &auth.client_key_data)?,
            bearer_token: auth.token,
        })
    }
}

pub fn load_from_file(path: &Path) -> BootstrapResult<Config> {
    let data = fs::read(path).map_err(|e| BootstrapError::io("error loading config file", path, e))?;
    serde_yaml::from_slice(&data).map_err(|source| BootstrapError::Kubeconfig {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `path` and flatten its current context.
pub fn load_rest_client_config(path: &Path) -> BootstrapResult<RestConfig> {
    let config = load_from_file(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    config.client_config(base)
}

pub fn write_to_file(config: &Config, path: &Path) -> BootstrapResult<()> {
    let content = serde_yaml::to_string(config).map_err(|source| BootstrapError::Kubeconfig {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| BootstrapError::io("error creating directory", dir, e))?;
    }
    fs::write(path, content).map_err(|e| BootstrapError::io("error writing config file", path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| BootstrapError::io("error setting permissions on", path, e))?;
    }
    Ok(())
}
