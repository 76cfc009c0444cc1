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

//! Generator for `kubectl create secret tls`.

use super::hash::secret_hash;
use super::{KubectlError, KubectlResult};
use crate::api::core::{Secret, SECRET_TYPE_TLS, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
use crate::certificate::{key_matches_cert, parse_certs_pem, private_key_pem};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use tracing::debug;

/// A parameter accepted by a generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorParam {
    pub name: &'static str,
    pub required: bool,
}

/// SecretForTlsGeneratorV1 builds a `kubernetes.io/tls` secret from a key
/// and a certificate file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretForTlsGeneratorV1 {
    pub name: String,
    /// Path to the PEM encoded private key.
    pub key: String,
    /// Path to the PEM encoded certificate.
    pub cert: String,
    /// Suffix the name with a hash of the secret's content.
    pub append_hash: bool,
}

impl SecretForTlsGeneratorV1 {
    pub fn param_names() -> Vec<GeneratorParam> {
        vec![
            GeneratorParam { name: "name", required: true },
            GeneratorParam { name: "key", required: true },
            GeneratorParam { name: "cert", required: true },
            GeneratorParam { name: "append-hash", required: false },
        ]
    }

    /// Build the secret from untyped parameters.
    pub fn generate(params: &BTreeMap<String, Value>) -> KubectlResult<Secret> {
        validate_params(&Self::param_names(), params)?;

        let mut generator = SecretForTlsGeneratorV1::default();
        if let Some(v) = params.get("append-hash") {
            generator.append_hash = v
                .as_bool()
                .ok_or_else(|| KubectlError::invalid(format!("expected bool, found :{}", v)))?;
        }
        for (key, value) in params {
            if key == "append-hash" {
                continue;
            }
            let s = value
                .as_str()
                .ok_or_else(|| KubectlError::invalid(format!("expected string, saw {} for '{}'", value, key)))?;
            match key.as_str() {
                "name" => generator.name = s.to_string(),
                "key" => generator.key = s.to_string(),
                "cert" => generator.cert = s.to_string(),
                _ => {}
            }
        }
        generator.structured_generate()
    }

    pub fn validate(&self) -> KubectlResult<()> {
        if self.name.is_empty() {
            return Err(KubectlError::invalid("name must be specified"));
        }
        if self.key.is_empty() {
            return Err(KubectlError::invalid("key must be specified"));
        }
        if self.cert.is_empty() {
            return Err(KubectlError::invalid("certificate must be specified"));
        }
        Ok(())
    }

    pub fn structured_generate(&self) -> KubectlResult<Secret> {
        self.validate()?;
        let tls_key = read_file(&self.key)?;
        let tls_cert = read_file(&self.cert)?;
        load_key_pair(&tls_cert, &tls_key)?;

        let mut secret = Secret::new(&self.name, "");
        secret.secret_type = SECRET_TYPE_TLS.to_string();
        secret.data.insert(TLS_CERT_KEY.to_string(), tls_cert);
        secret.data.insert(TLS_PRIVATE_KEY_KEY.to_string(), tls_key);
        if self.append_hash {
            let hash = secret_hash(&secret)?;
            secret.metadata.name = format!("{}-{}", secret.metadata.name, hash);
        }
        debug!("Generated TLS secret {}", secret.metadata.name);
        Ok(secret)
    }
}

/// Every required parameter must be present and non-zero.
fn validate_params(names: &[GeneratorParam], params: &BTreeMap<String, Value>) -> KubectlResult<()> {
    let errs: Vec<KubectlError> = names
        .iter()
        .filter(|p| p.required)
        .filter(|p| match params.get(p.name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .map(|p| KubectlError::invalid(format!("Parameter: {} is required", p.name)))
        .collect();
    match KubectlError::aggregate(errs) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn read_file(path: &str) -> KubectlResult<Vec<u8>> {
    fs::read(path).map_err(|source| KubectlError::ReadFile {
        path: path.to_string(),
        source,
    })
}

/// Check that the certificate chain parses and its leaf matches the key.
fn load_key_pair(cert_pem: &[u8], key_pem: &[u8]) -> KubectlResult<()> {
    let fail = |msg: String| KubectlError::invalid(format!("failed to load key pair tls: {}", msg));
    let certs = parse_certs_pem(cert_pem).map_err(|e| fail(e.to_string()))?;
    let key = private_key_pem(key_pem).ok_or_else(|| fail("failed to find any PEM data in key input".to_string()))?;
    if !key_matches_cert(&certs[0], &key).map_err(|e| fail(e.to_string()))? {
        return Err(fail("private key does not match public key".to_string()));
    }
    Ok(())
}
