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

//! Content hashes appended to generated object names.

use super::{KubectlError, KubectlResult};
use crate::api::core::Secret;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Returns a 10 character hash of the secret's type, name and data.
pub fn secret_hash(secret: &Secret) -> KubectlResult<String> {
    let encoded = encode_secret(secret)?;
    encode_hash(&hash(&encoded))
}

/// Serialize the hashed fields with keys in sorted order.
fn encode_secret(secret: &Secret) -> KubectlResult<String> {
    let data: BTreeMap<&str, String> = secret
        .data
        .iter()
        .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
        .collect();
    let mut object: BTreeMap<&str, Value> = BTreeMap::new();
    object.insert("data", json!(data));
    object.insert("kind", json!("Secret"));
    object.insert("name", json!(secret.metadata.name));
    object.insert("type", json!(secret.secret_type));
    serde_json::to_string(&object).map_err(|e| KubectlError::invalid(e.to_string()))
}

/// Take the first ten characters of a hex string and swap the vowels and the
/// digits most likely to spell words for other letters.
pub fn encode_hash(hex: &str) -> KubectlResult<String> {
    if hex.len() < 10 {
        return Err(KubectlError::invalid("the hex string must contain at least 10 characters"));
    }
    Ok(hex[..10]
        .chars()
        .map(|c| match c {
            '0' => 'g',
            '1' => 'h',
            '3' => 'k',
            'a' => 'm',
            'e' => 't',
            other => other,
        })
        .collect())
}

fn hash(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}
