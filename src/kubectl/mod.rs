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

//! Command implementations behind `kubectl drain`, `cordon`, `logs` and
//! `create secret tls`. Flag parsing is left to the caller; each command is
//! an options struct with `complete`/`validate`/`run` style methods.

pub mod drain;
pub mod generate;
pub mod hash;
pub mod logs;

use crate::client::ApiError;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type KubectlResult<T> = Result<T, KubectlError>;

#[derive(Debug, Error)]
pub enum KubectlError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Wrong number or combination of arguments.
    #[error("{0}")]
    Usage(String),

    /// Options that are individually valid but cannot be used together, or
    /// a request the command refuses to carry out.
    #[error("{0}")]
    Invalid(String),

    /// Polling gave up with pods still present.
    #[error("timed out waiting for the condition")]
    WaitTimeout { pending: Vec<String> },

    #[error("drain did not complete within {0:?}")]
    DrainTimeout(Duration),

    #[error("cannot read file {path}, {source}")]
    ReadFile { path: String, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<KubectlError>),
}

fn format_aggregate(errors: &[KubectlError]) -> String {
    if errors.len() == 1 {
        return errors[0].to_string();
    }
    let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("[{}]", msgs.join(", "))
}

impl KubectlError {
    pub fn usage(msg: impl Into<String>) -> Self {
        KubectlError::Usage(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        KubectlError::Invalid(msg.into())
    }

    /// Collapse `errors` into one; None when there is nothing to report.
    pub fn aggregate(mut errors: Vec<KubectlError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(KubectlError::Aggregate(errors)),
        }
    }
}

/// Parse an equality selector such as "app=web,tier==db".
pub fn parse_selector(selector: &str) -> KubectlResult<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term
            .split_once("==")
            .or_else(|| term.split_once('='))
            .ok_or_else(|| KubectlError::invalid(format!("unable to parse requirement: {:?}", term)))?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        assert!(KubectlError::aggregate(vec![]).is_none());

        let single = KubectlError::aggregate(vec![KubectlError::invalid("one")]).unwrap();
        assert_eq!(single.to_string(), "one");

        let multi =
            KubectlError::aggregate(vec![KubectlError::invalid("one"), KubectlError::usage("two")]).unwrap();
        assert_eq!(multi.to_string(), "[one, two]");
    }

    #[test]
    fn test_parse_selector() {
        let labels = parse_selector("app=web, tier==db,").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["app"], "web");
        assert_eq!(labels["tier"], "db");
        assert!(parse_selector("").unwrap().is_empty());
        assert!(parse_selector("app").is_err());
    }
}
