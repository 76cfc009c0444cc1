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

//! Pod bandwidth annotations.

use super::{NetworkError, NetworkResult};
use crate::api::resource::Quantity;
use std::collections::HashMap;

pub const INGRESS_BANDWIDTH_ANNOTATION: &str = "kubernetes.io/ingress-bandwidth";
pub const EGRESS_BANDWIDTH_ANNOTATION: &str = "kubernetes.io/egress-bandwidth";

fn validate_bandwidth_is_reasonable(rsrc: &Quantity) -> NetworkResult<()> {
    let min = Quantity::parse("1k")?;
    let max = Quantity::parse("1P")?;
    if rsrc < &min {
        return Err(NetworkError::plugin("resource is unreasonably small (< 1kbit)"));
    }
    if rsrc > &max {
        return Err(NetworkError::plugin("resource is unreasonably large (> 1Pbit)"));
    }
    Ok(())
}

fn parse_annotation(annotations: &HashMap<String, String>, key: &str) -> NetworkResult<Option<Quantity>> {
    let Some(value) = annotations.get(key) else {
        return Ok(None);
    };
    let quantity = Quantity::parse(value)?;
    validate_bandwidth_is_reasonable(&quantity)?;
    Ok(Some(quantity))
}

/// Returns the (ingress, egress) limits in bits per second.
pub fn extract_pod_bandwidth_resources(
    annotations: &HashMap<String, String>,
) -> NetworkResult<(Option<Quantity>, Option<Quantity>)> {
    let ingress = parse_annotation(annotations, INGRESS_BANDWIDTH_ANNOTATION)?;
    let egress = parse_annotation(annotations, EGRESS_BANDWIDTH_ANNOTATION)?;
    Ok((ingress, egress))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_pod_bandwidth_resources() {
        struct TestCase {
            name: &'static str,
            annotations: Vec<(&'static str, &'static str)>,
            expected: Option<(Option<i64>, Option<i64>)>,
            expected_err: Option<&'static str>,
        }
        let test_cases = vec![
            TestCase {
                name: "no annotations",
                annotations: vec![],
                expected: Some((None, None)),
                expected_err: None,
            },
            TestCase {
                name: "ingress only",
                annotations: vec![(INGRESS_BANDWIDTH_ANNOTATION, "10M")],
                expected: Some((Some(10_000_000), None)),
                expected_err: None,
            },
            TestCase {
                name: "both",
                annotations: vec![(INGRESS_BANDWIDTH_ANNOTATION, "1k"), (EGRESS_BANDWIDTH_ANNOTATION, "2G")],
                expected: Some((Some(1000), Some(2_000_000_000))),
                expected_err: None,
            },
            TestCase {
                name: "too small",
                annotations: vec![(EGRESS_BANDWIDTH_ANNOTATION, "999")],
                expected: None,
                expected_err: Some("resource is unreasonably small (< 1kbit)"),
            },
            TestCase {
                name: "too large",
                annotations: vec![(INGRESS_BANDWIDTH_ANNOTATION, "2P")],
                expected: None,
                expected_err: Some("resource is unreasonably large (> 1Pbit)"),
            },
            TestCase {
                name: "invalid quantity",
                annotations: vec![(INGRESS_BANDWIDTH_ANNOTATION, "fast")],
                expected: None,
                expected_err: None,
            },
        ];
        for tc in test_cases {
            let annotations: HashMap<String, String> = tc
                .annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let result = extract_pod_bandwidth_resources(&annotations);
            match tc.expected {
                Some((ingress, egress)) => {
                    let (i, e) = result.unwrap_or_else(|e| panic!("{}: unexpected error {}", tc.name, e));
                    assert_eq!(i.map(|q| q.value()), ingress, "{}: ingress", tc.name);
                    assert_eq!(e.map(|q| q.value()), egress, "{}: egress", tc.name);
                }
                None => {
                    let err = result.expect_err(tc.name);
                    if let Some(msg) = tc.expected_err {
                        assert_eq!(err.to_string(), msg, "{}: unexpected error", tc.name);
                    }
                }
            }
        }
    }
}
