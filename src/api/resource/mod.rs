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

//! Resource quantities and pod resource helpers.

use crate::api::core::{
    Container, Pod, ResourceList, RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE, RESOURCE_MEMORY,
    RESOURCE_PODS,
};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced by quantity parsing and resource extraction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    #[error("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {0:?}")]
    InvalidQuantity(String),

    #[error("unable to parse quantity's suffix: {0:?}")]
    InvalidSuffix(String),

    #[error("quantity {0:?} is too large")]
    Overflow(String),

    #[error("unsupported container resource : {0}")]
    UnsupportedResource(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),
}

/// Format records how a quantity was written so it can be printed back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Base-two suffixes: Ki, Mi, Gi ...
    BinarySi,
    /// Base-ten suffixes: m, k, M, G ...
    #[default]
    DecimalSi,
    /// Exponent notation: 1e3.
    DecimalExponent,
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Quantity is a fixed-point representation of a number, stored in milli-units.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quantity {
    milli: i128,
    format: Format,
}

impl Quantity {
    /// Parse a quantity string such as "100m", "1Gi" or "1e3".
    pub fn parse(s: &str) -> Result<Self, ResourceError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ResourceError::InvalidQuantity(s.to_string()));
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let (negative, digits) = match number.as_bytes().first() {
            Some(b'-') => (true, &number[1..]),
            Some(b'+') => (false, &number[1..]),
            _ => (false, number),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if (int_part.is_empty() && frac_part.is_empty())
            || !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
            || frac_part.len() > 18
        {
            return Err(ResourceError::InvalidQuantity(s.to_string()));
        }

        let overflow = || ResourceError::Overflow(s.to_string());
        let scale = 10i128.pow(frac_part.len() as u32);
        let int_value: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| overflow())?
        };
        let frac_value: i128 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| overflow())?
        };
        let mantissa = int_value
            .checked_mul(scale)
            .and_then(|v| v.checked_add(frac_value))
            .ok_or_else(overflow)?;

        let (numerator, denominator, format) = parse_suffix(suffix)?;

        // milli = ceil(mantissa * numerator * 1000 / (scale * denominator))
        let top = mantissa
            .checked_mul(numerator)
            .and_then(|v| v.checked_mul(1000))
            .ok_or_else(overflow)?;
        let bottom = scale.checked_mul(denominator).ok_or_else(overflow)?;
        let mut milli = top / bottom;
        if top % bottom != 0 {
            milli += 1;
        }
        if negative {
            milli = -milli;
        }

        Ok(Self { milli, format })
    }

    /// Create a quantity from a whole number of base units.
    pub fn from_value(value: i64, format: Format) -> Self {
        Self {
            milli: value as i128 * 1000,
            format,
        }
    }

    /// Create a quantity from milli-units.
    pub fn from_milli(milli: i64, format: Format) -> Self {
        Self {
            milli: milli as i128,
            format,
        }
    }

    /// Create a quantity of the given number of GiB.
    pub fn from_gib(gib: i64) -> Self {
        Self::from_value(gib.saturating_mul(1 << 30), Format::BinarySi)
    }

    /// Returns the value rounded up to whole units.
    pub fn value(&self) -> i64 {
        let whole = self.milli.div_euclid(1000);
        let rounded = if self.milli.rem_euclid(1000) != 0 {
            whole + 1
        } else {
            whole
        };
        clamp_i64(rounded)
    }

    /// Returns the value in milli-units.
    pub fn milli_value(&self) -> i64 {
        clamp_i64(self.milli)
    }

    pub fn is_zero(&self) -> bool {
        self.milli == 0
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Add another quantity to this one.
    pub fn add(&mut self, other: &Quantity) {
        self.milli = self.milli.saturating_add(other.milli);
    }
}

fn clamp_i64(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Returns (numerator, denominator, format) of the multiplier a suffix denotes.
fn parse_suffix(suffix: &str) -> Result<(i128, i128, Format), ResourceError> {
    if suffix.is_empty() {
        return Ok((1, 1, Format::DecimalSi));
    }
    if suffix == "m" {
        return Ok((1, 1000, Format::DecimalSi));
    }
    if let Some((_, shift)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((1i128 << shift, 1, Format::BinarySi));
    }
    if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((10i128.pow(*exp), 1, Format::DecimalSi));
    }
    if let Some(exp) = suffix.strip_prefix(['e', 'E']) {
        if let Ok(exp) = exp.parse::<i32>() {
            if exp.unsigned_abs() > 30 {
                return Err(ResourceError::Overflow(suffix.to_string()));
            }
            return if exp >= 0 {
                Ok((10i128.pow(exp as u32), 1, Format::DecimalExponent))
            } else {
                Ok((1, 10i128.pow(exp.unsigned_abs()), Format::DecimalExponent))
            };
        }
    }
    Err(ResourceError::InvalidSuffix(suffix.to_string()))
}

impl FromStr for Quantity {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.milli == other.milli
    }
}

impl Eq for Quantity {}

impl Hash for Quantity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.milli.hash(state);
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.milli.cmp(&other.milli)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.milli % 1000 != 0 {
            return write!(f, "{}m", self.milli);
        }
        let value = self.milli / 1000;
        if value == 0 {
            return write!(f, "0");
        }
        match self.format {
            Format::BinarySi => {
                for (suffix, shift) in BINARY_SUFFIXES.iter().rev() {
                    let unit = 1i128 << shift;
                    if value % unit == 0 {
                        return write!(f, "{}{}", value / unit, suffix);
                    }
                }
            }
            Format::DecimalSi | Format::DecimalExponent => {
                for (suffix, exp) in DECIMAL_SUFFIXES.iter().rev() {
                    let unit = 10i128.pow(*exp);
                    if value % unit == 0 {
                        return write!(f, "{}{}", value / unit, suffix);
                    }
                }
            }
        }
        write!(f, "{}", value)
    }
}

// ============================================================================
// Pod resource helpers
// ============================================================================

/// ResourceFieldSelector represents container resources (cpu, memory) and their output format.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceFieldSelector {
    pub container_name: String,
    /// Required: resource to select, e.g. "limits.cpu".
    pub resource: String,
    /// Output format of the exposed resources; defaults to "1".
    pub divisor: Option<Quantity>,
}

fn add_resource_list(list: &mut ResourceList, new: &ResourceList) {
    for (name, quantity) in new {
        list.entry(name.clone())
            .and_modify(|value| value.add(quantity))
            .or_insert(*quantity);
    }
}

fn max_resource_list(list: &mut ResourceList, new: &ResourceList) {
    for (name, quantity) in new {
        match list.get(name) {
            Some(value) if quantity <= value => {}
            _ => {
                list.insert(name.clone(), *quantity);
            }
        }
    }
}

/// Returns all defined resources summed up for all containers of the pod.
/// Init containers define the minimum of any resource.
pub fn pod_requests_and_limits(pod: &Pod) -> (ResourceList, ResourceList) {
    let mut reqs = ResourceList::new();
    let mut limits = ResourceList::new();
    for container in &pod.spec.containers {
        add_resource_list(&mut reqs, &container.resources.requests);
        add_resource_list(&mut limits, &container.resources.limits);
    }
    for container in &pod.spec.init_containers {
        max_resource_list(&mut reqs, &container.resources.requests);
        max_resource_list(&mut limits, &container.resources.limits);
    }
    (reqs, limits)
}

/// Returns the request for a specific resource; cpu is reported in millis.
pub fn get_resource_request(pod: &Pod, resource: &str) -> i64 {
    if resource == RESOURCE_PODS {
        return 1;
    }
    let scalar = |q: &Quantity| {
        if resource == RESOURCE_CPU {
            q.milli_value()
        } else {
            q.value()
        }
    };

    let mut total: i64 = 0;
    for container in &pod.spec.containers {
        if let Some(q) = container.resources.requests.get(resource) {
            total += scalar(q);
        }
    }
    // max(sum of containers, any init container)
    for container in &pod.spec.init_containers {
        if let Some(q) = container.resources.requests.get(resource) {
            total = total.max(scalar(q));
        }
    }
    total
}

fn find_container_in_pod<'a>(pod: &'a Pod, container_name: &str) -> Result<&'a Container, ResourceError> {
    pod.spec
        .containers
        .iter()
        .find(|c| c.name == container_name)
        .ok_or_else(|| ResourceError::ContainerNotFound(container_name.to_string()))
}

/// Extracts the value of a resource by container name.
pub fn extract_resource_value_by_container_name(
    fs: &ResourceFieldSelector,
    pod: &Pod,
    container_name: &str,
) -> Result<String, ResourceError> {
    let container = find_container_in_pod(pod, container_name)?;
    extract_container_resource_value(fs, container)
}

/// Extracts the value of a resource by container name, substituting node
/// allocatable for limits the container leaves unset.
pub fn extract_resource_value_by_container_name_and_node_allocatable(
    fs: &ResourceFieldSelector,
    pod: &Pod,
    container_name: &str,
    node_allocatable: &ResourceList,
) -> Result<String, ResourceError> {
    let mut container = find_container_in_pod(pod, container_name)?.clone();
    merge_container_resource_limits(&mut container, node_allocatable);
    extract_container_resource_value(fs, &container)
}

/// Extracts the value of a resource in an already known container.
pub fn extract_container_resource_value(
    fs: &ResourceFieldSelector,
    container: &Container,
) -> Result<String, ResourceError> {
    let divisor = match fs.divisor {
        Some(d) if !d.is_zero() => d,
        _ => Quantity::from_value(1, Format::DecimalSi),
    };
    let zero = Quantity::default();
    let limits = &container.resources.limits;
    let requests = &container.resources.requests;

    let value = match fs.resource.as_str() {
        "limits.cpu" => cpu_in_divisor(limits.get(RESOURCE_CPU).unwrap_or(&zero), &divisor),
        "limits.memory" => value_in_divisor(limits.get(RESOURCE_MEMORY).unwrap_or(&zero), &divisor),
        "limits.ephemeral-storage" => value_in_divisor(
            limits.get(RESOURCE_EPHEMERAL_STORAGE).unwrap_or(&zero),
            &divisor,
        ),
        "requests.cpu" => cpu_in_divisor(requests.get(RESOURCE_CPU).unwrap_or(&zero), &divisor),
        "requests.memory" => {
            value_in_divisor(requests.get(RESOURCE_MEMORY).unwrap_or(&zero), &divisor)
        }
        "requests.ephemeral-storage" => value_in_divisor(
            requests.get(RESOURCE_EPHEMERAL_STORAGE).unwrap_or(&zero),
            &divisor,
        ),
        other => return Err(ResourceError::UnsupportedResource(other.to_string())),
    };
    Ok(value.to_string())
}

fn ceil_div(a: i64, b: i64) -> i64 {
    if b == 0 {
        return 0;
    }
    (a as f64 / b as f64).ceil() as i64
}

fn cpu_in_divisor(cpu: &Quantity, divisor: &Quantity) -> i64 {
    ceil_div(cpu.milli_value(), divisor.milli_value())
}

fn value_in_divisor(q: &Quantity, divisor: &Quantity) -> i64 {
    ceil_div(q.value(), divisor.value())
}

/// Sets any missing or zero cpu/memory/ephemeral-storage limit to the node allocatable value.
pub fn merge_container_resource_limits(container: &mut Container, allocatable: &ResourceList) {
    for resource in [RESOURCE_CPU, RESOURCE_MEMORY, RESOURCE_EPHEMERAL_STORAGE] {
        let missing = container
            .resources
            .limits
            .get(resource)
            .map_or(true, |q| q.is_zero());
        if missing {
            if let Some(cap) = allocatable.get(resource) {
                container.resources.limits.insert(resource.to_string(), *cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), q(v)))
            .collect()
    }

    #[test]
    fn test_quantity_parse() {
        struct TestCase {
            name: &'static str,
            input: &'static str,
            milli: i64,
            value: i64,
        }

        let test_cases = vec![
            TestCase { name: "plain", input: "5", milli: 5000, value: 5 },
            TestCase { name: "milli", input: "100m", milli: 100, value: 1 },
            TestCase { name: "decimal fraction", input: "0.5", milli: 500, value: 1 },
            TestCase { name: "kilo", input: "2k", milli: 2_000_000, value: 2000 },
            TestCase { name: "gibi", input: "1Gi", milli: 1_073_741_824_000, value: 1_073_741_824 },
            TestCase { name: "mebi fraction", input: "1.5Mi", milli: 1_572_864_000, value: 1_572_864 },
            TestCase { name: "exponent", input: "1e3", milli: 1_000_000, value: 1000 },
            TestCase { name: "negative", input: "-2", milli: -2000, value: -2 },
        ];

        for tc in test_cases {
            let got = q(tc.input);
            assert_eq!(got.milli_value(), tc.milli, "{}: milli", tc.name);
            assert_eq!(got.value(), tc.value, "{}: value", tc.name);
        }
    }

    #[test]
    fn test_quantity_parse_errors() {
        for input in ["", "abc", "1Qi", "1..2", "Gi"] {
            assert!(Quantity::parse(input).is_err(), "{}: expected error", input);
        }
    }

    #[test]
    fn test_quantity_display() {
        assert_eq!(q("10Gi").to_string(), "10Gi");
        assert_eq!(q("1536Mi").to_string(), "1536Mi");
        assert_eq!(q("2000").to_string(), "2k");
        assert_eq!(q("250m").to_string(), "250m");
        assert_eq!(Quantity::from_gib(3).to_string(), "3Gi");
        assert_eq!(q("0").to_string(), "0");
    }

    #[test]
    fn test_quantity_compare() {
        assert_eq!(q("1Gi"), q("1073741824"));
        assert!(q("1Gi") > q("1G"));
        assert!(q("100m") < q("1"));
    }

    fn pod_with(containers: Vec<Container>, init: Vec<Container>) -> Pod {
        let mut pod = Pod::new("pod", "ns");
        pod.spec.containers = containers;
        pod.spec.init_containers = init;
        pod
    }

    fn container(name: &str, requests: &[(&str, &str)], limits: &[(&str, &str)]) -> Container {
        let mut c = Container::new(name, "image");
        c.resources.requests = list(requests);
        c.resources.limits = list(limits);
        c
    }

    #[test]
    fn test_pod_requests_and_limits() {
        let pod = pod_with(
            vec![
                container("a", &[("cpu", "100m"), ("memory", "1Gi")], &[("cpu", "1")]),
                container("b", &[("cpu", "200m")], &[("cpu", "1")]),
            ],
            vec![container("init", &[("cpu", "500m"), ("memory", "512Mi")], &[])],
        );
        let (reqs, limits) = pod_requests_and_limits(&pod);
        assert_eq!(reqs.get("cpu"), Some(&q("500m")));
        assert_eq!(reqs.get("memory"), Some(&q("1Gi")));
        assert_eq!(limits.get("cpu"), Some(&q("2")));
    }

    #[test]
    fn test_get_resource_request() {
        let pod = pod_with(
            vec![
                container("a", &[("cpu", "100m"), ("memory", "100")], &[]),
                container("b", &[("cpu", "200m"), ("memory", "50")], &[]),
            ],
            vec![container("init", &[("memory", "120")], &[])],
        );
        assert_eq!(get_resource_request(&pod, "cpu"), 300);
        assert_eq!(get_resource_request(&pod, "memory"), 150);
        assert_eq!(get_resource_request(&pod, "pods"), 1);
    }

    #[test]
    fn test_extract_container_resource_value() {
        struct TestCase {
            name: &'static str,
            resource: &'static str,
            divisor: Option<&'static str>,
            expected: Result<&'static str, ResourceError>,
        }

        let c = container(
            "app",
            &[("cpu", "250m"), ("memory", "64Mi")],
            &[("cpu", "1500m"), ("memory", "128Mi")],
        );

        let test_cases = vec![
            TestCase { name: "limits cpu cores", resource: "limits.cpu", divisor: None, expected: Ok("2") },
            TestCase { name: "limits cpu millis", resource: "limits.cpu", divisor: Some("1m"), expected: Ok("1500") },
            TestCase { name: "requests memory mebi", resource: "requests.memory", divisor: Some("1Mi"), expected: Ok("64") },
            TestCase { name: "requests cpu", resource: "requests.cpu", divisor: None, expected: Ok("1") },
            TestCase { name: "unset ephemeral storage", resource: "limits.ephemeral-storage", divisor: None, expected: Ok("0") },
            TestCase {
                name: "unsupported",
                resource: "limits.gpu",
                divisor: None,
                expected: Err(ResourceError::UnsupportedResource("limits.gpu".into())),
            },
        ];

        for tc in test_cases {
            let fs = ResourceFieldSelector {
                container_name: "app".into(),
                resource: tc.resource.into(),
                divisor: tc.divisor.map(q),
            };
            let got = extract_container_resource_value(&fs, &c);
            assert_eq!(got, tc.expected.map(String::from), "{}", tc.name);
        }
    }

    #[test]
    fn test_extract_with_node_allocatable() {
        let pod = pod_with(vec![container("app", &[], &[("cpu", "0")])], vec![]);
        let allocatable = list(&[("cpu", "4"), ("memory", "8Gi")]);
        let fs = ResourceFieldSelector {
            container_name: "app".into(),
            resource: "limits.cpu".into(),
            divisor: None,
        };
        let got = extract_resource_value_by_container_name_and_node_allocatable(
            &fs,
            &pod,
            "app",
            &allocatable,
        );
        assert_eq!(got, Ok("4".to_string()));

        let missing = extract_resource_value_by_container_name(&fs, &pod, "other");
        assert_eq!(missing.unwrap_err().to_string(), "container other not found");
    }
}
