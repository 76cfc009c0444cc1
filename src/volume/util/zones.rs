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

//! Zone selection for dynamically provisioned volumes.
//!
//! Volumes are spread across zones by hashing the claim name. A claim named
//! like a StatefulSet member (`claim-set-3`) hashes only `set` and uses the
//! trailing index as an offset, so the members of a set round-robin across
//! zones while the claims of one member stay together.

use super::LABEL_MULTI_ZONE_DELIMITER;
use crate::api::core::{Node, TopologySelectorTerm, LABEL_ZONE_FAILURE_DOMAIN};
use crate::volume::{VolumeError, VolumeResult};
use std::collections::BTreeSet;
use tracing::{info, warn};

const FNV32_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV32_PRIME: u32 = 16_777_619;

// FNV-1, not FNV-1a: multiply before xor.
fn fnv1_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV32_OFFSET_BASIS, |hash, b| {
        hash.wrapping_mul(FNV32_PRIME) ^ u32::from(*b)
    })
}

fn pvc_name_hash_and_index_offset(pvc_name: &str) -> (u32, u32) {
    if pvc_name.is_empty() {
        warn!("No name defined during volume create; choosing random zone");
        return (rand::random::<u32>(), 0);
    }

    let mut hash_string = pvc_name;
    let mut index = 0;
    if let Some(last_dash) = pvc_name.rfind('-') {
        let suffix = &pvc_name[last_dash + 1..];
        // u32 parsing accepts a leading '+'; only bare digits are an index.
        let digits = !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit());
        if let Some(id) = digits.then(|| suffix.parse::<u32>().ok()).flatten() {
            index = id;
            hash_string = &pvc_name[..last_dash];
            if let Some(prev_dash) = hash_string.rfind('-') {
                hash_string = &hash_string[prev_dash + 1..];
            }
            info!("Detected StatefulSet-style volume name {:?}; index={}", pvc_name, index);
        }
    }
    (fnv1_32(hash_string.as_bytes()), index)
}

/// Pick one zone for the claim. Returns an empty string without zones.
pub fn choose_zone_for_volume(zones: &BTreeSet<String>, pvc_name: &str) -> String {
    if zones.is_empty() {
        return String::new();
    }
    let (hash, index) = pvc_name_hash_and_index_offset(pvc_name);
    let zone_slice: Vec<&String> = zones.iter().collect();
    let zone = zone_slice[(hash.wrapping_add(index) % zone_slice.len() as u32) as usize].clone();
    info!(
        "Creating volume for PVC {:?}; chose zone={:?} from zones={:?}",
        pvc_name, zone, zone_slice
    );
    zone
}

/// Pick `num_zones` zones for a replicated claim.
pub fn choose_zones_for_volume(zones: &BTreeSet<String>, pvc_name: &str, num_zones: u32) -> BTreeSet<String> {
    let mut replica_zones = BTreeSet::new();
    if zones.is_empty() {
        return replica_zones;
    }
    let (hash, index) = pvc_name_hash_and_index_offset(pvc_name);
    let zone_slice: Vec<&String> = zones.iter().collect();
    let len = zone_slice.len() as u32;

    let starting_index = index.wrapping_mul(num_zones);
    for i in 0..num_zones {
        let idx = hash.wrapping_add(starting_index.wrapping_add(i)) % len;
        replica_zones.insert(zone_slice[idx as usize].clone());
    }
    info!(
        "Creating volume for replicated PVC {:?}; chosen zones={:?} from zones={:?}",
        pvc_name, replica_zones, zone_slice
    );
    replica_zones
}

/// Like [`choose_zones_for_volume`], but `zone_to_include` is always part of
/// the result when non-empty.
pub fn choose_zones_for_volume_including_zone(
    zones: &BTreeSet<String>,
    pvc_name: &str,
    zone_to_include: &str,
    num_replicas: u32,
) -> VolumeResult<BTreeSet<String>> {
    if num_replicas == 0 {
        return Err(VolumeError::invalid_argument("invalid number of replicas passed"));
    }
    if (zones.len() as u32) < num_replicas {
        return Err(VolumeError::invalid_argument(format!(
            "not enough zones found to provision a volume with {} replicas. Need at least {} distinct zones for a volume with {} replicas",
            num_replicas, num_replicas, num_replicas
        )));
    }
    if !zone_to_include.is_empty() && !zones.contains(zone_to_include) {
        return Err(VolumeError::invalid_argument(format!(
            "zone to be included: {} needs to be member of set: {:?}",
            zone_to_include, zones
        )));
    }
    if zones.len() as u32 == num_replicas {
        return Ok(zones.clone());
    }

    let mut candidates = zones.clone();
    let mut remaining = num_replicas;
    if !zone_to_include.is_empty() {
        candidates.remove(zone_to_include);
        remaining -= 1;
    }
    let mut chosen = choose_zones_for_volume(&candidates, pvc_name, remaining);
    if !zone_to_include.is_empty() {
        chosen.insert(zone_to_include.to_string());
    }
    Ok(chosen)
}

/// Select a single zone; see [`select_zones_for_volume`].
pub fn select_zone_for_volume(
    zone_parameter: Option<&str>,
    zones_parameter: Option<&BTreeSet<String>>,
    zones_with_nodes: &BTreeSet<String>,
    node: Option<&Node>,
    allowed_topologies: &[TopologySelectorTerm],
    pvc_name: &str,
) -> VolumeResult<String> {
    let zones = select_zones_for_volume(
        zone_parameter,
        zones_parameter,
        zones_with_nodes,
        node,
        allowed_topologies,
        pvc_name,
        1,
    )?;
    zones
        .into_iter()
        .next()
        .ok_or_else(|| VolumeError::internal("could not determine a zone to provision volume in"))
}

/// Select zones for a volume from, in order of precedence: the selected node,
/// the allowed topologies, the `zone`/`zones` storage class parameters, and
/// the zones that have nodes.
pub fn select_zones_for_volume(
    zone_parameter: Option<&str>,
    zones_parameter: Option<&BTreeSet<String>>,
    zones_with_nodes: &BTreeSet<String>,
    node: Option<&Node>,
    allowed_topologies: &[TopologySelectorTerm],
    pvc_name: &str,
    num_replicas: u32,
) -> VolumeResult<BTreeSet<String>> {
    if zone_parameter.is_some() && zones_parameter.is_some() {
        return Err(VolumeError::invalid_argument(
            "both zone and zones StorageClass parameters must not be used at the same time",
        ));
    }

    let mut zone_from_node = String::new();
    if let Some(node) = node {
        if zone_parameter.is_some() || zones_parameter.is_some() {
            return Err(VolumeError::invalid_argument(
                "zone[s] cannot be specified in StorageClass if VolumeBindingMode is set to WaitForFirstConsumer. Please specify allowedTopologies in StorageClass for constraining zones",
            ));
        }
        zone_from_node = node
            .metadata
            .labels
            .get(LABEL_ZONE_FAILURE_DOMAIN)
            .cloned()
            .ok_or_else(|| {
                VolumeError::invalid_argument(format!("{} Label for node missing", LABEL_ZONE_FAILURE_DOMAIN))
            })?;
        if num_replicas == 1 {
            return Ok(BTreeSet::from([zone_from_node]));
        }
    }

    let allowed_zones = zones_from_allowed_topologies(allowed_topologies)?;
    if !allowed_topologies.is_empty() && allowed_zones.is_empty() {
        return Err(VolumeError::invalid_argument(format!(
            "no matchLabelExpressions with {} key found in allowedTopologies. Please specify matchLabelExpressions with {} key",
            LABEL_ZONE_FAILURE_DOMAIN, LABEL_ZONE_FAILURE_DOMAIN
        )));
    }

    if !allowed_zones.is_empty() {
        if zone_parameter.is_some() || zones_parameter.is_some() {
            return Err(VolumeError::invalid_argument(
                "zone[s] cannot be specified in StorageClass if allowedTopologies specified",
            ));
        }
        return choose_zones_for_volume_including_zone(&allowed_zones, pvc_name, &zone_from_node, num_replicas)
            .map_err(|e| {
                VolumeError::invalid_argument(format!("cannot process zones in allowedTopologies: {}", e))
            });
    }

    if let Some(zone) = zone_parameter {
        if num_replicas > 1 {
            return Err(VolumeError::invalid_argument(
                "zone cannot be specified if desired number of replicas for pv is greather than 1. Please specify zones or allowedTopologies to specify desired zones",
            ));
        }
        return Ok(BTreeSet::from([zone.to_string()]));
    }

    if let Some(zones) = zones_parameter {
        if (zones.len() as u32) < num_replicas {
            return Err(VolumeError::invalid_argument(format!(
                "not enough zones found in zones parameter to provision a volume with {} replicas. Found {} zones, need {} zones",
                num_replicas,
                zones.len(),
                num_replicas
            )));
        }
        return Ok(choose_zones_for_volume(zones, pvc_name, num_replicas));
    }

    if !zones_with_nodes.is_empty() {
        return choose_zones_for_volume_including_zone(zones_with_nodes, pvc_name, &zone_from_node, num_replicas)
            .map_err(|e| {
                VolumeError::invalid_argument(format!(
                    "cannot process zones where nodes exist in the cluster: {}",
                    e
                ))
            });
    }
    Err(VolumeError::invalid_argument("cannot determine zones to provision volume in"))
}

/// Returns the zones named by the zone label expressions of the topologies.
pub fn zones_from_allowed_topologies(allowed_topologies: &[TopologySelectorTerm]) -> VolumeResult<BTreeSet<String>> {
    let mut zones = BTreeSet::new();
    for term in allowed_topologies {
        for exp in &term.match_label_expressions {
            if exp.key != LABEL_ZONE_FAILURE_DOMAIN {
                return Err(VolumeError::invalid_argument(format!(
                    "unsupported key found in matchLabelExpressions: {}",
                    exp.key
                )));
            }
            zones.extend(exp.values.iter().cloned());
        }
    }
    Ok(zones)
}

/// Returns an error if the zone is empty or blank.
pub fn validate_zone(zone: &str) -> VolumeResult<()> {
    if zone.trim().is_empty() {
        return Err(VolumeError::invalid_argument(format!(
            "the provided {:?} zone is not valid, it's an empty string or contains only spaces and tab characters",
            zone
        )));
    }
    Ok(())
}

/// Join zones into a label value.
pub fn zones_set_to_label_value(zones: &BTreeSet<String>) -> String {
    zones
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(LABEL_MULTI_ZONE_DELIMITER)
}

/// Parse a comma separated list of zones.
pub fn zones_to_set(zones: &str) -> VolumeResult<BTreeSet<String>> {
    string_to_list(zones, ",")
        .map(|list| list.into_iter().collect())
        .map_err(|e| {
            VolumeError::invalid_argument(format!(
                "error parsing zones {}, must be strings separated by commas: {}",
                zones, e
            ))
        })
}

/// Parse a multi-zone label value into a set.
pub fn label_zones_to_set(label_zones_value: &str) -> VolumeResult<BTreeSet<String>> {
    Ok(string_to_list(label_zones_value, LABEL_MULTI_ZONE_DELIMITER)?
        .into_iter()
        .collect())
}

/// Parse a multi-zone label value into a list, keeping order.
pub fn label_zones_to_list(label_zones_value: &str) -> VolumeResult<Vec<String>> {
    string_to_list(label_zones_value, LABEL_MULTI_ZONE_DELIMITER)
}

fn string_to_list(s: &str, delimiter: &str) -> VolumeResult<Vec<String>> {
    let mut list = Vec::new();
    for zone in s.split(delimiter) {
        let trimmed = zone.trim();
        if trimmed.is_empty() {
            return Err(VolumeError::invalid_argument(format!(
                "{:?} separated list ({:?}) must not contain an empty string",
                delimiter, s
            )));
        }
        list.push(trimmed.to_string());
    }
    Ok(list)
}
