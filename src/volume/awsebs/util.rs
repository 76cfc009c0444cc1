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

use super::PLUGIN_NAME;
use crate::api::core::{Node, TopologySelectorTerm};
use crate::api::resource::Quantity;
use crate::cloudprovider::{aws, CloudProvider};
use crate::volume::util::{generate_volume_name, round_up_to_gib_int, select_zone_for_volume, zones_to_set};
use crate::volume::{VolumeError, VolumeHost, VolumeOptions, VolumeResult};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

const MAX_VOLUME_NAME_LENGTH: usize = 255;
const MIN_IOPS_PER_GB: i64 = 1;
const MAX_IOPS_PER_GB: i64 = 30;

/// CreatedVolume describes a freshly provisioned EBS volume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreatedVolume {
    pub volume_id: String,
    pub size_gib: i64,
    pub labels: HashMap<String, String>,
    pub fs_type: String,
}

/// Returns the host's cloud provider, which must be AWS.
pub(super) fn get_cloud_provider(host: &dyn VolumeHost) -> VolumeResult<Arc<dyn CloudProvider>> {
    match host.cloud_provider() {
        Some(cloud) if cloud.aws_volumes().is_some() => Ok(cloud),
        other => {
            let name = other.map(|c| c.provider_name().to_string()).unwrap_or_else(|| "nil".to_string());
            error!("Failed to get AWS Cloud Provider. GetCloudProvider returned {} instead", name);
            Err(VolumeError::internal(format!(
                "Failed to get AWS Cloud Provider. GetCloudProvider returned {} instead",
                name
            )))
        }
    }
}

pub(super) fn aws_volumes(cloud: &dyn CloudProvider) -> VolumeResult<&dyn aws::Volumes> {
    cloud
        .aws_volumes()
        .ok_or_else(|| VolumeError::internal("cloud provider does not support EBS volumes"))
}

fn parse_iops_per_gb(value: &str) -> VolumeResult<i64> {
    let invalid = |reason: String| {
        VolumeError::invalid_argument(format!(
            "invalid iopsPerGB value {:?}, must be integer between {} and {}: {}",
            value, MIN_IOPS_PER_GB, MAX_IOPS_PER_GB, reason
        ))
    };
    let iops: i64 = value.parse().map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
    if !(MIN_IOPS_PER_GB..=MAX_IOPS_PER_GB).contains(&iops) {
        return Err(invalid("value out of range".to_string()));
    }
    Ok(iops)
}

fn parse_encrypted(value: &str) -> VolumeResult<bool> {
    match value.to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(VolumeError::invalid_argument(format!(
            "invalid encrypted boolean value {:?}, must be true or false: invalid syntax",
            value
        ))),
    }
}

/// Create an EBS volume for the claim in `options`. The zone comes from the
/// storage class or is picked among the zones that run nodes.
pub(super) fn create_volume(
    host: &dyn VolumeHost,
    options: &VolumeOptions,
    node: Option<&Node>,
    allowed_topologies: &[TopologySelectorTerm],
) -> VolumeResult<CreatedVolume> {
    let cloud = get_cloud_provider(host)?;
    let volumes = aws_volumes(cloud.as_ref())?;

    // AWS volumes don't have Name field, store the name in Name tag
    let mut tags = options.cloud_tags.clone();
    tags.insert(
        "Name".to_string(),
        generate_volume_name(&options.cluster_name, &options.pv_name, MAX_VOLUME_NAME_LENGTH),
    );

    let capacity = options
        .pvc
        .storage_request()
        .cloned()
        .unwrap_or_else(|| Quantity::from_gib(0));
    let request_gib = i64::from(round_up_to_gib_int(&capacity)?);

    let mut volume_options = aws::VolumeOptions {
        capacity_gib: request_gib,
        tags,
        volume_type: aws::DEFAULT_VOLUME_TYPE.to_string(),
        ..Default::default()
    };

    let mut zone: Option<String> = None;
    let mut zones: Option<BTreeSet<String>> = None;
    let mut fs_type = String::new();
    let mut parameters: Vec<(&String, &String)> = options.parameters.iter().collect();
    parameters.sort();
    for (k, v) in parameters {
        match k.to_lowercase().as_str() {
            "type" => volume_options.volume_type = v.clone(),
            "zone" => zone = Some(v.clone()),
            "zones" => zones = Some(zones_to_set(v)?),
            "iopspergb" => volume_options.iops_per_gb = parse_iops_per_gb(v)?,
            "encrypted" => volume_options.encrypted = parse_encrypted(v)?,
            "kmskeyid" => volume_options.kms_key_id = v.clone(),
            "fstype" => fs_type = v.clone(),
            _ => {
                return Err(VolumeError::invalid_argument(format!(
                    "invalid option {:?} for volume plugin {}",
                    k, PLUGIN_NAME
                )))
            }
        }
    }

    let zones_with_nodes = volumes.get_candidate_zones_for_dynamic_volume()?;
    volume_options.availability_zone = select_zone_for_volume(
        zone.as_deref(),
        zones.as_ref(),
        &zones_with_nodes,
        node,
        allowed_topologies,
        &options.pvc.metadata.name,
    )?;

    if options.pvc.spec.selector.is_some() {
        return Err(VolumeError::invalid_argument(
            "claim.Spec.Selector is not supported for dynamic provisioning on AWS",
        ));
    }

    let name = volumes.create_disk(&volume_options).inspect_err(|e| {
        warn!("Error creating EBS Disk volume: {}", e);
    })?;
    info!("Successfully created EBS Disk volume {}", name);

    let labels = match volumes.get_volume_labels(&name) {
        Ok(labels) => labels,
        Err(e) => {
            // We don't really want to leak the volume here...
            error!("error building labels for new EBS volume {:?}: {}", name, e);
            HashMap::new()
        }
    };

    Ok(CreatedVolume {
        volume_id: name,
        size_gib: request_gib,
        labels,
        fs_type,
    })
}

/// Delete the EBS volume. A volume that is already gone is not an error.
pub(super) fn delete_volume(host: &dyn VolumeHost, volume_id: &str) -> VolumeResult<()> {
    let cloud = get_cloud_provider(host)?;
    let volumes = aws_volumes(cloud.as_ref())?;

    let deleted = volumes.delete_disk(volume_id).inspect_err(|e| {
        error!("Error deleting EBS Disk volume {}: {}", volume_id, e);
    })?;
    if deleted {
        info!("Successfully deleted EBS Disk volume {}", volume_id);
    } else {
        info!("Successfully deleted EBS Disk volume {} (actually already deleted)", volume_id);
    }
    Ok(())
}

fn aws_volume_id_regex() -> VolumeResult<Regex> {
    Regex::new("^vol-[^/]*$").map_err(|e| VolumeError::internal(e.to_string()))
}

/// Map a Kubernetes volume id to the bare EBS volume id. Accepted forms are
/// `aws://<zone>/<vol-id>`, `aws:///<vol-id>` and `<vol-id>`.
pub fn map_to_aws_volume_id(volume_id: &str) -> VolumeResult<String> {
    let volume_id = volume_id.trim();
    if !volume_id.starts_with("aws://") {
        // Assume a bare aws volume id (vol-1234...)
        if aws_volume_id_regex()?.is_match(volume_id) {
            return Ok(volume_id.to_string());
        }
        return Err(VolumeError::invalid_argument(format!(
            "Invalid format for AWS volume ({})",
            volume_id
        )));
    }

    let url = Url::parse(volume_id).map_err(|e| {
        VolumeError::invalid_argument(format!("Invalid disk name ({}): {}", volume_id, e))
    })?;
    if url.scheme() != "aws" {
        return Err(VolumeError::invalid_argument(format!(
            "Invalid scheme for AWS volume ({})",
            volume_id
        )));
    }

    let aws_id = url.path().trim_start_matches('/');
    // The host is the availability zone and may be empty.
    if aws_id.contains('/') || !aws_volume_id_regex()?.is_match(aws_id) {
        return Err(VolumeError::invalid_argument(format!(
            "Invalid format for AWS volume ({})",
            volume_id
        )));
    }
    Ok(aws_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{LabelSelector, PersistentVolumeClaim, LABEL_ZONE_FAILURE_DOMAIN};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::cloudprovider::CloudError;
    use crate::volume::host::testing::new_fake_host;

    fn options_with(parameters: &[(&str, &str)]) -> VolumeOptions {
        let mut pvc = PersistentVolumeClaim::new("claim", "ns");
        pvc.spec
            .resources
            .requests
            .insert("storage".to_string(), Quantity::from_gib(4));
        VolumeOptions {
            pv_name: "pvc-1".to_string(),
            pvc,
            cluster_name: "cluster".to_string(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_map_to_aws_volume_id() {
        struct TestCase {
            input: &'static str,
            expected: Option<&'static str>,
        }
        let test_cases = vec![
            TestCase {
                input: "aws://us-east-1a/vol-1234",
                expected: Some("vol-1234"),
            },
            TestCase {
                input: "aws:///vol-1234",
                expected: Some("vol-1234"),
            },
            TestCase {
                input: "vol-1234",
                expected: Some("vol-1234"),
            },
            TestCase {
                input: " vol-1234 ",
                expected: Some("vol-1234"),
            },
            TestCase {
                input: "aws://us-east-1a/disk-1234",
                expected: None,
            },
            TestCase {
                input: "gce://zone/vol-1",
                expected: None,
            },
            TestCase {
                input: "disk-1234",
                expected: None,
            },
        ];
        for tc in test_cases {
            let result = map_to_aws_volume_id(tc.input);
            match tc.expected {
                Some(id) => assert_eq!(result.unwrap(), id, "{}: id", tc.input),
                None => assert!(result.is_err(), "{}: expected error", tc.input),
            }
        }
    }

    #[test]
    fn test_create_volume_parameters() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        cloud.set_zones_with_nodes(&["zone-a", "zone-b"]);
        let (host, _dir) = new_fake_host(Some(cloud.clone()));

        let created = create_volume(
            host.as_ref(),
            &options_with(&[
                ("Type", "io1"),
                ("zone", "zone-b"),
                ("iopsPerGB", "10"),
                ("encrypted", "true"),
                ("kmsKeyId", "key"),
                ("fsType", "xfs"),
            ]),
            None,
            &[],
        )
        .unwrap();
        assert!(created.volume_id.starts_with("aws://zone-b/vol-"));
        assert_eq!(created.size_gib, 4);
        assert_eq!(created.fs_type, "xfs");
        assert_eq!(created.labels[LABEL_ZONE_FAILURE_DOMAIN], "zone-a");

        let opts = &cloud.aws_volume_options()[0];
        assert_eq!(opts.volume_type, "io1");
        assert_eq!(opts.iops_per_gb, 10);
        assert!(opts.encrypted);
        assert_eq!(opts.kms_key_id, "key");
        assert_eq!(opts.tags["Name"], "cluster-dynamic-pvc-1");
    }

    #[test]
    fn test_create_volume_errors() {
        struct TestCase {
            name: &'static str,
            parameters: Vec<(&'static str, &'static str)>,
            expected: &'static str,
        }
        let test_cases = vec![
            TestCase {
                name: "unknown parameter",
                parameters: vec![("foo", "bar")],
                expected: "invalid option \"foo\" for volume plugin kubernetes.io/aws-ebs",
            },
            TestCase {
                name: "iops out of range",
                parameters: vec![("iopsPerGB", "50")],
                expected: "invalid iopsPerGB value \"50\", must be integer between 1 and 30: value out of range",
            },
            TestCase {
                name: "bad encrypted",
                parameters: vec![("encrypted", "yes")],
                expected: "invalid encrypted boolean value \"yes\", must be true or false: invalid syntax",
            },
        ];
        for tc in test_cases {
            let cloud = Arc::new(FakeCloud::new("aws"));
            let (host, _dir) = new_fake_host(Some(cloud));
            let err = create_volume(host.as_ref(), &options_with(&tc.parameters), None, &[]).unwrap_err();
            assert_eq!(err.to_string(), tc.expected, "{}: error", tc.name);
        }
    }

    #[test]
    fn test_create_volume_rejects_selector() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let mut options = options_with(&[]);
        options.pvc.spec.selector = Some(LabelSelector::default());
        let err = create_volume(host.as_ref(), &options, None, &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "claim.Spec.Selector is not supported for dynamic provisioning on AWS"
        );
        assert!(cloud.disks().is_empty());
    }

    #[test]
    fn test_create_volume_label_failure_keeps_volume() {
        let cloud = Arc::new(FakeCloud::new("aws"));
        cloud.set_error("get_volume_labels", CloudError::provider("boom"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let created = create_volume(host.as_ref(), &options_with(&[]), None, &[]).unwrap();
        assert!(created.labels.is_empty());
        assert_eq!(cloud.disks().len(), 1);
    }

    #[test]
    fn test_requires_aws_cloud() {
        let (host, _dir) = new_fake_host(Some(Arc::new(FakeCloud::new("gce"))));
        let err = delete_volume(host.as_ref(), "vol-1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to get AWS Cloud Provider. GetCloudProvider returned gce instead"
        );
    }
}
