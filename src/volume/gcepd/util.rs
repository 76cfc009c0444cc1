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
use crate::cloudprovider::{gce, CloudProvider};
use crate::volume::util::{
    generate_volume_name, round_up_to_gib, select_zone_for_volume, select_zones_for_volume, zones_to_set,
};
use crate::volume::{VolumeError, VolumeHost, VolumeOptions, VolumeResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info};

const MAX_VOLUME_NAME_LENGTH: usize = 63;
const REPLICA_ZONES: u32 = 2;

/// CreatedDisk describes a freshly provisioned persistent disk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreatedDisk {
    pub pd_name: String,
    pub size_gb: i64,
    pub labels: HashMap<String, String>,
    pub fs_type: String,
}

pub(super) fn get_cloud_provider(host: &dyn VolumeHost) -> VolumeResult<Arc<dyn CloudProvider>> {
    match host.cloud_provider() {
        Some(cloud) if cloud.gce_disks().is_some() => Ok(cloud),
        other => {
            let name = other.map(|c| c.provider_name().to_string()).unwrap_or_else(|| "nil".to_string());
            error!("Failed to get GCE Cloud Provider. plugin.host.GetCloudProvider returned {} instead", name);
            Err(VolumeError::internal(format!(
                "Failed to get GCE GCECloudProvider. plugin.host.GetCloudProvider returned {} instead",
                name
            )))
        }
    }
}

pub(super) fn gce_disks(cloud: &dyn CloudProvider) -> VolumeResult<&dyn gce::Disks> {
    cloud
        .gce_disks()
        .ok_or_else(|| VolumeError::internal("cloud provider does not support GCE persistent disks"))
}

/// Create a persistent disk for the claim in `options`. A `regional-pd`
/// replication type creates the disk in two zones.
pub(super) fn create_volume(
    host: &dyn VolumeHost,
    options: &VolumeOptions,
    node: Option<&Node>,
    allowed_topologies: &[TopologySelectorTerm],
) -> VolumeResult<CreatedDisk> {
    let cloud = get_cloud_provider(host)?;
    let disks = gce_disks(cloud.as_ref())?;

    let name = generate_volume_name(&options.cluster_name, &options.pv_name, MAX_VOLUME_NAME_LENGTH);
    let capacity = options
        .pvc
        .storage_request()
        .cloned()
        .unwrap_or_else(|| Quantity::from_gib(0));
    // GCE PDs are allocated in chunks of GiBs
    let request_gb = round_up_to_gib(&capacity);

    let mut disk_type = String::new();
    let mut zone: Option<String> = None;
    let mut zones: Option<BTreeSet<String>> = None;
    let mut replication_type = "none".to_string();
    let mut fs_type = String::new();
    let mut parameters: Vec<(&String, &String)> = options.parameters.iter().collect();
    parameters.sort();
    for (k, v) in parameters {
        match k.to_lowercase().as_str() {
            "type" => disk_type = v.clone(),
            "zone" => zone = Some(v.clone()),
            "zones" => zones = Some(zones_to_set(v)?),
            "replication-type" => replication_type = v.to_lowercase(),
            "fstype" => fs_type = v.clone(),
            _ => {
                return Err(VolumeError::invalid_argument(format!(
                    "invalid option {:?} for volume plugin {}",
                    k, PLUGIN_NAME
                )))
            }
        }
    }

    if options.pvc.spec.selector.is_some() {
        return Err(VolumeError::invalid_argument(
            "claim.Spec.Selector is not supported for dynamic provisioning on GCE",
        ));
    }
    if disk_type.is_empty() {
        disk_type = gce::DISK_TYPE_STANDARD.to_string();
    }

    let zones_with_nodes = disks.get_all_current_zones()?;
    let pvc_name = &options.pvc.metadata.name;
    let disk_zone = match replication_type.as_str() {
        gce::REPLICATION_TYPE_REGIONAL_PD => {
            let selected = select_zones_for_volume(
                zone.as_deref(),
                zones.as_ref(),
                &zones_with_nodes,
                node,
                allowed_topologies,
                pvc_name,
                REPLICA_ZONES,
            )?;
            disks
                .create_regional_disk(&name, &disk_type, &selected, request_gb, &options.cloud_tags)
                .inspect_err(|e| info!("Error creating regional GCE PD volume: {}", e))?;
            info!("Successfully created Regional GCE PD volume {}", name);
            String::new()
        }
        "none" => {
            let selected = select_zone_for_volume(
                zone.as_deref(),
                zones.as_ref(),
                &zones_with_nodes,
                node,
                allowed_topologies,
                pvc_name,
            )?;
            disks
                .create_disk(&name, &disk_type, &selected, request_gb, &options.cloud_tags)
                .inspect_err(|e| info!("Error creating single-zone GCE PD volume: {}", e))?;
            info!("Successfully created single-zone GCE PD volume {}", name);
            selected
        }
        other => {
            return Err(VolumeError::invalid_argument(format!(
                "replication-type of {:?} is not supported",
                other
            )))
        }
    };

    let labels = match disks.get_auto_labels_for_pd(&name, &disk_zone) {
        Ok(labels) => labels,
        Err(e) => {
            // We don't really want to leak the volume here...
            error!("error getting labels for volume {:?}: {}", name, e);
            HashMap::new()
        }
    };

    Ok(CreatedDisk {
        pd_name: name,
        size_gb: request_gb,
        labels,
        fs_type,
    })
}

pub(super) fn delete_volume(host: &dyn VolumeHost, pd_name: &str) -> VolumeResult<()> {
    let cloud = get_cloud_provider(host)?;
    let disks = gce_disks(cloud.as_ref())?;
    disks.delete_disk(pd_name).inspect_err(|e| {
        error!("Error deleting GCE PD volume {}: {}", pd_name, e);
    })?;
    info!("Successfully deleted GCE PD volume {}", pd_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{LabelSelector, Node, PersistentVolumeClaim, LABEL_ZONE_FAILURE_DOMAIN};
    use crate::cloudprovider::fake::FakeCloud;
    use crate::cloudprovider::CloudError;
    use crate::volume::host::testing::new_fake_host;

    fn options_with(parameters: &[(&str, &str)]) -> VolumeOptions {
        let mut pvc = PersistentVolumeClaim::new("claim", "ns");
        pvc.spec
            .resources
            .requests
            .insert("storage".to_string(), Quantity::parse("1500Mi").unwrap());
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
    fn test_create_volume_defaults() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));

        let created = create_volume(host.as_ref(), &options_with(&[]), None, &[]).unwrap();
        assert_eq!(created.pd_name, "cluster-dynamic-pvc-1");
        assert_eq!(created.size_gb, 2);
        assert_eq!(created.labels[LABEL_ZONE_FAILURE_DOMAIN], "zone-a");
        assert_eq!(cloud.gce_disk_type("cluster-dynamic-pvc-1").as_deref(), Some("pd-standard"));
        assert_eq!(
            cloud.call_names(),
            vec!["get_all_current_zones", "create_disk", "get_auto_labels_for_pd"]
        );
    }

    #[test]
    fn test_create_volume_zone_from_node() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let mut node = Node::new("node-1");
        node.metadata
            .labels
            .insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), "zone-z".to_string());

        let created = create_volume(
            host.as_ref(),
            &options_with(&[("FSType", "xfs")]),
            Some(&node),
            &[],
        )
        .unwrap();
        assert_eq!(created.fs_type, "xfs");
        assert_eq!(
            cloud.gce_disk_zones("cluster-dynamic-pvc-1"),
            BTreeSet::from(["zone-z".to_string()])
        );
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
                expected: "invalid option \"foo\" for volume plugin kubernetes.io/gce-pd",
            },
            TestCase {
                name: "unknown replication type",
                parameters: vec![("replication-type", "triple")],
                expected: "replication-type of \"triple\" is not supported",
            },
            TestCase {
                name: "zone and zones",
                parameters: vec![("zone", "zone-a"), ("zones", "zone-a,zone-b")],
                expected: "both zone and zones StorageClass parameters must not be used at the same time",
            },
            TestCase {
                name: "regional with a single zone",
                parameters: vec![("replication-type", "regional-pd"), ("zones", "zone-a")],
                expected: "not enough zones found in zones parameter to provision a volume with 2 replicas. Found 1 zones, need 2 zones",
            },
        ];
        for tc in test_cases {
            let cloud = Arc::new(FakeCloud::new("gce"));
            let (host, _dir) = new_fake_host(Some(cloud));
            let err = create_volume(host.as_ref(), &options_with(&tc.parameters), None, &[]).unwrap_err();
            assert_eq!(err.to_string(), tc.expected, "{}", tc.name);
        }
    }

    #[test]
    fn test_create_volume_rejects_selector() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        let (host, _dir) = new_fake_host(Some(cloud));
        let mut options = options_with(&[]);
        options.pvc.spec.selector = Some(LabelSelector::default());
        let err = create_volume(host.as_ref(), &options, None, &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "claim.Spec.Selector is not supported for dynamic provisioning on GCE"
        );
    }

    #[test]
    fn test_create_volume_label_failure_keeps_disk() {
        let cloud = Arc::new(FakeCloud::new("gce"));
        cloud.set_error("get_auto_labels_for_pd", CloudError::provider("boom"));
        let (host, _dir) = new_fake_host(Some(cloud.clone()));
        let created = create_volume(host.as_ref(), &options_with(&[]), None, &[]).unwrap();
        assert!(created.labels.is_empty());
        assert!(cloud.disks().contains_key("cluster-dynamic-pvc-1"));
    }

    #[test]
    fn test_requires_gce_cloud() {
        let (host, _dir) = new_fake_host(Some(Arc::new(FakeCloud::new("aws"))));
        let err = create_volume(host.as_ref(), &options_with(&[]), None, &[]).unwrap_err();
        assert!(err.to_string().ends_with("returned aws instead"));

        let (host, _dir) = new_fake_host(None);
        let err = delete_volume(host.as_ref(), "pd").unwrap_err();
        assert!(err.to_string().ends_with("returned nil instead"));
    }
}
