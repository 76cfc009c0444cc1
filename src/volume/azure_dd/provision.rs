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

use super::common::{
    get_cloud_provider, managed_disk_controller, normalize_caching_mode, normalize_kind,
    normalize_storage_account_type, parse_zoned, DEFAULT_FS_TYPE,
};
use crate::api::core::{
    AzureDataDiskKind, AzureDiskVolumeSource, Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeAccessMode, PersistentVolumeSource, TopologySelectorTerm,
    VolumeNodeAffinity, RESOURCE_STORAGE,
};
use crate::api::resource::Quantity;
use crate::cloudprovider::azure::ManagedDiskOptions;
use crate::volume::util::{
    check_persistent_volume_claim_mode_block, generate_volume_name, round_up_to_gib_int, select_zone_for_volume,
    zones_to_set, VOLUME_DYNAMICALLY_CREATED_BY_KEY,
};
use crate::volume::{Deleter, Provisioner, VolumeError, VolumeHost, VolumeOptions, VolumeResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_DISK_NAME_LENGTH: usize = 75;

/// StorageClass parameters understood by the Azure disk provisioner.
#[derive(Debug, Default)]
struct ProvisionParameters {
    storage_account_type: String,
    location: String,
    account: String,
    kind: String,
    caching_mode: String,
    fs_type: String,
    resource_group: String,
    zone: Option<String>,
    zones: Option<BTreeSet<String>>,
    zoned: String,
}

impl ProvisionParameters {
    fn parse(parameters: &HashMap<String, String>) -> VolumeResult<Self> {
        let mut params = Self::default();
        for (k, v) in parameters {
            match k.to_lowercase().as_str() {
                "skuname" | "storageaccounttype" => params.storage_account_type = v.clone(),
                "location" => params.location = v.clone(),
                "storageaccount" => params.account = v.clone(),
                "kind" => params.kind = v.clone(),
                "cachingmode" => params.caching_mode = v.clone(),
                "fstype" => params.fs_type = v.to_lowercase(),
                "resourcegroup" => params.resource_group = v.clone(),
                "zone" => params.zone = Some(v.clone()),
                "zones" => params.zones = Some(zones_to_set(v)?),
                "zoned" => params.zoned = v.clone(),
                _ => {
                    return Err(VolumeError::invalid_argument(format!(
                        "AzureDisk - invalid option {} in storage class",
                        k
                    )))
                }
            }
        }
        Ok(params)
    }
}

/// AzureDiskProvisioner creates managed disks for claims.
pub struct AzureDiskProvisioner {
    host: Arc<dyn VolumeHost>,
    access_modes: Vec<PersistentVolumeAccessMode>,
    options: VolumeOptions,
}

impl AzureDiskProvisioner {
    pub(super) fn new(
        host: Arc<dyn VolumeHost>,
        access_modes: Vec<PersistentVolumeAccessMode>,
        options: VolumeOptions,
    ) -> Self {
        Self {
            host,
            access_modes,
            options,
        }
    }

    fn check_access_modes(&self) -> VolumeResult<()> {
        let modes = &self.options.pvc.spec.access_modes;
        if modes.len() > 1 {
            return Err(VolumeError::invalid_argument(
                "AzureDisk - multiple access modes are not supported on AzureDisk plugin",
            ));
        }
        if let Some(mode) = modes.first() {
            if !self.access_modes.contains(mode) {
                return Err(VolumeError::invalid_argument(format!(
                    "AzureDisk - mode {} is not supported by AzureDisk plugin (supported mode is {})",
                    mode.as_str(),
                    PersistentVolumeAccessMode::ReadWriteOnce.as_str()
                )));
            }
        }
        Ok(())
    }
}

impl Provisioner for AzureDiskProvisioner {
    fn provision(
        &self,
        selected_node: Option<&Node>,
        allowed_topologies: &[TopologySelectorTerm],
    ) -> VolumeResult<PersistentVolume> {
        self.check_access_modes()?;
        let pvc = &self.options.pvc;
        if pvc.spec.selector.is_some() {
            return Err(VolumeError::invalid_argument(
                "azureDisk - claim.Spec.Selector is not supported for dynamic provisioning on Azure disk",
            ));
        }

        let name = generate_volume_name(&self.options.cluster_name, &self.options.pv_name, MAX_DISK_NAME_LENGTH);
        let capacity = pvc
            .storage_request()
            .cloned()
            .unwrap_or_else(|| Quantity::from_gib(0));
        let request_gib = round_up_to_gib_int(&capacity)?;

        let params = ProvisionParameters::parse(&self.options.parameters)?;
        let storage_account_type = normalize_storage_account_type(&params.storage_account_type)?;
        let kind = normalize_kind(&params.kind)?;
        let caching_mode = normalize_caching_mode(&params.caching_mode)?;
        let zoned = parse_zoned(&params.zoned, kind)?;

        if kind != AzureDataDiskKind::Managed {
            if !params.resource_group.is_empty() {
                return Err(VolumeError::invalid_argument(
                    "StorageClass option 'resourceGroup' can be used only for managed disks",
                ));
            }
            return Err(VolumeError::invalid_argument(format!(
                "AzureDisk - dynamic provisioning of {} blob disks is not supported",
                kind.as_str()
            )));
        }
        if !zoned && (params.zone.is_some() || params.zones.is_some() || !allowed_topologies.is_empty()) {
            return Err(VolumeError::invalid_argument(
                "zone, zones and allowedTopologies StorageClass parameters must be used together with zoned parameter",
            ));
        }
        if !params.location.is_empty() || !params.account.is_empty() {
            debug!(
                "azureDisk - location {:?} and storage account {:?} are ignored for managed disks",
                params.location, params.account
            );
        }

        let cloud = get_cloud_provider(self.host.as_ref())?;
        let controller = managed_disk_controller(cloud.as_ref())?;

        let mut availability_zone = String::new();
        if zoned {
            let mut active_zones = BTreeSet::new();
            if let Some(zones) = cloud.zones() {
                active_zones.insert(zones.get_zone()?.failure_domain);
            }
            availability_zone = select_zone_for_volume(
                params.zone.as_deref(),
                params.zones.as_ref(),
                &active_zones,
                selected_node,
                allowed_topologies,
                &pvc.metadata.name,
            )?;
        }

        let disk_options = ManagedDiskOptions {
            disk_name: name.clone(),
            size_gb: i64::from(request_gib),
            pvc_name: pvc.metadata.name.clone(),
            resource_group: params.resource_group.clone(),
            availability_zone,
            tags: self.options.cloud_tags.clone(),
            storage_account_type,
        };
        let disk_uri = controller.create_managed_disk(&disk_options)?;
        let labels = controller.get_azure_disk_labels(&disk_uri)?;
        info!("azureDisk - created managed disk {} for claim {}", disk_uri, pvc.metadata.name);

        let fs_type = if check_persistent_volume_claim_mode_block(pvc) {
            String::new()
        } else if params.fs_type.is_empty() {
            DEFAULT_FS_TYPE.to_string()
        } else {
            params.fs_type
        };

        let mut pv = PersistentVolume::new(&self.options.pv_name);
        pv.metadata.annotations.insert(
            VOLUME_DYNAMICALLY_CREATED_BY_KEY.to_string(),
            "azure-disk-dynamic-provisioner".to_string(),
        );
        pv.spec.persistent_volume_reclaim_policy = self.options.reclaim_policy;
        pv.spec.access_modes = if pvc.spec.access_modes.is_empty() {
            self.access_modes.clone()
        } else {
            pvc.spec.access_modes.clone()
        };
        pv.spec.capacity.insert(
            RESOURCE_STORAGE.to_string(),
            Quantity::from_gib(i64::from(request_gib)),
        );
        pv.spec.volume_mode = pvc.spec.volume_mode;
        pv.spec.persistent_volume_source = PersistentVolumeSource {
            azure_disk: Some(AzureDiskVolumeSource {
                disk_name: name,
                data_disk_uri: disk_uri,
                caching_mode: Some(caching_mode),
                fs_type: Some(fs_type),
                read_only: Some(false),
                kind: Some(kind),
            }),
            ..Default::default()
        };
        pv.spec.mount_options = self.options.mount_options.clone();

        let mut labels: Vec<(String, String)> = labels.into_iter().collect();
        labels.sort();
        let mut requirements = Vec::with_capacity(labels.len());
        for (k, v) in labels {
            requirements.push(NodeSelectorRequirement::in_values(&k, vec![v.clone()]));
            pv.metadata.labels.insert(k, v);
        }
        if zoned && !requirements.is_empty() {
            pv.spec.node_affinity = Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: requirements,
                    }],
                }),
            });
        }
        Ok(pv)
    }
}

/// AzureDiskDeleter removes a managed disk.
pub struct AzureDiskDeleter {
    host: Arc<dyn VolumeHost>,
    volume_name: String,
    disk_uri: String,
}

impl AzureDiskDeleter {
    pub(super) fn new(host: Arc<dyn VolumeHost>, volume_name: &str, disk_uri: &str) -> Self {
        Self {
            host,
            volume_name: volume_name.to_string(),
            disk_uri: disk_uri.to_string(),
        }
    }
}

impl Deleter for AzureDiskDeleter {
    fn delete(&self) -> VolumeResult<()> {
        let cloud = get_cloud_provider(self.host.as_ref())?;
        let controller = managed_disk_controller(cloud.as_ref())?;
        info!("azureDisk - deleting volume {} ({})", self.volume_name, self.disk_uri);
        Ok(controller.delete_managed_disk(&self.disk_uri)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{
        AzureDataDiskCachingMode, LabelSelector, PersistentVolumeClaim, PersistentVolumeMode,
        LABEL_ZONE_FAILURE_DOMAIN, LABEL_ZONE_REGION,
    };
    use crate::cloudprovider::azure::{Backoff, ManagedDiskController};
    use crate::cloudprovider::fake::{FakeCloud, FakeDisksClient};
    use crate::cloudprovider::CloudProvider;
    use crate::volume::host::testing::new_fake_host;
    use std::time::Duration;

    fn azure_cloud(client: Arc<FakeDisksClient>) -> Arc<dyn CloudProvider> {
        let controller = ManagedDiskController::new(client, "sub", "rg", "eastus").with_backoff(Backoff {
            duration: Duration::from_millis(1),
            factor: 1.0,
            steps: 1,
        });
        Arc::new(FakeCloud::new("azure").with_managed_disks(controller))
    }

    fn options_with(parameters: &[(&str, &str)]) -> VolumeOptions {
        let mut pvc = PersistentVolumeClaim::new("claim", "ns");
        pvc.spec.access_modes = vec![PersistentVolumeAccessMode::ReadWriteOnce];
        pvc.spec
            .resources
            .requests
            .insert(RESOURCE_STORAGE.to_string(), Quantity::parse("1500Mi").unwrap());
        VolumeOptions {
            pv_name: "pvc-1".to_string(),
            pvc,
            cluster_name: "kubernetes".to_string(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn provisioner(client: Arc<FakeDisksClient>, options: VolumeOptions) -> (AzureDiskProvisioner, tempfile::TempDir) {
        let (host, dir) = new_fake_host(Some(azure_cloud(client)));
        (
            AzureDiskProvisioner::new(host, vec![PersistentVolumeAccessMode::ReadWriteOnce], options),
            dir,
        )
    }

    #[test]
    fn test_provision_defaults() {
        let client = Arc::new(FakeDisksClient::new());
        let (p, _dir) = provisioner(client.clone(), options_with(&[]));
        let pv = p.provision(None, &[]).unwrap();

        let source = pv.spec.persistent_volume_source.azure_disk.clone().unwrap();
        assert_eq!(source.disk_name, "kubernetes-dynamic-pvc-1");
        assert_eq!(
            source.data_disk_uri,
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/kubernetes-dynamic-pvc-1"
        );
        assert_eq!(source.kind, Some(AzureDataDiskKind::Managed));
        assert_eq!(source.caching_mode, Some(AzureDataDiskCachingMode::ReadOnly));
        assert_eq!(source.fs_type.as_deref(), Some("ext4"));
        assert_eq!(pv.spec.capacity[RESOURCE_STORAGE], Quantity::from_gib(2));
        assert_eq!(
            pv.metadata.annotations[VOLUME_DYNAMICALLY_CREATED_BY_KEY],
            "azure-disk-dynamic-provisioner"
        );
        // The fake node zone is a fault domain, so the disk is not zoned.
        assert!(pv.spec.node_affinity.is_none());

        let disk = &client.disks()["kubernetes-dynamic-pvc-1"];
        assert_eq!(disk.sku, "Standard_LRS");
        assert_eq!(disk.size_gb, Some(2));
        assert!(disk.zones.is_empty());
    }

    #[test]
    fn test_provision_zoned() {
        let client = Arc::new(FakeDisksClient::new());
        let (p, _dir) = provisioner(
            client.clone(),
            options_with(&[
                ("zoned", "true"),
                ("zone", "eastus-2"),
                ("skuName", "premium_lrs"),
                ("cachingMode", "None"),
                ("fsType", "XFS"),
            ]),
        );
        let pv = p.provision(None, &[]).unwrap();

        let disk = &client.disks()["kubernetes-dynamic-pvc-1"];
        assert_eq!(disk.zones, vec!["2".to_string()]);
        assert_eq!(disk.sku, "Premium_LRS");
        assert_eq!(pv.metadata.labels[LABEL_ZONE_FAILURE_DOMAIN], "eastus-2");
        assert_eq!(pv.metadata.labels[LABEL_ZONE_REGION], "eastus");

        let source = pv.spec.persistent_volume_source.azure_disk.clone().unwrap();
        assert_eq!(source.caching_mode, Some(AzureDataDiskCachingMode::None));
        assert_eq!(source.fs_type.as_deref(), Some("xfs"));

        let terms = pv.spec.node_affinity.unwrap().required.unwrap().node_selector_terms;
        assert_eq!(terms[0].match_expressions.len(), 2);
    }

    #[test]
    fn test_provision_block_mode() {
        let client = Arc::new(FakeDisksClient::new());
        let mut options = options_with(&[]);
        options.pvc.spec.volume_mode = Some(PersistentVolumeMode::Block);
        let (p, _dir) = provisioner(client, options);
        let pv = p.provision(None, &[]).unwrap();
        let source = pv.spec.persistent_volume_source.azure_disk.unwrap();
        assert_eq!(source.fs_type.as_deref(), Some(""));
        assert_eq!(pv.spec.volume_mode, Some(PersistentVolumeMode::Block));
    }

    #[test]
    fn test_provision_errors() {
        struct TestCase {
            name: &'static str,
            parameters: Vec<(&'static str, &'static str)>,
            expected: &'static str,
        }
        let test_cases = vec![
            TestCase {
                name: "unknown parameter",
                parameters: vec![("foo", "bar")],
                expected: "AzureDisk - invalid option foo in storage class",
            },
            TestCase {
                name: "resource group on blob disk",
                parameters: vec![("kind", "dedicated"), ("resourceGroup", "rg2")],
                expected: "StorageClass option 'resourceGroup' can be used only for managed disks",
            },
            TestCase {
                name: "blob disk",
                parameters: vec![("kind", "shared")],
                expected: "AzureDisk - dynamic provisioning of Shared blob disks is not supported",
            },
            TestCase {
                name: "zone without zoned",
                parameters: vec![("zoned", "false"), ("zone", "eastus-1")],
                expected: "zone, zones and allowedTopologies StorageClass parameters must be used together with zoned parameter",
            },
            TestCase {
                name: "zoned blob disk",
                parameters: vec![("kind", "dedicated"), ("zoned", "true")],
                expected: "zoned is only supported by managed disks",
            },
        ];
        for tc in test_cases {
            let (p, _dir) = provisioner(Arc::new(FakeDisksClient::new()), options_with(&tc.parameters));
            let err = p.provision(None, &[]).unwrap_err();
            assert_eq!(err.to_string(), tc.expected, "{}", tc.name);
        }
    }

    #[test]
    fn test_provision_claim_validation() {
        let mut options = options_with(&[]);
        options.pvc.spec.access_modes = vec![
            PersistentVolumeAccessMode::ReadWriteOnce,
            PersistentVolumeAccessMode::ReadOnlyMany,
        ];
        let (p, _dir) = provisioner(Arc::new(FakeDisksClient::new()), options);
        assert_eq!(
            p.provision(None, &[]).unwrap_err().to_string(),
            "AzureDisk - multiple access modes are not supported on AzureDisk plugin"
        );

        let mut options = options_with(&[]);
        options.pvc.spec.access_modes = vec![PersistentVolumeAccessMode::ReadWriteMany];
        let (p, _dir) = provisioner(Arc::new(FakeDisksClient::new()), options);
        assert_eq!(
            p.provision(None, &[]).unwrap_err().to_string(),
            "AzureDisk - mode ReadWriteMany is not supported by AzureDisk plugin (supported mode is ReadWriteOnce)"
        );

        let mut options = options_with(&[]);
        options.pvc.spec.selector = Some(LabelSelector::default());
        let (p, _dir) = provisioner(Arc::new(FakeDisksClient::new()), options);
        assert_eq!(
            p.provision(None, &[]).unwrap_err().to_string(),
            "azureDisk - claim.Spec.Selector is not supported for dynamic provisioning on Azure disk"
        );
    }

    #[test]
    fn test_delete() {
        let client = Arc::new(FakeDisksClient::new());
        let (p, _dir) = provisioner(client.clone(), options_with(&[]));
        let pv = p.provision(None, &[]).unwrap();
        let uri = pv.spec.persistent_volume_source.azure_disk.unwrap().data_disk_uri;

        let deleter = AzureDiskDeleter::new(p.host.clone(), "pvc-1", &uri);
        deleter.delete().unwrap();
        assert!(client.disks().is_empty());
    }
}
