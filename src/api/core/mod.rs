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

//! Core Kubernetes API types (Pod, Volume, PersistentVolume, Node, Service, etc.)

use crate::api::resource::Quantity;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// ResourceList is a map of resource names to quantities.
pub type ResourceList = BTreeMap<String, Quantity>;

/// ApiObject is a trait for Kubernetes API objects stored by clients and caches.
pub trait ApiObject: Send + Sync {
    /// Returns the object as Any for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns the kind of this object.
    fn kind(&self) -> &str;

    /// Returns the object metadata.
    fn metadata(&self) -> &ObjectMeta;
}

macro_rules! impl_api_object {
    ($ty:ty, $kind:expr) => {
        impl ApiObject for $ty {
            fn as_any(&self) -> &dyn Any {
                self
            }

            fn kind(&self) -> &str {
                $kind
            }

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }
        }
    };
}

// ============================================================================
// Constants
// ============================================================================

/// Label key for hostname topology.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// Label key for the failure-domain zone of a node or volume.
pub const LABEL_ZONE_FAILURE_DOMAIN: &str = "failure-domain.beta.kubernetes.io/zone";

/// Label key for the region of a node or volume.
pub const LABEL_ZONE_REGION: &str = "failure-domain.beta.kubernetes.io/region";

/// Annotation set on static pods mirrored into the API server.
pub const MIRROR_POD_ANNOTATION_KEY: &str = "kubernetes.io/config.mirror";

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_STORAGE: &str = "storage";
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const RESOURCE_PODS: &str = "pods";

/// Secret type for TLS secrets.
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
/// Secret type for opaque user data.
pub const SECRET_TYPE_OPAQUE: &str = "Opaque";
/// Data key for the certificate in a TLS secret.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Data key for the private key in a TLS secret.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

// ============================================================================
// Metadata
// ============================================================================

/// OwnerReference contains enough information to identify an owning object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// If true, this reference points to the managing controller.
    pub controller: Option<bool>,
}

impl OwnerReference {
    /// Create a controller owner reference.
    pub fn controller(kind: &str, name: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: String::new(),
            controller: Some(true),
        }
    }
}

/// ObjectMeta is metadata that all persisted resources must have.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Create metadata with the given name and namespace.
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// Returns the owner reference that is marked as controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|r| r.controller == Some(true))
    }

    /// Returns "namespace/name", or just "name" for cluster-scoped objects.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

/// ObjectReference contains enough information to let you locate the referenced object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

// ============================================================================
// Label selectors
// ============================================================================

/// LabelSelectorRequirement is a selector that contains values, a key, and an operator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

/// LabelSelector is a label query over a set of resources.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelSelector {
    pub match_labels: HashMap<String, String>,
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

// ============================================================================
// Containers
// ============================================================================

/// Protocol defines network protocols supported for things like container ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// ContainerPort represents a network port in a single container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerPort {
    pub name: String,
    pub host_port: i32,
    pub container_port: i32,
    pub protocol: Protocol,
    pub host_ip: String,
}

/// ResourceRequirements describes the compute resource requirements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceRequirements {
    /// Requests describes the minimum amount of compute resources required.
    pub requests: ResourceList,
    /// Limits describes the maximum amount of compute resources allowed.
    pub limits: ResourceList,
}

/// Container represents a single container in a pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub ports: Vec<ContainerPort>,
    pub resources: ResourceRequirements,
}

impl Container {
    /// Create a new container with the given name and image.
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Volume sources
// ============================================================================

/// EmptyDirVolumeSource represents a temporary directory that shares a pod's lifetime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EmptyDirVolumeSource {
    pub medium: String,
}

/// HostPathVolumeSource represents a host path mapped into a pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostPathVolumeSource {
    pub path: String,
}

/// AwsElasticBlockStoreVolumeSource represents a Persistent Disk resource in AWS.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AwsElasticBlockStoreVolumeSource {
    /// Unique ID of the persistent disk resource in AWS (Amazon EBS volume).
    pub volume_id: String,
    pub fs_type: String,
    /// The partition in the volume that you want to mount; 0 means the whole disk.
    pub partition: i32,
    pub read_only: bool,
}

/// GcePersistentDiskVolumeSource represents a Persistent Disk resource in Google Compute Engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GcePersistentDiskVolumeSource {
    pub pd_name: String,
    pub fs_type: String,
    pub partition: i32,
    pub read_only: bool,
}

/// AzureDataDiskKind describes how an Azure data disk is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AzureDataDiskKind {
    /// Multiple blob disks per storage account.
    Shared,
    /// Single blob disk per storage account.
    Dedicated,
    /// Azure managed data disk.
    Managed,
}

impl AzureDataDiskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AzureDataDiskKind::Shared => "Shared",
            AzureDataDiskKind::Dedicated => "Dedicated",
            AzureDataDiskKind::Managed => "Managed",
        }
    }

    /// Parse a disk kind; matching is case-insensitive.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "shared" => Some(AzureDataDiskKind::Shared),
            "dedicated" => Some(AzureDataDiskKind::Dedicated),
            "managed" => Some(AzureDataDiskKind::Managed),
            _ => None,
        }
    }
}

/// AzureDataDiskCachingMode is the host caching mode of an Azure data disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AzureDataDiskCachingMode {
    None,
    #[default]
    ReadOnly,
    ReadWrite,
}

impl AzureDataDiskCachingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AzureDataDiskCachingMode::None => "None",
            AzureDataDiskCachingMode::ReadOnly => "ReadOnly",
            AzureDataDiskCachingMode::ReadWrite => "ReadWrite",
        }
    }

    /// Parse a caching mode; matching is case-insensitive.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(AzureDataDiskCachingMode::None),
            "readonly" => Some(AzureDataDiskCachingMode::ReadOnly),
            "readwrite" => Some(AzureDataDiskCachingMode::ReadWrite),
            _ => None,
        }
    }
}

/// AzureDiskVolumeSource represents an Azure Data Disk mount on the host and bind mount to the pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AzureDiskVolumeSource {
    pub disk_name: String,
    pub data_disk_uri: String,
    pub caching_mode: Option<AzureDataDiskCachingMode>,
    pub fs_type: Option<String>,
    pub read_only: Option<bool>,
    /// None when the spec was reconstructed from the node.
    pub kind: Option<AzureDataDiskKind>,
}

/// AzureFileVolumeSource represents an Azure File Service mount on the host and bind mount to the pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AzureFileVolumeSource {
    pub secret_name: String,
    pub share_name: String,
    pub read_only: bool,
}

/// AzureFilePersistentVolumeSource is the persistent-volume flavor of an Azure File mount.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AzureFilePersistentVolumeSource {
    pub secret_name: String,
    pub share_name: String,
    pub read_only: bool,
    /// Namespace of the secret; defaults to "default" when unset.
    pub secret_namespace: Option<String>,
}

/// PhotonPersistentDiskVolumeSource represents a Photon Controller persistent disk resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhotonPersistentDiskVolumeSource {
    pub pd_id: String,
    pub fs_type: String,
}

/// FlexVolumeSource represents a generic volume resource provisioned by an exec based driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlexVolumeSource {
    pub driver: String,
    pub fs_type: String,
    pub options: HashMap<String, String>,
    pub read_only: bool,
}

/// PersistentVolumeClaimVolumeSource references a PVC in the same namespace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistentVolumeClaimVolumeSource {
    pub claim_name: String,
    pub read_only: bool,
}

/// VolumeSource represents the source of a volume to mount. Only one member may be set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VolumeSource {
    pub empty_dir: Option<EmptyDirVolumeSource>,
    pub host_path: Option<HostPathVolumeSource>,
    pub aws_elastic_block_store: Option<AwsElasticBlockStoreVolumeSource>,
    pub gce_persistent_disk: Option<GcePersistentDiskVolumeSource>,
    pub azure_disk: Option<AzureDiskVolumeSource>,
    pub azure_file: Option<AzureFileVolumeSource>,
    pub photon_persistent_disk: Option<PhotonPersistentDiskVolumeSource>,
    pub flex_volume: Option<FlexVolumeSource>,
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
}

/// Volume represents a named volume in a pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Volume {
    pub name: String,
    pub volume_source: VolumeSource,
}

impl Volume {
    /// Create a new volume with the given name and source.
    pub fn new(name: &str, volume_source: VolumeSource) -> Self {
        Self {
            name: name.to_string(),
            volume_source,
        }
    }
}

// ============================================================================
// Persistent volumes
// ============================================================================

/// PersistentVolumeAccessMode describes how a volume can be mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PersistentVolumeAccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

impl PersistentVolumeAccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistentVolumeAccessMode::ReadWriteOnce => "ReadWriteOnce",
            PersistentVolumeAccessMode::ReadOnlyMany => "ReadOnlyMany",
            PersistentVolumeAccessMode::ReadWriteMany => "ReadWriteMany",
        }
    }
}

impl fmt::Display for PersistentVolumeAccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// PersistentVolumeMode describes how a volume is intended to be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PersistentVolumeMode {
    Block,
    #[default]
    Filesystem,
}

impl PersistentVolumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistentVolumeMode::Block => "Block",
            PersistentVolumeMode::Filesystem => "Filesystem",
        }
    }
}

/// PersistentVolumeReclaimPolicy describes a policy for end-of-life maintenance of persistent volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PersistentVolumeReclaimPolicy {
    Recycle,
    #[default]
    Delete,
    Retain,
}

/// NodeSelectorOperator is the set of operators usable in a node selector requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeSelectorOperator {
    #[default]
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// NodeSelectorRequirement is a selector that contains values, a key, and an operator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    pub values: Vec<String>,
}

impl NodeSelectorRequirement {
    /// Create an `In` requirement.
    pub fn in_values(key: &str, values: Vec<String>) -> Self {
        Self {
            key: key.to_string(),
            operator: NodeSelectorOperator::In,
            values,
        }
    }

    /// Check whether the given label set satisfies this requirement.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            NodeSelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            NodeSelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            NodeSelectorOperator::Exists => value.is_some(),
            NodeSelectorOperator::DoesNotExist => value.is_none(),
            NodeSelectorOperator::Gt | NodeSelectorOperator::Lt => {
                let (Some(v), Some(bound)) = (value, self.values.first()) else {
                    return false;
                };
                match (v.parse::<i64>(), bound.parse::<i64>()) {
                    (Ok(v), Ok(bound)) if self.operator == NodeSelectorOperator::Gt => v > bound,
                    (Ok(v), Ok(bound)) => v < bound,
                    _ => false,
                }
            }
        }
    }
}

/// NodeSelectorTerm is a conjunction of requirements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSelectorTerm {
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

/// NodeSelector is a disjunction of terms.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSelector {
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

impl NodeSelector {
    /// Returns true if any term matches the given labels.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.node_selector_terms
            .iter()
            .any(|term| term.match_expressions.iter().all(|req| req.matches(labels)))
    }
}

/// VolumeNodeAffinity defines constraints that limit what nodes a volume can be accessed from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VolumeNodeAffinity {
    pub required: Option<NodeSelector>,
}

/// TopologySelectorLabelRequirement is a label key plus allowed values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologySelectorLabelRequirement {
    pub key: String,
    pub values: Vec<String>,
}

/// TopologySelectorTerm represents the result of label queries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologySelectorTerm {
    pub match_label_expressions: Vec<TopologySelectorLabelRequirement>,
}

/// PersistentVolumeSource is the set of sources a persistent volume may be backed by.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistentVolumeSource {
    pub aws_elastic_block_store: Option<AwsElasticBlockStoreVolumeSource>,
    pub gce_persistent_disk: Option<GcePersistentDiskVolumeSource>,
    pub azure_disk: Option<AzureDiskVolumeSource>,
    pub azure_file: Option<AzureFilePersistentVolumeSource>,
    pub photon_persistent_disk: Option<PhotonPersistentDiskVolumeSource>,
    pub flex_volume: Option<FlexVolumeSource>,
    pub host_path: Option<HostPathVolumeSource>,
}

/// PersistentVolumeSpec is the specification of a persistent volume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistentVolumeSpec {
    pub capacity: ResourceList,
    pub persistent_volume_source: PersistentVolumeSource,
    pub access_modes: Vec<PersistentVolumeAccessMode>,
    pub claim_ref: Option<ObjectReference>,
    pub persistent_volume_reclaim_policy: PersistentVolumeReclaimPolicy,
    pub storage_class_name: String,
    pub mount_options: Vec<String>,
    pub volume_mode: Option<PersistentVolumeMode>,
    pub node_affinity: Option<VolumeNodeAffinity>,
}

/// PersistentVolume is a storage resource provisioned by an administrator or a provisioner.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistentVolume {
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeSpec,
}

impl PersistentVolume {
    /// Create a new cluster-scoped persistent volume.
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, ""),
            spec: PersistentVolumeSpec::default(),
        }
    }
}

impl_api_object!(PersistentVolume, "PersistentVolume");

/// PersistentVolumeClaimSpec describes the common attributes of storage devices.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistentVolumeClaimSpec {
    pub access_modes: Vec<PersistentVolumeAccessMode>,
    pub selector: Option<LabelSelector>,
    pub resources: ResourceRequirements,
    pub volume_name: String,
    pub storage_class_name: Option<String>,
    pub volume_mode: Option<PersistentVolumeMode>,
}

/// PersistentVolumeClaim is a user's request for and claim to a persistent volume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistentVolumeClaim {
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeClaimSpec,
}

impl PersistentVolumeClaim {
    /// Create a new claim with the given name and namespace.
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            spec: PersistentVolumeClaimSpec::default(),
        }
    }

    /// Returns the requested storage, if any.
    pub fn storage_request(&self) -> Option<&Quantity> {
        self.spec.resources.requests.get(RESOURCE_STORAGE)
    }
}

impl_api_object!(PersistentVolumeClaim, "PersistentVolumeClaim");

// ============================================================================
// Pod
// ============================================================================

/// PodSecurityContext holds pod-level security attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodSecurityContext {
    /// A special supplemental group that applies to all containers in a pod.
    pub fs_group: Option<i64>,
}

/// PodSpec describes the specification of a pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodSpec {
    pub node_name: String,
    pub host_network: bool,
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
    pub security_context: Option<PodSecurityContext>,
    pub termination_grace_period_seconds: Option<i64>,
}

/// PodPhase is a label for the condition of a pod at the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

/// PodStatus represents information about the status of a pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub pod_ip: String,
}

/// Pod represents a Kubernetes Pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl Pod {
    /// Create a new pod with the given name and namespace.
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            ..Default::default()
        }
    }

    /// A pod is terminated once it reached the Succeeded or Failed phase.
    pub fn is_terminated(&self) -> bool {
        matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Returns the pod's fsGroup, if set.
    pub fn fs_group(&self) -> Option<i64> {
        self.spec.security_context.as_ref().and_then(|sc| sc.fs_group)
    }
}

impl_api_object!(Pod, "Pod");

// ============================================================================
// Node
// ============================================================================

/// NodeSpec describes the attributes that a node is created with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSpec {
    pub pod_cidr: String,
    pub provider_id: String,
    /// Unschedulable controls node schedulability of new pods.
    pub unschedulable: bool,
}

/// ConditionStatus represents the status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// NodeConditionType represents the type of a node condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeConditionType {
    Ready,
    MemoryPressure,
    DiskPressure,
    PidPressure,
    NetworkUnavailable,
}

/// NodeCondition contains condition information for a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCondition {
    pub condition_type: NodeConditionType,
    pub status: ConditionStatus,
}

impl NodeCondition {
    pub fn new(condition_type: NodeConditionType, status: ConditionStatus) -> Self {
        Self {
            condition_type,
            status,
        }
    }
}

/// NodeAddressType is the kind of a node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeAddressType {
    Hostname,
    InternalIp,
    ExternalIp,
    InternalDns,
    ExternalDns,
}

/// NodeAddress contains information for the node's address.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAddress {
    pub address_type: NodeAddressType,
    pub address: String,
}

/// NodeStatus is information about the current status of a node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeStatus {
    pub conditions: Vec<NodeCondition>,
    pub addresses: Vec<NodeAddress>,
    pub capacity: ResourceList,
    pub allocatable: ResourceList,
}

/// Node represents a Kubernetes Node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub spec: NodeSpec,
    pub status: NodeStatus,
}

impl Node {
    /// Create a new node with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, ""),
            ..Default::default()
        }
    }

    /// Returns the status of the given condition type, if reported.
    pub fn condition(&self, condition_type: NodeConditionType) -> Option<ConditionStatus> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
            .map(|c| c.status)
    }

    /// A node is ready when its Ready condition is True.
    pub fn is_ready(&self) -> bool {
        self.condition(NodeConditionType::Ready) == Some(ConditionStatus::True)
    }
}

impl_api_object!(Node, "Node");

// ============================================================================
// Service
// ============================================================================

/// ServiceType describes ingress methods for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceType {
    #[default]
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIp => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ExternalName => "ExternalName",
        }
    }
}

/// ServiceExternalTrafficPolicyType describes how nodes distribute service traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceExternalTrafficPolicyType {
    Cluster,
    Local,
}

/// ServicePort contains information on a service's port.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServicePort {
    pub name: String,
    pub protocol: Protocol,
    pub port: i32,
    pub target_port: i32,
    pub node_port: i32,
}

/// ServiceSpec describes the attributes that a user creates on a service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceSpec {
    pub service_type: ServiceType,
    pub ports: Vec<ServicePort>,
    pub cluster_ip: String,
    pub external_ips: Vec<String>,
    pub load_balancer_ip: String,
    pub load_balancer_source_ranges: Vec<String>,
    pub external_traffic_policy: Option<ServiceExternalTrafficPolicyType>,
    pub health_check_node_port: i32,
}

/// LoadBalancerIngress represents the status of a load-balancer ingress point.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadBalancerIngress {
    pub ip: String,
    pub hostname: String,
}

/// LoadBalancerStatus represents the status of a load-balancer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadBalancerStatus {
    pub ingress: Vec<LoadBalancerIngress>,
}

/// ServiceStatus represents the current status of a service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceStatus {
    pub load_balancer: LoadBalancerStatus,
}

/// Service is a named abstraction of software service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Service {
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
    pub status: ServiceStatus,
}

impl Service {
    /// Create a new service with the given name and namespace.
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            ..Default::default()
        }
    }

    /// Returns true if the service asks for a cloud load balancer.
    pub fn wants_load_balancer(&self) -> bool {
        self.spec.service_type == ServiceType::LoadBalancer
    }
}

impl_api_object!(Service, "Service");

// ============================================================================
// DaemonSet
// ============================================================================

/// DaemonSet runs a copy of a pod on every eligible node. Only its metadata
/// is modelled.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DaemonSet {
    pub metadata: ObjectMeta,
}

impl DaemonSet {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
        }
    }
}

impl_api_object!(DaemonSet, "DaemonSet");

// ============================================================================
// Secret
// ============================================================================

/// Secret holds secret data of a certain type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Secret {
    pub metadata: ObjectMeta,
    pub secret_type: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Create a new opaque secret with the given name and namespace.
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            secret_type: SECRET_TYPE_OPAQUE.to_string(),
            data: BTreeMap::new(),
        }
    }
}

impl_api_object!(Secret, "Secret");

// ============================================================================
// Event
// ============================================================================

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Event is a report of something that happened to an object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    pub metadata: ObjectMeta,
    pub involved_object: ObjectReference,
    /// Short, machine understandable reason, e.g. "EnsuredLoadBalancer".
    pub reason: String,
    pub message: String,
    /// Either "Normal" or "Warning".
    pub event_type: String,
}

impl Event {
    pub fn new(involved_object: ObjectReference, event_type: &str, reason: &str, message: &str) -> Self {
        Self {
            metadata: ObjectMeta::new("", &involved_object.namespace),
            involved_object,
            reason: reason.to_string(),
            message: message.to_string(),
            event_type: event_type.to_string(),
        }
    }
}

impl_api_object!(Event, "Event");
