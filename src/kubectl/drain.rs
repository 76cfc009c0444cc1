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

//! Cordon, uncordon and drain a node.

use super::{parse_selector, KubectlError, KubectlResult};
use crate::api::core::{Node, Pod, MIRROR_POD_ANNOTATION_KEY};
use crate::client::{ApiResult, DaemonSetClient, NodeClient, PodClient};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const DAEMONSET_FATAL: &str = "DaemonSet-managed pods (use --ignore-daemonsets to ignore)";
const DAEMONSET_WARNING: &str = "Ignoring DaemonSet-managed pods";
const LOCAL_STORAGE_FATAL: &str = "pods with local storage (use --delete-local-data to override)";
const LOCAL_STORAGE_WARNING: &str = "Deleting pods with local storage";
const UNMANAGED_FATAL: &str =
    "pods not managed by ReplicationController, ReplicaSet, Job, DaemonSet or StatefulSet (use --force to override)";
const UNMANAGED_WARNING: &str =
    "Deleting pods not managed by ReplicationController, ReplicaSet, Job, DaemonSet or StatefulSet";
const MIRROR_WARNING: &str = "Ignoring mirror pods";

// ============================================================================
// Cordon
// ============================================================================

/// CordonHelper flips `spec.unschedulable` on a node when needed.
pub struct CordonHelper {
    node: Node,
    desired: bool,
}

impl CordonHelper {
    pub fn new(node: Node) -> Self {
        Self { node, desired: false }
    }

    /// Record the desired state. Returns true when the node has to change.
    pub fn update_if_required(&mut self, desired: bool) -> bool {
        self.desired = desired;
        self.node.spec.unschedulable != desired
    }

    pub fn patch_or_replace(&self, client: &dyn NodeClient) -> ApiResult<Node> {
        client.patch_node_unschedulable(&self.node.metadata.name, self.desired)
    }
}

/// Cordon (`desired` true) or uncordon a node and return the message to
/// print.
pub fn run_cordon_or_uncordon(client: &dyn NodeClient, node_name: &str, desired: bool) -> KubectlResult<String> {
    let verb = if desired { "cordoned" } else { "uncordoned" };
    let node = client.get_node(node_name).map_err(|e| {
        error!("unable to get node {:?}: {}", node_name, e);
        e
    })?;

    let mut helper = CordonHelper::new(node);
    if !helper.update_if_required(desired) {
        return Ok(format!("node/{} already {}", node_name, verb));
    }
    helper.patch_or_replace(client)?;
    Ok(format!("node/{} {}", node_name, verb))
}

// ============================================================================
// Pod filters
// ============================================================================

/// What to do with one pod of a node being drained.
#[derive(Debug, Clone, PartialEq)]
pub enum PodDeleteStatus {
    Okay,
    Skip,
    /// Delete the pod, or leave it when `delete` is false, and warn.
    Warning { delete: bool, message: String },
    /// The drain cannot proceed while this pod is on the node.
    Error(String),
}

impl PodDeleteStatus {
    fn delete(&self) -> bool {
        match self {
            PodDeleteStatus::Okay => true,
            PodDeleteStatus::Warning { delete, .. } => *delete,
            PodDeleteStatus::Skip | PodDeleteStatus::Error(_) => false,
        }
    }
}

fn has_local_storage(pod: &Pod) -> bool {
    pod.spec.volumes.iter().any(|v| v.volume_source.empty_dir.is_some())
}

/// Join "<message>: a, b" groups with "; ".
fn join_groups(groups: &BTreeMap<String, Vec<String>>) -> String {
    groups
        .iter()
        .map(|(msg, pods)| format!("{}: {}", msg, pods.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Drain
// ============================================================================

pub struct DrainOptions {
    /// Continue even if there are pods not managed by a controller.
    pub force: bool,
    pub ignore_daemonsets: bool,
    /// Continue even if there are pods using emptyDir.
    pub delete_local_data: bool,
    /// Grace period for each pod. None uses the pod's own.
    pub grace_period: Option<i64>,
    /// Give up after this long. None waits forever.
    pub timeout: Option<Duration>,
    /// Only drain pods matching this equality selector, e.g. "app=web".
    pub pod_selector: String,
    /// Delete pods directly instead of creating evictions.
    pub disable_eviction: bool,

    nodes: Arc<dyn NodeClient>,
    pods: Arc<dyn PodClient>,
    daemon_sets: Arc<dyn DaemonSetClient>,
    poll_interval: Duration,
    eviction_retry_interval: Duration,
}

impl DrainOptions {
    pub fn new(nodes: Arc<dyn NodeClient>, pods: Arc<dyn PodClient>, daemon_sets: Arc<dyn DaemonSetClient>) -> Self {
        Self {
            force: false,
            ignore_daemonsets: false,
            delete_local_data: false,
            grace_period: None,
            timeout: None,
            pod_selector: String::new(),
            disable_eviction: false,
            nodes,
            pods,
            daemon_sets,
            poll_interval: POLL_INTERVAL,
            eviction_retry_interval: EVICTION_RETRY_INTERVAL,
        }
    }

    /// Cordon the node, then delete or evict its pods. Returns the lines to
    /// print.
    pub fn run_drain(&self, node_name: &str) -> KubectlResult<Vec<String>> {
        let mut out = vec![run_cordon_or_uncordon(self.nodes.as_ref(), node_name, true)?];
        if let Err(e) = self.delete_or_evict_pods_simple(node_name, &mut out) {
            error!("unable to drain node {:?}, aborting command...", node_name);
            return Err(e);
        }
        out.push(format!("node/{} drained", node_name));
        Ok(out)
    }

    fn delete_or_evict_pods_simple(&self, node_name: &str, out: &mut Vec<String>) -> KubectlResult<()> {
        let pods = self.get_pods_for_deletion(node_name, out)?;
        let result = self.delete_or_evict_pods(pods, out);
        if let Err(e) = &result {
            let mut ignored = Vec::new();
            if let Ok(pending) = self.get_pods_for_deletion(node_name, &mut ignored) {
                let names: Vec<&str> = pending.iter().map(|p| p.metadata.name.as_str()).collect();
                error!(
                    "There are pending pods in node {:?} when an error occurred: {}: {:?}",
                    node_name, e, names
                );
            }
        }
        result
    }

    fn filters(&self) -> [fn(&Self, &Pod) -> PodDeleteStatus; 5] {
        [
            Self::skip_deleted_filter,
            Self::daemonset_filter,
            Self::mirror_pod_filter,
            Self::local_storage_filter,
            Self::unreplicated_filter,
        ]
    }

    fn skip_deleted_filter(&self, pod: &Pod) -> PodDeleteStatus {
        if pod.metadata.deletion_timestamp.is_some() {
            return PodDeleteStatus::Skip;
        }
        PodDeleteStatus::Okay
    }

    fn daemonset_filter(&self, pod: &Pod) -> PodDeleteStatus {
        // A DaemonSet pod is never deleted: the controller would recreate it.
        // One whose DaemonSet is gone may only be deleted with --force.
        let owner = match pod.metadata.controller_ref() {
            Some(owner) if owner.kind == "DaemonSet" => owner,
            _ => return PodDeleteStatus::Okay,
        };
        if pod.is_terminated() {
            return PodDeleteStatus::Okay;
        }
        if let Err(e) = self.daemon_sets.get_daemon_set(&pod.metadata.namespace, &owner.name) {
            if e.is_not_found() && self.force {
                return PodDeleteStatus::Warning {
                    delete: true,
                    message: e.to_string(),
                };
            }
            return PodDeleteStatus::Error(e.to_string());
        }
        if !self.ignore_daemonsets {
            return PodDeleteStatus::Error(DAEMONSET_FATAL.to_string());
        }
        PodDeleteStatus::Warning {
            delete: false,
            message: DAEMONSET_WARNING.to_string(),
        }
    }

    fn mirror_pod_filter(&self, pod: &Pod) -> PodDeleteStatus {
        if pod.metadata.annotations.contains_key(MIRROR_POD_ANNOTATION_KEY) {
            return PodDeleteStatus::Warning {
                delete: false,
                message: MIRROR_WARNING.to_string(),
            };
        }
        PodDeleteStatus::Okay
    }

    fn local_storage_filter(&self, pod: &Pod) -> PodDeleteStatus {
        if !has_local_storage(pod) || pod.is_terminated() {
            return PodDeleteStatus::Okay;
        }
        if !self.delete_local_data {
            return PodDeleteStatus::Error(LOCAL_STORAGE_FATAL.to_string());
        }
        PodDeleteStatus::Warning {
            delete: true,
            message: LOCAL_STORAGE_WARNING.to_string(),
        }
    }

    fn unreplicated_filter(&self, pod: &Pod) -> PodDeleteStatus {
        if pod.is_terminated() || pod.metadata.controller_ref().is_some() {
            return PodDeleteStatus::Okay;
        }
        if self.force {
            return PodDeleteStatus::Warning {
                delete: true,
                message: UNMANAGED_WARNING.to_string(),
            };
        }
        PodDeleteStatus::Error(UNMANAGED_FATAL.to_string())
    }

    /// Returns the pods to delete. Warnings are appended to `out`; any pod
    /// that blocks the drain turns the whole call into an error.
    pub fn get_pods_for_deletion(&self, node_name: &str, out: &mut Vec<String>) -> KubectlResult<Vec<Pod>> {
        let selector = parse_selector(&self.pod_selector)?;
        let pods = self.pods.list_pods_on_node(node_name)?;

        let mut to_delete = Vec::new();
        let mut warnings: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut fatals: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pod in pods {
            if !selector
                .iter()
                .all(|(k, v)| pod.metadata.labels.get(k) == Some(v))
            {
                continue;
            }
            let mut delete = true;
            for filter in self.filters() {
                let status = filter(self, &pod);
                match &status {
                    PodDeleteStatus::Warning { message, .. } => {
                        warnings.entry(message.clone()).or_default().push(pod.metadata.name.clone());
                    }
                    PodDeleteStatus::Error(message) => {
                        fatals.entry(message.clone()).or_default().push(pod.metadata.key());
                    }
                    PodDeleteStatus::Okay | PodDeleteStatus::Skip => {}
                }
                if !status.delete() {
                    delete = false;
                    break;
                }
            }
            if delete {
                to_delete.push(pod);
            }
        }

        if !fatals.is_empty() {
            let errs = fatals
                .iter()
                .map(|(msg, pods)| KubectlError::invalid(format!("cannot delete {}: {}", msg, pods.join(", "))))
                .collect();
            return Err(KubectlError::aggregate(errs).unwrap_or_else(|| KubectlError::invalid("cannot delete pods")));
        }
        if !warnings.is_empty() {
            let line = format!("WARNING: {}", join_groups(&warnings));
            warn!("{}", line);
            out.push(line);
        }
        Ok(to_delete)
    }

    /// Remove `pods` from the node, by eviction unless disabled, and wait for
    /// them to be gone.
    pub fn delete_or_evict_pods(&self, pods: Vec<Pod>, out: &mut Vec<String>) -> KubectlResult<()> {
        if pods.is_empty() {
            return Ok(());
        }
        if self.disable_eviction {
            self.delete_pods(pods, out)
        } else {
            self.evict_pods(pods, out)
        }
    }

    fn evict_pods(&self, pods: Vec<Pod>, out: &mut Vec<String>) -> KubectlResult<()> {
        let (tx, rx) = mpsc::channel();
        let num_pods = pods.len();
        for pod in pods {
            let tx = tx.clone();
            let client = self.pods.clone();
            let grace_period = self.grace_period;
            let retry_interval = self.eviction_retry_interval;
            let poll_interval = self.poll_interval;
            let timeout = self.timeout;
            thread::spawn(move || {
                let mut lines = Vec::new();
                let result = evict_and_wait(
                    client.as_ref(),
                    pod,
                    grace_period,
                    retry_interval,
                    poll_interval,
                    timeout,
                    &mut lines,
                );
                // The receiver is gone once the drain timed out.
                let _ = tx.send((lines, result));
            });
        }
        drop(tx);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut errors = Vec::new();
        for _ in 0..num_pods {
            let received = match deadline {
                Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((lines, result)) => {
                    out.extend(lines);
                    if let Err(e) = result {
                        errors.push(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(KubectlError::DrainTimeout(self.timeout.unwrap_or_default()));
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        match KubectlError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn delete_pods(&self, pods: Vec<Pod>, out: &mut Vec<String>) -> KubectlResult<()> {
        for pod in &pods {
            match self
                .pods
                .delete_pod(&pod.metadata.namespace, &pod.metadata.name, self.grace_period)
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        let client = self.pods.as_ref();
        let get_pod = |namespace: &str, name: &str| client.get_pod(namespace, name);
        match wait_for_delete(pods, self.poll_interval, self.timeout, false, &get_pod, out) {
            Err(KubectlError::WaitTimeout { .. }) => Err(KubectlError::DrainTimeout(self.timeout.unwrap_or_default())),
            other => other,
        }
    }
}

fn evict_and_wait(
    client: &dyn PodClient,
    pod: Pod,
    grace_period: Option<i64>,
    retry_interval: Duration,
    poll_interval: Duration,
    timeout: Option<Duration>,
    out: &mut Vec<String>,
) -> KubectlResult<()> {
    let name = pod.metadata.name.clone();
    loop {
        match client.evict_pod(&pod.metadata.namespace, &name, grace_period) {
            Ok(()) => break,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.is_too_many_requests() => {
                let line = format!(
                    "error when evicting pod {:?} (will retry after {:?}): {}",
                    name, retry_interval, e
                );
                warn!("{}", line);
                out.push(line);
                thread::sleep(retry_interval);
            }
            Err(e) => {
                return Err(KubectlError::invalid(format!("error when evicting pod {:?}: {}", name, e)));
            }
        }
    }
    let get_pod = |namespace: &str, pod_name: &str| client.get_pod(namespace, pod_name);
    wait_for_delete(vec![pod], poll_interval, timeout, true, &get_pod, out).map_err(|e| match e {
        KubectlError::WaitTimeout { .. } => KubectlError::DrainTimeout(timeout.unwrap_or_default()),
        e => KubectlError::invalid(format!("error when waiting for pod {:?} terminating: {}", name, e)),
    })
}

/// Poll until every pod is gone. A pod counts as gone when it is not found
/// or has been replaced by one with a different UID. Each gone pod adds a
/// "pod/<name> evicted" (or "deleted") line to `out`.
pub fn wait_for_delete(
    pods: Vec<Pod>,
    interval: Duration,
    timeout: Option<Duration>,
    using_eviction: bool,
    get_pod: &dyn Fn(&str, &str) -> ApiResult<Pod>,
    out: &mut Vec<String>,
) -> KubectlResult<()> {
    let verb = if using_eviction { "evicted" } else { "deleted" };
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut pending = pods;
    loop {
        let mut still_present = Vec::new();
        for pod in pending {
            match get_pod(&pod.metadata.namespace, &pod.metadata.name) {
                Err(e) if e.is_not_found() => out.push(format!("pod/{} {}", pod.metadata.name, verb)),
                Ok(p) if p.metadata.uid != pod.metadata.uid => {
                    out.push(format!("pod/{} {}", pod.metadata.name, verb))
                }
                Ok(_) => still_present.push(pod),
                Err(e) => return Err(e.into()),
            }
        }
        if still_present.is_empty() {
            return Ok(());
        }
        pending = still_present;

        if let Some(deadline) = deadline {
            if Instant::now() + interval > deadline {
                let names: BTreeSet<String> = pending.iter().map(|p| p.metadata.key()).collect();
                info!("Timed out waiting for {} pods to be deleted", names.len());
                return Err(KubectlError::WaitTimeout {
                    pending: names.into_iter().collect(),
                });
            }
        }
        thread::sleep(interval);
    }
}
