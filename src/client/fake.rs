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

//! In-memory clientset for tests.

use super::{
    ApiError, ApiResult, DaemonSetClient, LogsClient, NodeClient, PodClient, PodLogOptions, SecretClient,
    ServiceClient,
};
use crate::api::core::{DaemonSet, Node, Pod, Secret, Service};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::sync::{Mutex, RwLock};

/// Action is a single request made against the [`FakeClientset`].
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub verb: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl Action {
    fn new(verb: &str, resource: &str, namespace: &str, name: &str) -> Self {
        Self {
            verb: verb.to_string(),
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Returns "verb resource", e.g. "delete pods".
    pub fn short(&self) -> String {
        format!("{} {}", self.verb, self.resource)
    }
}

/// FakeClientset keeps API objects in memory, records every request, and
/// returns queued errors for a (verb, resource) pair before touching state.
#[derive(Default)]
pub struct FakeClientset {
    nodes: RwLock<BTreeMap<String, Node>>,
    pods: RwLock<BTreeMap<String, Pod>>,
    services: RwLock<BTreeMap<String, Service>>,
    secrets: RwLock<BTreeMap<String, Secret>>,
    daemon_sets: RwLock<BTreeMap<String, DaemonSet>>,
    logs: RwLock<HashMap<String, String>>,
    actions: Mutex<Vec<Action>>,
    errors: Mutex<HashMap<(String, String), VecDeque<ApiError>>>,
    // Evicted pods stay until deleted explicitly.
    keep_evicted_pods: bool,
}

fn key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

impl FakeClientset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evictions are accepted but do not remove the pod.
    pub fn keep_evicted_pods(mut self) -> Self {
        self.keep_evicted_pods = true;
        self
    }

    pub fn add_node(&self, node: Node) {
        self.nodes
            .write()
            .unwrap()
            .insert(node.metadata.name.clone(), node);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods
            .write()
            .unwrap()
            .insert(pod.metadata.key(), pod);
    }

    pub fn add_service(&self, service: Service) {
        self.services
            .write()
            .unwrap()
            .insert(service.metadata.key(), service);
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.services.write().unwrap().remove(&key(namespace, name));
    }

    pub fn add_secret(&self, secret: Secret) {
        self.secrets
            .write()
            .unwrap()
            .insert(secret.metadata.key(), secret);
    }

    pub fn add_daemon_set(&self, daemon_set: DaemonSet) {
        self.daemon_sets
            .write()
            .unwrap()
            .insert(daemon_set.metadata.key(), daemon_set);
    }

    /// Set the log content served for a pod container.
    pub fn set_logs(&self, namespace: &str, pod: &str, container: &str, content: &str) {
        self.logs
            .write()
            .unwrap()
            .insert(format!("{}/{}", key(namespace, pod), container), content.to_string());
    }

    /// Queue an error returned by the next `verb` on `resource`.
    pub fn push_error(&self, verb: &str, resource: &str, err: ApiError) {
        self.errors
            .lock()
            .unwrap()
            .entry((verb.to_string(), resource.to_string()))
            .or_default()
            .push_back(err);
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    /// Returns the actions as "verb resource" strings.
    pub fn action_names(&self) -> Vec<String> {
        self.actions.lock().unwrap().iter().map(Action::short).collect()
    }

    pub fn clear_actions(&self) {
        self.actions.lock().unwrap().clear();
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.read().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.services.read().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets.read().unwrap().get(&key(namespace, name)).cloned()
    }

    fn invoke(&self, verb: &str, resource: &str, namespace: &str, name: &str) -> ApiResult<()> {
        self.actions
            .lock()
            .unwrap()
            .push(Action::new(verb, resource, namespace, name));
        let mut errors = self.errors.lock().unwrap();
        match errors
            .get_mut(&(verb.to_string(), resource.to_string()))
            .and_then(|queue| queue.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl NodeClient for FakeClientset {
    fn get_node(&self, name: &str) -> ApiResult<Node> {
        self.invoke("get", "nodes", "", name)?;
        self.node(name).ok_or_else(|| ApiError::not_found("nodes", name))
    }

    fn list_nodes(&self) -> ApiResult<Vec<Node>> {
        self.invoke("list", "nodes", "", "")?;
        Ok(self.nodes.read().unwrap().values().cloned().collect())
    }

    fn patch_node_unschedulable(&self, name: &str, unschedulable: bool) -> ApiResult<Node> {
        self.invoke("patch", "nodes", "", name)?;
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| ApiError::not_found("nodes", name))?;
        node.spec.unschedulable = unschedulable;
        Ok(node.clone())
    }
}

impl PodClient for FakeClientset {
    fn get_pod(&self, namespace: &str, name: &str) -> ApiResult<Pod> {
        self.invoke("get", "pods", namespace, name)?;
        self.pod(namespace, name)
            .ok_or_else(|| ApiError::not_found("pods", name))
    }

    fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> ApiResult<Vec<Pod>> {
        self.invoke("list", "pods", namespace, "")?;
        Ok(self
            .pods
            .read()
            .unwrap()
            .values()
            .filter(|p| namespace.is_empty() || p.metadata.namespace == namespace)
            .filter(|p| {
                selector
                    .iter()
                    .all(|(k, v)| p.metadata.labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    fn list_pods_on_node(&self, node_name: &str) -> ApiResult<Vec<Pod>> {
        self.invoke("list", "pods", "", "")?;
        Ok(self
            .pods
            .read()
            .unwrap()
            .values()
            .filter(|p| p.spec.node_name == node_name)
            .cloned()
            .collect())
    }

    fn delete_pod(&self, namespace: &str, name: &str, _grace_period_seconds: Option<i64>) -> ApiResult<()> {
        self.invoke("delete", "pods", namespace, name)?;
        self.pods
            .write()
            .unwrap()
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found("pods", name))
    }

    fn evict_pod(&self, namespace: &str, name: &str, _grace_period_seconds: Option<i64>) -> ApiResult<()> {
        self.invoke("create", "pods/eviction", namespace, name)?;
        let mut pods = self.pods.write().unwrap();
        if !pods.contains_key(&key(namespace, name)) {
            return Err(ApiError::not_found("pods", name));
        }
        if !self.keep_evicted_pods {
            pods.remove(&key(namespace, name));
        }
        Ok(())
    }
}

impl ServiceClient for FakeClientset {
    fn get_service(&self, namespace: &str, name: &str) -> ApiResult<Service> {
        self.invoke("get", "services", namespace, name)?;
        self.service(namespace, name)
            .ok_or_else(|| ApiError::not_found("services", name))
    }

    fn list_services(&self) -> ApiResult<Vec<Service>> {
        self.invoke("list", "services", "", "")?;
        Ok(self.services.read().unwrap().values().cloned().collect())
    }

    fn update_service_status(&self, service: &Service) -> ApiResult<Service> {
        let meta = &service.metadata;
        self.invoke("update", "services/status", &meta.namespace, &meta.name)?;
        let mut services = self.services.write().unwrap();
        let stored = services
            .get_mut(&meta.key())
            .ok_or_else(|| ApiError::not_found("services", &meta.name))?;
        stored.status = service.status.clone();
        Ok(stored.clone())
    }
}

impl SecretClient for FakeClientset {
    fn get_secret(&self, namespace: &str, name: &str) -> ApiResult<Secret> {
        self.invoke("get", "secrets", namespace, name)?;
        self.secret(namespace, name)
            .ok_or_else(|| ApiError::not_found("secrets", name))
    }

    fn create_secret(&self, secret: &Secret) -> ApiResult<Secret> {
        let meta = &secret.metadata;
        self.invoke("create", "secrets", &meta.namespace, &meta.name)?;
        let mut secrets = self.secrets.write().unwrap();
        if secrets.contains_key(&meta.key()) {
            return Err(ApiError::conflict(format!(
                "secrets \"{}\" already exists",
                meta.name
            )));
        }
        secrets.insert(meta.key(), secret.clone());
        Ok(secret.clone())
    }

    fn delete_secret(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.invoke("delete", "secrets", namespace, name)?;
        self.secrets
            .write()
            .unwrap()
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found("secrets", name))
    }
}

impl DaemonSetClient for FakeClientset {
    fn get_daemon_set(&self, namespace: &str, name: &str) -> ApiResult<DaemonSet> {
        self.invoke("get", "daemonsets", namespace, name)?;
        self.daemon_sets
            .read()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ApiError::not_found("daemonsets", name))
    }
}

impl LogsClient for FakeClientset {
    fn stream_logs(&self, namespace: &str, pod: &str, options: &PodLogOptions) -> ApiResult<Box<dyn Read + Send>> {
        self.invoke("get", "pods/log", namespace, pod)?;
        let logs = self.logs.read().unwrap();
        let content = logs
            .get(&format!("{}/{}", key(namespace, pod), options.container))
            .cloned()
            .ok_or_else(|| ApiError::not_found("pods", pod))?;
        let content = match options.tail_lines {
            Some(n) if n >= 0 => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(n as usize);
                lines[start..].iter().map(|l| format!("{}\n", l)).collect()
            }
            _ => content,
        };
        Ok(Box::new(Cursor::new(content.into_bytes())))
    }
}
