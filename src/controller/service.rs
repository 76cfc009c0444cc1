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

//! Service controller.
//!
//! Keeps a cloud load balancer in line with every `LoadBalancer` service and
//! pushes the set of ready nodes to each of them.

use crate::api::core::{
    LoadBalancerStatus, Node, Service, ServicePort, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING,
};
use crate::client::record::EventRecorder;
use crate::client::{ApiError, ServiceClient};
use crate::cloudprovider::{CloudError, CloudProvider, LoadBalancer};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MIN_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

const CLIENT_RETRY_COUNT: usize = 5;
const CLIENT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const QUEUE_BASE_DELAY: Duration = Duration::from_millis(5);
const QUEUE_MAX_DELAY: Duration = Duration::from_secs(1000);

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),

    #[error("the cloud provider does not support external load balancers")]
    LoadBalancerUnsupported,

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// RetryError is a failed sync and the delay before the next attempt.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RetryError {
    pub source: ServiceError,
    pub retry_delay: Duration,
}

// ============================================================================
// Cache
// ============================================================================

/// CachedService is the last service state applied to the cloud.
#[derive(Debug, Clone, Default)]
pub struct CachedService {
    pub state: Option<Service>,
    last_retry_delay: Duration,
}

impl CachedService {
    /// Double the retry delay, between 5s and 5m.
    pub fn next_retry_delay(&mut self) -> Duration {
        self.last_retry_delay = (self.last_retry_delay * 2).clamp(MIN_RETRY_DELAY, MAX_RETRY_DELAY);
        self.last_retry_delay
    }

    pub fn reset_retry_delay(&mut self) {
        self.last_retry_delay = Duration::ZERO;
    }
}

#[derive(Debug, Default)]
pub struct ServiceCache {
    service_map: Mutex<HashMap<String, CachedService>>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.service_map.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns the applied service state for `key`, if any.
    pub fn get_by_key(&self, key: &str) -> Option<Service> {
        self.service_map
            .lock()
            .unwrap()
            .get(key)
            .and_then(|c| c.state.clone())
    }

    /// Returns the state of every cached entry. Entries without one are None.
    pub fn all_services(&self) -> Vec<Option<Service>> {
        let map = self.service_map.lock().unwrap();
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        keys.into_iter().map(|k| map[k].state.clone()).collect()
    }

    pub fn get(&self, key: &str) -> Option<CachedService> {
        self.service_map.lock().unwrap().get(key).cloned()
    }

    pub fn get_or_create(&self, key: &str) -> CachedService {
        self.service_map
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    pub fn set(&self, key: &str, service: CachedService) {
        self.service_map.lock().unwrap().insert(key.to_string(), service);
    }

    pub fn delete(&self, key: &str) {
        self.service_map.lock().unwrap().remove(key);
    }
}

// ============================================================================
// Work queue
// ============================================================================

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
}

/// WorkQueue is a FIFO of keys. A key is queued at most once, and a key
/// added while it is being processed is requeued when done.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
    }

    /// Pop the next key and mark it processing.
    pub fn get(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let key = state.queue.pop_front()?;
        state.processing.insert(key.clone());
        state.dirty.remove(&key);
        Some(key)
    }

    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requeue `key` and return how long the caller should wait before
    /// processing it, backing off exponentially per failure.
    pub fn add_rate_limited(&self, key: &str) -> Duration {
        let failures = {
            let mut state = self.state.lock().unwrap();
            let n = state.failures.entry(key.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.add(key);
        let exp = 2u32.saturating_pow(failures - 1);
        QUEUE_BASE_DELAY.saturating_mul(exp).min(QUEUE_MAX_DELAY)
    }

    pub fn forget(&self, key: &str) {
        self.state.lock().unwrap().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().unwrap().failures.get(key).copied().unwrap_or(0)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Split "namespace/name". A bare name has an empty namespace.
pub fn split_meta_namespace_key(key: &str) -> ServiceResult<(&str, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] => Ok(("", name)),
        [namespace, name] => Ok((namespace, name)),
        _ => Err(ServiceError::InvalidKey(key.to_string())),
    }
}

/// Returns the cloud load balancer name of a service.
pub fn load_balancer_name(service: &Service) -> String {
    let mut name: String = format!("a{}", service.metadata.uid).replace('-', "");
    name.truncate(32);
    name
}

/// Returns the predicate selecting nodes that can back a load balancer.
pub fn get_node_conditions_predicate() -> impl Fn(&Node) -> bool {
    |node: &Node| {
        if node.spec.unschedulable {
            return false;
        }
        // Only a True Ready condition counts.
        node.is_ready()
    }
}

fn node_names(nodes: &[Node]) -> BTreeSet<&str> {
    nodes.iter().map(|n| n.metadata.name.as_str()).collect()
}

/// Compares two node lists by name.
pub fn node_slices_equal_for_lb(x: &[Node], y: &[Node]) -> bool {
    x.len() == y.len() && node_names(x) == node_names(y)
}

fn ports_equal_for_lb(x: &[ServicePort], y: &[ServicePort]) -> bool {
    x.len() == y.len()
        && x.iter().zip(y).all(|(a, b)| {
            a.name == b.name && a.protocol == b.protocol && a.port == b.port && a.node_port == b.node_port
        })
}

// ============================================================================
// Controller
// ============================================================================

pub struct ServiceController {
    cloud: Arc<dyn CloudProvider>,
    known_hosts: Mutex<Vec<Node>>,
    services_to_update: Mutex<Vec<Service>>,
    client: Arc<dyn ServiceClient>,
    cluster_name: String,
    recorder: Arc<dyn EventRecorder>,
    cache: ServiceCache,
    queue: WorkQueue,
    client_retry_interval: Duration,
}

impl ServiceController {
    /// Fails when the cloud has no load balancer support.
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        client: Arc<dyn ServiceClient>,
        cluster_name: &str,
        recorder: Arc<dyn EventRecorder>,
    ) -> ServiceResult<Self> {
        if cloud.load_balancer().is_none() {
            return Err(ServiceError::LoadBalancerUnsupported);
        }
        Ok(Self {
            cloud,
            known_hosts: Mutex::new(Vec::new()),
            services_to_update: Mutex::new(Vec::new()),
            client,
            cluster_name: cluster_name.to_string(),
            recorder,
            cache: ServiceCache::new(),
            queue: WorkQueue::new(),
            client_retry_interval: CLIENT_RETRY_INTERVAL,
        })
    }

    /// Set the pause between retried status writes.
    pub fn with_client_retry_interval(mut self, interval: Duration) -> Self {
        self.client_retry_interval = interval;
        self
    }

    pub fn cache(&self) -> &ServiceCache {
        &self.cache
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    fn balancer(&self) -> ServiceResult<&dyn LoadBalancer> {
        self.cloud
            .load_balancer()
            .ok_or(ServiceError::LoadBalancerUnsupported)
    }

    pub fn enqueue_service(&self, service: &Service) {
        self.queue.add(&service.metadata.key());
    }

    /// Enqueue an updated service when the change matters to its load
    /// balancer.
    pub fn on_service_update(&self, old: &Service, new: &Service) {
        if self.needs_update(old, new) || needs_cleanup(new) {
            self.enqueue_service(new);
        }
    }

    /// Sync the next queued key. Returns false when the queue is empty.
    pub fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get() else {
            return false;
        };
        match self.sync_service(&key) {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                let delay = self.queue.add_rate_limited(&key);
                error!("Error syncing service {:?}, retrying in {:?}. Error: {}", key, delay, e);
            }
        }
        self.queue.done(&key);
        true
    }

    /// Bring the load balancer of `key` in line with the stored service.
    pub fn sync_service(&self, key: &str) -> ServiceResult<()> {
        let (namespace, name) = split_meta_namespace_key(key)?;
        let result = match self.client.get_service(namespace, name) {
            Err(e) if e.is_not_found() => {
                info!("Service has been deleted {}", key);
                self.process_service_deletion(key)
            }
            Err(e) => {
                warn!("Unable to retrieve service {} from store: {}", key, e);
                return Err(e.into());
            }
            Ok(service) => {
                let mut cached = self.cache.get_or_create(key);
                self.process_service_update(&mut cached, &service, key)
            }
        };
        result.map_err(|e| {
            warn!("Service {} failed, retrying in {:?}", key, e.retry_delay);
            e.source
        })
    }

    /// Apply `service`. On success the cache holds it; on failure a warning
    /// event is recorded and the error carries the retry delay.
    pub fn process_service_update(
        &self,
        cached: &mut CachedService,
        service: &Service,
        key: &str,
    ) -> Result<(), RetryError> {
        if let Some(old) = &cached.state {
            if old.metadata.uid != service.metadata.uid {
                self.process_load_balancer_delete(cached, key)?;
            }
        }

        if let Err(e) = self.create_load_balancer_if_needed(key, service) {
            let (reason, message) = if service.wants_load_balancer() {
                ("CreatingLoadBalancerFailed", "Error creating load balancer")
            } else {
                ("CleanupLoadBalancerFailed", "Error cleaning up load balancer")
            };
            self.recorder.event(
                service,
                EVENT_TYPE_WARNING,
                reason,
                &format!("{} (will retry): {}", message, e),
            );
            return Err(self.retry_later(cached, key, e));
        }

        cached.state = Some(service.clone());
        cached.reset_retry_delay();
        self.cache.set(key, cached.clone());
        Ok(())
    }

    /// Ensure the load balancer, or delete one the service no longer wants,
    /// and persist the resulting status.
    pub fn create_load_balancer_if_needed(&self, key: &str, service: &Service) -> ServiceResult<()> {
        let previous_state = service.status.load_balancer.clone();
        let new_state = if !service.wants_load_balancer() {
            let had_balancer = !previous_state.ingress.is_empty()
                || self
                    .cache
                    .get_by_key(key)
                    .is_some_and(|s| s.wants_load_balancer());
            if had_balancer {
                info!("Deleting existing load balancer for service {} that no longer needs a load balancer.", key);
                self.recorder
                    .event(service, EVENT_TYPE_NORMAL, "DeletingLoadBalancer", "Deleting load balancer");
                self.balancer()?
                    .ensure_load_balancer_deleted(&self.cluster_name, service)?;
                self.recorder
                    .event(service, EVENT_TYPE_NORMAL, "DeletedLoadBalancer", "Deleted load balancer");
            }
            LoadBalancerStatus::default()
        } else {
            info!("Ensuring LB for service {}", key);
            self.recorder
                .event(service, EVENT_TYPE_NORMAL, "EnsuringLoadBalancer", "Ensuring load balancer");
            let status = self.ensure_load_balancer(service)?;
            self.recorder
                .event(service, EVENT_TYPE_NORMAL, "EnsuredLoadBalancer", "Ensured load balancer");
            status
        };

        if new_state == previous_state {
            debug!("Not persisting unchanged LoadBalancerStatus for service {} to registry.", key);
            return Ok(());
        }
        let mut updated = service.clone();
        updated.status.load_balancer = new_state;
        self.persist_update(&updated)
    }

    fn ensure_load_balancer(&self, service: &Service) -> ServiceResult<LoadBalancerStatus> {
        let nodes = self.known_hosts.lock().unwrap().clone();
        if nodes.is_empty() {
            self.recorder.event(
                service,
                EVENT_TYPE_WARNING,
                "UnAvailableLoadBalancer",
                &format!(
                    "There are no available nodes for LoadBalancer service {}",
                    service.metadata.key()
                ),
            );
        }
        Ok(self
            .balancer()?
            .ensure_load_balancer(&self.cluster_name, service, &nodes)?)
    }

    /// Write the service status. A deleted service is not an error; a
    /// conflict is returned immediately; other errors are retried.
    pub fn persist_update(&self, service: &Service) -> ServiceResult<()> {
        let key = service.metadata.key();
        let mut last_err = None;
        for attempt in 0..CLIENT_RETRY_COUNT {
            match self.client.update_service_status(service) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    info!("Not persisting update to service '{}' that no longer exists: {}", key, e);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        "Failed to persist updated LoadBalancerStatus to service '{}' after creating its load balancer: {}",
                        key, e
                    );
                    last_err = Some(e);
                }
            }
            if attempt + 1 < CLIENT_RETRY_COUNT {
                std::thread::sleep(self.client_retry_interval);
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Returns true when the load balancer must be reconciled for the change
    /// from `old` to `new`. Every detected difference is recorded as an event.
    pub fn needs_update(&self, old: &Service, new: &Service) -> bool {
        if !old.wants_load_balancer() && !new.wants_load_balancer() {
            return false;
        }
        let record = |reason: &str, message: String| {
            self.recorder.event(new, EVENT_TYPE_NORMAL, reason, &message);
        };
        if old.wants_load_balancer() != new.wants_load_balancer() {
            record(
                "Type",
                format!("{} -> {}", old.spec.service_type.as_str(), new.spec.service_type.as_str()),
            );
            return true;
        }
        if old.spec.load_balancer_source_ranges != new.spec.load_balancer_source_ranges {
            record(
                "LoadBalancerSourceRanges",
                format!(
                    "{:?} -> {:?}",
                    old.spec.load_balancer_source_ranges, new.spec.load_balancer_source_ranges
                ),
            );
            return true;
        }
        if !ports_equal_for_lb(&old.spec.ports, &new.spec.ports) {
            return true;
        }
        if old.spec.load_balancer_ip != new.spec.load_balancer_ip {
            record(
                "LoadbalancerIP",
                format!("{} -> {}", old.spec.load_balancer_ip, new.spec.load_balancer_ip),
            );
            return true;
        }
        if old.spec.external_ips.len() != new.spec.external_ips.len() {
            record(
                "ExternalIP",
                format!("Count: {} -> {}", old.spec.external_ips.len(), new.spec.external_ips.len()),
            );
            return true;
        }
        for (old_ip, new_ip) in old.spec.external_ips.iter().zip(&new.spec.external_ips) {
            if old_ip != new_ip {
                record("ExternalIP", format!("Added: {}", new_ip));
                return true;
            }
        }
        if old.metadata.uid != new.metadata.uid {
            record("UID", format!("{} -> {}", old.metadata.uid, new.metadata.uid));
            return true;
        }
        if old.spec.external_traffic_policy != new.spec.external_traffic_policy {
            record(
                "ExternalTrafficPolicy",
                format!(
                    "{:?} -> {:?}",
                    old.spec.external_traffic_policy, new.spec.external_traffic_policy
                ),
            );
            return true;
        }
        if old.spec.health_check_node_port != new.spec.health_check_node_port {
            record(
                "HealthCheckNodePort",
                format!(
                    "{} -> {}",
                    old.spec.health_check_node_port, new.spec.health_check_node_port
                ),
            );
            return true;
        }
        false
    }

    /// Handle a service removed from the API server.
    pub fn process_service_deletion(&self, key: &str) -> Result<(), RetryError> {
        let Some(mut cached) = self.cache.get(key) else {
            error!("service {} not in cache even though the watcher thought it was. Ignoring the deletion", key);
            return Ok(());
        };
        self.process_load_balancer_delete(&mut cached, key)
    }

    fn process_load_balancer_delete(&self, cached: &mut CachedService, key: &str) -> Result<(), RetryError> {
        let Some(service) = cached.state.clone() else {
            self.cache.delete(key);
            return Ok(());
        };
        // Only LoadBalancer services own cloud state.
        if !service.wants_load_balancer() {
            self.cache.delete(key);
            return Ok(());
        }

        self.recorder
            .event(&service, EVENT_TYPE_NORMAL, "DeletingLoadBalancer", "Deleting load balancer");
        let result = self
            .balancer()
            .and_then(|lb| Ok(lb.ensure_load_balancer_deleted(&self.cluster_name, &service)?));
        if let Err(e) = result {
            self.recorder.event(
                &service,
                EVENT_TYPE_WARNING,
                "DeletingLoadBalancerFailed",
                &format!("Error deleting load balancer (will retry): {}", e),
            );
            return Err(self.retry_later(cached, key, e));
        }
        self.recorder
            .event(&service, EVENT_TYPE_NORMAL, "DeletedLoadBalancer", "Deleted load balancer");
        self.cache.delete(key);
        cached.reset_retry_delay();
        Ok(())
    }

    /// Grow the retry delay of `cached` and store it so the next failure
    /// backs off further.
    fn retry_later(&self, cached: &mut CachedService, key: &str, source: ServiceError) -> RetryError {
        let retry_delay = cached.next_retry_delay();
        self.cache.set(key, cached.clone());
        RetryError { source, retry_delay }
    }

    /// Push `hosts` to every LoadBalancer service. Returns the services that
    /// failed so they can be retried.
    pub fn update_load_balancer_hosts(&self, services: &[Option<Service>], hosts: &[Node]) -> Vec<Service> {
        let mut services_to_retry = Vec::new();
        for service in services.iter().flatten() {
            if let Err(e) = self.locked_update_load_balancer_hosts(service, hosts) {
                error!("External error while updating load balancer: {}.", e);
                services_to_retry.push(service.clone());
            }
        }
        services_to_retry
    }

    fn locked_update_load_balancer_hosts(&self, service: &Service, hosts: &[Node]) -> ServiceResult<()> {
        if !service.wants_load_balancer() {
            return Ok(());
        }
        let lb = self.balancer()?;
        let err = match lb.update_load_balancer(&self.cluster_name, service, hosts) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        // It's only an error if the load balancer still exists.
        match lb.get_load_balancer(&self.cluster_name, service) {
            Ok(None) => return Ok(()),
            Ok(Some(_)) => {}
            Err(e) => error!("Error checking load balancer of service {}: {}", service.metadata.key(), e),
        }
        let names: Vec<&str> = hosts.iter().map(|n| n.metadata.name.as_str()).collect();
        self.recorder.event(
            service,
            EVENT_TYPE_WARNING,
            "LoadBalancerUpdateFailed",
            &format!("Error updating load balancer with new hosts {:?}: {}", names, err),
        );
        Err(err.into())
    }

    /// Recompute the ready hosts from `nodes`. On a change every cached
    /// service is updated; otherwise only earlier failures are retried.
    pub fn node_syncloop(&self, nodes: &[Node]) {
        let predicate = get_node_conditions_predicate();
        let new_hosts: Vec<Node> = nodes.iter().filter(|n| predicate(*n)).cloned().collect();

        let mut known_hosts = self.known_hosts.lock().unwrap();
        let mut services_to_update = self.services_to_update.lock().unwrap();
        let candidates: Vec<Option<Service>> = if node_slices_equal_for_lb(&new_hosts, &known_hosts) {
            // Just retry the failures.
            services_to_update.drain(..).map(Some).collect()
        } else {
            let names: Vec<&str> = new_hosts.iter().map(|n| n.metadata.name.as_str()).collect();
            info!("Detected change in list of current cluster nodes. New node set: {:?}", names);
            self.cache.all_services()
        };
        let num_services = candidates.iter().flatten().count();
        *services_to_update = self.update_load_balancer_hosts(&candidates, &new_hosts);
        info!(
            "Successfully updated {} out of {} load balancers to direct traffic to the updated set of nodes",
            num_services - services_to_update.len(),
            num_services
        );
        *known_hosts = new_hosts;
    }
}

/// A service that still reports a load balancer but no longer wants one.
fn needs_cleanup(service: &Service) -> bool {
    !service.wants_load_balancer() && !service.status.load_balancer.ingress.is_empty()
}
