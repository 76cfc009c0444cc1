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

//! CNI network plugin.
//!
//! The default network is the first valid config found in the config
//! directory, re-read on every status check. Pods are added to the loopback
//! network first, then to the default network.

use super::bandwidth::extract_pod_bandwidth_resources;
use super::{
    Host, NetworkError, NetworkPlugin, NetworkResult, PodNetworkStatus, DEFAULT_INTERFACE_NAME,
    NET_PLUGIN_EVENT_POD_CIDR_CHANGE, NET_PLUGIN_EVENT_POD_CIDR_CHANGE_DETAIL_CIDR,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, warn};

pub const CNI_PLUGIN_NAME: &str = "cni";

const CONF_EXTENSIONS: [&str; 3] = ["conf", "conflist", "json"];

// ============================================================================
// Configuration
// ============================================================================

/// NetConf holds the fields of a single plugin config the runtime reads.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetConf {
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub capabilities: HashMap<String, bool>,
}

/// NetworkConfig is one plugin config plus its raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub network: NetConf,
    pub raw: Map<String, Value>,
}

impl NetworkConfig {
    fn from_value(value: Value, path: &Path) -> NetworkResult<Self> {
        let network = NetConf::deserialize(&value).map_err(|source| NetworkError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        let Value::Object(raw) = value else {
            return Err(NetworkError::plugin(format!(
                "error parsing configuration from {}: not an object",
                path.display()
            )));
        };
        Ok(Self { network, raw })
    }
}

/// NetworkConfigList is an ordered chain of plugins under one network name.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfigList {
    pub name: String,
    pub cni_version: String,
    pub plugins: Vec<NetworkConfig>,
}

fn read_json(path: &Path) -> NetworkResult<Value> {
    let bytes = fs::read(path).map_err(|source| NetworkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| NetworkError::Config {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a single plugin config.
pub fn conf_from_file(path: &Path) -> NetworkResult<NetworkConfig> {
    NetworkConfig::from_value(read_json(path)?, path)
}

/// Load a plugin chain.
pub fn conf_list_from_file(path: &Path) -> NetworkResult<NetworkConfigList> {
    let value = read_json(path)?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| NetworkError::plugin("error parsing configuration list: no name"))?
        .to_string();
    let cni_version = value
        .get("cniVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let plugins = value
        .get("plugins")
        .and_then(Value::as_array)
        .ok_or_else(|| NetworkError::plugin("error parsing configuration list: no 'plugins' key"))?
        .iter()
        .map(|p| NetworkConfig::from_value(p.clone(), path))
        .collect::<NetworkResult<Vec<_>>>()?;
    Ok(NetworkConfigList {
        name,
        cni_version,
        plugins,
    })
}

/// Wrap a single plugin config into a one-element list.
pub fn conf_list_from_conf(conf: NetworkConfig) -> NetworkConfigList {
    NetworkConfigList {
        name: conf.network.name.clone(),
        cni_version: conf.network.cni_version.clone(),
        plugins: vec![conf],
    }
}

/// Returns the config files in `dir`, sorted. A missing dir has none.
pub fn conf_files(dir: &Path) -> NetworkResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(NetworkError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| CONF_EXTENSIONS.contains(&e))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// CniNetwork is a loaded config list and the CNI runtime that executes it.
pub struct CniNetwork {
    pub name: String,
    pub network_config: NetworkConfigList,
    cni: Arc<dyn Cni>,
}

/// Returns the first valid network in `conf_dir`.
pub fn get_default_cni_network(conf_dir: &Path, cni: Arc<dyn Cni>) -> NetworkResult<CniNetwork> {
    let files = conf_files(conf_dir)?;
    if files.is_empty() {
        return Err(NetworkError::plugin(format!("no networks found in {}", conf_dir.display())));
    }

    for conf_file in files {
        let is_list = conf_file.extension().is_some_and(|e| e == "conflist");
        let conf_list = if is_list {
            match conf_list_from_file(&conf_file) {
                Ok(list) => list,
                Err(e) => {
                    warn!("Error loading CNI config list file {}: {}", conf_file.display(), e);
                    continue;
                }
            }
        } else {
            let conf = match conf_from_file(&conf_file) {
                Ok(conf) => conf,
                Err(e) => {
                    warn!("Error loading CNI config file {}: {}", conf_file.display(), e);
                    continue;
                }
            };
            // Also catches a conflist saved with a .conf extension.
            if conf.network.plugin_type.is_empty() {
                warn!(
                    "Error loading CNI config file {}: no 'type'; perhaps this is a .conflist?",
                    conf_file.display()
                );
                continue;
            }
            conf_list_from_conf(conf)
        };
        if conf_list.plugins.is_empty() {
            warn!("CNI config list {} has no networks, skipping", conf_file.display());
            continue;
        }

        debug!("Using CNI configuration file {}", conf_file.display());
        return Ok(CniNetwork {
            name: conf_list.name.clone(),
            network_config: conf_list,
            cni,
        });
    }
    Err(NetworkError::plugin(format!(
        "no valid networks found in {}",
        conf_dir.display()
    )))
}

fn get_lo_network(cni: Arc<dyn Cni>) -> CniNetwork {
    let mut raw = Map::new();
    raw.insert("cniVersion".to_string(), json!("0.2.0"));
    raw.insert("name".to_string(), json!("cni-loopback"));
    raw.insert("type".to_string(), json!("loopback"));
    let conf = NetworkConfig {
        network: NetConf {
            cni_version: "0.2.0".to_string(),
            name: "cni-loopback".to_string(),
            plugin_type: "loopback".to_string(),
            capabilities: HashMap::new(),
        },
        raw,
    };
    CniNetwork {
        name: "cni-loopback".to_string(),
        network_config: conf_list_from_conf(conf),
        cni,
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// RuntimeConf carries the per-sandbox arguments of an ADD or DEL.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeConf {
    pub container_id: String,
    pub net_ns: String,
    pub if_name: String,
    pub args: Vec<(String, String)>,
    pub capability_args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct CniPortMapping {
    host_port: i32,
    container_port: i32,
    protocol: String,
    #[serde(rename = "hostIP")]
    host_ip: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct CniBandwidthEntry {
    #[serde(skip_serializing_if = "is_zero")]
    ingress_rate: i64,
    #[serde(skip_serializing_if = "is_zero")]
    ingress_burst: i64,
    #[serde(skip_serializing_if = "is_zero")]
    egress_rate: i64,
    #[serde(skip_serializing_if = "is_zero")]
    egress_burst: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// IpConfig is one address assigned by a plugin, in CIDR form.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    pub address: String,
    pub gateway: String,
}

/// CniResult is the interesting part of an ADD result.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct CniResult {
    pub ips: Vec<IpConfig>,
}

/// Cni runs network config lists against a sandbox.
pub trait Cni: Send + Sync {
    fn add_network_list(&self, net: &NetworkConfigList, rt: &RuntimeConf) -> NetworkResult<CniResult>;

    fn del_network_list(&self, net: &NetworkConfigList, rt: &RuntimeConf) -> NetworkResult<()>;
}

/// CniConfig executes plugin binaries found in `path`.
pub struct CniConfig {
    pub path: Vec<PathBuf>,
}

impl CniConfig {
    fn find_plugin(&self, plugin_type: &str) -> NetworkResult<PathBuf> {
        self.path
            .iter()
            .map(|dir| dir.join(plugin_type))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                NetworkError::plugin(format!(
                    "failed to find plugin {:?} in path {:?}",
                    plugin_type, self.path
                ))
            })
    }

    fn build_one_config(
        list: &NetworkConfigList,
        conf: &NetworkConfig,
        prev_result: Option<&Value>,
        rt: &RuntimeConf,
    ) -> Value {
        let mut raw = conf.raw.clone();
        raw.insert("name".to_string(), json!(list.name));
        raw.insert("cniVersion".to_string(), json!(list.cni_version));
        if let Some(prev) = prev_result {
            raw.insert("prevResult".to_string(), prev.clone());
        }
        let runtime_config: Map<String, Value> = rt
            .capability_args
            .iter()
            .filter(|(k, _)| conf.network.capabilities.get(*k).copied().unwrap_or(false))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !runtime_config.is_empty() {
            raw.insert("runtimeConfig".to_string(), Value::Object(runtime_config));
        }
        Value::Object(raw)
    }

    fn exec_plugin(&self, command: &str, conf: &NetworkConfig, stdin: &Value, rt: &RuntimeConf) -> NetworkResult<Vec<u8>> {
        let plugin = self.find_plugin(&conf.network.plugin_type)?;
        let args: Vec<String> = rt.args.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let cni_path = std::env::join_paths(&self.path)
            .map_err(|e| NetworkError::plugin(format!("invalid CNI path: {}", e)))?;
        let io_err = |source| NetworkError::Io {
            path: plugin.clone(),
            source,
        };

        let mut child = Command::new(&plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.net_ns)
            .env("CNI_IFNAME", &rt.if_name)
            .env("CNI_ARGS", args.join(";"))
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_err)?;
        if let Some(mut input) = child.stdin.take() {
            let bytes = serde_json::to_vec(stdin).map_err(|e| NetworkError::plugin(e.to_string()))?;
            input.write_all(&bytes).map_err(io_err)?;
        }
        let output = child.wait_with_output().map_err(io_err)?;
        if !output.status.success() {
            // Plugins report errors as {"code": N, "msg": "..."} on stdout.
            let msg = serde_json::from_slice::<Value>(&output.stdout)
                .ok()
                .and_then(|v| v.get("msg").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).trim().to_string());
            return Err(NetworkError::plugin(msg));
        }
        Ok(output.stdout)
    }
}

impl Cni for CniConfig {
    fn add_network_list(&self, net: &NetworkConfigList, rt: &RuntimeConf) -> NetworkResult<CniResult> {
        let mut prev: Option<(&str, Value)> = None;
        for conf in &net.plugins {
            let stdin = Self::build_one_config(net, conf, prev.as_ref().map(|(_, v)| v), rt);
            let out = self.exec_plugin("ADD", conf, &stdin, rt)?;
            let value = serde_json::from_slice(&out).map_err(|e| {
                NetworkError::plugin(format!("failed to parse result of {}: {}", conf.network.plugin_type, e))
            })?;
            prev = Some((conf.network.plugin_type.as_str(), value));
        }
        match prev {
            Some((plugin_type, value)) => CniResult::deserialize(&value)
                .map_err(|e| NetworkError::plugin(format!("failed to parse result of {}: {}", plugin_type, e))),
            None => Ok(CniResult::default()),
        }
    }

    fn del_network_list(&self, net: &NetworkConfigList, rt: &RuntimeConf) -> NetworkResult<()> {
        for conf in net.plugins.iter().rev() {
            let stdin = Self::build_one_config(net, conf, None, rt);
            self.exec_plugin("DEL", conf, &stdin, rt)?;
        }
        Ok(())
    }
}

/// A call recorded by [`FakeCni`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeCniCall {
    pub command: &'static str,
    pub network: String,
    pub rt: RuntimeConf,
}

/// FakeCni records calls and returns scripted results.
#[derive(Debug, Default)]
pub struct FakeCni {
    calls: Mutex<Vec<FakeCniCall>>,
    add_result: Mutex<CniResult>,
    add_error: Mutex<Option<String>>,
    del_error: Mutex<Option<String>>,
}

impl FakeCni {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_add_result(&self, result: CniResult) {
        *self.add_result.lock().unwrap() = result;
    }

    pub fn set_add_error(&self, msg: &str) {
        *self.add_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn set_del_error(&self, msg: &str) {
        *self.del_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn calls(&self) -> Vec<FakeCniCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Cni for FakeCni {
    fn add_network_list(&self, net: &NetworkConfigList, rt: &RuntimeConf) -> NetworkResult<CniResult> {
        self.calls.lock().unwrap().push(FakeCniCall {
            command: "ADD",
            network: net.name.clone(),
            rt: rt.clone(),
        });
        if let Some(msg) = self.add_error.lock().unwrap().clone() {
            return Err(NetworkError::plugin(msg));
        }
        Ok(self.add_result.lock().unwrap().clone())
    }

    fn del_network_list(&self, net: &NetworkConfigList, rt: &RuntimeConf) -> NetworkResult<()> {
        self.calls.lock().unwrap().push(FakeCniCall {
            command: "DEL",
            network: net.name.clone(),
            rt: rt.clone(),
        });
        match self.del_error.lock().unwrap().clone() {
            Some(msg) => Err(NetworkError::plugin(msg)),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Plugin
// ============================================================================

pub struct CniNetworkPlugin {
    lo_network: Option<CniNetwork>,
    default_network: RwLock<Option<Arc<CniNetwork>>>,
    host: Option<Arc<dyn Host>>,
    conf_dir: PathBuf,
    cni: Arc<dyn Cni>,
    pod_cidr: RwLock<String>,
    results: Mutex<HashMap<String, CniResult>>,
}

/// Build the CNI plugin over the binaries in `bin_dirs`. Empty entries are
/// dropped. The config is synced once, best effort.
pub fn probe_network_plugins(conf_dir: &Path, bin_dirs: &[PathBuf]) -> Vec<Box<dyn NetworkPlugin>> {
    let bin_dirs: Vec<PathBuf> = bin_dirs
        .iter()
        .filter(|d| !d.as_os_str().is_empty())
        .cloned()
        .collect();
    let plugin = CniNetworkPlugin::new(conf_dir, Arc::new(CniConfig { path: bin_dirs }));
    plugin.sync_network_config();
    vec![Box::new(plugin)]
}

fn pod_desc(namespace: &str, name: &str, container_id: &str) -> String {
    format!("{}_{}/{}", namespace, name, container_id)
}

impl CniNetworkPlugin {
    pub fn new(conf_dir: &Path, cni: Arc<dyn Cni>) -> Self {
        Self {
            lo_network: Some(get_lo_network(cni.clone())),
            default_network: RwLock::new(None),
            host: None,
            conf_dir: conf_dir.to_path_buf(),
            cni,
            pod_cidr: RwLock::new(String::new()),
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the runtime host and sync the config.
    pub fn init(&mut self, host: Arc<dyn Host>) -> NetworkResult<()> {
        self.host = Some(host);
        self.sync_network_config();
        Ok(())
    }

    fn sync_network_config(&self) {
        match get_default_cni_network(&self.conf_dir, self.cni.clone()) {
            Ok(network) => *self.default_network.write().unwrap() = Some(Arc::new(network)),
            Err(e) => warn!("Unable to update cni config: {}", e),
        }
    }

    fn get_default_network(&self) -> Option<Arc<CniNetwork>> {
        self.default_network.read().unwrap().clone()
    }

    fn host(&self) -> NetworkResult<&Arc<dyn Host>> {
        self.host
            .as_ref()
            .ok_or_else(|| NetworkError::plugin("cni network plugin is not initialized"))
    }

    fn check_initialized(&self) -> NetworkResult<Arc<CniNetwork>> {
        let Some(network) = self.get_default_network() else {
            return Err(NetworkError::plugin("cni config uninitialized"));
        };
        // The ipRanges capability needs a pod CIDR.
        let wants_ip_ranges = network
            .network_config
            .plugins
            .iter()
            .any(|p| p.network.capabilities.get("ipRanges").copied().unwrap_or(false));
        if wants_ip_ranges && self.pod_cidr.read().unwrap().is_empty() {
            return Err(NetworkError::plugin("no PodCIDR set"));
        }
        Ok(network)
    }

    fn add_to_network(
        &self,
        network: &CniNetwork,
        name: &str,
        namespace: &str,
        container_id: &str,
        net_ns: &str,
        annotations: &HashMap<String, String>,
    ) -> NetworkResult<CniResult> {
        let rt = self
            .build_cni_runtime_conf(name, namespace, container_id, net_ns, annotations)
            .inspect_err(|e| error!("Error adding network when building cni runtime conf: {}", e))?;

        let pdesc = pod_desc(namespace, name, container_id);
        let net_conf = &network.network_config;
        let plugin_type = net_conf
            .plugins
            .first()
            .map(|p| p.network.plugin_type.as_str())
            .unwrap_or_default();
        debug!("Adding {} to network {}/{} netns {:?}", pdesc, plugin_type, net_conf.name, net_ns);
        let res = network.cni.add_network_list(net_conf, &rt).inspect_err(|e| {
            error!("Error adding {} to network {}/{}: {}", pdesc, plugin_type, net_conf.name, e);
        })?;
        debug!("Added {} to network {}: {:?}", pdesc, net_conf.name, res);
        Ok(res)
    }

    fn delete_from_network(
        &self,
        network: &CniNetwork,
        name: &str,
        namespace: &str,
        container_id: &str,
        net_ns: &str,
    ) -> NetworkResult<()> {
        let rt = self
            .build_cni_runtime_conf(name, namespace, container_id, net_ns, &HashMap::new())
            .inspect_err(|e| error!("Error deleting network when building cni runtime conf: {}", e))?;

        let pdesc = pod_desc(namespace, name, container_id);
        let net_conf = &network.network_config;
        let plugin_type = net_conf
            .plugins
            .first()
            .map(|p| p.network.plugin_type.as_str())
            .unwrap_or_default();
        debug!("Deleting {} from network {}/{} netns {:?}", pdesc, plugin_type, net_conf.name, net_ns);
        match network.cni.del_network_list(net_conf, &rt) {
            // The network may be gone after an earlier, partial teardown.
            Err(e) if !e.to_string().contains("no such file or directory") => {
                error!("Error deleting {} from network {}/{}: {}", pdesc, plugin_type, net_conf.name, e);
                Err(e)
            }
            _ => {
                debug!("Deleted {} from network {}/{}", pdesc, plugin_type, net_conf.name);
                Ok(())
            }
        }
    }

    fn build_cni_runtime_conf(
        &self,
        name: &str,
        namespace: &str,
        container_id: &str,
        net_ns: &str,
        annotations: &HashMap<String, String>,
    ) -> NetworkResult<RuntimeConf> {
        let mut rt = RuntimeConf {
            container_id: container_id.to_string(),
            net_ns: net_ns.to_string(),
            if_name: DEFAULT_INTERFACE_NAME.to_string(),
            args: vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("K8S_POD_NAMESPACE".to_string(), namespace.to_string()),
                ("K8S_POD_NAME".to_string(), name.to_string()),
                ("K8S_POD_INFRA_CONTAINER_ID".to_string(), container_id.to_string()),
            ],
            capability_args: Map::new(),
        };

        let port_mappings = self
            .host()?
            .get_pod_port_mappings(container_id)
            .map_err(|e| NetworkError::plugin(format!("could not retrieve port mappings: {}", e)))?;
        let port_mappings: Vec<CniPortMapping> = port_mappings
            .into_iter()
            .filter(|p| p.host_port > 0)
            .map(|p| CniPortMapping {
                host_port: p.host_port,
                container_port: p.container_port,
                protocol: p.protocol.as_str().to_lowercase(),
                host_ip: p.host_ip,
            })
            .collect();
        rt.capability_args
            .insert("portMappings".to_string(), json!(port_mappings));

        let (ingress, egress) = extract_pod_bandwidth_resources(annotations)
            .map_err(|e| NetworkError::plugin(format!("error reading pod bandwidth annotations: {}", e)))?;
        if ingress.is_some() || egress.is_some() {
            let entry = CniBandwidthEntry {
                ingress_rate: ingress.map_or(0, |q| q.value() / 1000),
                egress_rate: egress.map_or(0, |q| q.value() / 1000),
                ..Default::default()
            };
            rt.capability_args.insert("bandwidth".to_string(), json!(entry));
        }

        let pod_cidr = self.pod_cidr.read().unwrap().clone();
        rt.capability_args
            .insert("ipRanges".to_string(), json!([[{ "subnet": pod_cidr }]]));
        Ok(rt)
    }
}

impl NetworkPlugin for CniNetworkPlugin {
    fn name(&self) -> &str {
        CNI_PLUGIN_NAME
    }

    fn event(&self, name: &str, details: &HashMap<String, String>) {
        if name != NET_PLUGIN_EVENT_POD_CIDR_CHANGE {
            return;
        }
        let Some(pod_cidr) = details.get(NET_PLUGIN_EVENT_POD_CIDR_CHANGE_DETAIL_CIDR) else {
            warn!("{} event didn't contain pod CIDR", NET_PLUGIN_EVENT_POD_CIDR_CHANGE);
            return;
        };
        let mut current = self.pod_cidr.write().unwrap();
        if !current.is_empty() {
            warn!("Ignoring subsequent pod CIDR update to {}", pod_cidr);
            return;
        }
        *current = pod_cidr.clone();
    }

    fn status(&self) -> NetworkResult<()> {
        // Pick up config changes.
        self.sync_network_config();
        self.check_initialized().map(|_| ())
    }

    fn set_up_pod(
        &self,
        namespace: &str,
        name: &str,
        container_id: &str,
        annotations: &HashMap<String, String>,
    ) -> NetworkResult<()> {
        let network = self.check_initialized()?;
        let net_ns = self.host()?.get_net_ns(container_id).map_err(|e| {
            NetworkError::plugin(format!("CNI failed to retrieve network namespace path: {}", e))
        })?;

        if let Some(lo) = &self.lo_network {
            self.add_to_network(lo, name, namespace, container_id, &net_ns, annotations)?;
        }
        let result = self.add_to_network(&network, name, namespace, container_id, &net_ns, annotations)?;
        self.results
            .lock()
            .unwrap()
            .insert(container_id.to_string(), result);
        Ok(())
    }

    fn tear_down_pod(&self, namespace: &str, name: &str, container_id: &str) -> NetworkResult<()> {
        let network = self.check_initialized()?;
        // A missing namespace does not block teardown.
        let net_ns = match self.host()?.get_net_ns(container_id) {
            Ok(ns) => ns,
            Err(e) => {
                warn!("CNI failed to retrieve network namespace path: {}", e);
                String::new()
            }
        };
        self.delete_from_network(&network, name, namespace, container_id, &net_ns)?;
        self.results.lock().unwrap().remove(container_id);
        Ok(())
    }

    fn get_pod_network_status(
        &self,
        namespace: &str,
        name: &str,
        container_id: &str,
    ) -> NetworkResult<PodNetworkStatus> {
        let results = self.results.lock().unwrap();
        let ip = results
            .get(container_id)
            .and_then(|r| r.ips.first())
            .map(|ip| ip.address.split('/').next().unwrap_or_default().to_string())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                NetworkError::plugin(format!(
                    "CNI failed to retrieve network status for pod {}",
                    pod_desc(namespace, name, container_id)
                ))
            })?;
        Ok(PodNetworkStatus { ip })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::Protocol;
    use crate::network::bandwidth::INGRESS_BANDWIDTH_ANNOTATION;
    use crate::network::PortMapping;
    use tempfile::TempDir;

    struct FakeHost {
        net_ns_error: bool,
        port_mappings: Vec<PortMapping>,
    }

    impl Host for FakeHost {
        fn get_net_ns(&self, container_id: &str) -> NetworkResult<String> {
            if self.net_ns_error {
                return Err(NetworkError::plugin("sandbox is gone"));
            }
            Ok(format!("/proc/{}/ns/net", container_id))
        }

        fn get_pod_port_mappings(&self, _container_id: &str) -> NetworkResult<Vec<PortMapping>> {
            Ok(self.port_mappings.clone())
        }
    }

    fn write_conf(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    fn new_plugin(dir: &TempDir, host: FakeHost) -> (CniNetworkPlugin, Arc<FakeCni>) {
        let cni = Arc::new(FakeCni::new());
        let mut plugin = CniNetworkPlugin::new(dir.path(), cni.clone());
        plugin.init(Arc::new(host)).unwrap();
        (plugin, cni)
    }

    fn default_host() -> FakeHost {
        FakeHost {
            net_ns_error: false,
            port_mappings: vec![],
        }
    }

    #[test]
    fn test_get_default_cni_network() {
        struct TestCase {
            name: &'static str,
            files: Vec<(&'static str, &'static str)>,
            expected_network: Option<&'static str>,
            expected_err: Option<&'static str>,
        }
        let test_cases = vec![
            TestCase {
                name: "no files",
                files: vec![],
                expected_network: None,
                expected_err: Some("no networks found in"),
            },
            TestCase {
                name: "single conf",
                files: vec![("10-bridge.conf", r#"{"cniVersion": "0.3.1", "name": "bridge-net", "type": "bridge"}"#)],
                expected_network: Some("bridge-net"),
                expected_err: None,
            },
            TestCase {
                name: "sorted first wins",
                files: vec![
                    ("20-b.conflist", r#"{"name": "second", "plugins": [{"type": "ptp"}]}"#),
                    ("10-a.conflist", r#"{"name": "first", "plugins": [{"type": "bridge"}]}"#),
                ],
                expected_network: Some("first"),
                expected_err: None,
            },
            TestCase {
                name: "conf without type is skipped",
                files: vec![
                    ("10-a.conf", r#"{"name": "no-type", "plugins": [{"type": "bridge"}]}"#),
                    ("20-b.json", r#"{"name": "typed", "type": "bridge"}"#),
                ],
                expected_network: Some("typed"),
                expected_err: None,
            },
            TestCase {
                name: "invalid and empty lists skipped",
                files: vec![
                    ("10-a.conflist", "not json"),
                    ("20-b.conflist", r#"{"name": "empty", "plugins": []}"#),
                    ("README.md", "ignored"),
                ],
                expected_network: None,
                expected_err: Some("no valid networks found in"),
            },
        ];
        for tc in test_cases {
            let dir = tempfile::tempdir().unwrap();
            for (name, content) in &tc.files {
                write_conf(&dir, name, content);
            }
            let result = get_default_cni_network(dir.path(), Arc::new(FakeCni::new()));
            match (tc.expected_network, tc.expected_err) {
                (Some(network), _) => {
                    let net = result.unwrap_or_else(|e| panic!("{}: unexpected error {}", tc.name, e));
                    assert_eq!(net.name, network, "{}: unexpected network", tc.name);
                }
                (None, Some(msg)) => {
                    let err = result.err().unwrap_or_else(|| panic!("{}: expected error", tc.name));
                    assert!(err.to_string().starts_with(msg), "{}: unexpected error {}", tc.name, err);
                }
                (None, None) => unreachable!(),
            }
        }
    }

    #[test]
    fn test_conf_list_from_conf() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(&dir, "10.conf", r#"{"cniVersion": "0.3.1", "name": "net", "type": "bridge", "bridge": "cni0"}"#);
        let conf = conf_from_file(&dir.path().join("10.conf")).unwrap();
        let list = conf_list_from_conf(conf);
        assert_eq!(list.name, "net");
        assert_eq!(list.cni_version, "0.3.1");
        assert_eq!(list.plugins.len(), 1);
        assert_eq!(list.plugins[0].raw["bridge"], json!("cni0"));
    }

    #[test]
    fn test_status() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, _cni) = new_plugin(&dir, default_host());
        assert_eq!(plugin.name(), "cni");
        assert_eq!(plugin.status().unwrap_err().to_string(), "cni config uninitialized");

        write_conf(
            &dir,
            "10.conflist",
            r#"{"name": "net", "plugins": [{"type": "host-local", "capabilities": {"ipRanges": true}}]}"#,
        );
        assert_eq!(plugin.status().unwrap_err().to_string(), "no PodCIDR set");

        plugin.event(
            NET_PLUGIN_EVENT_POD_CIDR_CHANGE,
            &HashMap::from([(NET_PLUGIN_EVENT_POD_CIDR_CHANGE_DETAIL_CIDR.to_string(), "10.0.0.0/24".to_string())]),
        );
        plugin.status().unwrap();

        // Later changes are ignored.
        plugin.event(
            NET_PLUGIN_EVENT_POD_CIDR_CHANGE,
            &HashMap::from([(NET_PLUGIN_EVENT_POD_CIDR_CHANGE_DETAIL_CIDR.to_string(), "10.1.0.0/24".to_string())]),
        );
        assert_eq!(*plugin.pod_cidr.read().unwrap(), "10.0.0.0/24");
    }

    #[test]
    fn test_set_up_and_tear_down_pod() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(&dir, "10.conf", r#"{"name": "net", "type": "bridge"}"#);
        let host = FakeHost {
            net_ns_error: false,
            port_mappings: vec![
                PortMapping {
                    protocol: Protocol::Udp,
                    container_port: 53,
                    host_port: 5353,
                    host_ip: "0.0.0.0".to_string(),
                },
                PortMapping {
                    protocol: Protocol::Tcp,
                    container_port: 80,
                    host_port: 0,
                    host_ip: String::new(),
                },
            ],
        };
        let (plugin, cni) = new_plugin(&dir, host);
        cni.set_add_result(CniResult {
            ips: vec![IpConfig {
                address: "10.0.0.5/24".to_string(),
                gateway: "10.0.0.1".to_string(),
            }],
        });

        let annotations = HashMap::from([(INGRESS_BANDWIDTH_ANNOTATION.to_string(), "1M".to_string())]);
        plugin.set_up_pod("ns", "pod", "abc", &annotations).unwrap();

        let calls = cni.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].network, "cni-loopback");
        assert_eq!(calls[1].network, "net");
        let rt = &calls[1].rt;
        assert_eq!(rt.if_name, "eth0");
        assert_eq!(rt.net_ns, "/proc/abc/ns/net");
        assert_eq!(rt.args[1], ("K8S_POD_NAMESPACE".to_string(), "ns".to_string()));
        assert_eq!(
            rt.capability_args["portMappings"],
            json!([{"hostPort": 5353, "containerPort": 53, "protocol": "udp", "hostIP": "0.0.0.0"}])
        );
        assert_eq!(rt.capability_args["bandwidth"], json!({"ingressRate": 1000}));
        assert_eq!(rt.capability_args["ipRanges"], json!([[{"subnet": ""}]]));

        assert_eq!(plugin.get_pod_network_status("ns", "pod", "abc").unwrap().ip, "10.0.0.5");

        plugin.tear_down_pod("ns", "pod", "abc").unwrap();
        assert_eq!(cni.calls()[2].command, "DEL");
        assert!(plugin.get_pod_network_status("ns", "pod", "abc").is_err());
    }

    #[test]
    fn test_tear_down_tolerates_missing_network() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(&dir, "10.conf", r#"{"name": "net", "type": "bridge"}"#);
        let (plugin, cni) = new_plugin(
            &dir,
            FakeHost {
                net_ns_error: true,
                port_mappings: vec![],
            },
        );

        cni.set_del_error("failed to open netns: no such file or directory");
        plugin.tear_down_pod("ns", "pod", "abc").unwrap();
        assert_eq!(cni.calls()[0].rt.net_ns, "");

        cni.set_del_error("plugin crashed");
        assert_eq!(plugin.tear_down_pod("ns", "pod", "abc").unwrap_err().to_string(), "plugin crashed");
    }

    #[test]
    fn test_set_up_pod_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, _cni) = new_plugin(
            &dir,
            FakeHost {
                net_ns_error: true,
                port_mappings: vec![],
            },
        );
        let err = plugin.set_up_pod("ns", "pod", "abc", &HashMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "cni config uninitialized");

        write_conf(&dir, "10.conf", r#"{"name": "net", "type": "bridge"}"#);
        plugin.status().unwrap();
        let err = plugin.set_up_pod("ns", "pod", "abc", &HashMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "CNI failed to retrieve network namespace path: sandbox is gone"
        );

        let (plugin, _cni) = new_plugin(&dir, default_host());
        let annotations = HashMap::from([(INGRESS_BANDWIDTH_ANNOTATION.to_string(), "10".to_string())]);
        let err = plugin.set_up_pod("ns", "pod", "abc", &annotations).unwrap_err();
        assert_eq!(
            err.to_string(),
            "error reading pod bandwidth annotations: resource is unreasonably small (< 1kbit)"
        );
    }

    #[test]
    fn test_add_network_list_result() {
        struct TestCase {
            name: &'static str,
            output: &'static str,
            expected_ips: Vec<&'static str>,
            expected_err: Option<&'static str>,
        }
        let test_cases = vec![
            TestCase {
                name: "valid result",
                output: r#"{"cniVersion": "0.3.1", "ips": [{"address": "10.1.0.5/24", "gateway": "10.1.0.1"}]}"#,
                expected_ips: vec!["10.1.0.5/24"],
                expected_err: None,
            },
            TestCase {
                name: "result without ips",
                output: r#"{"cniVersion": "0.3.1"}"#,
                expected_ips: vec![],
                expected_err: None,
            },
            TestCase {
                name: "ips of the wrong type",
                output: r#"{"cniVersion": "0.3.1", "ips": "10.1.0.5/24"}"#,
                expected_ips: vec![],
                expected_err: Some("failed to parse result of fake-bridge: "),
            },
            TestCase {
                name: "not json",
                output: "ok",
                expected_ips: vec![],
                expected_err: Some("failed to parse result of fake-bridge: "),
            },
        ];

        for tc in test_cases {
            use std::os::unix::fs::PermissionsExt;
            let bin_dir = tempfile::tempdir().unwrap();
            let plugin_path = bin_dir.path().join("fake-bridge");
            fs::write(&plugin_path, format!("#!/bin/sh\ncat > /dev/null\necho '{}'\n", tc.output)).unwrap();
            fs::set_permissions(&plugin_path, fs::Permissions::from_mode(0o755)).unwrap();

            let conf_dir = tempfile::tempdir().unwrap();
            write_conf(
                &conf_dir,
                "10.conflist",
                r#"{"name": "net", "cniVersion": "0.3.1", "plugins": [{"type": "fake-bridge"}]}"#,
            );
            let list = conf_list_from_file(&conf_dir.path().join("10.conflist")).unwrap();
            let cni = CniConfig {
                path: vec![bin_dir.path().to_path_buf()],
            };

            match cni.add_network_list(&list, &RuntimeConf::default()) {
                Ok(result) => {
                    assert!(tc.expected_err.is_none(), "{}: expected an error", tc.name);
                    let ips: Vec<&str> = result.ips.iter().map(|ip| ip.address.as_str()).collect();
                    assert_eq!(ips, tc.expected_ips, "{}: unexpected ips", tc.name);
                }
                Err(e) => {
                    let prefix = tc
                        .expected_err
                        .unwrap_or_else(|| panic!("{}: unexpected error {}", tc.name, e));
                    assert!(
                        e.to_string().starts_with(prefix),
                        "{}: unexpected error {}",
                        tc.name,
                        e
                    );
                }
            }
        }
    }

    #[test]
    fn test_build_one_config_runtime_config() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            &dir,
            "10.conflist",
            r#"{"name": "net", "cniVersion": "0.3.1", "plugins": [{"type": "portmap", "capabilities": {"portMappings": true}}]}"#,
        );
        let list = conf_list_from_file(&dir.path().join("10.conflist")).unwrap();
        let mut rt = RuntimeConf::default();
        rt.capability_args.insert("portMappings".to_string(), json!([]));
        rt.capability_args.insert("bandwidth".to_string(), json!({}));

        let conf = CniConfig::build_one_config(&list, &list.plugins[0], Some(&json!({"ips": []})), &rt);
        assert_eq!(conf["name"], json!("net"));
        assert_eq!(conf["cniVersion"], json!("0.3.1"));
        assert_eq!(conf["runtimeConfig"], json!({"portMappings": []}));
        assert_eq!(conf["prevResult"], json!({"ips": []}));
    }
}
