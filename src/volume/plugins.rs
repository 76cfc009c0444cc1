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

//! Plugin registry for volume plugins.

use super::errors::{VolumeError, VolumeResult};
use super::host::VolumeHost;
use super::{Spec, VolumePlugin};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{error, info};

fn qualified_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$",
        )
        .unwrap()
    })
}

/// Returns true if `name` is a valid qualified name such as "kubernetes.io/aws-ebs".
pub fn is_qualified_name(name: &str) -> bool {
    let simple = name.rsplit('/').next().unwrap_or(name);
    !name.is_empty() && simple.len() <= 63 && qualified_name_regex().is_match(name)
}

/// VolumePluginMgr tracks registered plugins.
#[derive(Default)]
pub struct VolumePluginMgr {
    plugins: RwLock<HashMap<String, Arc<dyn VolumePlugin>>>,
}

impl VolumePluginMgr {
    /// Create a new empty plugin manager.
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Initialize and register the given plugins. Plugins with an invalid or
    /// duplicate name, or whose init fails, are skipped and reported.
    pub fn init_plugins(
        &self,
        plugins: Vec<Box<dyn VolumePlugin>>,
        host: Arc<dyn VolumeHost>,
    ) -> VolumeResult<()> {
        let mut registry = self.plugins.write().unwrap();
        let mut all_errs = Vec::new();

        for mut plugin in plugins {
            let name = plugin.name().to_string();
            if !is_qualified_name(&name) {
                all_errs.push(VolumeError::internal(format!(
                    "volume plugin has invalid name: {:?}",
                    name
                )));
                continue;
            }
            if registry.contains_key(&name) {
                all_errs.push(VolumeError::internal(format!(
                    "volume plugin {:?} was registered more than once",
                    name
                )));
                continue;
            }
            if let Err(e) = plugin.init(host.clone()) {
                error!("Failed to load volume plugin {}, error: {}", name, e);
                all_errs.push(e);
                continue;
            }
            info!("Loaded volume plugin {:?}", name);
            registry.insert(name, Arc::from(plugin));
        }

        match VolumeError::aggregate(all_errs) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Get all registered plugin names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let registry = self.plugins.read().unwrap();
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }

    /// Find the single plugin that supports `spec`.
    pub fn find_plugin_by_spec(&self, spec: &Spec) -> VolumeResult<Arc<dyn VolumePlugin>> {
        let registry = self.plugins.read().unwrap();
        let mut matches: Vec<&Arc<dyn VolumePlugin>> =
            registry.values().filter(|p| p.can_support(spec)).collect();

        match matches.len() {
            0 => Err(VolumeError::internal("no volume plugin matched")),
            1 => Ok(matches[0].clone()),
            _ => {
                matches.sort_by(|a, b| a.name().cmp(b.name()));
                let names: Vec<&str> = matches.iter().map(|p| p.name()).collect();
                Err(VolumeError::internal(format!(
                    "multiple volume plugins matched: {}",
                    names.join(",")
                )))
            }
        }
    }

    /// Find a plugin by its name.
    pub fn find_plugin_by_name(&self, name: &str) -> VolumeResult<Arc<dyn VolumePlugin>> {
        let registry = self.plugins.read().unwrap();
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| VolumeError::internal("no volume plugin matched"))
    }

    /// Find the plugin supporting `spec` if it is attachable.
    pub fn find_attachable_plugin_by_spec(&self, spec: &Spec) -> VolumeResult<Option<Arc<dyn VolumePlugin>>> {
        let plugin = self.find_plugin_by_spec(spec)?;
        Ok(plugin.as_attachable().is_some().then_some(plugin))
    }

    /// Find a provisionable plugin by name.
    pub fn find_provisionable_plugin_by_name(&self, name: &str) -> VolumeResult<Arc<dyn VolumePlugin>> {
        let plugin = self.find_plugin_by_name(name)?;
        if plugin.as_provisionable().is_none() {
            return Err(VolumeError::internal("no provisionable volume plugin matched"));
        }
        Ok(plugin)
    }

    /// Find a deletable plugin supporting `spec`.
    pub fn find_deletable_plugin_by_spec(&self, spec: &Spec) -> VolumeResult<Arc<dyn VolumePlugin>> {
        let plugin = self.find_plugin_by_spec(spec)?;
        if plugin.as_deletable().is_none() {
            return Err(VolumeError::internal("no deletable volume plugin matched"));
        }
        Ok(plugin)
    }

    /// Find an expandable plugin supporting `spec`.
    pub fn find_expandable_plugin_by_spec(&self, spec: &Spec) -> VolumeResult<Option<Arc<dyn VolumePlugin>>> {
        let plugin = self.find_plugin_by_spec(spec)?;
        Ok(plugin.as_expandable().is_some().then_some(plugin))
    }

    /// Collect the attach limits reported by every plugin that has them.
    pub fn volume_limits(&self) -> HashMap<String, i64> {
        let registry = self.plugins.read().unwrap();
        let mut limits = HashMap::new();
        for plugin in registry.values() {
            let Some(limited) = plugin.as_attach_limited() else {
                continue;
            };
            match limited.volume_limits() {
                Ok(l) => limits.extend(l),
                Err(e) => tracing::warn!("Error getting volume limit for plugin {}: {}", plugin.name(), e),
            }
        }
        limits
    }
}

/// Returns every in-tree plugin, ready for [`VolumePluginMgr::init_plugins`].
pub fn probe_volume_plugins(flex_plugin_dir: Option<&std::path::Path>) -> Vec<Box<dyn VolumePlugin>> {
    let mut all: Vec<Box<dyn VolumePlugin>> = Vec::new();
    all.extend(super::awsebs::probe_volume_plugins());
    all.extend(super::gcepd::probe_volume_plugins());
    all.extend(super::azure_dd::probe_volume_plugins());
    all.extend(super::azure_file::probe_volume_plugins());
    all.extend(super::photon_pd::probe_volume_plugins());
    if let Some(dir) = flex_plugin_dir {
        all.extend(super::flexvolume::probe_volume_plugins(dir));
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::core::{Pod, Volume, VolumeSource};
    use crate::volume::host::testing::new_fake_volume_host;
    use crate::volume::{Mounter, Unmounter};
    use std::path::Path;

    struct TestPlugin {
        name: &'static str,
        supports: bool,
        fail_init: bool,
    }

    impl VolumePlugin for TestPlugin {
        fn init(&mut self, _host: Arc<dyn VolumeHost>) -> VolumeResult<()> {
            if self.fail_init {
                return Err(VolumeError::internal("init failed"));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            self.name
        }

        fn volume_name(&self, spec: &Spec) -> VolumeResult<String> {
            Ok(spec.name().to_string())
        }

        fn can_support(&self, _spec: &Spec) -> bool {
            self.supports
        }

        fn supports_mount_option(&self) -> bool {
            false
        }

        fn supports_bulk_volume_verification(&self) -> bool {
            false
        }

        fn new_mounter(&self, _spec: &Spec, _pod: &Pod) -> VolumeResult<Box<dyn Mounter>> {
            Err(VolumeError::internal("unsupported"))
        }

        fn new_unmounter(&self, _name: &str, _uid: &str) -> VolumeResult<Box<dyn Unmounter>> {
            Err(VolumeError::internal("unsupported"))
        }

        fn construct_volume_spec(&self, name: &str, _mount_path: &Path) -> VolumeResult<Spec> {
            Ok(Spec::from_volume(Volume::new(name, VolumeSource::default())))
        }
    }

    fn plugin(name: &'static str, supports: bool) -> Box<dyn VolumePlugin> {
        Box::new(TestPlugin {
            name,
            supports,
            fail_init: false,
        })
    }

    #[test]
    fn test_init_plugins() {
        let (host, _dir) = new_fake_volume_host();
        let mgr = VolumePluginMgr::new();
        let err = mgr
            .init_plugins(
                vec![
                    plugin("kubernetes.io/a", false),
                    plugin("kubernetes.io/a", false),
                    plugin("bad name!", false),
                    Box::new(TestPlugin {
                        name: "kubernetes.io/b",
                        supports: false,
                        fail_init: true,
                    }),
                ],
                host,
            )
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("volume plugin \"kubernetes.io/a\" was registered more than once"));
        assert!(msg.contains("volume plugin has invalid name: \"bad name!\""));
        assert!(msg.contains("init failed"));
        assert_eq!(mgr.registered_names(), vec!["kubernetes.io/a".to_string()]);
    }

    #[test]
    fn test_find_plugin_by_spec() {
        let (host, _dir) = new_fake_volume_host();
        let spec = Spec::from_volume(Volume::new("vol", VolumeSource::default()));

        let mgr = VolumePluginMgr::new();
        mgr.init_plugins(vec![plugin("kubernetes.io/a", false)], host.clone())
            .unwrap();
        assert_eq!(
            mgr.find_plugin_by_spec(&spec).err().unwrap().to_string(),
            "no volume plugin matched"
        );

        let mgr = VolumePluginMgr::new();
        mgr.init_plugins(
            vec![plugin("kubernetes.io/b", true), plugin("kubernetes.io/a", true)],
            host.clone(),
        )
        .unwrap();
        assert_eq!(
            mgr.find_plugin_by_spec(&spec).err().unwrap().to_string(),
            "multiple volume plugins matched: kubernetes.io/a,kubernetes.io/b"
        );

        let mgr = VolumePluginMgr::new();
        mgr.init_plugins(
            vec![plugin("kubernetes.io/a", true), plugin("kubernetes.io/b", false)],
            host,
        )
        .unwrap();
        assert_eq!(mgr.find_plugin_by_spec(&spec).unwrap().name(), "kubernetes.io/a");
        assert!(mgr.find_attachable_plugin_by_spec(&spec).unwrap().is_none());
        assert!(mgr.find_provisionable_plugin_by_name("kubernetes.io/a").is_err());
        assert!(mgr.find_plugin_by_name("kubernetes.io/c").is_err());
    }

    #[test]
    fn test_is_qualified_name() {
        assert!(is_qualified_name("kubernetes.io/aws-ebs"));
        assert!(is_qualified_name("flexvolume-vendor/driver"));
        assert!(is_qualified_name("simple"));
        assert!(!is_qualified_name(""));
        assert!(!is_qualified_name("kubernetes.io/"));
        assert!(!is_qualified_name("Bad.Prefix/name"));
    }
}
