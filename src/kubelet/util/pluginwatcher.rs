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

//! Plugin registration handlers and a reference handler used to exercise the
//! watcher.

use super::{dial, EndpointError};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Validation(String),

    #[error("failed dialing endpoint ({endpoint}): {source}")]
    Dial { endpoint: String, source: EndpointError },

    #[error("{0}")]
    Event(String),
}

/// PluginHandler is notified as plugin sockets come and go.
pub trait PluginHandler: Send + Sync {
    /// Check a newly discovered plugin before it is registered.
    fn validate_plugin(&self, plugin_name: &str, endpoint: &str, versions: &[String]) -> Result<(), PluginError>;

    fn register_plugin(&self, plugin_name: &str, endpoint: &str) -> Result<(), PluginError>;

    fn deregister_plugin(&self, plugin_name: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExamplePluginEvent {
    Validate = 0,
    Register = 1,
    DeRegister = 2,
    Error = 3,
}

struct EventChan {
    tx: Sender<ExamplePluginEvent>,
    rx: Arc<Mutex<Receiver<ExamplePluginEvent>>>,
}

#[derive(Default)]
struct HandlerState {
    /// Expected plugin names and their supported versions.
    expected: HashMap<String, Vec<String>>,
    event_chans: HashMap<String, EventChan>,
    count: usize,
}

/// ExampleHandler accepts only the plugins it was told to expect and reports
/// every callback on a per-plugin channel.
#[derive(Default)]
pub struct ExampleHandler {
    state: Mutex<HandlerState>,
}

impl ExampleHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `plugin_name` serving `versions`.
    pub fn add_plugin_name(&self, plugin_name: &str, versions: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state
            .expected
            .insert(plugin_name.to_string(), versions.iter().map(|v| v.to_string()).collect());
        state.event_chans.entry(plugin_name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel();
            EventChan {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            }
        });
    }

    /// Returns the number of registered plugins.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().count
    }

    fn send_event(&self, plugin_name: &str, event: ExamplePluginEvent) {
        let state = self.state.lock().unwrap();
        debug!("Sending {:?} for plugin {}", event, plugin_name);
        match state.event_chans.get(plugin_name) {
            Some(chan) => {
                // The receiver lives as long as the handler.
                let _ = chan.tx.send(event);
            }
            None => debug!("No event channel for plugin {}", plugin_name),
        }
    }

    /// Decrement the registered count. Returns the previous count, or None
    /// for a plugin that was never expected.
    pub fn decrease_plugin_count(&self, plugin_name: &str) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.expected.contains_key(plugin_name) {
            return None;
        }
        let old = state.count;
        state.count = old.saturating_sub(1);
        Some(old)
    }

    /// Wait for `events`, in order, on the channel of `plugin_name`.
    pub fn expect_events_on_channel(&self, plugin_name: &str, events: &[ExamplePluginEvent]) -> Result<(), PluginError> {
        // Senders take the state lock, so it is not held while blocking.
        let rx = self
            .state
            .lock()
            .unwrap()
            .event_chans
            .get(plugin_name)
            .map(|chan| chan.rx.clone())
            .ok_or_else(|| PluginError::Event(format!("no event channel for plugin {}", plugin_name)))?;
        let rx = rx.lock().unwrap();
        for expected in events {
            match rx.recv_timeout(EVENT_TIMEOUT) {
                Ok(event) if event == *expected => {}
                Ok(event) => {
                    return Err(PluginError::Event(format!(
                        "Unexpected event {:?}, expected {:?}",
                        event, expected
                    )))
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(PluginError::Event(format!("Timed out waiting for event {:?}", expected)))
                }
            }
        }
        Ok(())
    }
}

impl PluginHandler for ExampleHandler {
    fn validate_plugin(&self, plugin_name: &str, endpoint: &str, versions: &[String]) -> Result<(), PluginError> {
        self.send_event(plugin_name, ExamplePluginEvent::Validate);

        let expected = self.state.lock().unwrap().expected.get(plugin_name).cloned();
        let Some(expected) = expected else {
            return Err(PluginError::Validation(format!("Got unexpected plugin name {}", plugin_name)));
        };
        if versions != expected.as_slice() {
            return Err(PluginError::Validation(format!(
                "versions '{:?}' != '{:?}'",
                versions, expected
            )));
        }
        if endpoint.is_empty() {
            return Err(PluginError::Validation("Expected endpoint to be non-empty".to_string()));
        }
        Ok(())
    }

    fn register_plugin(&self, plugin_name: &str, endpoint: &str) -> Result<(), PluginError> {
        self.send_event(plugin_name, ExamplePluginEvent::Register);

        // The plugin must be serving before it counts as registered.
        dial(endpoint, DIAL_TIMEOUT).map_err(|source| PluginError::Dial {
            endpoint: endpoint.to_string(),
            source,
        })?;
        self.state.lock().unwrap().count += 1;
        Ok(())
    }

    fn deregister_plugin(&self, plugin_name: &str) {
        self.send_event(plugin_name, ExamplePluginEvent::DeRegister);
        self.decrease_plugin_count(plugin_name);
    }
}
