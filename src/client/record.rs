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

//! Event recording.

use crate::api::core::{ApiObject, Event, ObjectReference, EVENT_TYPE_WARNING};
use std::sync::Mutex;
use tracing::{info, warn};

/// EventRecorder records events about API objects.
pub trait EventRecorder: Send + Sync {
    fn event(&self, object: &dyn ApiObject, event_type: &str, reason: &str, message: &str);
}

/// Build the reference an event points at.
pub fn object_reference(object: &dyn ApiObject) -> ObjectReference {
    let meta = object.metadata();
    ObjectReference {
        kind: object.kind().to_string(),
        namespace: meta.namespace.clone(),
        name: meta.name.clone(),
        uid: meta.uid.clone(),
    }
}

/// LoggingRecorder writes events to the log.
#[derive(Debug, Default)]
pub struct LoggingRecorder {
    component: String,
}

impl LoggingRecorder {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }
}

impl EventRecorder for LoggingRecorder {
    fn event(&self, object: &dyn ApiObject, event_type: &str, reason: &str, message: &str) {
        let event = Event::new(object_reference(object), event_type, reason, message);
        let target = &event.involved_object;
        if event.event_type == EVENT_TYPE_WARNING {
            warn!(
                component = %self.component,
                kind = %target.kind,
                object = %format!("{}/{}", target.namespace, target.name),
                reason = %event.reason,
                "{}",
                event.message
            );
        } else {
            info!(
                component = %self.component,
                kind = %target.kind,
                object = %format!("{}/{}", target.namespace, target.name),
                reason = %event.reason,
                "{}",
                event.message
            );
        }
    }
}

/// FakeRecorder collects events as "<Type> <Reason> <Message>" strings.
#[derive(Debug, Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<String>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventRecorder for FakeRecorder {
    fn event(&self, _object: &dyn ApiObject, event_type: &str, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} {} {}", event_type, reason, message));
    }
}
