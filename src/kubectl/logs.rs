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

//! `kubectl logs`: print the logs of one or more pod containers.

use super::{parse_selector, KubectlError, KubectlResult};
use crate::api::core::Pod;
use crate::client::{LogsClient, PodClient, PodLogOptions};
use chrono::{DateTime, Duration, Utc};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info};

const LOGS_USAGE_ERR: &str =
    "expected POD_NAME or TYPE/NAME, usage: logs [-f] [-p] (POD | TYPE/NAME) [-c CONTAINER]";

/// Tail used for selector queries when no tail was requested.
const SELECTOR_TAIL: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct LogsOptions {
    pub namespace: String,
    /// POD or TYPE/NAME.
    pub resource_arg: String,
    pub all_containers: bool,
    pub container: String,
    /// Set by `complete` when `-c` was given.
    pub container_name_specified: bool,
    /// Positional arguments as passed to `complete`.
    pub resources: Vec<String>,

    pub follow: bool,
    pub previous: bool,
    pub timestamps: bool,
    /// RFC3339 timestamp; only logs newer than it are returned.
    pub since_time: String,
    pub since_seconds: Duration,
    pub limit_bytes: i64,
    /// Lines from the end of the log to show; -1 shows everything.
    pub tail: i64,
    pub selector: String,
    /// Upper bound on concurrent streams when following.
    pub max_follow_concurrency: usize,
}

impl Default for LogsOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            resource_arg: String::new(),
            all_containers: false,
            container: String::new(),
            container_name_specified: false,
            resources: Vec::new(),
            follow: false,
            previous: false,
            timestamps: false,
            since_time: String::new(),
            since_seconds: Duration::zero(),
            limit_bytes: 0,
            tail: -1,
            selector: String::new(),
            max_follow_concurrency: 5,
        }
    }
}

/// One container log to fetch.
#[derive(Debug, Clone, PartialEq)]
struct LogRequest {
    namespace: String,
    pod: String,
    options: PodLogOptions,
}

impl LogsOptions {
    pub fn complete(&mut self, args: &[String]) -> KubectlResult<()> {
        self.container_name_specified = !self.container.is_empty();
        self.resources = args.to_vec();

        if !self.selector.is_empty() {
            if !args.is_empty() {
                return Err(KubectlError::usage("only a selector (-l) or a POD name is allowed"));
            }
            return Ok(());
        }
        match args {
            [resource] => self.resource_arg = resource.clone(),
            [resource, container] => {
                self.resource_arg = resource.clone();
                if self.container_name_specified {
                    return Err(KubectlError::usage("only one of -c or an inline [CONTAINER] arg is allowed"));
                }
                self.container = container.clone();
            }
            _ => return Err(KubectlError::usage(LOGS_USAGE_ERR)),
        }
        Ok(())
    }

    pub fn validate(&self) -> KubectlResult<()> {
        if self.follow && !self.selector.is_empty() {
            return Err(KubectlError::invalid("only one of follow (-f) or selector (-l) is allowed"));
        }
        if !self.since_time.is_empty() && !self.since_seconds.is_zero() {
            return Err(KubectlError::invalid(
                "at most one of `sinceTime` or `sinceSeconds` may be specified",
            ));
        }
        if self.all_containers && !self.container.is_empty() {
            return Err(KubectlError::invalid(format!(
                "--all-containers=true should not be specified with container name {}",
                self.container
            )));
        }
        if self.container_name_specified && self.resources.len() == 2 {
            return Err(KubectlError::invalid("only one of -c or an inline [CONTAINER] arg is allowed"));
        }
        if self.limit_bytes < 0 {
            return Err(KubectlError::invalid("--limit-bytes must be greater than 0"));
        }
        if self.since_seconds < Duration::zero() {
            return Err(KubectlError::invalid("--since must be greater than 0"));
        }
        if self.tail < -1 {
            return Err(KubectlError::invalid("--tail must be greater than or equal to -1"));
        }
        self.to_log_options().map(|_| ())
    }

    pub fn to_log_options(&self) -> KubectlResult<PodLogOptions> {
        let mut options = PodLogOptions {
            container: self.container.clone(),
            follow: self.follow,
            previous: self.previous,
            timestamps: self.timestamps,
            ..Default::default()
        };
        if !self.since_time.is_empty() {
            let t = DateTime::parse_from_rfc3339(&self.since_time)
                .map_err(|e| KubectlError::invalid(format!("invalid --since-time {:?}: {}", self.since_time, e)))?;
            options.since_time = Some(t.with_timezone(&Utc));
        }
        if self.limit_bytes != 0 {
            options.limit_bytes = Some(self.limit_bytes);
        }
        if !self.since_seconds.is_zero() {
            // Round up to whole seconds.
            let millis = self.since_seconds.num_milliseconds();
            options.since_seconds = Some((millis + 999).div_euclid(1000));
        }
        if !self.selector.is_empty() && self.tail == -1 {
            options.tail_lines = Some(SELECTOR_TAIL);
        } else if self.tail >= 0 {
            options.tail_lines = Some(self.tail);
        }
        Ok(options)
    }

    /// Write the requested logs to `out`.
    pub fn run_logs<C>(&self, client: &C, out: &mut dyn Write) -> KubectlResult<()>
    where
        C: LogsClient + PodClient + ?Sized,
    {
        self.validate()?;
        let pods = self.resolve_pods(client)?;
        if pods.is_empty() {
            info!("No resources found in {} namespace.", self.namespace);
            return Ok(());
        }

        let base = self.to_log_options()?;
        let mut requests = Vec::new();
        for pod in &pods {
            for container in self.containers_for(pod)? {
                requests.push(LogRequest {
                    namespace: pod.metadata.namespace.clone(),
                    pod: pod.metadata.name.clone(),
                    options: PodLogOptions {
                        container,
                        ..base.clone()
                    },
                });
            }
        }

        if self.follow && requests.len() > 1 {
            if requests.len() > self.max_follow_concurrency {
                return Err(KubectlError::invalid(format!(
                    "you are attempting to follow {} log streams, but maximum allowed concurrency is {}, use --max-log-requests to increase the limit",
                    requests.len(),
                    self.max_follow_concurrency
                )));
            }
            return parallel_consume_requests(client, requests, out);
        }

        for request in requests {
            debug!("Streaming logs of {}/{} container {}", request.namespace, request.pod, request.options.container);
            let stream = client.stream_logs(&request.namespace, &request.pod, &request.options)?;
            consume_request(stream, out)?;
        }
        Ok(())
    }

    fn resolve_pods<C>(&self, client: &C) -> KubectlResult<Vec<Pod>>
    where
        C: PodClient + ?Sized,
    {
        if !self.selector.is_empty() {
            let selector = parse_selector(&self.selector)?;
            let mut pods = client.list_pods(&self.namespace, &selector)?;
            pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
            return Ok(pods);
        }
        let name = match self.resource_arg.split_once('/') {
            None => self.resource_arg.as_str(),
            Some(("po" | "pod" | "pods", name)) => name,
            Some((kind, _)) => {
                return Err(KubectlError::invalid(format!("cannot get the logs from {}", kind)));
            }
        };
        Ok(vec![client.get_pod(&self.namespace, name)?])
    }

    fn containers_for(&self, pod: &Pod) -> KubectlResult<Vec<String>> {
        if self.all_containers {
            return Ok(pod
                .spec
                .init_containers
                .iter()
                .chain(pod.spec.containers.iter())
                .map(|c| c.name.clone())
                .collect());
        }
        if !self.container.is_empty() {
            return Ok(vec![self.container.clone()]);
        }
        match pod.spec.containers.as_slice() {
            [only] => Ok(vec![only.name.clone()]),
            containers => {
                let names: Vec<&str> = containers.iter().map(|c| c.name.as_str()).collect();
                Err(KubectlError::invalid(format!(
                    "a container name must be specified for pod {}, choose one of: [{}]",
                    pod.metadata.name,
                    names.join(" ")
                )))
            }
        }
    }
}

/// Copy a log stream to `out`.
pub fn consume_request(mut stream: Box<dyn Read + Send>, out: &mut dyn Write) -> KubectlResult<u64> {
    let n = io::copy(&mut stream, out)?;
    out.flush()?;
    Ok(n)
}

/// Follow several streams at once. Lines are written whole, in the order
/// they arrive.
fn parallel_consume_requests<C>(client: &C, requests: Vec<LogRequest>, out: &mut dyn Write) -> KubectlResult<()>
where
    C: LogsClient + ?Sized,
{
    let mut streams = Vec::with_capacity(requests.len());
    for request in &requests {
        streams.push(client.stream_logs(&request.namespace, &request.pod, &request.options)?);
    }

    let (tx, rx) = mpsc::channel::<io::Result<Vec<u8>>>();
    thread::scope(|s| -> KubectlResult<()> {
        for stream in streams {
            let tx = tx.clone();
            s.spawn(move || {
                let mut reader = BufReader::new(stream);
                loop {
                    let mut line = Vec::new();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => return,
                        Ok(_) => {
                            if tx.send(Ok(line)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
            });
        }
        drop(tx);

        let mut errors = Vec::new();
        for line in rx {
            match line {
                Ok(line) => out.write_all(&line)?,
                Err(e) => errors.push(KubectlError::from(e)),
            }
        }
        out.flush()?;
        match KubectlError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}
