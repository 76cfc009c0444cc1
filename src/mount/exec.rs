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

//! Command execution used by mount helpers and exec-based drivers.

use std::collections::VecDeque;
use std::io;
use std::process::Command;
use std::sync::Mutex;
use thiserror::Error;

/// ExecError is returned when a command cannot be run or exits non-zero.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to run {cmd}: {source}")]
    Spawn { cmd: String, source: io::Error },

    #[error("{cmd} exited with status {status}: {output}")]
    Exit {
        cmd: String,
        status: i32,
        output: String,
    },
}

impl ExecError {
    /// Returns the exit status, if the command ran to completion.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecError::Exit { status, .. } => Some(*status),
            ExecError::Spawn { .. } => None,
        }
    }

    /// Returns the combined command output captured with the failure.
    pub fn output(&self) -> &str {
        match self {
            ExecError::Exit { output, .. } => output,
            ExecError::Spawn { .. } => "",
        }
    }
}

/// Exec runs a command and returns its combined output.
pub trait Exec: Send + Sync {
    fn run(&self, cmd: &str, args: &[String]) -> Result<Vec<u8>, ExecError>;
}

/// CommandExec runs commands on the host through `std::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct CommandExec;

impl CommandExec {
    pub fn new() -> Self {
        Self
    }
}

impl Exec for CommandExec {
    fn run(&self, cmd: &str, args: &[String]) -> Result<Vec<u8>, ExecError> {
        let output = Command::new(cmd)
            .args(args)
            .output()
            .map_err(|source| ExecError::Spawn {
                cmd: cmd.to_string(),
                source,
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if output.status.success() {
            return Ok(combined);
        }
        Err(ExecError::Exit {
            cmd: cmd.to_string(),
            status: output.status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&combined).into_owned(),
        })
    }
}

/// A scripted reply for [`FakeExec`].
#[derive(Debug, Clone)]
pub struct FakeExecResponse {
    /// Command the reply is expected for; checked when non-empty.
    pub cmd: String,
    pub output: String,
    /// Non-zero marks the call as failed.
    pub status: i32,
}

impl FakeExecResponse {
    pub fn ok(cmd: &str, output: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            output: output.to_string(),
            status: 0,
        }
    }

    pub fn fail(cmd: &str, status: i32, output: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            output: output.to_string(),
            status,
        }
    }
}

/// FakeExec replays scripted responses in order and records every call.
/// Calls beyond the script succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeExec {
    responses: Mutex<VecDeque<FakeExecResponse>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeExec {
    pub fn new(responses: Vec<FakeExecResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns the recorded calls as (command, args).
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Exec for FakeExec {
    fn run(&self, cmd: &str, args: &[String]) -> Result<Vec<u8>, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((cmd.to_string(), args.to_vec()));

        let Some(response) = self.responses.lock().unwrap().pop_front() else {
            return Ok(Vec::new());
        };
        if !response.cmd.is_empty() && response.cmd != cmd {
            return Err(ExecError::Exit {
                cmd: cmd.to_string(),
                status: -1,
                output: format!("unexpected command {}, expected {}", cmd, response.cmd),
            });
        }
        if response.status != 0 {
            return Err(ExecError::Exit {
                cmd: cmd.to_string(),
                status: response.status,
                output: response.output,
            });
        }
        Ok(response.output.into_bytes())
    }
}
