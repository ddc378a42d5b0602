// Copyright 2024 The Trellis Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::net::Ipv4Addr;
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_error::Error;

use crate::http_client::JsonClient;

/// Identifier the runtime assigned to a created workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(pub String);

impl core::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the runtime needs to create one workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    /// Applied verbatim; bindings are recovered from these later.
    pub labels: HashMap<String, String>,
}

/// A workload as the runtime reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub id: WorkloadId,
    pub name: String,
    pub image: String,
    /// Runtime lifecycle state, for example `running`.
    pub state: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Address the runtime observes on the workload's interface, when
    /// it reports one.
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
}

/// Captured output of a command run inside a workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The node-local container runtime as the coordinator sees it. A trait
/// so saga tests can intercept these calls.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + Unpin + 'static {
    /// Create and start a workload.
    async fn create(&self, spec: &WorkloadSpec) -> Result<WorkloadId, Error>;

    /// Remove a workload by name. `force` tears it down even while
    /// running.
    async fn remove(&self, name: &str, force: bool) -> Result<(), Error>;

    /// Run a command inside the workload and wait for it to finish.
    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, Error>;

    /// `None` when the runtime knows no workload by that name.
    async fn inspect(&self, name: &str) -> Result<Option<WorkloadInfo>, Error>;

    /// Workloads carrying the managed label on this host.
    async fn list_managed(&self) -> Result<Vec<WorkloadInfo>, Error>;

    /// Cheap liveness probe of the runtime API.
    async fn ping(&self) -> Result<(), Error>;
}

/// Shipped [`ContainerRuntime`] speaking JSON to the configured runtime
/// endpoint.
#[derive(Clone)]
pub struct HttpRuntimeClient {
    client: JsonClient,
}

impl HttpRuntimeClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: JsonClient::new(endpoint),
        }
    }
}

impl core::fmt::Debug for HttpRuntimeClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpRuntimeClient")
            .field("endpoint", &self.client.endpoint())
            .finish()
    }
}

#[derive(Deserialize)]
struct CreateResponse {
    id: WorkloadId,
}

#[async_trait]
impl ContainerRuntime for HttpRuntimeClient {
    async fn create(&self, spec: &WorkloadSpec) -> Result<WorkloadId, Error> {
        let response: CreateResponse = self.client.post_json("/workloads", spec).await?;
        Ok(response.id)
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), Error> {
        self.client
            .delete_unit(&format!("/workloads/{name}?force={force}"))
            .await
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, Error> {
        #[derive(Serialize)]
        struct ExecRequest<'a> {
            command: &'a [String],
        }
        self.client
            .post_json(&format!("/workloads/{name}/exec"), &ExecRequest { command })
            .await
    }

    async fn inspect(&self, name: &str) -> Result<Option<WorkloadInfo>, Error> {
        self.client.get_json_opt(&format!("/workloads/{name}")).await
    }

    async fn list_managed(&self) -> Result<Vec<WorkloadInfo>, Error> {
        self.client.get_json("/workloads?managed=true").await
    }

    async fn ping(&self) -> Result<(), Error> {
        self.client.get_unit("/ping").await
    }
}
