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

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use trellis_agent::coordinator::{
    DeprovisionOutcome, ManagedWorkload, PingReport, ProvisionOutcome, ProvisioningCoordinator,
};
use trellis_config::server::AgentConfig;
use trellis_error::Error;
use trellis_util::health_utils::HealthRegistryBuilder;

use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub name: String,
    /// Image to run. Falls back to the agent's configured default.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PingRequest {
    pub target: String,
}

#[derive(Debug, Serialize)]
pub struct WorkloadsResponse {
    pub host: String,
    pub workloads: Vec<ManagedWorkload>,
    pub count: usize,
}

/// HTTP face of one host's provisioning coordinator.
pub struct AgentServer {
    coordinator: Arc<ProvisioningCoordinator>,
}

impl AgentServer {
    pub fn new(config: &AgentConfig) -> Result<Self, Error> {
        Ok(Self {
            coordinator: ProvisioningCoordinator::from_config(config)?,
        })
    }

    /// Used by tests that want to swap the coordinator's clients out.
    pub const fn new_with_coordinator(coordinator: Arc<ProvisioningCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn register_health(&self, registry: &mut HealthRegistryBuilder) {
        self.coordinator.register_health(registry);
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/provision", post(provision))
            .route("/workloads", get(list_workloads))
            .route("/workloads/{name}", delete(deprovision))
            .route("/workloads/{name}/ping", post(ping_workload))
            .with_state(self.coordinator)
    }
}

impl core::fmt::Debug for AgentServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AgentServer")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

async fn provision(
    State(coordinator): State<Arc<ProvisioningCoordinator>>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<Json<ProvisionOutcome>> {
    let outcome = coordinator
        .provision(&request.name, request.image.as_deref())
        .await?;
    Ok(Json(outcome))
}

async fn deprovision(
    State(coordinator): State<Arc<ProvisioningCoordinator>>,
    Path(name): Path<String>,
) -> ApiResult<Json<DeprovisionOutcome>> {
    Ok(Json(coordinator.deprovision(&name).await?))
}

async fn list_workloads(
    State(coordinator): State<Arc<ProvisioningCoordinator>>,
) -> ApiResult<Json<WorkloadsResponse>> {
    let workloads = coordinator.list_workloads().await?;
    Ok(Json(WorkloadsResponse {
        host: coordinator.host_id().clone(),
        count: workloads.len(),
        workloads,
    }))
}

async fn ping_workload(
    State(coordinator): State<Arc<ProvisioningCoordinator>>,
    Path(name): Path<String>,
    Json(request): Json<PingRequest>,
) -> ApiResult<Json<PingReport>> {
    Ok(Json(
        coordinator.ping_workload(&name, &request.target).await?,
    ))
}
