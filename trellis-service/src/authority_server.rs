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
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{Level, event};
use trellis_allocator::address_allocator::{AddressAllocator, PoolStats};
use trellis_config::server::AuthorityConfig;
use trellis_error::{Code, Error, ResultExt, make_err};
use trellis_store::address_range::AddressRange;
use trellis_store::pool_manager::PoolManager;
use trellis_store::pool_store::{Binding, UNKNOWN_HOST};

use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub name: String,
    /// Host claiming the address. Recorded as the binding's owner,
    /// "unknown" when absent.
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub name: String,
    pub freed: Ipv4Addr,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub exists: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BindingsResponse {
    pub bindings: Vec<Binding>,
    pub count: usize,
}

/// HTTP face of the allocation ledger. One instance per configured
/// authority service; agents across the cluster all talk to the same
/// one.
pub struct AuthorityServer {
    allocator: Arc<AddressAllocator>,
}

impl AuthorityServer {
    pub fn new(config: &AuthorityConfig, pool_manager: &PoolManager) -> Result<Self, Error> {
        let pool = pool_manager
            .get_pool(&config.pool)
            .err_tip(|| format!("'{}' not configured in the pools list", config.pool))?;
        let range = AddressRange::new(&config.range)
            .err_tip(|| "while parsing the authority address range")?;
        Ok(Self {
            allocator: Arc::new(AddressAllocator::new(pool, range)),
        })
    }

    /// Seeds the backing pool. Must complete before the router serves
    /// traffic, otherwise early allocations race the seeding pass.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        self.allocator.bootstrap().await
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/allocate", post(allocate))
            .route("/release", post(release))
            .route("/check/{name}", get(check))
            .route("/bindings", get(list_bindings))
            .route("/bindings/{name}", get(get_binding))
            .route("/stats", get(stats))
            .with_state(self.allocator)
    }
}

impl core::fmt::Debug for AuthorityServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthorityServer").finish_non_exhaustive()
    }
}

async fn allocate(
    State(allocator): State<Arc<AddressAllocator>>,
    Json(request): Json<AllocateRequest>,
) -> ApiResult<Json<Binding>> {
    let host = if request.host.is_empty() {
        UNKNOWN_HOST
    } else {
        request.host.as_str()
    };
    let binding = allocator.allocate(&request.name, host).await?;
    event!(
        Level::INFO,
        name = %request.name,
        address = %binding.address,
        host = %binding.host,
        "Allocated address"
    );
    Ok(Json(binding))
}

async fn release(
    State(allocator): State<Arc<AddressAllocator>>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<Json<ReleaseResponse>> {
    let freed = allocator.release(&request.name).await?;
    event!(Level::INFO, name = %request.name, freed = %freed, "Released address");
    Ok(Json(ReleaseResponse {
        name: request.name,
        freed,
    }))
}

async fn check(
    State(allocator): State<Arc<AddressAllocator>>,
    Path(name): Path<String>,
) -> ApiResult<Json<CheckResponse>> {
    let response = match allocator.lookup(&name).await? {
        Some(binding) => CheckResponse {
            exists: true,
            name,
            address: Some(binding.address),
            host: Some(binding.host),
        },
        None => CheckResponse {
            exists: false,
            name,
            address: None,
            host: None,
        },
    };
    Ok(Json(response))
}

async fn list_bindings(
    State(allocator): State<Arc<AddressAllocator>>,
) -> ApiResult<Json<BindingsResponse>> {
    let bindings = allocator.list().await?;
    Ok(Json(BindingsResponse {
        count: bindings.len(),
        bindings,
    }))
}

async fn get_binding(
    State(allocator): State<Arc<AddressAllocator>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Binding>> {
    let binding = allocator
        .lookup(&name)
        .await?
        .ok_or_else(|| make_err!(Code::NotFound, "No binding for {name}"))?;
    Ok(Json(binding))
}

async fn stats(State(allocator): State<Arc<AddressAllocator>>) -> ApiResult<Json<PoolStats>> {
    Ok(Json(allocator.stats().await?))
}
