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

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_error::Error;

use crate::http_client::JsonClient;

/// Identity of the overlay network workloads get attached to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySummary {
    pub name: String,
    pub subnet: String,
}

/// The network substrate as the coordinator sees it.
#[async_trait]
pub trait OverlayNetwork: Send + Sync + Unpin + 'static {
    /// Attach `workload` to the overlay under the given address.
    async fn attach(&self, workload: &str, address: Ipv4Addr) -> Result<(), Error>;

    /// Detach `workload` from the overlay, forcing if needed.
    async fn detach(&self, workload: &str) -> Result<(), Error>;

    /// Which overlay this agent attaches workloads to.
    async fn describe(&self) -> Result<OverlaySummary, Error>;
}

/// Shipped [`OverlayNetwork`] speaking JSON to the configured overlay
/// endpoint.
#[derive(Clone)]
pub struct HttpOverlayClient {
    client: JsonClient,
}

impl HttpOverlayClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: JsonClient::new(endpoint),
        }
    }
}

impl core::fmt::Debug for HttpOverlayClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpOverlayClient")
            .field("endpoint", &self.client.endpoint())
            .finish()
    }
}

#[derive(Serialize)]
struct AttachRequest<'a> {
    workload: &'a str,
    address: Ipv4Addr,
}

#[derive(Serialize)]
struct DetachRequest<'a> {
    workload: &'a str,
    force: bool,
}

#[async_trait]
impl OverlayNetwork for HttpOverlayClient {
    async fn attach(&self, workload: &str, address: Ipv4Addr) -> Result<(), Error> {
        self.client
            .post_unit("/attach", &AttachRequest { workload, address })
            .await
    }

    async fn detach(&self, workload: &str) -> Result<(), Error> {
        self.client
            .post_unit("/detach", &DetachRequest {
                workload,
                force: true,
            })
            .await
    }

    async fn describe(&self) -> Result<OverlaySummary, Error> {
        self.client.get_json("/describe").await
    }
}
