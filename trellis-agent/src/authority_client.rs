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

use async_trait::async_trait;
use futures::Future;
use futures::stream::unfold;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use trellis_config::pools::Retry;
use trellis_error::{Code, Error, make_err};
use trellis_store::pool_store::Binding;
use trellis_util::retry::{Retrier, RetryResult};

use crate::http_client::JsonClient;

/// The cluster-wide address authority as the coordinator sees it.
#[async_trait]
pub trait AddressAuthority: Send + Sync + Unpin + 'static {
    /// `None` when the name is unbound anywhere in the cluster.
    async fn check(&self, name: &str) -> Result<Option<Binding>, Error>;

    /// Claim an address for `name` on `host`. Idempotent per name; a
    /// retry returns the original binding.
    async fn allocate(&self, name: &str, host: &str) -> Result<Binding, Error>;

    /// Dissolve the binding for `name`. Fails `NotFound` when unbound.
    async fn release(&self, name: &str) -> Result<Ipv4Addr, Error>;

    /// Cheap reachability probe of the authority.
    async fn ping(&self) -> Result<(), Error>;
}

/// Shipped [`AddressAuthority`] speaking JSON to the allocator service.
///
/// Retry covers transport failures only. Semantic answers (exhausted,
/// conflict, not found) always surface on the first attempt, and the
/// default config makes no retries at all.
pub struct HttpAuthorityClient {
    client: JsonClient,
    retrier: Retrier,
}

impl HttpAuthorityClient {
    pub fn new(endpoint: &str, retry: Retry) -> Self {
        let jitter_fn = retry.make_jitter_fn();
        Self {
            client: JsonClient::new(endpoint),
            retrier: Retrier::new(
                Arc::new(|duration| Box::pin(sleep(duration))),
                jitter_fn,
                retry,
            ),
        }
    }

    async fn run_with_retry<T, F, Fut>(&self, operation: F, tip: &'static str) -> Result<T, Error>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        let operation = &operation;
        self.retrier
            .retry(unfold((), move |state| async move {
                let result = match operation().await {
                    Ok(value) => RetryResult::Ok(value),
                    Err(e) if matches!(e.code, Code::Unavailable | Code::DeadlineExceeded) => {
                        RetryResult::Retry(e.append(tip))
                    }
                    Err(e) => RetryResult::Err(e.append(tip)),
                };
                Some((result, state))
            }))
            .await
    }
}

impl core::fmt::Debug for HttpAuthorityClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpAuthorityClient")
            .field("endpoint", &self.client.endpoint())
            .finish()
    }
}

#[derive(Deserialize)]
struct CheckResponse {
    exists: bool,
    name: String,
    #[serde(default)]
    address: Option<Ipv4Addr>,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    freed: Ipv4Addr,
}

#[async_trait]
impl AddressAuthority for HttpAuthorityClient {
    async fn check(&self, name: &str) -> Result<Option<Binding>, Error> {
        let path = format!("/check/{name}");
        let response: CheckResponse = self
            .run_with_retry(
                || self.client.get_json(&path),
                "while checking name with authority",
            )
            .await?;
        if !response.exists {
            return Ok(None);
        }
        let (Some(address), Some(host)) = (response.address, response.host) else {
            return Err(make_err!(
                Code::Internal,
                "Authority reported {name} as bound but returned no binding"
            ));
        };
        Ok(Some(Binding {
            name: response.name,
            address,
            host,
        }))
    }

    async fn allocate(&self, name: &str, host: &str) -> Result<Binding, Error> {
        #[derive(Serialize)]
        struct AllocateRequest<'a> {
            name: &'a str,
            host: &'a str,
        }
        let request = AllocateRequest { name, host };
        self.run_with_retry(
            || self.client.post_json("/allocate", &request),
            "while allocating address",
        )
        .await
    }

    async fn release(&self, name: &str) -> Result<Ipv4Addr, Error> {
        #[derive(Serialize)]
        struct ReleaseRequest<'a> {
            name: &'a str,
        }
        let request = ReleaseRequest { name };
        let response: ReleaseResponse = self
            .run_with_retry(
                || self.client.post_json("/release", &request),
                "while releasing address",
            )
            .await?;
        Ok(response.freed)
    }

    async fn ping(&self) -> Result<(), Error> {
        self.run_with_retry(|| self.client.get_unit("/stats"), "while probing authority")
            .await
    }
}
