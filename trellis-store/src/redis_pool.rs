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
use core::time::Duration;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::{
    ClientLike, HashesInterface, KeysInterface, LuaInterface, SetsInterface,
};
use fred::prelude::Builder;
use fred::types::config::{
    Config as RedisConfig, ConnectionConfig, PerformanceConfig, ReconnectPolicy,
};
use futures::Future;
use futures::stream::unfold;
use tokio::time::sleep;
use trellis_config::pools::{RedisMode, RedisPoolSpec, Retry};
use trellis_error::{Code, Error, ResultExt, make_err, make_input_err};
use trellis_util::health_utils::{HealthRegistryBuilder, HealthStatus, HealthStatusIndicator};
use trellis_util::retry::{Retrier, RetryResult};

use crate::address_range::AddressRange;
use crate::pool_store::{Binding, PoolCounts, PoolStore, UNKNOWN_HOST};

/// The default command timeout when not specified.
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// The default connection timeout when not specified.
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3_000;

/// The default connection pool size when not specified.
const DEFAULT_CONNECTION_POOL_SIZE: usize = 3;

/// Addresses are seeded into the available set in batches of this size.
const SEED_CHUNK_SIZE: usize = 1000;

/// Set of addresses currently free.
const AVAILABLE_SUFFIX: &str = "available";

/// Hash of name -> address for live bindings.
const NAME_TO_ADDRESS_SUFFIX: &str = "name_to_address";

/// Hash of address -> name, the exact mirror of `name_to_address`.
const ADDRESS_TO_NAME_SUFFIX: &str = "address_to_name";

/// Hash of name -> host that provisioned the workload.
const NAME_TO_HOST_SUFFIX: &str = "name_to_host";

/// Marker key recording that the pool was seeded.
const POOL_READY_SUFFIX: &str = "pool_ready";

/// Key recording the seeded pool size.
const POOL_TOTAL_SUFFIX: &str = "pool_total";

/// Records `name -> address` on all three hashes, or touches nothing
/// if the name is already bound. KEYS are the `name_to_address`,
/// `address_to_name` and `name_to_host` hashes, ARGV is
/// `[name, address, host]`. Returns 1 if the binding was recorded.
pub const BIND_SCRIPT: &str = "
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
return 1
";

/// Adds each address to the available set unless some binding already
/// holds it. KEYS are the `available` set and the `address_to_name`
/// hash, ARGV is one batch of addresses. Returns the number newly
/// added, so a seeding interrupted mid-way resumes without touching
/// anything handed out since.
pub const SEED_SCRIPT: &str = "
local added = 0
for i = 1, #ARGV do
  if redis.call('HEXISTS', KEYS[2], ARGV[i]) == 0 then
    added = added + redis.call('SADD', KEYS[1], ARGV[i])
  end
end
return added
";

/// Erases a binding from all three hashes and returns its address to
/// the available set. KEYS are the `name_to_address`, `address_to_name`
/// and `name_to_host` hashes plus the `available` set, ARGV is
/// `[name]`. Returns the freed address, or nil if the name is unbound.
pub const UNBIND_SCRIPT: &str = "
local address = redis.call('HGET', KEYS[1], ARGV[1])
if not address then
  return false
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], address)
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('SADD', KEYS[4], address)
return address
";

/// A [`PoolStore`] implementation that keeps the address ledger in
/// Redis so that every process in the cluster observes the same
/// allocations.
pub struct RedisPoolStore {
    /// The connection pool to the underlying Redis instance(s).
    client_pool: Pool,

    /// A common prefix to prepend to all keys before they are sent to Redis.
    ///
    /// See [`RedisPoolSpec::key_prefix`](`trellis_config::pools::RedisPoolSpec::key_prefix`).
    key_prefix: String,

    /// Retry configuration for transient command failures.
    retrier: Retrier,
}

impl RedisPoolStore {
    /// Create this object from the pool configuration.
    pub fn new(spec: &RedisPoolSpec) -> Result<Arc<Self>, Error> {
        let [addr] = spec.addresses.as_slice() else {
            return Err(make_input_err!(
                "Expected exactly one address in redis pool configuration"
            ));
        };

        let redis_config = match spec.mode {
            RedisMode::Cluster => RedisConfig::from_url_clustered(addr),
            RedisMode::Sentinel => RedisConfig::from_url_sentinel(addr),
            RedisMode::Standard => RedisConfig::from_url_centralized(addr),
        }
        .err_tip_with_code(|e| {
            (
                Code::InvalidArgument,
                format!("while parsing redis node address: {e}"),
            )
        })?;

        let command_timeout_ms = if spec.command_timeout_ms == 0 {
            DEFAULT_COMMAND_TIMEOUT_MS
        } else {
            spec.command_timeout_ms
        };
        let connection_timeout_ms = if spec.connection_timeout_ms == 0 {
            DEFAULT_CONNECTION_TIMEOUT_MS
        } else {
            spec.connection_timeout_ms
        };
        let connection_pool_size = if spec.connection_pool_size == 0 {
            DEFAULT_CONNECTION_POOL_SIZE
        } else {
            spec.connection_pool_size
        };

        let mut builder = Builder::from_config(redis_config);
        builder
            .set_performance_config(PerformanceConfig {
                default_command_timeout: Duration::from_millis(command_timeout_ms),
                ..Default::default()
            })
            .set_connection_config(ConnectionConfig {
                connection_timeout: Duration::from_millis(connection_timeout_ms),
                internal_command_timeout: Duration::from_millis(connection_timeout_ms),
                ..Default::default()
            })
            // Retry forever with a second between attempts.
            .set_policy(ReconnectPolicy::new_constant(0, 1000));

        let client_pool = builder
            .build_pool(connection_pool_size)
            .err_tip(|| "while creating redis connection pool")?;

        Ok(Self::new_from_pool(
            client_pool,
            spec.key_prefix.clone(),
            spec.retry.clone(),
        ))
    }

    /// Used for testing when determinism is required.
    pub fn new_from_pool(client_pool: Pool, key_prefix: String, retry: Retry) -> Arc<Self> {
        // Fires off a background task using `tokio::spawn`.
        let _ = client_pool.connect();
        let jitter_fn = retry.make_jitter_fn();
        Arc::new(Self {
            client_pool,
            key_prefix,
            retrier: Retrier::new(
                Arc::new(|duration| Box::pin(sleep(duration))),
                jitter_fn,
                retry,
            ),
        })
    }

    fn make_key(&self, suffix: &str) -> String {
        let mut key = String::with_capacity(self.key_prefix.len() + suffix.len());
        key.push_str(&self.key_prefix);
        key.push_str(suffix);
        key
    }

    /// Runs a single command against Redis, retrying transient failures
    /// per the configured retry policy.
    async fn run_with_retry<T, F, Fut>(&self, operation: F, tip: &'static str) -> Result<T, Error>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, fred::error::Error>> + Send,
    {
        let operation = &operation;
        self.retrier
            .retry(unfold((), move |state| async move {
                let result = match operation().await {
                    Ok(value) => RetryResult::Ok(value),
                    Err(e) => RetryResult::Retry(Error::from(e).append(tip)),
                };
                Some((result, state))
            }))
            .await
    }
}

#[async_trait]
impl PoolStore for RedisPoolStore {
    async fn init_pool(&self, range: &AddressRange) -> Result<u64, Error> {
        let ready_key = self.make_key(POOL_READY_SUFFIX);
        let ready = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .get::<Option<String>, _>(ready_key.as_str())
                        .await
                },
                "in RedisPoolStore::init_pool",
            )
            .await?;
        if ready.is_some() {
            // Another process already finished seeding this pool.
            return Ok(0);
        }

        // Seed before setting the marker. A crash mid-seed leaves the
        // marker unset and the next bootstrap resumes here; the script
        // never re-adds an address some binding already owns.
        let seed_keys = vec![
            self.make_key(AVAILABLE_SUFFIX),
            self.make_key(ADDRESS_TO_NAME_SUFFIX),
        ];
        let addresses: Vec<String> = range.iter().map(|address| address.to_string()).collect();
        let total = addresses.len().to_string();
        let mut seeded = 0;
        for chunk in addresses.chunks(SEED_CHUNK_SIZE) {
            seeded += self
                .run_with_retry(
                    || async {
                        self.client_pool
                            .eval::<u64, _, _, _>(SEED_SCRIPT, seed_keys.clone(), chunk.to_vec())
                            .await
                    },
                    "in RedisPoolStore::init_pool",
                )
                .await?;
        }

        let total_key = self.make_key(POOL_TOTAL_SUFFIX);
        self.run_with_retry(
            || async {
                self.client_pool
                    .set::<(), _, _>(total_key.as_str(), total.as_str(), None, None, false)
                    .await
            },
            "in RedisPoolStore::init_pool",
        )
        .await?;
        self.run_with_retry(
            || async {
                self.client_pool
                    .set::<(), _, _>(ready_key.as_str(), "1", None, None, false)
                    .await
            },
            "in RedisPoolStore::init_pool",
        )
        .await?;
        Ok(seeded)
    }

    async fn try_reserve_one(&self) -> Result<Option<Ipv4Addr>, Error> {
        let available_key = self.make_key(AVAILABLE_SUFFIX);
        let popped = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .spop::<Option<String>, _>(available_key.as_str(), None)
                        .await
                },
                "in RedisPoolStore::try_reserve_one",
            )
            .await?;
        popped
            .map(|address| {
                address.parse::<Ipv4Addr>().map_err(|e| {
                    make_err!(Code::DataLoss, "Popped malformed address {address}: {e:?}")
                })
            })
            .transpose()
    }

    async fn bind(&self, name: &str, address: Ipv4Addr, host: &str) -> Result<(), Error> {
        let keys = vec![
            self.make_key(NAME_TO_ADDRESS_SUFFIX),
            self.make_key(ADDRESS_TO_NAME_SUFFIX),
            self.make_key(NAME_TO_HOST_SUFFIX),
        ];
        let argv = vec![name.to_string(), address.to_string(), host.to_string()];
        let recorded = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .eval::<i64, _, _, _>(BIND_SCRIPT, keys.clone(), argv.clone())
                        .await
                },
                "in RedisPoolStore::bind",
            )
            .await?;
        if recorded == 0 {
            return Err(make_err!(
                Code::AlreadyExists,
                "Binding for {name} already exists"
            ));
        }
        Ok(())
    }

    async fn unbind(&self, name: &str) -> Result<Ipv4Addr, Error> {
        let keys = vec![
            self.make_key(NAME_TO_ADDRESS_SUFFIX),
            self.make_key(ADDRESS_TO_NAME_SUFFIX),
            self.make_key(NAME_TO_HOST_SUFFIX),
            self.make_key(AVAILABLE_SUFFIX),
        ];
        let argv = vec![name.to_string()];
        let address = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .eval::<Option<String>, _, _, _>(UNBIND_SCRIPT, keys.clone(), argv.clone())
                        .await
                },
                "in RedisPoolStore::unbind",
            )
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "No binding for {name}"))?;
        address.parse::<Ipv4Addr>().map_err(|e| {
            make_err!(
                Code::DataLoss,
                "Binding for {name} held malformed address {address}: {e:?}"
            )
        })
    }

    async fn unreserve(&self, address: Ipv4Addr) -> Result<(), Error> {
        let available_key = self.make_key(AVAILABLE_SUFFIX);
        let address = address.to_string();
        self.run_with_retry(
            || async {
                self.client_pool
                    .sadd::<(), _, _>(available_key.as_str(), address.as_str())
                    .await
            },
            "in RedisPoolStore::unreserve",
        )
        .await
    }

    async fn lookup(&self, name: &str) -> Result<Option<Binding>, Error> {
        let address_key = self.make_key(NAME_TO_ADDRESS_SUFFIX);
        let Some(address) = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .hget::<Option<String>, _, _>(address_key.as_str(), name)
                        .await
                },
                "in RedisPoolStore::lookup",
            )
            .await?
        else {
            return Ok(None);
        };
        let host_key = self.make_key(NAME_TO_HOST_SUFFIX);
        let host = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .hget::<Option<String>, _, _>(host_key.as_str(), name)
                        .await
                },
                "in RedisPoolStore::lookup",
            )
            .await?
            .unwrap_or_else(|| UNKNOWN_HOST.to_string());
        let address = address.parse::<Ipv4Addr>().map_err(|e| {
            make_err!(
                Code::DataLoss,
                "Binding for {name} held malformed address {address}: {e:?}"
            )
        })?;
        Ok(Some(Binding {
            name: name.to_string(),
            address,
            host,
        }))
    }

    async fn list(&self) -> Result<Vec<Binding>, Error> {
        let address_key = self.make_key(NAME_TO_ADDRESS_SUFFIX);
        let addresses = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .hgetall::<HashMap<String, String>, _>(address_key.as_str())
                        .await
                },
                "in RedisPoolStore::list",
            )
            .await?;
        let host_key = self.make_key(NAME_TO_HOST_SUFFIX);
        let mut hosts = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .hgetall::<HashMap<String, String>, _>(host_key.as_str())
                        .await
                },
                "in RedisPoolStore::list",
            )
            .await?;
        let mut bindings = Vec::with_capacity(addresses.len());
        for (name, address) in addresses {
            let address = address.parse::<Ipv4Addr>().map_err(|e| {
                make_err!(
                    Code::DataLoss,
                    "Binding for {name} held malformed address {address}: {e:?}"
                )
            })?;
            let host = hosts
                .remove(&name)
                .unwrap_or_else(|| UNKNOWN_HOST.to_string());
            bindings.push(Binding {
                name,
                address,
                host,
            });
        }
        bindings.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        Ok(bindings)
    }

    async fn counts(&self) -> Result<PoolCounts, Error> {
        let total_key = self.make_key(POOL_TOTAL_SUFFIX);
        let total = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .get::<Option<u64>, _>(total_key.as_str())
                        .await
                },
                "in RedisPoolStore::counts",
            )
            .await?
            .unwrap_or_default();
        let available_key = self.make_key(AVAILABLE_SUFFIX);
        let available = self
            .run_with_retry(
                || async {
                    self.client_pool
                        .scard::<u64, _>(available_key.as_str())
                        .await
                },
                "in RedisPoolStore::counts",
            )
            .await?;
        let address_key = self.make_key(NAME_TO_ADDRESS_SUFFIX);
        let allocated = self
            .run_with_retry(
                || async { self.client_pool.hlen::<u64, _>(address_key.as_str()).await },
                "in RedisPoolStore::counts",
            )
            .await?;
        Ok(PoolCounts {
            total,
            available,
            allocated,
        })
    }

    fn register_health(self: Arc<Self>, registry: &mut HealthRegistryBuilder) {
        registry.register_indicator(self);
    }
}

#[async_trait]
impl HealthStatusIndicator for RedisPoolStore {
    fn get_name(&self) -> &'static str {
        "RedisPoolStore"
    }

    async fn check_health(&self, namespace: Cow<'static, str>) -> HealthStatus {
        match self.counts().await {
            Ok(counts) => HealthStatus::new_ok(
                self,
                format!(
                    "{} addresses available, {} allocated",
                    counts.available, counts.allocated
                )
                .into(),
            ),
            Err(e) => HealthStatus::new_failed(self, format!("{namespace} - {e:?}").into()),
        }
    }
}
