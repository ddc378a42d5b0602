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

use serde::Serialize;
use tracing::{Level, event};
use trellis_error::{Code, Error, ResultExt, error_if, make_err};
use trellis_store::address_range::AddressRange;
use trellis_store::pool_store::{Binding, PoolStore};

/// Point-in-time view of the pool published by the stats endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolStats {
    pub subnet: String,
    pub total: u64,
    pub allocated: u64,
    pub available: u64,
    /// Allocated share of the seeded pool, as a percentage.
    pub utilization: f64,
}

/// Hands out addresses from a fixed range and remembers who holds what.
///
/// All state lives in the backing [`PoolStore`], so any number of allocator
/// instances may serve the same pool concurrently. The allocator only
/// sequences the store primitives so that the pool and the name bindings
/// never disagree, even when two callers ask for the same name at once.
pub struct AddressAllocator {
    pool: Arc<dyn PoolStore>,
    range: AddressRange,
}

impl AddressAllocator {
    pub fn new(pool: Arc<dyn PoolStore>, range: AddressRange) -> Self {
        Self { pool, range }
    }

    /// Seeds the backing pool from the configured range.
    ///
    /// Only the first caller ever writes anything. Later calls (and calls
    /// from other processes sharing the store) find the pool marked ready
    /// and leave existing allocations untouched.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        let seeded = self
            .pool
            .init_pool(&self.range)
            .await
            .err_tip(|| "while seeding address pool")?;
        if seeded == 0 {
            event!(Level::INFO, "Address pool already seeded, keeping existing allocations");
        } else {
            event!(
                Level::INFO,
                "Seeded address pool with {seeded} addresses from {}",
                self.range.subnet(),
            );
        }
        Ok(())
    }

    /// Allocates an address for `name`, recording `host` as its owner.
    ///
    /// Allocation is idempotent per name. If the name is already bound the
    /// existing binding is returned unchanged, so a client retrying after a
    /// lost response converges on its original address.
    pub async fn allocate(&self, name: &str, host: &str) -> Result<Binding, Error> {
        error_if!(name.is_empty(), "Allocation requires a non-empty name");
        error_if!(host.is_empty(), "Allocation requires a non-empty host");
        if let Some(existing) = self.pool.lookup(name).await? {
            return Ok(existing);
        }
        let Some(address) = self.pool.try_reserve_one().await? else {
            return Err(make_err!(Code::ResourceExhausted, "Address pool exhausted"));
        };
        match self.pool.bind(name, address, host).await {
            Ok(()) => Ok(Binding {
                name: name.to_string(),
                address,
                host: host.to_string(),
            }),
            Err(e) if e.code == Code::AlreadyExists => {
                // Another caller bound this name between our lookup and our
                // bind. Hand the reserved address back and adopt the
                // winner's binding so both callers see the same answer.
                self.pool
                    .unreserve(address)
                    .await
                    .err_tip(|| "while returning address after lost bind race")?;
                self.pool.lookup(name).await?.ok_or_else(|| {
                    make_err!(
                        Code::Aborted,
                        "Binding for {name} vanished while resolving an allocation race"
                    )
                })
            }
            Err(e) => {
                // The reservation must not leak on an unrelated bind
                // failure. If handing it back fails too, both errors are
                // surfaced together.
                match self.pool.unreserve(address).await {
                    Ok(()) => Err(e),
                    Err(unreserve_err) => Err(e.merge(unreserve_err)),
                }
            }
        }
    }

    /// Releases the binding for `name` and returns the freed address to the
    /// pool. Fails with `NotFound` if no such binding exists.
    pub async fn release(&self, name: &str) -> Result<Ipv4Addr, Error> {
        self.pool.unbind(name).await
    }

    /// Looks up the binding for `name`, if any.
    pub async fn lookup(&self, name: &str) -> Result<Option<Binding>, Error> {
        self.pool.lookup(name).await
    }

    /// Returns every live binding, ordered by name.
    pub async fn list(&self) -> Result<Vec<Binding>, Error> {
        self.pool.list().await
    }

    pub async fn stats(&self) -> Result<PoolStats, Error> {
        let counts = self.pool.counts().await?;
        let utilization = if counts.total == 0 {
            0.0
        } else {
            counts.allocated as f64 / counts.total as f64 * 100.0
        };
        Ok(PoolStats {
            subnet: self.range.subnet().to_string(),
            total: counts.total,
            allocated: counts.allocated,
            available: counts.available,
            utilization,
        })
    }
}
