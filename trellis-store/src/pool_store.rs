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
use serde::{Deserialize, Serialize};
use trellis_error::Error;
use trellis_util::health_utils::{HealthRegistryBuilder, HealthStatusIndicator};

use crate::address_range::AddressRange;

/// Host value reported for bindings whose host record is missing, for
/// example because it was made by an older release.
pub const UNKNOWN_HOST: &str = "unknown";

/// A recorded name to address assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub address: Ipv4Addr,
    pub host: String,
}

/// Live occupancy of a pool. Only ever used for reporting, never for
/// allocation decisions. `total` is the pool size recorded when the
/// pool was seeded; the other two move with every allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub total: u64,
    pub available: u64,
    pub allocated: u64,
}

/// Ledger of address state shared by every allocator in the cluster.
///
/// Implementations must keep two invariants regardless of interleaving:
/// an address is never both free and bound, and the name and address
/// mappings always mirror each other exactly. Every operation below is
/// a single atomic unit against the backing state; none of them span
/// multiple round trips that could observe each other half-done.
#[async_trait]
pub trait PoolStore: HealthStatusIndicator + 'static {
    /// Seed the free list with every address of `range` that is not
    /// reserved. First caller wins; later callers (and restarts) see
    /// the pool as already seeded and leave it untouched. Returns the
    /// number of addresses added, which is zero when the pool was
    /// already seeded.
    async fn init_pool(&self, range: &AddressRange) -> Result<u64, Error>;

    /// Remove one address from the free list and hand it to the caller.
    /// The address is in limbo until the caller either binds it or
    /// returns it with `unreserve`. Returns `None` when the pool is
    /// exhausted, which is not an error at this layer.
    async fn try_reserve_one(&self) -> Result<Option<Ipv4Addr>, Error>;

    /// Record `name` as bound to `address` on `host`. Fails with
    /// `Code::AlreadyExists` if the name is already bound, in which
    /// case no state changes and the caller still holds the address.
    async fn bind(&self, name: &str, address: Ipv4Addr, host: &str) -> Result<(), Error>;

    /// Dissolve the binding for `name` and return its address to the
    /// free list. Fails with `Code::NotFound` if the name is not bound,
    /// leaving the pool unchanged.
    async fn unbind(&self, name: &str) -> Result<Ipv4Addr, Error>;

    /// Return a reserved but never-bound address to the free list.
    /// Callers may only hand back addresses they got from
    /// `try_reserve_one`.
    async fn unreserve(&self, address: Ipv4Addr) -> Result<(), Error>;

    /// Look up the binding for `name`, if any.
    async fn lookup(&self, name: &str) -> Result<Option<Binding>, Error>;

    /// Every binding in the pool, ordered by name.
    async fn list(&self) -> Result<Vec<Binding>, Error>;

    /// Current occupancy. The counters are read separately, so the
    /// numbers can be skewed by in-flight operations. Fine for
    /// reporting, which is all this is for.
    async fn counts(&self) -> Result<PoolCounts, Error>;

    // Register health checks used to monitor the pool.
    fn register_health(self: Arc<Self>, _registry: &mut HealthRegistryBuilder) {}
}
