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
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use trellis_allocator::address_allocator::{AddressAllocator, PoolStats};
use trellis_config::pools::{AddressRangeSpec, MemoryPoolSpec};
use trellis_error::{Code, Error};
use trellis_macro::trellis_test;
use trellis_store::address_range::AddressRange;
use trellis_store::memory_pool::MemoryPoolStore;
use trellis_store::pool_store::{Binding, PoolCounts, PoolStore};
use trellis_util::health_utils::default_health_status_indicator;

fn test_range(start: &str, end: &str) -> Result<AddressRange, Error> {
    AddressRange::new(&AddressRangeSpec {
        subnet: "10.1.0.0/24".to_string(),
        range_start: start.to_string(),
        range_end: end.to_string(),
        reserved: vec![],
    })
}

async fn make_allocator(start: &str, end: &str) -> Result<AddressAllocator, Error> {
    let pool = MemoryPoolStore::new(&MemoryPoolSpec::default());
    let allocator = AddressAllocator::new(pool, test_range(start, end)?);
    allocator.bootstrap().await?;
    Ok(allocator)
}

/// Delegates to a real store but answers `None` for a configurable number
/// of lookups, exposing the window between an allocator's existence check
/// and its bind attempt.
struct RacingPool {
    inner: Arc<MemoryPoolStore>,
    hidden_lookups: AtomicUsize,
}

#[async_trait]
impl PoolStore for RacingPool {
    async fn init_pool(&self, range: &AddressRange) -> Result<u64, Error> {
        self.inner.init_pool(range).await
    }

    async fn try_reserve_one(&self) -> Result<Option<Ipv4Addr>, Error> {
        self.inner.try_reserve_one().await
    }

    async fn bind(&self, name: &str, address: Ipv4Addr, host: &str) -> Result<(), Error> {
        self.inner.bind(name, address, host).await
    }

    async fn unbind(&self, name: &str) -> Result<Ipv4Addr, Error> {
        self.inner.unbind(name).await
    }

    async fn unreserve(&self, address: Ipv4Addr) -> Result<(), Error> {
        self.inner.unreserve(address).await
    }

    async fn lookup(&self, name: &str) -> Result<Option<Binding>, Error> {
        let hide = self
            .hidden_lookups
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if hide {
            return Ok(None);
        }
        self.inner.lookup(name).await
    }

    async fn list(&self) -> Result<Vec<Binding>, Error> {
        self.inner.list().await
    }

    async fn counts(&self) -> Result<PoolCounts, Error> {
        self.inner.counts().await
    }
}

default_health_status_indicator!(RacingPool);

#[trellis_test]
async fn allocate_is_idempotent_per_name() -> Result<(), Error> {
    let allocator = make_allocator("10.1.0.2", "10.1.0.4").await?;

    let first = allocator.allocate("web-1", "host-a").await?;
    // A retry keeps the original binding, host included.
    let second = allocator.allocate("web-1", "host-b").await?;
    assert_eq!(first, second);

    let stats = allocator.stats().await?;
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.available, 2);
    Ok(())
}

#[trellis_test]
async fn distinct_names_get_distinct_addresses() -> Result<(), Error> {
    let allocator = make_allocator("10.1.0.2", "10.1.0.3").await?;

    let first = allocator.allocate("web-1", "host-a").await?;
    let second = allocator.allocate("web-2", "host-a").await?;
    assert_ne!(first.address, second.address);
    Ok(())
}

#[trellis_test]
async fn exhausted_pool_is_resource_exhausted() -> Result<(), Error> {
    let allocator = make_allocator("10.1.0.2", "10.1.0.2").await?;

    let only = allocator.allocate("web-1", "host-a").await?;
    let e = allocator
        .allocate("web-2", "host-a")
        .await
        .expect_err("pool of one should be exhausted");
    assert_eq!(e.code, Code::ResourceExhausted);

    // Releasing the only holder makes its address allocatable again.
    assert_eq!(allocator.release("web-1").await?, only.address);
    let reused = allocator.allocate("web-2", "host-a").await?;
    assert_eq!(reused.address, only.address);
    Ok(())
}

#[trellis_test]
async fn release_unknown_name_is_not_found() -> Result<(), Error> {
    let allocator = make_allocator("10.1.0.2", "10.1.0.4").await?;

    let e = allocator
        .release("ghost")
        .await
        .expect_err("nothing was allocated");
    assert_eq!(e.code, Code::NotFound);
    assert_eq!(allocator.stats().await?.available, 3);
    Ok(())
}

#[trellis_test]
async fn allocate_rejects_empty_identifiers() -> Result<(), Error> {
    let allocator = make_allocator("10.1.0.2", "10.1.0.4").await?;

    let e = allocator.allocate("", "host-a").await.expect_err("no name");
    assert_eq!(e.code, Code::InvalidArgument);
    let e = allocator.allocate("web-1", "").await.expect_err("no host");
    assert_eq!(e.code, Code::InvalidArgument);
    assert_eq!(allocator.stats().await?.available, 3);
    Ok(())
}

#[trellis_test]
async fn lost_bind_race_adopts_winner_binding() -> Result<(), Error> {
    let inner = MemoryPoolStore::new(&MemoryPoolSpec::default());
    let racing = Arc::new(RacingPool {
        inner: inner.clone(),
        hidden_lookups: AtomicUsize::new(0),
    });
    let allocator = AddressAllocator::new(racing.clone(), test_range("10.1.0.2", "10.1.0.4")?);
    allocator.bootstrap().await?;

    // Another allocator binds the name first.
    let winner_address = inner
        .try_reserve_one()
        .await?
        .expect("pool should not be exhausted");
    inner.bind("web-1", winner_address, "host-b").await?;

    // Our allocate misses the binding on its first look and only finds out
    // when its own bind is rejected.
    racing.hidden_lookups.store(1, Ordering::Release);
    let adopted = allocator.allocate("web-1", "host-a").await?;
    assert_eq!(
        adopted,
        Binding {
            name: "web-1".to_string(),
            address: winner_address,
            host: "host-b".to_string(),
        }
    );

    // The loser's reservation went back to the pool.
    assert_eq!(
        inner.counts().await?,
        PoolCounts {
            total: 3,
            available: 2,
            allocated: 1,
        }
    );
    Ok(())
}

#[trellis_test]
async fn vanished_race_winner_aborts() -> Result<(), Error> {
    let inner = MemoryPoolStore::new(&MemoryPoolSpec::default());
    let racing = Arc::new(RacingPool {
        inner: inner.clone(),
        hidden_lookups: AtomicUsize::new(0),
    });
    let allocator = AddressAllocator::new(racing.clone(), test_range("10.1.0.2", "10.1.0.4")?);
    allocator.bootstrap().await?;

    let winner_address = inner
        .try_reserve_one()
        .await?
        .expect("pool should not be exhausted");
    inner.bind("web-1", winner_address, "host-b").await?;

    // The winner's binding stays invisible even when we go back to adopt
    // it, as if it was released in between.
    racing.hidden_lookups.store(2, Ordering::Release);
    let e = allocator
        .allocate("web-1", "host-a")
        .await
        .expect_err("race cannot be resolved");
    assert_eq!(e.code, Code::Aborted);

    // The reservation still went back to the pool.
    assert_eq!(inner.counts().await?.available, 2);
    Ok(())
}

#[trellis_test]
async fn concurrent_allocations_never_share_an_address() -> Result<(), Error> {
    let allocator = make_allocator("10.1.0.2", "10.1.0.11").await?;

    let names: Vec<String> = (0..10).map(|i| format!("web-{i}")).collect();
    let bindings = futures::future::try_join_all(
        names.iter().map(|name| allocator.allocate(name, "host-a")),
    )
    .await?;

    let mut addresses: Vec<Ipv4Addr> = bindings.iter().map(|b| b.address).collect();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), 10);

    let stats = allocator.stats().await?;
    assert_eq!(stats.allocated, 10);
    assert_eq!(stats.available, 0);
    Ok(())
}

#[trellis_test]
async fn bootstrap_preserves_existing_allocations() -> Result<(), Error> {
    let pool = MemoryPoolStore::new(&MemoryPoolSpec::default());
    let allocator = AddressAllocator::new(pool.clone(), test_range("10.1.0.2", "10.1.0.4")?);
    allocator.bootstrap().await?;
    let binding = allocator.allocate("web-1", "host-a").await?;

    // A restarted authority bootstraps against the same store without
    // reseeding or dropping live bindings.
    let restarted = AddressAllocator::new(pool, test_range("10.1.0.2", "10.1.0.4")?);
    restarted.bootstrap().await?;
    assert_eq!(restarted.lookup("web-1").await?, Some(binding));
    assert_eq!(restarted.stats().await?.allocated, 1);
    Ok(())
}

#[trellis_test]
async fn stats_reports_pool_utilization() -> Result<(), Error> {
    let allocator = make_allocator("10.1.0.2", "10.1.0.5").await?;
    allocator.allocate("web-1", "host-a").await?;

    assert_eq!(
        allocator.stats().await?,
        PoolStats {
            subnet: "10.1.0.0/24".to_string(),
            total: 4,
            allocated: 1,
            available: 3,
            utilization: 25.0,
        }
    );
    Ok(())
}
