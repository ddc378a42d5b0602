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
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use trellis_config::pools::MemoryPoolSpec;
use trellis_error::{Code, Error, make_err};
use trellis_util::health_utils::default_health_status_indicator;

use crate::address_range::AddressRange;
use crate::pool_store::{Binding, PoolCounts, PoolStore, UNKNOWN_HOST};

#[derive(Default)]
struct PoolState {
    ready: bool,
    total: u64,
    available: BTreeSet<Ipv4Addr>,
    name_to_address: HashMap<String, Ipv4Addr>,
    address_to_name: HashMap<Ipv4Addr, String>,
    name_to_host: HashMap<String, String>,
}

/// A single-process pool kept entirely in memory. Useful for tests and
/// single-node deployments where nothing outside this process allocates.
pub struct MemoryPoolStore {
    state: Mutex<PoolState>,
}

impl MemoryPoolStore {
    pub fn new(_spec: &MemoryPoolSpec) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState::default()),
        })
    }
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    async fn init_pool(&self, range: &AddressRange) -> Result<u64, Error> {
        let mut state = self.state.lock();
        if state.ready {
            return Ok(0);
        }
        state.ready = true;
        let mut seeded = 0;
        for address in range.iter() {
            state.available.insert(address);
            seeded += 1;
        }
        state.total = seeded;
        Ok(seeded)
    }

    async fn try_reserve_one(&self) -> Result<Option<Ipv4Addr>, Error> {
        let mut state = self.state.lock();
        let Some(address) = state.available.iter().next().copied() else {
            return Ok(None);
        };
        state.available.remove(&address);
        Ok(Some(address))
    }

    async fn bind(&self, name: &str, address: Ipv4Addr, host: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.name_to_address.contains_key(name) {
            return Err(make_err!(
                Code::AlreadyExists,
                "Binding for {name} already exists"
            ));
        }
        state.name_to_address.insert(name.to_string(), address);
        state.address_to_name.insert(address, name.to_string());
        state.name_to_host.insert(name.to_string(), host.to_string());
        Ok(())
    }

    async fn unbind(&self, name: &str) -> Result<Ipv4Addr, Error> {
        let mut state = self.state.lock();
        let Some(address) = state.name_to_address.remove(name) else {
            return Err(make_err!(Code::NotFound, "No binding for {name}"));
        };
        state.address_to_name.remove(&address);
        state.name_to_host.remove(name);
        state.available.insert(address);
        Ok(address)
    }

    async fn unreserve(&self, address: Ipv4Addr) -> Result<(), Error> {
        self.state.lock().available.insert(address);
        Ok(())
    }

    async fn lookup(&self, name: &str) -> Result<Option<Binding>, Error> {
        let state = self.state.lock();
        Ok(state.name_to_address.get(name).map(|address| Binding {
            name: name.to_string(),
            address: *address,
            host: state
                .name_to_host
                .get(name)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_HOST.to_string()),
        }))
    }

    async fn list(&self) -> Result<Vec<Binding>, Error> {
        let state = self.state.lock();
        let mut bindings: Vec<Binding> = state
            .name_to_address
            .iter()
            .map(|(name, address)| Binding {
                name: name.clone(),
                address: *address,
                host: state
                    .name_to_host
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_HOST.to_string()),
            })
            .collect();
        bindings.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        Ok(bindings)
    }

    async fn counts(&self) -> Result<PoolCounts, Error> {
        let state = self.state.lock();
        Ok(PoolCounts {
            total: state.total,
            available: state.available.len() as u64,
            allocated: state.name_to_address.len() as u64,
        })
    }
}

default_health_status_indicator!(MemoryPoolStore);
