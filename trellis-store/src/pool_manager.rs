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

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::pool_store::PoolStore;

pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<dyn PoolStore>>>,
}

impl PoolManager {
    pub fn new() -> PoolManager {
        PoolManager {
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_pool(&self, name: &str, pool: Arc<dyn PoolStore>) {
        let mut pools = self.pools.write();
        pools.insert(name.to_string(), pool);
    }

    pub fn get_pool(&self, name: &str) -> Option<Arc<dyn PoolStore>> {
        let pools = self.pools.read();
        if let Some(pool) = pools.get(name) {
            return Some(pool.clone());
        }
        None
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}
