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

use core::pin::Pin;
use std::sync::Arc;

use futures::Future;
use trellis_config::pools::PoolSpec;
use trellis_error::Error;
use trellis_util::health_utils::HealthRegistryBuilder;

use crate::memory_pool::MemoryPoolStore;
use crate::pool_store::PoolStore;
use crate::redis_pool::RedisPoolStore;

type FutureMaybePool<'a> = Box<dyn Future<Output = Result<Arc<dyn PoolStore>, Error>> + 'a>;

pub fn pool_factory<'a>(
    backend: &'a PoolSpec,
    maybe_health_registry_builder: Option<&'a mut HealthRegistryBuilder>,
) -> Pin<FutureMaybePool<'a>> {
    Box::pin(async move {
        let pool: Arc<dyn PoolStore> = match backend {
            PoolSpec::Redis(spec) => RedisPoolStore::new(spec)?,
            PoolSpec::Memory(spec) => MemoryPoolStore::new(spec),
        };

        if let Some(health_registry_builder) = maybe_health_registry_builder {
            pool.clone().register_health(health_registry_builder);
        }

        Ok(pool)
    })
}
