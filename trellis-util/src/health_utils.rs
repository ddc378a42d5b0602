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
use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use futures::stream::unfold;
use parking_lot::Mutex;
use serde::Serialize;

/// Logical name of the health indicator component.
type HealthComponentName = Cow<'static, str>;
/// Struct name health indicator component.
type StructName = &'static str;
/// Readable message status of the health indicator.
pub type Message = Cow<'static, str>;

/// Status state of a health indicator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum HealthStatus {
    Ok {
        struct_name: StructName,
        message: Message,
    },
    Initializing {
        struct_name: StructName,
        message: Message,
    },
    Warning {
        struct_name: StructName,
        message: Message,
    },
    Failed {
        struct_name: StructName,
        message: Message,
    },
}

impl HealthStatus {
    pub fn new_ok(component: &(impl HealthStatusIndicator + ?Sized), message: Message) -> Self {
        Self::Ok {
            struct_name: component.struct_name(),
            message,
        }
    }

    pub fn new_initializing(
        component: &(impl HealthStatusIndicator + ?Sized),
        message: Message,
    ) -> Self {
        Self::Initializing {
            struct_name: component.struct_name(),
            message,
        }
    }

    pub fn new_warning(
        component: &(impl HealthStatusIndicator + ?Sized),
        message: Message,
    ) -> Self {
        Self::Warning {
            struct_name: component.struct_name(),
            message,
        }
    }

    pub fn new_failed(component: &(impl HealthStatusIndicator + ?Sized), message: Message) -> Self {
        Self::Failed {
            struct_name: component.struct_name(),
            message,
        }
    }
}

/// Description of the health status of a component.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct HealthStatusDescription {
    pub component_name: HealthComponentName,
    pub status: HealthStatus,
}

/// Health status indicator trait. This trait is used to define
/// a health status indicator by implementing the `check_health` function.
/// A default implementation is provided for the `check_health` function
/// that returns healthy component.
#[async_trait]
pub trait HealthStatusIndicator: Sync + Send + Unpin {
    fn get_name(&self) -> &'static str;

    /// Returns the name of the struct implementing the trait.
    fn struct_name(&self) -> StructName {
        core::any::type_name::<Self>()
    }

    /// Check the health status of the component. This function should be
    /// implemented by the component to check the health status of the component.
    async fn check_health(&self, _namespace: Cow<'static, str>) -> HealthStatus {
        HealthStatus::new_ok(self, "ok".into())
    }
}

type Registries = Vec<(HealthComponentName, Arc<dyn HealthStatusIndicator>)>;

/// Builder to assemble the set of health indicators before the registry
/// starts serving. Sub-builders share the same underlying state, so
/// indicators registered on any of them end up in the built registry.
pub struct HealthRegistryBuilder {
    namespace: HealthComponentName,
    state: Arc<Mutex<Registries>>,
}

impl HealthRegistryBuilder {
    pub fn new(component_name: &str) -> Self {
        Self {
            namespace: format!("/{component_name}").into(),
            state: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a health status indicator at the current component level.
    pub fn register_indicator(&mut self, indicator: Arc<dyn HealthStatusIndicator>) {
        self.state.lock().push((self.namespace.clone(), indicator));
    }

    /// Create a sub-builder scoped under the given component name.
    pub fn sub_builder(&mut self, component_name: &str) -> HealthRegistryBuilder {
        HealthRegistryBuilder {
            namespace: format!("{}/{component_name}", self.namespace).into(),
            state: self.state.clone(),
        }
    }

    pub fn build(&mut self) -> HealthRegistry {
        HealthRegistry {
            indicators: self.state.lock().clone(),
        }
    }
}

#[derive(Default, Clone)]
pub struct HealthRegistry {
    indicators: Registries,
}

pub trait HealthStatusReporter {
    fn health_status_report(
        &self,
    ) -> Pin<Box<dyn Stream<Item = HealthStatusDescription> + Send + '_>>;
}

/// Health status reporter for the registry. Indicators are checked
/// lazily, only as the returned stream is polled.
impl HealthStatusReporter for HealthRegistry {
    fn health_status_report(
        &self,
    ) -> Pin<Box<dyn Stream<Item = HealthStatusDescription> + Send + '_>> {
        Box::pin(unfold(
            self.indicators.iter(),
            |mut indicators_iter| async {
                let (component_name, indicator) = indicators_iter.next()?;
                Some((
                    HealthStatusDescription {
                        component_name: component_name.clone(),
                        status: indicator.check_health(component_name.clone()).await,
                    },
                    indicators_iter,
                ))
            },
        ))
    }
}

/// Default health status indicator implementation for a component.
/// Generally used by components that only need to report a static
/// healthy status.
#[macro_export]
macro_rules! default_health_status_indicator {
    ($type:ty) => {
        #[async_trait::async_trait]
        impl $crate::health_utils::HealthStatusIndicator for $type {
            fn get_name(&self) -> &'static str {
                stringify!($type)
            }
        }
    };
}

// Re-export at module level so callers can use the macro through
// `health_utils::default_health_status_indicator`.
pub use crate::default_health_status_indicator;
