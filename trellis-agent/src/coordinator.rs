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
use futures::Future;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{Level, event};
use trellis_config::server::AgentConfig;
use trellis_error::{Code, Error, ResultExt, error_if, make_err};
use trellis_store::pool_store::Binding;
use trellis_util::health_utils::{HealthRegistryBuilder, HealthStatus, HealthStatusIndicator};

use crate::authority_client::{AddressAuthority, HttpAuthorityClient};
use crate::overlay_client::{HttpOverlayClient, OverlayNetwork};
use crate::runtime_client::{
    ContainerRuntime, HttpRuntimeClient, WorkloadId, WorkloadInfo, WorkloadSpec,
};

/// Label marking a workload as created through this system.
pub const MANAGED_LABEL: &str = "trellis.managed";
/// Label carrying the address allocated for the workload.
pub const ADDRESS_LABEL: &str = "trellis.address";
/// Label carrying the host that claimed the address.
pub const HOST_LABEL: &str = "trellis.host";

const DEFAULT_RUNTIME_ENDPOINT: &str = "http://127.0.0.1:2475";
const DEFAULT_IMAGE: &str = "nginx:alpine";
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of the network attach step of a provisioning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Attached,
    Failed(String),
}

impl NetworkStatus {
    pub const fn is_attached(&self) -> bool {
        matches!(self, Self::Attached)
    }
}

impl core::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Attached => f.write_str("attached"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

impl Serialize for NetworkStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one teardown step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    Failed(String),
}

impl core::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

impl Serialize for StepStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What a completed (possibly degraded) provisioning looks like.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProvisionOutcome {
    pub workload_id: WorkloadId,
    pub name: String,
    pub address: Ipv4Addr,
    pub host: String,
    pub image: String,
    pub network_status: NetworkStatus,
}

/// What a completed teardown looks like, step by step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeprovisionOutcome {
    pub name: String,
    pub freed: Ipv4Addr,
    pub detach_status: StepStatus,
    pub remove_status: StepStatus,
    pub release_status: StepStatus,
}

/// One managed workload, joining what its labels promise with what the
/// runtime observes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManagedWorkload {
    pub id: WorkloadId,
    pub name: String,
    pub image: String,
    pub state: String,
    /// Address recorded in the workload's label at creation.
    pub allocated_address: Option<String>,
    /// Address the runtime currently observes.
    pub observed_address: Option<Ipv4Addr>,
}

/// Result of a connectivity test run inside a workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PingReport {
    pub name: String,
    pub target: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

fn is_managed(info: &WorkloadInfo) -> bool {
    info.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true")
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Runs the provisioning sequence on one host.
///
/// The coordinator keeps no state of its own between requests. Every
/// step's effect lives either in the authority (the binding) or on the
/// workload itself (the labels), so a restarted agent can pick up
/// teardown of anything an earlier incarnation created.
pub struct ProvisioningCoordinator {
    host_id: String,
    default_image: String,
    step_timeout: Duration,
    runtime: Arc<dyn ContainerRuntime>,
    overlay: Arc<dyn OverlayNetwork>,
    authority: Arc<dyn AddressAuthority>,
}

impl ProvisioningCoordinator {
    /// Builds the coordinator with the shipped HTTP clients, applying
    /// the documented config defaults.
    pub fn from_config(config: &AgentConfig) -> Result<Arc<Self>, Error> {
        error_if!(
            config.authority_endpoint.is_empty(),
            "An agent requires an authority_endpoint"
        );
        let runtime_endpoint = if config.runtime_endpoint.is_empty() {
            DEFAULT_RUNTIME_ENDPOINT
        } else {
            &config.runtime_endpoint
        };
        let overlay_endpoint = if config.overlay_endpoint.is_empty() {
            runtime_endpoint
        } else {
            &config.overlay_endpoint
        };
        Ok(Self::new(
            config,
            Arc::new(HttpRuntimeClient::new(runtime_endpoint)),
            Arc::new(HttpOverlayClient::new(overlay_endpoint)),
            Arc::new(HttpAuthorityClient::new(
                &config.authority_endpoint,
                config.retry.clone(),
            )),
        ))
    }

    pub fn new(
        config: &AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        overlay: Arc<dyn OverlayNetwork>,
        authority: Arc<dyn AddressAuthority>,
    ) -> Arc<Self> {
        let host_id = config
            .host_id
            .clone()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(local_hostname);
        let default_image = if config.default_image.is_empty() {
            DEFAULT_IMAGE.to_string()
        } else {
            config.default_image.clone()
        };
        let step_timeout = if config.step_timeout_ms == 0 {
            DEFAULT_STEP_TIMEOUT
        } else {
            Duration::from_millis(config.step_timeout_ms)
        };
        Arc::new(Self {
            host_id,
            default_image,
            step_timeout,
            runtime,
            overlay,
            authority,
        })
    }

    pub const fn host_id(&self) -> &String {
        &self.host_id
    }

    /// Bounds one runtime or overlay call. Expiry is an ordinary step
    /// failure and unwinds like any other.
    async fn step<T>(
        &self,
        operation: impl Future<Output = Result<T, Error>> + Send,
        what: &'static str,
    ) -> Result<T, Error> {
        match timeout(self.step_timeout, operation).await {
            Ok(result) => result.err_tip(|| format!("during {what}")),
            Err(_) => Err(make_err!(
                Code::DeadlineExceeded,
                "Step {what} did not finish within {:?}",
                self.step_timeout,
            )),
        }
    }

    fn managed_labels(&self, address: Ipv4Addr) -> HashMap<String, String> {
        HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (ADDRESS_LABEL.to_string(), address.to_string()),
            (HOST_LABEL.to_string(), self.host_id.clone()),
        ])
    }

    /// Provisions `name`: checks uniqueness, claims an address, creates
    /// the workload, and attaches it to the overlay.
    ///
    /// Fails before any state exists (`AlreadyExists` on a name conflict,
    /// `ResourceExhausted` on an empty pool), or releases the claimed
    /// address when workload creation fails. An attach failure after
    /// creation is a degraded success: workload and binding stay put and
    /// `network_status` carries the reason.
    pub async fn provision(
        &self,
        name: &str,
        image: Option<&str>,
    ) -> Result<ProvisionOutcome, Error> {
        error_if!(name.is_empty(), "Provisioning requires a workload name");
        if let Some(existing) = self.authority.check(name).await? {
            return Err(make_err!(
                Code::AlreadyExists,
                "Workload name {name} is already bound to {} on host {}",
                existing.address,
                existing.host,
            ));
        }

        let binding = self.authority.allocate(name, &self.host_id).await?;
        if binding.host != self.host_id {
            // Another host claimed the name between the check and our
            // allocate, and the authority handed us its binding. It is
            // theirs; releasing it here would strand their workload.
            return Err(make_err!(
                Code::AlreadyExists,
                "Workload name {name} was claimed by host {} during provisioning",
                binding.host,
            ));
        }
        let image = image.unwrap_or(&self.default_image).to_string();
        let spec = WorkloadSpec {
            name: name.to_string(),
            image: image.clone(),
            labels: self.managed_labels(binding.address),
        };
        let workload_id = match self.step(self.runtime.create(&spec), "workload creation").await {
            Ok(id) => id,
            Err(create_err) => return Err(self.unwind_failed_create(name, create_err).await),
        };
        event!(
            Level::INFO,
            name,
            address = %binding.address,
            id = %workload_id,
            "Created workload"
        );

        let network_status = match self
            .step(self.overlay.attach(name, binding.address), "network attach")
            .await
        {
            Ok(()) => NetworkStatus::Attached,
            Err(e) => {
                // The workload already has an identity and its binding;
                // only the attachment is missing and can be retried on
                // its own.
                event!(Level::WARN, name, "Network attach failed: {e:?}");
                NetworkStatus::Failed(e.to_string())
            }
        };

        Ok(ProvisionOutcome {
            workload_id,
            name: name.to_string(),
            address: binding.address,
            host: binding.host,
            image,
            network_status,
        })
    }

    /// Returns the address claim after a failed create. The creation
    /// error always wins; a failed release rides along in its messages.
    async fn unwind_failed_create(&self, name: &str, create_err: Error) -> Error {
        event!(
            Level::WARN,
            name,
            "Workload creation failed, releasing address: {create_err:?}"
        );
        match self.authority.release(name).await {
            Ok(freed) => {
                event!(
                    Level::INFO,
                    name,
                    address = %freed,
                    "Released address after failed creation"
                );
                create_err
            }
            Err(release_err) => {
                event!(Level::ERROR, name, "Compensating release failed: {release_err:?}");
                create_err.merge(release_err)
            }
        }
    }

    /// Tears down `name` in reverse provisioning order.
    ///
    /// Detach is best-effort. Remove and release each run regardless of
    /// earlier step failures; any remove or release error fails the
    /// whole call with both errors merged.
    pub async fn deprovision(&self, name: &str) -> Result<DeprovisionOutcome, Error> {
        error_if!(name.is_empty(), "Deprovisioning requires a workload name");
        let Some(info) = self.runtime.inspect(name).await? else {
            return Err(make_err!(
                Code::NotFound,
                "No workload named {name} on host {}",
                self.host_id
            ));
        };
        if !is_managed(&info) {
            return Err(make_err!(
                Code::NotFound,
                "Workload {name} exists but is not managed here"
            ));
        }
        let labeled_address = info.labels.get(ADDRESS_LABEL).cloned();

        let detach_status = match self.step(self.overlay.detach(name), "network detach").await {
            Ok(()) => StepStatus::Ok,
            Err(e) => {
                // A missing attachment must not stop the teardown.
                event!(Level::WARN, name, "Ignoring detach failure during teardown: {e:?}");
                StepStatus::Failed(e.to_string())
            }
        };

        let remove_result = self
            .step(self.runtime.remove(name, true), "workload removal")
            .await;
        let release_result = self.authority.release(name).await;

        match (remove_result, release_result) {
            (Ok(()), Ok(freed)) => {
                let freed_text = freed.to_string();
                if labeled_address.as_deref().is_some_and(|labeled| labeled != freed_text) {
                    event!(
                        Level::WARN,
                        name,
                        labeled = ?labeled_address,
                        freed = %freed,
                        "Workload label address disagrees with released address"
                    );
                }
                event!(Level::INFO, name, freed = %freed, "Deprovisioned workload");
                Ok(DeprovisionOutcome {
                    name: name.to_string(),
                    freed,
                    detach_status,
                    remove_status: StepStatus::Ok,
                    release_status: StepStatus::Ok,
                })
            }
            (Err(remove_err), Ok(freed)) => Err(remove_err.append(format!(
                "workload removal failed for {name}; its address {freed} was still released"
            ))),
            (Ok(()), Err(release_err)) => {
                let tip = if release_err.code == Code::NotFound {
                    format!("workload {name} was removed; its name was not bound")
                } else {
                    format!("workload {name} was removed but its name is still bound")
                };
                Err(release_err.append(tip))
            }
            (Err(remove_err), Err(release_err)) => Err(remove_err.merge(release_err)),
        }
    }

    /// Every managed workload on this host, ordered by name.
    pub async fn list_workloads(&self) -> Result<Vec<ManagedWorkload>, Error> {
        let infos = self.runtime.list_managed().await?;
        let mut workloads: Vec<ManagedWorkload> = infos
            .into_iter()
            .map(|info| ManagedWorkload {
                allocated_address: info.labels.get(ADDRESS_LABEL).cloned(),
                observed_address: info.address,
                id: info.id,
                name: info.name,
                image: info.image,
                state: info.state,
            })
            .collect();
        workloads.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        Ok(workloads)
    }

    /// Runs `ping -c 3 <target>` inside the named workload and reports
    /// the outcome verbatim.
    pub async fn ping_workload(&self, name: &str, target: &str) -> Result<PingReport, Error> {
        error_if!(target.is_empty(), "Connectivity test requires a target");
        let Some(info) = self.runtime.inspect(name).await? else {
            return Err(make_err!(
                Code::NotFound,
                "No workload named {name} on host {}",
                self.host_id
            ));
        };
        if !is_managed(&info) {
            return Err(make_err!(
                Code::NotFound,
                "Workload {name} exists but is not managed here"
            ));
        }
        let command = vec![
            "ping".to_string(),
            "-c".to_string(),
            "3".to_string(),
            target.to_string(),
        ];
        let output = self
            .step(self.runtime.exec(name, &command), "connectivity test")
            .await?;
        Ok(PingReport {
            name: name.to_string(),
            target: target.to_string(),
            success: output.exit_code == 0,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    // Register health checks used to monitor this agent's dependencies.
    pub fn register_health(self: &Arc<Self>, registry: &mut HealthRegistryBuilder) {
        registry.register_indicator(self.clone());
    }
}

impl core::fmt::Debug for ProvisioningCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProvisioningCoordinator")
            .field("host_id", &self.host_id)
            .field("default_image", &self.default_image)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

#[async_trait]
impl HealthStatusIndicator for ProvisioningCoordinator {
    fn get_name(&self) -> &'static str {
        "ProvisioningCoordinator"
    }

    async fn check_health(&self, namespace: Cow<'static, str>) -> HealthStatus {
        if let Err(e) = self.authority.ping().await {
            return HealthStatus::new_failed(
                self,
                format!("{namespace} - authority unreachable: {e:?}").into(),
            );
        }
        if let Err(e) = self.runtime.ping().await {
            return HealthStatus::new_failed(
                self,
                format!("{namespace} - runtime unreachable: {e:?}").into(),
            );
        }
        match self.overlay.describe().await {
            Ok(overlay) => HealthStatus::new_ok(
                self,
                format!(
                    "host {} attached to overlay {} ({})",
                    self.host_id, overlay.name, overlay.subnet
                )
                .into(),
            ),
            Err(e) => HealthStatus::new_failed(
                self,
                format!("{namespace} - overlay unreachable: {e:?}").into(),
            ),
        }
    }
}
