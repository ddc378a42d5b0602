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

use serde::{Deserialize, Serialize};
use trellis_error::{Error, ResultExt};

use crate::NamedConfig;
use crate::pools::{AddressRangeSpec, PoolRefName, PoolSpec, Retry};
use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

/// The address authority service. It owns the allocation ledger and is
/// the single place agents go to claim and release overlay addresses.
#[derive(Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct AuthorityConfig {
    /// The pool name referenced in the `pools` map in the main config
    /// that backs the allocation ledger.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub pool: PoolRefName,

    /// The address space this authority hands allocations out of.
    pub range: AddressRangeSpec,
}

/// The provisioning agent service. It runs on every workload host and
/// drives the create/attach sequence against the local container
/// runtime, claiming addresses from the authority first.
#[derive(Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Identity this host reports when claiming addresses. Shows up as
    /// the `host` field of every binding made through this agent.
    ///
    /// Default: the machine hostname
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub host_id: Option<String>,

    /// Base URL of the address authority, e.g. `http://10.0.0.5:5000`.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub authority_endpoint: String,

    /// Base URL of the container runtime API this agent drives.
    ///
    /// Default: "http://127.0.0.1:2475"
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub runtime_endpoint: String,

    /// Base URL of the overlay network control API. Leave empty to use
    /// the runtime endpoint, which is correct when the runtime also
    /// manages the overlay.
    ///
    /// Default: (Empty String / runtime endpoint)
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub overlay_endpoint: String,

    /// Image to run when a provision request does not name one.
    ///
    /// Default: "nginx:alpine"
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub default_image: String,

    /// Upper bound in milliseconds on any single provisioning step
    /// (allocate, create, attach). A step that exceeds this is treated
    /// as failed and the sequence unwinds.
    ///
    /// Default: 30000 (30 seconds)
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub step_timeout_ms: u64,

    /// Retry configuration for calls made to the address authority.
    #[serde(default)]
    pub retry: Retry,
}

#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Path to register the health status check. If path is "/status", and your
    /// domain is "example.com", you can reach the endpoint with:
    /// <http://example.com/status>.
    ///
    /// Default: "/status"
    #[serde(default)]
    pub path: String,

    // Timeout on health checks. Defaults to 5s.
    #[serde(default)]
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    /// The address authority service.
    pub authority: Option<AuthorityConfig>,

    /// The provisioning agent service.
    /// NOTE: This service should only be reachable from inside the
    /// cluster. It drives the local container runtime, so exposing it
    /// publicly hands out workload control.
    pub agent: Option<AgentConfig>,

    /// This is the service for health status check.
    pub health: Option<HealthConfig>,
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ListenerConfig {
    /// Listener for HTTP/HTTPS/HTTP2 sockets.
    Http(HttpListener),
}

#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct HttpListener {
    /// Address to listen on. Example: `127.0.0.1:8080` or `:8080` to listen
    /// to all IPs.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub socket_address: String,
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Name of the server. This is used to help identify the service
    /// for telemetry and logs.
    ///
    /// Default: {index of server in config}
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub name: String,

    /// Configuration
    pub listener: ListenerConfig,

    /// Services to attach to server.
    pub services: Option<ServicesConfig>,
}

pub type PoolConfig = NamedConfig<PoolSpec>;

#[derive(Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct TrellisConfig {
    /// List of pools available to use in this config.
    /// The keys can be used in other configs when needing to reference a pool.
    pub pools: Vec<PoolConfig>,

    /// Servers to setup for this process.
    pub servers: Vec<ServerConfig>,
}

impl TrellisConfig {
    /// # Errors
    ///
    /// Will return `Err` if we can't load the file.
    pub fn try_from_json5_file(config_file: &str) -> Result<Self, Error> {
        let json_contents = std::fs::read_to_string(config_file)
            .err_tip(|| format!("Could not open config file {config_file}"))?;
        Ok(serde_json5::from_str(&json_contents)?)
    }
}
