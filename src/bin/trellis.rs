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

use std::net::SocketAddr;
use std::sync::Arc;

use async_lock::Mutex as AsyncMutex;
use axum::Router;
use axum::http::StatusCode;
use clap::Parser;
use futures::future::{BoxFuture, try_join_all};
use hyper_util::rt::tokio::TokioIo;
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use mimalloc::MiMalloc;
use scopeguard::guard;
use tokio::net::TcpListener;
#[cfg(target_family = "unix")]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, event};
use trellis_config::server::{ListenerConfig, TrellisConfig};
use trellis_error::{Error, ResultExt, make_input_err};
use trellis_service::agent_server::AgentServer;
use trellis_service::authority_server::AuthorityServer;
use trellis_service::health_server::HealthServer;
use trellis_store::default_pool_factory::pool_factory;
use trellis_store::pool_manager::PoolManager;
use trellis_util::background_spawn;
use trellis_util::health_utils::HealthRegistryBuilder;
use trellis_util::init_tracing;
use trellis_util::task::TaskExecutor;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// Note: This must be kept in sync with the documentation in `HealthConfig::path`.
const DEFAULT_HEALTH_STATUS_CHECK_PATH: &str = "/status";

/// Address authority and provisioning agent for overlay-networked
/// container clusters.
#[derive(Parser, Debug)]
#[clap(
    author = "The Trellis Authors",
    version,
    about,
    long_about = None
)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

async fn inner_main(cfg: TrellisConfig) -> Result<(), Error> {
    let health_registry_builder = Arc::new(AsyncMutex::new(HealthRegistryBuilder::new("trellis")));

    let pool_manager = Arc::new(PoolManager::new());
    {
        let mut health_registry_lock = health_registry_builder.lock().await;

        for pool_cfg in cfg.pools {
            let name = pool_cfg.name;
            let health_component_name = format!("pools/{name}");
            let mut health_register_pool =
                health_registry_lock.sub_builder(&health_component_name);
            let pool = pool_factory(&pool_cfg.spec, Some(&mut health_register_pool))
                .await
                .err_tip(|| format!("Failed to create pool '{name}'"))?;
            pool_manager.add_pool(&name, pool);
        }
    }

    let mut root_futures: Vec<BoxFuture<Result<(), Error>>> = Vec::new();

    for (i, server_cfg) in cfg.servers.into_iter().enumerate() {
        let server_name = if server_cfg.name.is_empty() {
            format!("{i}")
        } else {
            server_cfg.name.clone()
        };
        let services = server_cfg
            .services
            .err_tip(|| "'services' must be configured")?;

        let mut svc = Router::new()
            // This is the default service that executes if no other endpoint matches.
            .fallback((StatusCode::NOT_FOUND, "Not Found"));

        if let Some(authority_cfg) = services.authority {
            let authority_server =
                AuthorityServer::new(&authority_cfg, &pool_manager).err_tip(|| {
                    format!("Failed to create authority service for server '{server_name}'")
                })?;
            authority_server
                .bootstrap()
                .await
                .err_tip(|| "While seeding the authority allocation ledger")?;
            svc = svc.merge(authority_server.into_router());
        }

        if let Some(agent_cfg) = services.agent {
            let agent_server = AgentServer::new(&agent_cfg).err_tip(|| {
                format!("Failed to create agent service for server '{server_name}'")
            })?;
            let mut agent_health_builder = health_registry_builder
                .lock()
                .await
                .sub_builder(&format!("agents/{server_name}"));
            agent_server.register_health(&mut agent_health_builder);
            svc = svc.merge(agent_server.into_router());
        }

        if let Some(health_cfg) = services.health {
            let path = if health_cfg.path.is_empty() {
                DEFAULT_HEALTH_STATUS_CHECK_PATH
            } else {
                &health_cfg.path
            };
            let health_registry = health_registry_builder.lock().await.build();
            svc = svc.route_service(path, HealthServer::new(health_registry));
        }

        // Currently we only support http as our socket type.
        let ListenerConfig::Http(http_config) = server_cfg.listener;

        let socket_addr = http_config
            .socket_address
            .parse::<SocketAddr>()
            .map_err(|e| {
                make_input_err!("Invalid address '{}' - {e:?}", http_config.socket_address)
            })?;
        let tcp_listener = TcpListener::bind(&socket_addr).await?;
        let http = auto::Builder::new(TaskExecutor::default());
        event!(Level::WARN, "Ready, listening on {socket_addr}",);
        root_futures.push(Box::pin(async move {
            loop {
                match tcp_listener.accept().await {
                    Ok((tcp_stream, remote_addr)) => {
                        event!(
                            target: "trellis::services",
                            Level::INFO,
                            ?remote_addr,
                            ?socket_addr,
                            "Client connected"
                        );
                        // This is the safest way to guarantee that if our future
                        // is ever dropped we will cleanup our data.
                        let scope_guard = guard((), move |()| {
                            event!(
                                target: "trellis::services",
                                Level::INFO,
                                ?remote_addr,
                                ?socket_addr,
                                "Client disconnected"
                            );
                        });
                        let (http, svc) = (http.clone(), svc.clone());
                        background_spawn!(
                            name: "http_connection",
                            fut: async move {
                                // Move it into our spawn, so if our spawn dies the cleanup happens.
                                let _guard = scope_guard;
                                if let Err(err) = http
                                    .serve_connection(
                                        TokioIo::new(tcp_stream),
                                        TowerToHyperService::new(svc),
                                    )
                                    .await
                                {
                                    event!(
                                        target: "trellis::services",
                                        Level::ERROR,
                                        ?err,
                                        "Failed running service"
                                    );
                                }
                            },
                            target: "trellis::services",
                            ?remote_addr,
                            ?socket_addr,
                        );
                    }
                    Err(err) => {
                        event!(Level::ERROR, ?err, "Failed to accept tcp connection");
                    }
                }
            }
            // Unreachable
        }));
    }

    if let Err(e) = try_join_all(root_futures).await {
        panic!("{e:?}");
    }

    Ok(())
}

async fn get_config() -> Result<TrellisConfig, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(TrellisConfig::try_from_json5_file(&args.config_file)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let cfg = futures::executor::block_on(get_config())?;

    #[allow(clippy::disallowed_methods)]
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        runtime.spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen to SIGINT");
            eprintln!("User terminated process via SIGINT");
            std::process::exit(130);
        });

        #[cfg(target_family = "unix")]
        runtime.spawn(async move {
            signal(SignalKind::terminate())
                .expect("Failed to listen to SIGTERM")
                .recv()
                .await;
            event!(Level::WARN, "Process terminated via SIGTERM",);
            std::process::exit(143);
        });

        runtime
            .block_on(inner_main(cfg))
            .err_tip(|| "main() function failed")?;
    }
    Ok(())
}
