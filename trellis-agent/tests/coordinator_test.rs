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
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use trellis_agent::authority_client::AddressAuthority;
use trellis_agent::coordinator::{
    ADDRESS_LABEL, HOST_LABEL, MANAGED_LABEL, NetworkStatus, ProvisioningCoordinator, StepStatus,
};
use trellis_agent::overlay_client::{OverlayNetwork, OverlaySummary};
use trellis_agent::runtime_client::{
    ContainerRuntime, ExecOutput, WorkloadId, WorkloadInfo, WorkloadSpec,
};
use trellis_allocator::address_allocator::AddressAllocator;
use trellis_config::pools::{AddressRangeSpec, MemoryPoolSpec, Retry};
use trellis_config::server::AgentConfig;
use trellis_error::{Code, Error, make_err};
use trellis_macro::trellis_test;
use trellis_store::address_range::AddressRange;
use trellis_store::memory_pool::MemoryPoolStore;
use trellis_store::pool_store::Binding;

/// In-process runtime double. Created workloads land in a map so
/// inspect and list see exactly what create recorded.
#[derive(Default)]
struct FakeRuntime {
    workloads: Mutex<HashMap<String, WorkloadInfo>>,
    created: Mutex<Vec<WorkloadSpec>>,
    removed: Mutex<Vec<String>>,
    exec_commands: Mutex<Vec<Vec<String>>>,
    exec_output: Mutex<Option<ExecOutput>>,
    fail_create: AtomicBool,
    fail_remove: AtomicBool,
    hang_create: AtomicBool,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &WorkloadSpec) -> Result<WorkloadId, Error> {
        if self.hang_create.load(Ordering::Acquire) {
            futures::future::pending::<()>().await;
        }
        if self.fail_create.load(Ordering::Acquire) {
            return Err(make_err!(Code::Internal, "Runtime refused creation"));
        }
        self.created.lock().push(spec.clone());
        let id = WorkloadId(format!("id-{}", spec.name));
        self.workloads.lock().insert(
            spec.name.clone(),
            WorkloadInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: "running".to_string(),
                labels: spec.labels.clone(),
                address: None,
            },
        );
        Ok(id)
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<(), Error> {
        if self.fail_remove.load(Ordering::Acquire) {
            return Err(make_err!(Code::Internal, "Runtime refused removal"));
        }
        self.workloads.lock().remove(name);
        self.removed.lock().push(name.to_string());
        Ok(())
    }

    async fn exec(&self, _name: &str, command: &[String]) -> Result<ExecOutput, Error> {
        self.exec_commands.lock().push(command.to_vec());
        Ok(self.exec_output.lock().clone().unwrap_or(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    async fn inspect(&self, name: &str) -> Result<Option<WorkloadInfo>, Error> {
        Ok(self.workloads.lock().get(name).cloned())
    }

    async fn list_managed(&self) -> Result<Vec<WorkloadInfo>, Error> {
        Ok(self
            .workloads
            .lock()
            .values()
            .filter(|info| info.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true"))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeOverlay {
    attached: Mutex<Vec<(String, Ipv4Addr)>>,
    detached: Mutex<Vec<String>>,
    fail_attach: AtomicBool,
    fail_detach: AtomicBool,
}

#[async_trait]
impl OverlayNetwork for FakeOverlay {
    async fn attach(&self, workload: &str, address: Ipv4Addr) -> Result<(), Error> {
        if self.fail_attach.load(Ordering::Acquire) {
            return Err(make_err!(Code::Unavailable, "Overlay attach rejected"));
        }
        self.attached.lock().push((workload.to_string(), address));
        Ok(())
    }

    async fn detach(&self, workload: &str) -> Result<(), Error> {
        if self.fail_detach.load(Ordering::Acquire) {
            return Err(make_err!(Code::Unavailable, "Overlay detach rejected"));
        }
        self.detached.lock().push(workload.to_string());
        Ok(())
    }

    async fn describe(&self) -> Result<OverlaySummary, Error> {
        Ok(OverlaySummary {
            name: "trellis0".to_string(),
            subnet: "10.1.0.0/24".to_string(),
        })
    }
}

/// Authority double backed by a real allocator so binding bookkeeping
/// behaves exactly as it does in the service.
struct FakeAuthority {
    allocator: AddressAllocator,
    fail_release: AtomicBool,
    /// When set, the next check reports the name as unbound even if a
    /// binding exists, mimicking a lookup that raced a remote allocate.
    hide_next_check: AtomicBool,
}

#[async_trait]
impl AddressAuthority for FakeAuthority {
    async fn check(&self, name: &str) -> Result<Option<Binding>, Error> {
        if self.hide_next_check.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }
        self.allocator.lookup(name).await
    }

    async fn allocate(&self, name: &str, host: &str) -> Result<Binding, Error> {
        self.allocator.allocate(name, host).await
    }

    async fn release(&self, name: &str) -> Result<Ipv4Addr, Error> {
        if self.fail_release.load(Ordering::Acquire) {
            return Err(make_err!(Code::Unavailable, "Authority offline"));
        }
        self.allocator.release(name).await
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

struct Harness {
    runtime: Arc<FakeRuntime>,
    overlay: Arc<FakeOverlay>,
    authority: Arc<FakeAuthority>,
    coordinator: Arc<ProvisioningCoordinator>,
}

fn test_config(step_timeout_ms: u64) -> AgentConfig {
    AgentConfig {
        host_id: Some("host-a".to_string()),
        authority_endpoint: "http://authority.test".to_string(),
        runtime_endpoint: String::new(),
        overlay_endpoint: String::new(),
        default_image: String::new(),
        step_timeout_ms,
        retry: Retry::default(),
    }
}

async fn make_harness_with(range_end: &str, step_timeout_ms: u64) -> Result<Harness, Error> {
    let pool = MemoryPoolStore::new(&MemoryPoolSpec::default());
    let allocator = AddressAllocator::new(
        pool,
        AddressRange::new(&AddressRangeSpec {
            subnet: "10.1.0.0/24".to_string(),
            range_start: "10.1.0.2".to_string(),
            range_end: range_end.to_string(),
            reserved: vec![],
        })?,
    );
    allocator.bootstrap().await?;
    let runtime = Arc::new(FakeRuntime::default());
    let overlay = Arc::new(FakeOverlay::default());
    let authority = Arc::new(FakeAuthority {
        allocator,
        fail_release: AtomicBool::new(false),
        hide_next_check: AtomicBool::new(false),
    });
    let coordinator = ProvisioningCoordinator::new(
        &test_config(step_timeout_ms),
        runtime.clone(),
        overlay.clone(),
        authority.clone(),
    );
    Ok(Harness {
        runtime,
        overlay,
        authority,
        coordinator,
    })
}

async fn make_harness(range_end: &str) -> Result<Harness, Error> {
    make_harness_with(range_end, 0).await
}

#[trellis_test]
async fn provision_creates_labeled_workload_and_attaches_it() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;

    let outcome = harness.coordinator.provision("web-a", None).await?;

    assert_eq!(outcome.workload_id, WorkloadId("id-web-a".to_string()));
    assert_eq!(outcome.name, "web-a");
    assert_eq!(outcome.address, Ipv4Addr::new(10, 1, 0, 2));
    assert_eq!(outcome.host, "host-a");
    assert_eq!(outcome.image, "nginx:alpine");
    assert_eq!(outcome.network_status, NetworkStatus::Attached);

    let created = harness.runtime.created.lock();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].labels.get(MANAGED_LABEL), Some(&"true".to_string()));
    assert_eq!(
        created[0].labels.get(ADDRESS_LABEL),
        Some(&"10.1.0.2".to_string())
    );
    assert_eq!(created[0].labels.get(HOST_LABEL), Some(&"host-a".to_string()));
    drop(created);

    assert_eq!(
        *harness.overlay.attached.lock(),
        vec![("web-a".to_string(), Ipv4Addr::new(10, 1, 0, 2))]
    );
    Ok(())
}

#[trellis_test]
async fn provision_uses_the_requested_image() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;

    let outcome = harness.coordinator.provision("web-a", Some("redis:7")).await?;

    assert_eq!(outcome.image, "redis:7");
    assert_eq!(harness.runtime.created.lock()[0].image, "redis:7");
    Ok(())
}

#[trellis_test]
async fn duplicate_name_is_rejected_before_any_side_effects() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-a", None).await?;

    let err = harness
        .coordinator
        .provision("web-a", None)
        .await
        .expect_err("second provision of the same name must fail");

    assert_eq!(err.code, Code::AlreadyExists);
    assert!(
        err.to_string().contains("host-a"),
        "conflict should name the holding host: {err:?}"
    );
    assert_eq!(harness.runtime.created.lock().len(), 1);
    assert_eq!(harness.authority.allocator.stats().await?.allocated, 1);
    Ok(())
}

#[trellis_test]
async fn name_claimed_by_another_host_mid_provision_is_a_conflict() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    // host-b binds the name while our uniqueness check is in flight, so
    // the allocator hands us host-b's binding back.
    harness.authority.allocator.allocate("web-a", "host-b").await?;
    harness
        .authority
        .hide_next_check
        .store(true, Ordering::Release);

    let err = harness
        .coordinator
        .provision("web-a", None)
        .await
        .expect_err("a binding owned by another host must not be provisioned here");

    assert_eq!(err.code, Code::AlreadyExists);
    assert!(
        err.to_string().contains("host-b"),
        "the conflict should name the winning host: {err:?}"
    );
    // No workload was created and the winner keeps its binding.
    assert_eq!(harness.runtime.created.lock().len(), 0);
    let binding = harness
        .authority
        .allocator
        .lookup("web-a")
        .await?
        .expect("the winner's binding must survive");
    assert_eq!(binding.host, "host-b");
    Ok(())
}

#[trellis_test]
async fn failed_creation_releases_the_claimed_address() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.runtime.fail_create.store(true, Ordering::Release);

    let err = harness
        .coordinator
        .provision("web-a", None)
        .await
        .expect_err("provision must surface the creation failure");

    assert_eq!(err.code, Code::Internal);
    assert_eq!(harness.authority.check("web-a").await?, None);
    assert_eq!(harness.authority.allocator.stats().await?.allocated, 0);
    assert_eq!(harness.overlay.attached.lock().len(), 0);
    Ok(())
}

#[trellis_test]
async fn failed_creation_and_failed_release_surface_both_errors() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.runtime.fail_create.store(true, Ordering::Release);
    harness.authority.fail_release.store(true, Ordering::Release);

    let err = harness
        .coordinator
        .provision("web-a", None)
        .await
        .expect_err("provision must fail");

    // The creation error stays authoritative, the release failure rides
    // along in the message chain.
    assert_eq!(err.code, Code::Internal);
    let rendered = format!("{err:?}");
    assert!(rendered.contains("Runtime refused creation"), "{rendered}");
    assert!(rendered.contains("Authority offline"), "{rendered}");
    Ok(())
}

#[trellis_test]
async fn attach_failure_keeps_workload_and_binding() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.overlay.fail_attach.store(true, Ordering::Release);

    let outcome = harness.coordinator.provision("web-a", None).await?;

    match &outcome.network_status {
        NetworkStatus::Failed(reason) => {
            assert!(reason.contains("Overlay attach rejected"), "{reason}");
        }
        NetworkStatus::Attached => panic!("attach was supposed to fail"),
    }
    assert!(!outcome.network_status.is_attached());
    let binding = harness
        .authority
        .check("web-a")
        .await?
        .expect("binding must survive an attach failure");
    assert_eq!(binding.address, Ipv4Addr::new(10, 1, 0, 2));
    assert!(harness.runtime.workloads.lock().contains_key("web-a"));
    Ok(())
}

#[trellis_test]
async fn deprovision_runs_every_step_and_frees_the_address() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    let provisioned = harness.coordinator.provision("web-a", None).await?;

    let outcome = harness.coordinator.deprovision("web-a").await?;

    assert_eq!(outcome.name, "web-a");
    assert_eq!(outcome.freed, provisioned.address);
    assert_eq!(outcome.detach_status, StepStatus::Ok);
    assert_eq!(outcome.remove_status, StepStatus::Ok);
    assert_eq!(outcome.release_status, StepStatus::Ok);
    assert_eq!(*harness.overlay.detached.lock(), vec!["web-a".to_string()]);
    assert_eq!(*harness.runtime.removed.lock(), vec!["web-a".to_string()]);
    assert_eq!(harness.authority.check("web-a").await?, None);
    assert_eq!(harness.authority.allocator.stats().await?.allocated, 0);
    Ok(())
}

#[trellis_test]
async fn detach_failure_does_not_stop_a_teardown() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-a", None).await?;
    harness.overlay.fail_detach.store(true, Ordering::Release);

    let outcome = harness.coordinator.deprovision("web-a").await?;

    match &outcome.detach_status {
        StepStatus::Failed(reason) => {
            assert!(reason.contains("Overlay detach rejected"), "{reason}");
        }
        StepStatus::Ok => panic!("detach was supposed to fail"),
    }
    assert_eq!(outcome.remove_status, StepStatus::Ok);
    assert_eq!(outcome.release_status, StepStatus::Ok);
    assert_eq!(harness.authority.check("web-a").await?, None);
    Ok(())
}

#[trellis_test]
async fn release_still_runs_when_removal_fails() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-a", None).await?;
    harness.runtime.fail_remove.store(true, Ordering::Release);

    let err = harness
        .coordinator
        .deprovision("web-a")
        .await
        .expect_err("teardown must surface the removal failure");

    assert_eq!(err.code, Code::Internal);
    assert!(
        err.to_string().contains("still released"),
        "the caller should learn the address was freed anyway: {err:?}"
    );
    assert_eq!(harness.authority.check("web-a").await?, None);
    Ok(())
}

#[trellis_test]
async fn removal_and_release_failures_are_reported_together() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-a", None).await?;
    harness.runtime.fail_remove.store(true, Ordering::Release);
    harness.authority.fail_release.store(true, Ordering::Release);

    let err = harness
        .coordinator
        .deprovision("web-a")
        .await
        .expect_err("teardown must fail");

    let rendered = format!("{err:?}");
    assert!(rendered.contains("Runtime refused removal"), "{rendered}");
    assert!(rendered.contains("Authority offline"), "{rendered}");
    Ok(())
}

#[trellis_test]
async fn deprovision_of_an_unbound_name_says_so() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    // A managed workload whose binding is already gone, as after a
    // crashed teardown that released but failed to remove.
    harness.runtime.workloads.lock().insert(
        "orphan".to_string(),
        WorkloadInfo {
            id: WorkloadId("id-orphan".to_string()),
            name: "orphan".to_string(),
            image: "nginx:alpine".to_string(),
            state: "running".to_string(),
            labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
            address: None,
        },
    );

    let err = harness
        .coordinator
        .deprovision("orphan")
        .await
        .expect_err("the release step has nothing to free");

    assert_eq!(err.code, Code::NotFound);
    assert!(
        err.to_string().contains("was not bound"),
        "the message must not claim a binding survives: {err:?}"
    );
    // The workload itself was still removed.
    assert_eq!(*harness.runtime.removed.lock(), vec!["orphan".to_string()]);
    Ok(())
}

#[trellis_test]
async fn deprovision_of_an_unknown_name_is_not_found() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;

    let err = harness
        .coordinator
        .deprovision("ghost")
        .await
        .expect_err("nothing to tear down");

    assert_eq!(err.code, Code::NotFound);
    Ok(())
}

#[trellis_test]
async fn deprovision_refuses_unmanaged_workloads() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.runtime.workloads.lock().insert(
        "bystander".to_string(),
        WorkloadInfo {
            id: WorkloadId("id-bystander".to_string()),
            name: "bystander".to_string(),
            image: "alpine".to_string(),
            state: "running".to_string(),
            labels: HashMap::new(),
            address: None,
        },
    );

    let err = harness
        .coordinator
        .deprovision("bystander")
        .await
        .expect_err("unmanaged workloads are off limits");

    assert_eq!(err.code, Code::NotFound);
    assert_eq!(harness.runtime.removed.lock().len(), 0);
    Ok(())
}

#[trellis_test]
async fn freed_addresses_are_handed_out_again() -> Result<(), Error> {
    // Two usable addresses, three workloads.
    let harness = make_harness("10.1.0.3").await?;
    let first = harness.coordinator.provision("web-a", None).await?;
    harness.coordinator.provision("web-b", None).await?;

    let err = harness
        .coordinator
        .provision("web-c", None)
        .await
        .expect_err("the pool is exhausted");
    assert_eq!(err.code, Code::ResourceExhausted);

    harness.coordinator.deprovision("web-a").await?;
    let reclaimed = harness.coordinator.provision("web-c", None).await?;
    assert_eq!(reclaimed.address, first.address);
    Ok(())
}

#[trellis_test]
async fn ping_reports_exec_output_verbatim() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-a", None).await?;
    *harness.runtime.exec_output.lock() = Some(ExecOutput {
        exit_code: 0,
        stdout: "3 packets transmitted, 3 received".to_string(),
        stderr: String::new(),
    });

    let report = harness.coordinator.ping_workload("web-a", "10.1.0.3").await?;

    assert_eq!(report.name, "web-a");
    assert_eq!(report.target, "10.1.0.3");
    assert_eq!(report.exit_code, 0);
    assert!(report.success);
    assert_eq!(report.stdout, "3 packets transmitted, 3 received");
    assert_eq!(
        *harness.runtime.exec_commands.lock(),
        vec![vec![
            "ping".to_string(),
            "-c".to_string(),
            "3".to_string(),
            "10.1.0.3".to_string(),
        ]]
    );
    Ok(())
}

#[trellis_test]
async fn unreachable_ping_target_is_a_report_not_an_error() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-a", None).await?;
    *harness.runtime.exec_output.lock() = Some(ExecOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: "100% packet loss".to_string(),
    });

    let report = harness.coordinator.ping_workload("web-a", "10.9.9.9").await?;

    assert!(!report.success);
    assert_eq!(report.exit_code, 1);
    assert_eq!(report.stderr, "100% packet loss");
    Ok(())
}

#[trellis_test]
async fn ping_requires_a_target_and_a_managed_workload() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-a", None).await?;

    let err = harness
        .coordinator
        .ping_workload("web-a", "")
        .await
        .expect_err("an empty target is meaningless");
    assert_eq!(err.code, Code::InvalidArgument);

    let err = harness
        .coordinator
        .ping_workload("ghost", "10.1.0.3")
        .await
        .expect_err("no such workload");
    assert_eq!(err.code, Code::NotFound);
    Ok(())
}

#[trellis_test]
async fn list_reports_managed_workloads_sorted_by_name() -> Result<(), Error> {
    let harness = make_harness("10.1.0.5").await?;
    harness.coordinator.provision("web-b", None).await?;
    harness.coordinator.provision("web-a", Some("redis:7")).await?;

    let workloads = harness.coordinator.list_workloads().await?;

    assert_eq!(workloads.len(), 2);
    assert_eq!(workloads[0].name, "web-a");
    assert_eq!(workloads[0].image, "redis:7");
    assert_eq!(workloads[1].name, "web-b");
    assert_eq!(
        workloads[1].allocated_address,
        Some("10.1.0.2".to_string())
    );
    Ok(())
}

#[trellis_test]
async fn slow_creation_times_out_and_unwinds() -> Result<(), Error> {
    let harness = make_harness_with("10.1.0.5", 50).await?;
    harness.runtime.hang_create.store(true, Ordering::Release);

    let err = harness
        .coordinator
        .provision("web-a", None)
        .await
        .expect_err("a hung runtime call must not stall provisioning forever");

    assert_eq!(err.code, Code::DeadlineExceeded);
    assert_eq!(harness.authority.check("web-a").await?, None);
    assert_eq!(harness.authority.allocator.stats().await?.allocated, 0);
    Ok(())
}
