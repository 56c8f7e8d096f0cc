//! Adoption against a running supervisor.
//!
//! The supervisor runs in-process over the simulated backend; clients
//! reach it through duplex streams and target processes live in a fake
//! procfs.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use procgov_common::config::SupervisorConfig;
use procgov_common::error::ProcgovError;
use procgov_common::types::JobSettings;
use procgov_core::job::JobBackend;
use procgov_core::process::{Bitness, ProcessInspector};
use procgov_core::sim::SimulatedBackend;
use procgov_core::topology::StaticTopology;
use procgov_ipc::protocol::Notification;
use procgov_sdk::adoption::{Adopter, AdoptionReport, AdoptionRequest};
use procgov_sdk::builder::JobSettingsBuilder;
use procgov_sdk::client::GatewayClient;
use procgov_supervisor::Supervisor;
use procgov_supervisor::supervisor::EventLoop;
use tempfile::TempDir;
use tokio::io::DuplexStream;

const STEP: Duration = Duration::from_secs(5);

struct World {
    backend: Arc<SimulatedBackend>,
    supervisor: Supervisor,
    _events: EventLoop,
    proc_root: TempDir,
    inspector: ProcessInspector,
}

impl World {
    fn start() -> Self {
        Self::with_config(SupervisorConfig {
            idle_timeout_ms: 60_000,
            poll_interval_ms: 5,
            ..SupervisorConfig::default()
        })
    }

    fn with_config(config: SupervisorConfig) -> Self {
        let backend = Arc::new(SimulatedBackend::new());
        let supervisor = Supervisor::new(
            config,
            backend.clone(),
            Arc::new(StaticTopology::uniform(8)),
        );
        let events = supervisor.start_event_loop().expect("event loop");
        let proc_root = tempfile::tempdir().expect("proc root");
        let inspector = ProcessInspector::with_proc_root(proc_root.path());
        Self {
            backend,
            supervisor,
            _events: events,
            proc_root,
            inspector,
        }
    }

    fn client(&self) -> GatewayClient<DuplexStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let gateway = Arc::clone(self.supervisor.gateway());
        let _task = tokio::spawn(async move { gateway.handle_connection(server).await });
        GatewayClient::new(client)
    }

    fn adopter(&self) -> Adopter<'_> {
        Adopter::new(self.backend.as_ref(), &self.inspector)
    }

    fn spawn(&self, pid: u32) {
        add_process(self.proc_root.path(), pid);
    }

    async fn adopt(
        &self,
        name: Option<&str>,
        pids: &[u32],
        settings: JobSettings,
    ) -> Result<AdoptionReport, ProcgovError> {
        let mut client = self.client();
        self.adopter()
            .adopt(
                &mut client,
                &AdoptionRequest {
                    name: name.map(str::to_owned),
                    pids: pids.to_vec(),
                    settings,
                },
            )
            .await
    }

    async fn wait_tracked(&self, pid: u32) {
        let registry = Arc::clone(self.supervisor.registry());
        tokio::time::timeout(STEP, async {
            while registry.job_for_pid(pid).is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("supervisor tracks the process");
    }

    fn stop(&self) {
        self.supervisor.cancellation_token().cancel();
    }
}

fn add_process(root: &Path, pid: u32) {
    let class = if Bitness::current() == Bitness::Bits64 { 2 } else { 1 };
    let dir = root.join(pid.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("exe"), [0x7f, b'E', b'L', b'F', class]).unwrap();
    std::fs::write(dir.join("environ"), b"PATH=/bin\0").unwrap();
}

// ── Fresh jobs ───────────────────────────────────────────────────────

#[tokio::test]
async fn untracked_processes_get_a_new_job() {
    let world = World::start();
    world.spawn(100);
    world.spawn(200);

    let report = world
        .adopt(Some("web"), &[100, 200], JobSettings::default())
        .await
        .unwrap();
    assert_eq!(report.name, "web");
    assert_eq!(report.assigned, vec![100, 200]);
    assert_eq!(world.backend.created_jobs(), vec!["web".to_owned()]);

    world.wait_tracked(100).await;
    world.wait_tracked(200).await;
    let job = world.supervisor.registry().job_by_name("web").unwrap();
    assert_eq!(job.members, 2);
    world.stop();
}

#[tokio::test]
async fn unnamed_adoption_generates_a_name() {
    let world = World::start();
    world.spawn(7);
    let report = world.adopt(None, &[7], JobSettings::default()).await.unwrap();
    assert!(report.name.starts_with("procgov-"));
    assert!(world.backend.members(&report.name).contains(&7));
    world.stop();
}

// ── Existing jobs ────────────────────────────────────────────────────

#[tokio::test]
async fn tracked_process_pulls_request_into_its_job() {
    let world = World::start();
    world.spawn(20);
    world.spawn(21);
    let _ = world
        .adopt(Some("db"), &[20], JobSettings::default())
        .await
        .unwrap();
    world.wait_tracked(20).await;

    let topology = StaticTopology::uniform(8);
    let update = JobSettingsBuilder::new()
        .max_job_memory(1 << 30)
        .build(&topology)
        .unwrap();
    let report = world.adopt(None, &[20, 21], update.settings).await.unwrap();
    assert_eq!(report.name, "db");
    assert_eq!(report.already_members, vec![20]);
    assert_eq!(report.assigned, vec![21]);
    assert_eq!(world.backend.created_jobs().len(), 1);

    let mut client = world.client();
    let stored = client.get_job_settings("db").await.unwrap().unwrap();
    assert_eq!(stored.max_job_memory, 1 << 30);
    world.stop();
}

#[tokio::test]
async fn conflicting_adoption_mutates_neither_job() {
    let world = World::start();
    for pid in [1, 2] {
        world.spawn(pid);
    }
    let _ = world.adopt(Some("a"), &[1], JobSettings::default()).await.unwrap();
    let _ = world.adopt(Some("b"), &[2], JobSettings::default()).await.unwrap();
    world.wait_tracked(1).await;
    world.wait_tracked(2).await;
    let calls_a = world.backend.applied_calls("a");
    let calls_b = world.backend.applied_calls("b");

    let settings = JobSettings {
        max_job_memory: 4096,
        ..JobSettings::default()
    };
    let err = world.adopt(None, &[1, 2], settings).await.unwrap_err();
    assert!(matches!(err, ProcgovError::JobConflict { .. }));

    assert_eq!(world.backend.applied_calls("a"), calls_a);
    assert_eq!(world.backend.applied_calls("b"), calls_b);
    assert_eq!(world.backend.members("a").into_iter().collect::<Vec<_>>(), vec![1]);
    assert_eq!(world.backend.members("b").into_iter().collect::<Vec<_>>(), vec![2]);
    assert_eq!(world.backend.created_jobs().len(), 2);
    world.stop();
}

#[tokio::test]
async fn requested_name_conflicting_with_discovery_is_rejected() {
    let world = World::start();
    world.spawn(3);
    let _ = world.adopt(Some("a"), &[3], JobSettings::default()).await.unwrap();
    world.wait_tracked(3).await;

    let err = world
        .adopt(Some("other"), &[3], JobSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcgovError::JobNameMismatch { .. }));
    assert!(world.backend.open_job("other").unwrap().is_none());
    world.stop();
}

#[tokio::test]
async fn missing_target_is_rejected_before_any_job_exists() {
    let world = World::start();
    world.spawn(4);
    let err = world
        .adopt(Some("x"), &[4, 999], JobSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcgovError::Validation { .. }));
    assert!(world.backend.created_jobs().is_empty());
    world.stop();
}

#[tokio::test]
async fn failed_assignment_leaves_no_job_behind() {
    let world = World::with_config(SupervisorConfig {
        idle_timeout_ms: 60_000,
        poll_interval_ms: 5,
        memberless_grace_ms: Some(50),
        ..SupervisorConfig::default()
    });
    world.spawn(31);
    world.backend.vanish_process(31);

    let err = world
        .adopt(Some("stillborn"), &[31], JobSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcgovError::NothingAssigned { failed: 1, .. }));
    assert_eq!(world.backend.created_jobs(), vec!["stillborn".to_owned()]);

    let registry = Arc::clone(world.supervisor.registry());
    tokio::time::timeout(STEP, async {
        while !registry.is_empty() || !world.backend.is_released("stillborn") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("memberless job is dropped");
    world.stop();
}

// ── Subscription ─────────────────────────────────────────────────────

#[tokio::test]
async fn subscribed_adoption_sees_the_whole_lifecycle() {
    let world = World::start();
    world.spawn(50);
    let request = AdoptionRequest {
        name: Some("watched".into()),
        pids: vec![50],
        settings: JobSettings::default(),
    };
    let (report, mut events) = world
        .adopter()
        .adopt_and_subscribe(world.client(), &request)
        .await
        .unwrap();
    assert_eq!(report.assigned, vec![50]);
    assert_eq!(events.job(), "watched");

    let first = tokio::time::timeout(STEP, events.next()).await.unwrap().unwrap();
    assert_eq!(
        first,
        Some(Notification::NewProcess {
            name: "watched".into(),
            pid: 50
        })
    );

    world.backend.exit_process("watched", 50).unwrap();
    let mut rest = Vec::new();
    while let Some(event) = tokio::time::timeout(STEP, events.next()).await.unwrap().unwrap() {
        rest.push(event);
    }
    assert_eq!(
        rest,
        vec![
            Notification::ExitProcess {
                name: "watched".into(),
                pid: 50,
                abnormal: false
            },
            Notification::NoActiveProcesses {
                name: "watched".into()
            },
        ]
    );
    world.stop();
}
