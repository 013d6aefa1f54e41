use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use pubsub_console_emulator_manager::testing::{MockProbe, MockProcessControl};
use pubsub_console_emulator_manager::{
    instance_name, EmulatorConfig, EmulatorEvent, EmulatorInstance, EmulatorManager,
    EmulatorManagerConfig, EmulatorStatus,
};
use pubsub_console_error::ConsoleError;

fn fast_config() -> EmulatorManagerConfig {
    EmulatorManagerConfig {
        ready_attempts: 3,
        ready_interval: Duration::from_millis(10),
        stop_grace: Duration::from_millis(10),
        exit_poll_interval: Duration::from_millis(20),
    }
}

fn manager_with(
    control: &Arc<MockProcessControl>,
    probe: Arc<MockProbe>,
) -> EmulatorManager {
    EmulatorManager::with_probe(control.clone(), probe, fast_config())
}

fn config_on(port: u16) -> EmulatorConfig {
    EmulatorConfig {
        port: Some(port),
        ..EmulatorConfig::default()
    }
}

async fn wait_for_status(
    manager: &EmulatorManager,
    profile_id: &str,
    status: EmulatorStatus,
) -> EmulatorInstance {
    let deadline = Duration::from_secs(5);
    let result = timeout(deadline, async {
        loop {
            if let Some(instance) = manager.get_status(profile_id) {
                if instance.status == status {
                    return instance;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    match result {
        Ok(instance) => instance,
        Err(_) => panic!("instance for {profile_id} never reached {status:?}"),
    }
}

#[tokio::test]
async fn start_launches_and_becomes_running() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());

    let endpoint = manager.ensure_ready("dev", &config_on(18085)).await.unwrap();
    assert_eq!(endpoint.address(), "127.0.0.1:18085");
    assert!(manager.is_running("dev"));

    let launches = control.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].name, instance_name("dev"));
    assert_eq!(launches[0].port, 18085);
    assert_eq!(launches[0].bind_host, "127.0.0.1");
}

#[tokio::test]
async fn double_start_launches_exactly_once() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());
    let config = config_on(18086);

    manager.start("dev", &config).await.unwrap();
    manager.start("dev", &config).await.unwrap();
    wait_for_status(&manager, "dev", EmulatorStatus::Running).await;
    manager.start("dev", &config).await.unwrap();

    assert_eq!(control.launches().len(), 1);
}

#[tokio::test]
async fn adopts_externally_running_instance() {
    let control = MockProcessControl::new();
    control.add_container(&instance_name("dev"), true);
    let manager = manager_with(&control, MockProbe::ready());

    manager.start("dev", &config_on(18087)).await.unwrap();

    assert!(manager.is_running("dev"));
    assert!(control.launches().is_empty());
}

#[tokio::test]
async fn removes_stale_container_before_launching() {
    let control = MockProcessControl::new();
    control.add_container(&instance_name("dev"), false);
    let manager = manager_with(&control, MockProbe::ready());

    manager.ensure_ready("dev", &config_on(18088)).await.unwrap();

    assert_eq!(control.launches().len(), 1);
    assert!(control
        .removes()
        .iter()
        .any(|(name, force)| name == &instance_name("dev") && *force));
}

#[tokio::test]
async fn unavailable_runtime_blocks_start_before_any_state() {
    let control = MockProcessControl::new();
    control.deny_runtime("cannot connect to the daemon");
    let manager = manager_with(&control, MockProbe::ready());

    let err = manager.start("dev", &EmulatorConfig::default()).await.unwrap_err();
    assert!(matches!(err, ConsoleError::EmulatorUnavailable { .. }));
    assert!(manager.get_status("dev").is_none());
}

#[tokio::test]
async fn occupied_port_blocks_start() {
    let listener = TcpListener::bind("127.0.0.1:18089").unwrap();
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());

    let err = manager.start("dev", &config_on(18089)).await.unwrap_err();
    assert!(matches!(err, ConsoleError::PortInUse { port: 18089 }));
    assert!(control.launches().is_empty());
    assert!(manager.get_status("dev").is_none());
    drop(listener);
}

#[tokio::test]
async fn readiness_timeout_records_error_status() {
    let control = MockProcessControl::new();
    let probe = MockProbe::never();
    let manager = manager_with(&control, probe.clone());
    let mut events = manager.subscribe();

    manager.start("dev", &config_on(18090)).await.unwrap();
    let instance = wait_for_status(&manager, "dev", EmulatorStatus::Error).await;
    assert!(instance.error.unwrap().contains("readiness"));
    assert_eq!(probe.checks(), 3);

    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, EmulatorEvent::Error { .. }));

    let err = manager
        .ensure_ready("dev2", &config_on(18091))
        .await
        .map(|_| ());
    // A second profile with the same never-ready probe fails through
    // ensure_ready with the recorded message.
    assert!(matches!(
        err,
        Err(ConsoleError::EmulatorNotReady { .. })
    ));
}

#[tokio::test]
async fn stop_tears_down_and_clears_bookkeeping() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());
    let name = instance_name("dev");

    manager.ensure_ready("dev", &config_on(18092)).await.unwrap();
    manager.stop("dev").await.unwrap();

    assert!(manager.get_status("dev").is_none());
    assert!(!manager.is_running("dev"));
    assert!(control.stops().contains(&name));
    assert!(!control.container_exists(&name));
}

#[tokio::test]
async fn stop_without_instance_is_a_no_op() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());
    manager.stop("ghost").await.unwrap();
    assert!(control.stops().is_empty());
}

#[tokio::test]
async fn start_stop_start_reuses_one_name_without_port_conflict() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());
    let config = config_on(18093);

    manager.ensure_ready("p1", &config).await.unwrap();
    manager.stop("p1").await.unwrap();
    manager.ensure_ready("p1", &config).await.unwrap();

    assert!(manager.is_running("p1"));
    let launches = control.launches();
    assert_eq!(launches.len(), 2);
    assert!(launches.iter().all(|spec| spec.name == instance_name("p1")));
}

#[tokio::test]
async fn get_status_returns_a_defensive_copy() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());

    manager.ensure_ready("dev", &config_on(18094)).await.unwrap();

    let mut snapshot = manager.get_status("dev").unwrap();
    snapshot.status = EmulatorStatus::Error;
    snapshot.error = Some("mutated by caller".to_string());

    let fresh = manager.get_status("dev").unwrap();
    assert_eq!(fresh.status, EmulatorStatus::Running);
    assert!(fresh.error.is_none());
}

#[tokio::test]
async fn unexpected_exit_is_recorded_as_error() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());
    let mut events = manager.subscribe();

    manager.ensure_ready("dev", &config_on(18095)).await.unwrap();
    control.mark_exited(&instance_name("dev"));

    let instance = wait_for_status(&manager, "dev", EmulatorStatus::Error).await;
    assert_eq!(instance.error.as_deref(), Some("emulator exited unexpectedly"));

    let mut saw_error = false;
    while let Ok(Ok(event)) = timeout(Duration::from_secs(1), events.recv()).await {
        if matches!(event, EmulatorEvent::Error { .. }) {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn stop_all_stops_every_tracked_instance() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());

    manager.ensure_ready("p1", &config_on(18096)).await.unwrap();
    manager.ensure_ready("p2", &config_on(18097)).await.unwrap();
    manager.stop_all().await;

    assert!(manager.get_status("p1").is_none());
    assert!(manager.get_status("p2").is_none());
}

#[tokio::test]
async fn adopt_only_tracks_existing_instances() {
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());

    assert!(!manager.adopt("dev", &config_on(18098)).await.unwrap());
    assert!(manager.get_status("dev").is_none());

    control.add_container(&instance_name("dev"), true);
    assert!(manager.adopt("dev", &config_on(18098)).await.unwrap());
    assert!(manager.is_running("dev"));
    assert!(control.launches().is_empty());
}

#[tokio::test]
async fn data_dir_is_passed_through_to_the_launch() {
    let data_dir = tempfile::tempdir().unwrap();
    let control = MockProcessControl::new();
    let manager = manager_with(&control, MockProbe::ready());
    let config = EmulatorConfig {
        port: Some(18099),
        data_dir: Some(data_dir.path().to_path_buf()),
        ..EmulatorConfig::default()
    };

    manager.ensure_ready("dev", &config).await.unwrap();

    let launches = control.launches();
    assert_eq!(launches[0].data_dir.as_deref(), Some(data_dir.path()));
}
