//! Agent end to end: real `catdog-module` processes on a loopback relay.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use std::sync::Arc;

use catdog_agent::config::{MonitorConf, RelayConf, VibesConf};
use catdog_agent::{Agent, AgentConfig, AgentError, ModuleFault, ModuleSpec};
use catdog_core::{ConnectionStatus, GlobalChannel, LinkClient, Message};
use catdog_devkit::{free_tcp_port, init_tracing, wait_until, RecordingObserver};
use parking_lot::Mutex;
use serde_json::{json, Value};
use time::OffsetDateTime;

fn launcher() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_catdog-module"))
}

fn module(name: &str, id: &str, params: Value) -> ModuleSpec {
    ModuleSpec {
        name: name.into(),
        module: id.into(),
        params,
        env: HashMap::new(),
    }
}

fn config(modules: Vec<ModuleSpec>) -> AgentConfig {
    AgentConfig {
        relay: RelayConf {
            serve: true,
            bind: "127.0.0.1:0".into(),
            address: String::new(),
        },
        vibes: VibesConf {
            enabled: false,
            ..VibesConf::default()
        },
        monitor: MonitorConf {
            heartbeat_timeout_secs: 2.0,
            check_interval_secs: 0.2,
            startup_timeout_secs: 10.0,
            heartbeat_interval_ms: 200,
            shutdown_grace_secs: 3.0,
        },
        launcher: Some(launcher()),
        modules,
        ..AgentConfig::default()
    }
}

fn sensor_and_speaker(port: u16) -> Vec<ModuleSpec> {
    vec![
        module(
            "sensor",
            "debug.dummy_sensor",
            json!({"host": "127.0.0.1", "port": port, "interval_ms": 200}),
        ),
        module(
            "speaker",
            "debug.dummy_actuator",
            json!({"upstream": {"host": "127.0.0.1", "port": port}, "reconnect_ms": 100}),
        ),
    ]
}

#[tokio::test]
async fn test_modules_come_online_and_stop() {
    init_tracing();
    let port = free_tcp_port().unwrap();
    let mut agent = Agent::new(config(sensor_and_speaker(port))).unwrap();

    agent.start().await.unwrap();
    let snapshot = agent.heartbeats().snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(agent.heartbeats().pending().is_empty(), "{snapshot:?}");

    let health = agent.health_snapshot();
    assert!(health["modules"].get("sensor").is_some());
    assert!(health.contains_key("cpu"));
    assert!(agent.check_modules().await.is_empty());

    assert!(matches!(agent.start().await, Err(AgentError::AlreadyStarted)));

    agent.stop().await;
    for (name, pid) in agent.module_pids().await {
        assert!(pid.is_none(), "{name} still running");
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_module_is_reported() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    init_tracing();
    let port = free_tcp_port().unwrap();
    let cfg = config(sensor_and_speaker(port));
    let monitor = cfg.monitor.clone();
    let mut agent = Agent::new(cfg).unwrap();
    agent.start().await.unwrap();
    let mut faults = agent.subscribe_faults();

    let pid = agent
        .module_pids()
        .await
        .into_iter()
        .find(|(name, _)| name == "speaker")
        .and_then(|(_, pid)| pid)
        .unwrap();
    let last_seen = agent.heartbeats().get("speaker").unwrap().last_seen;
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let flagged_within = monitor.check_interval() + monitor.heartbeat_timeout() + Duration::from_millis(750);
    let mut exited = false;
    let silent_for = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match faults.recv().await {
                Ok(ModuleFault::Exited { module, .. }) if module == "speaker" => exited = true,
                Ok(ModuleFault::MissedHeartbeat { module, .. }) if module == "speaker" => {
                    break OffsetDateTime::now_utc() - last_seen;
                }
                Ok(_) => continue,
                Err(e) => panic!("fault channel failed: {e}"),
            }
        }
    })
    .await
    .unwrap();

    assert!(exited, "process exit was not reported before the missed heartbeat");
    assert!(
        silent_for.as_seconds_f64() <= flagged_within.as_secs_f64(),
        "flagged {silent_for} after the last heartbeat, allowed {flagged_within:?}"
    );
    assert_eq!(agent.heartbeats().get("sensor").unwrap().status_label(), "operational");

    agent.stop().await;
}

#[tokio::test]
async fn test_reading_is_played_exactly_once_across_processes() {
    init_tracing();
    let relay = GlobalChannel::start("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().to_string();

    // Écoute du canal global avant que les modules n'existent
    let announced = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = announced.clone();
    let observer = RecordingObserver::new();
    let listener = LinkClient::new(relay_addr.clone())
        .with_backoff(Duration::from_millis(50))
        .with_observer(observer.shared())
        .spawn(move |message: Message| {
            if !message.is_heartbeat() {
                sink.lock().push(message);
            }
        });
    wait_until(Duration::from_secs(5), || observer.last() == Some(ConnectionStatus::Connected))
        .await
        .unwrap();

    let port = free_tcp_port().unwrap();
    let mut cfg = config(vec![
        module(
            "sensor",
            "debug.dummy_sensor",
            json!({"host": "127.0.0.1", "port": port, "value": 10, "interval_ms": 100, "max_messages": 1}),
        ),
        module(
            "speaker",
            "debug.dummy_actuator",
            json!({"upstream": {"host": "127.0.0.1", "port": port}, "reconnect_ms": 100}),
        ),
    ]);
    cfg.relay = RelayConf {
        serve: false,
        bind: "127.0.0.1:0".into(),
        address: relay_addr,
    };

    let mut agent = Agent::new(cfg).unwrap();
    agent.start().await.unwrap();
    assert!(agent.heartbeats().pending().is_empty());

    wait_until(Duration::from_secs(10), || !announced.lock().is_empty())
        .await
        .unwrap();
    // Le capteur ne doit plus rien émettre
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = announced.lock().clone();
    assert_eq!(events.len(), 1, "{events:?}");
    assert_eq!(events[0].sender(), "speaker");
    assert_eq!(
        Value::Object(events[0].content().clone()),
        json!({"event": "played", "count": 1, "from": "sensor", "payload": {"value": 10, "play_sound": true}})
    );

    agent.stop().await;
    listener.join().await;
    relay.shutdown();
}

#[tokio::test]
async fn test_startup_times_out_without_relay() {
    init_tracing();
    let dead_relay = free_tcp_port().unwrap();
    let mut cfg = config(vec![module(
        "sensor",
        "debug.dummy_sensor",
        json!({"host": "127.0.0.1", "port": free_tcp_port().unwrap()}),
    )]);
    cfg.relay = RelayConf {
        serve: false,
        bind: "127.0.0.1:0".into(),
        address: format!("127.0.0.1:{dead_relay}"),
    };
    cfg.monitor.startup_timeout_secs = 1.0;
    cfg.monitor.shutdown_grace_secs = 1.0;

    let mut agent = Agent::new(cfg).unwrap();
    match agent.start().await {
        Err(AgentError::StartupTimeout { pending }) => assert_eq!(pending, vec!["sensor".to_string()]),
        other => panic!("expected a startup timeout, got {other:?}"),
    }
    for (_, pid) in agent.module_pids().await {
        assert!(pid.is_none());
    }
}

#[tokio::test]
async fn test_boot_failure_aborts_startup() {
    init_tracing();
    let mut agent = Agent::new(config(vec![module(
        "speaker",
        "debug.dummy_actuator",
        json!({"required_asset": "/definitely/not/a/sound.wav"}),
    )]))
    .unwrap();

    match agent.start().await {
        Err(AgentError::ModuleExited { name, code }) => {
            assert_eq!(name, "speaker");
            assert_eq!(code, Some(3));
        }
        other => panic!("expected the module to exit, got {other:?}"),
    }
}

#[test]
fn test_launcher_exit_codes() {
    let unknown = Command::new(launcher())
        .args(["--module", "debug.nope"])
        .env_remove("CATDOG_RELAY_ADDR")
        .status()
        .unwrap();
    assert_eq!(unknown.code(), Some(2));

    let bad_params = Command::new(launcher())
        .args(["--module", "debug.dummy_sensor", "--params", "{\"colour\": \"red\"}"])
        .env_remove("CATDOG_RELAY_ADDR")
        .status()
        .unwrap();
    assert_eq!(bad_params.code(), Some(2));

    let boot = Command::new(launcher())
        .args([
            "--module",
            "debug.dummy_actuator",
            "--params",
            "{\"required_asset\": \"/definitely/not/a/sound.wav\"}",
        ])
        .env_remove("CATDOG_RELAY_ADDR")
        .status()
        .unwrap();
    assert_eq!(boot.code(), Some(3));
}

#[tokio::test]
async fn test_roster_loads_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.yaml");
    std::fs::write(
        &path,
        r#"
device: { name: kitchen }
relay: { serve: true, bind: "127.0.0.1:0" }
vibes: { enabled: false }
modules:
  - { name: sensor, module: debug.dummy_sensor, params: { port: 9100 } }
  - name: speaker
    module: debug.dummy_actuator
    params: { upstream: { host: 127.0.0.1, port: 9100 } }
    env: { RUST_LOG: debug }
"#,
    )
    .unwrap();

    let cfg = AgentConfig::load(&path).await.unwrap();
    assert_eq!(cfg.device.name, "kitchen");
    assert!(cfg.relay.serve);
    assert!(!cfg.vibes.enabled);
    assert_eq!(cfg.modules.len(), 2);
    assert_eq!(cfg.modules[1].env.get("RUST_LOG").map(String::as_str), Some("debug"));
    assert_eq!(cfg.monitor.heartbeat_timeout_secs, 10.0);

    let missing = AgentConfig::load(dir.path().join("nope.yaml")).await;
    assert!(missing.is_err());
}
