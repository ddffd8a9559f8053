use std::sync::Arc;
use std::time::Duration;

use catdog_core::{
    async_trait, HeartbeatStatus, Message, ModuleContext, ModuleDriver, ModuleError, ModuleRuntime,
    INBOX_CAPACITY,
};
use catdog_devkit::{init_tracing, wait_until, MockSink};
use parking_lot::Mutex;
use serde_json::json;

const BEAT: Duration = Duration::from_millis(50);

#[derive(Default, Clone)]
struct Script {
    fail_boot: bool,
    fail_start: bool,
    fail_on_tick: bool,
    panic_on_tick: bool,
    fail_inside_processing: bool,
}

#[derive(Default, Clone)]
struct Trace {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Trace {
    fn push(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

struct Scripted {
    script: Script,
    trace: Trace,
}

#[async_trait]
impl ModuleDriver for Scripted {
    async fn boot(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.trace.push("boot");
        if self.script.fail_boot {
            return Err(ModuleError::Boot("missing asset".into()));
        }
        Ok(())
    }

    async fn start(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.trace.push("start");
        if self.script.fail_start {
            return Err(ModuleError::Start("port busy".into()));
        }
        Ok(())
    }

    async fn handle(&mut self, ctx: &ModuleContext, message: Message) -> Result<(), ModuleError> {
        self.trace.push(format!("handle:{}", message.sender()));
        if self.script.fail_inside_processing {
            let _guard = ctx.begin_processing("playing sound");
            return Err(ModuleError::runtime("speaker unplugged"));
        }
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        (self.script.fail_on_tick || self.script.panic_on_tick).then_some(Duration::from_millis(120))
    }

    async fn tick(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.trace.push("tick");
        if self.script.panic_on_tick {
            panic!("sensor exploded");
        }
        Err(ModuleError::runtime("read failed"))
    }

    async fn stop(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.trace.push("stop");
        Ok(())
    }
}

fn runtime(name: &str, script: Script) -> (ModuleRuntime, Trace) {
    init_tracing();
    let trace = Trace::default();
    let driver = Scripted {
        script,
        trace: trace.clone(),
    };
    let rt = ModuleRuntime::new(name, Box::new(driver)).with_heartbeat_interval(BEAT);
    (rt, trace)
}

#[tokio::test]
async fn test_graceful_stop_sends_exactly_one_dying_heartbeat() {
    let (mut rt, trace) = runtime("dummymodule", Script::default());
    rt.boot().await.unwrap();
    let ctx = rt.context().clone();
    let stop = rt.stop_handle();
    let sink = MockSink::new();
    let task = tokio::spawn(rt.run(sink.shared()));

    wait_until(Duration::from_secs(2), || {
        sink.heartbeats().iter().any(|h| h.status == HeartbeatStatus::Operational)
    })
    .await
    .unwrap();
    assert!(ctx.is_running());

    stop.stop();
    task.await.unwrap().unwrap();

    let heartbeats = sink.heartbeats();
    assert_eq!(sink.dying_count(), 1);
    let last = heartbeats.last().unwrap();
    assert!(last.dying);
    assert_eq!(last.status, HeartbeatStatus::Operational);
    assert!(last.error.is_none());
    assert_eq!(trace.calls(), vec!["boot", "start", "stop"]);

    // Nothing after the final heartbeat
    let count = sink.messages().len();
    tokio::time::sleep(BEAT * 3).await;
    assert_eq!(sink.messages().len(), count);
}

#[tokio::test]
async fn test_nominal_heartbeat_content_is_minimal() {
    let (mut rt, _) = runtime("dummymodule", Script::default());
    rt.boot().await.unwrap();
    let stop = rt.stop_handle();
    let sink = MockSink::new();
    let task = tokio::spawn(rt.run(sink.shared()));

    wait_until(Duration::from_secs(2), || {
        sink.heartbeat_messages()
            .iter()
            .any(|m| m.get("status") == Some(&json!("operational")) && m.get("dying") == Some(&json!(false)))
    })
    .await
    .unwrap();
    stop.stop();
    task.await.unwrap().unwrap();

    for msg in sink.heartbeat_messages() {
        assert_eq!(msg.sender(), "dummymodule");
        let nominal = msg.get("status") == Some(&json!("operational")) && msg.get("dying") == Some(&json!(false));
        let mut keys: Vec<&str> = msg.content().keys().map(String::as_str).collect();
        keys.sort();
        if nominal {
            assert_eq!(keys, vec!["dying", "module_name", "status"]);
        } else {
            for key in ["last_function", "active", "connected", "error", "time_in_status_seconds"] {
                assert!(keys.contains(&key), "{key} missing from {keys:?}");
            }
        }
    }
}

#[tokio::test]
async fn test_runtime_error_ends_with_error_heartbeat() {
    let script = Script {
        fail_on_tick: true,
        ..Script::default()
    };
    let (mut rt, trace) = runtime("sensor", script);
    rt.boot().await.unwrap();
    let ctx = rt.context().clone();
    let sink = MockSink::new();

    let err = rt.run(sink.shared()).await.unwrap_err();
    assert!(matches!(err, ModuleError::Runtime(_)));

    assert!(!ctx.is_alive());
    assert_eq!(ctx.status(), HeartbeatStatus::Error);
    assert_eq!(sink.dying_count(), 1);
    let last = sink.last_heartbeat().unwrap();
    assert!(last.dying);
    assert_eq!(last.status, HeartbeatStatus::Error);
    assert_eq!(last.error.as_deref(), Some("read failed"));
    assert_eq!(last.active, Some(false));
    assert!(trace.calls().ends_with(&["tick".to_string(), "stop".to_string()]));
}

#[tokio::test]
async fn test_panic_in_hook_is_captured() {
    let script = Script {
        panic_on_tick: true,
        ..Script::default()
    };
    let (mut rt, _) = runtime("sensor", script);
    rt.boot().await.unwrap();
    let sink = MockSink::new();

    let err = rt.run(sink.shared()).await.unwrap_err();
    match err {
        ModuleError::Panicked(text) => assert!(text.contains("sensor exploded")),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(sink.dying_count(), 1);
    let last = sink.last_heartbeat().unwrap();
    assert_eq!(last.status, HeartbeatStatus::Error);
    assert!(last.error.unwrap().contains("sensor exploded"));
}

#[tokio::test]
async fn test_boot_failure_never_reaches_start() {
    let script = Script {
        fail_boot: true,
        ..Script::default()
    };
    let (mut rt, trace) = runtime("speaker", script);
    let err = rt.boot().await.unwrap_err();
    assert!(matches!(err, ModuleError::Boot(_)));
    assert_eq!(rt.context().status(), HeartbeatStatus::Error);
    assert!(!rt.context().is_alive());
    assert_eq!(trace.calls(), vec!["boot"]);
}

#[tokio::test]
async fn test_start_failure_is_reported() {
    let script = Script {
        fail_start: true,
        ..Script::default()
    };
    let (mut rt, _) = runtime("speaker", script);
    rt.boot().await.unwrap();
    let sink = MockSink::new();
    let err = rt.run(sink.shared()).await.unwrap_err();
    assert!(matches!(err, ModuleError::Start(_)));
    assert!(sink
        .heartbeats()
        .iter()
        .all(|h| h.status != HeartbeatStatus::Operational));
    assert_eq!(sink.dying_count(), 1);
}

#[tokio::test]
async fn test_processing_reverts_when_work_fails() {
    let script = Script {
        fail_inside_processing: true,
        ..Script::default()
    };
    let (mut rt, _) = runtime("speaker", script);
    rt.boot().await.unwrap();
    let ctx = rt.context().clone();
    let mut feed = ctx.data_handler();
    let sink = MockSink::new();
    let task = tokio::spawn(rt.run(sink.shared()));

    wait_until(Duration::from_secs(2), || ctx.status() == HeartbeatStatus::Operational)
        .await
        .unwrap();
    feed(Message::data_from_value("sensor", json!({"play_sound": true})).unwrap());

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ModuleError::Runtime(_)));
    assert_eq!(ctx.status(), HeartbeatStatus::Error);
    let last = sink.last_heartbeat().unwrap();
    assert!(last.dying);
    assert_eq!(last.last_function.as_deref(), Some("playing sound"));
    assert_eq!(last.error.as_deref(), Some("speaker unplugged"));
}

#[tokio::test]
async fn test_heartbeats_keep_flowing_when_sink_refuses() {
    let (mut rt, _) = runtime("dummymodule", Script::default());
    rt.boot().await.unwrap();
    let stop = rt.stop_handle();
    let sink = MockSink::new();
    sink.refuse_sends(true);
    let task = tokio::spawn(rt.run(sink.shared()));

    wait_until(Duration::from_secs(2), || sink.messages().len() >= 3).await.unwrap();
    stop.stop();
    task.await.unwrap().unwrap();
    assert_eq!(sink.dying_count(), 1);
}

#[tokio::test]
async fn test_global_messages_skip_heartbeats_and_own_echo() {
    struct Listener {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ModuleDriver for Listener {
        async fn start(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }

        async fn handle_global(&mut self, _ctx: &ModuleContext, message: Message) -> Result<(), ModuleError> {
            self.seen.lock().push(message.sender().to_string());
            Ok(())
        }
    }

    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let rt = ModuleRuntime::new("me", Box::new(Listener { seen: seen.clone() })).with_heartbeat_interval(BEAT);
    let ctx = rt.context().clone();
    let stop = rt.stop_handle();
    let mut global = ctx.global_handler();
    let sink = MockSink::new();
    let task = tokio::spawn(rt.run(sink.shared()));

    global(catdog_core::Heartbeat::nominal("other").into_message());
    global(Message::data_from_value("me", json!({"x": 1})).unwrap());
    global(Message::data_from_value("other", json!({"x": 2})).unwrap());

    wait_until(Duration::from_secs(2), || seen.lock().len() == 1).await.unwrap();
    assert_eq!(*seen.lock(), vec!["other".to_string()]);

    ctx.broadcast_global(json!({"hello": "world"}).as_object().unwrap().clone()).unwrap();
    assert_eq!(sink.data_messages().len(), 1);
    assert_eq!(sink.data_messages()[0].sender(), "me");

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inbox_drops_messages_beyond_capacity() {
    let (mut rt, trace) = runtime("speaker", Script::default());
    rt.boot().await.unwrap();
    let ctx = rt.context().clone();
    let mut deliver = ctx.data_handler();
    for i in 0..INBOX_CAPACITY + 10 {
        deliver(Message::data("sensor", serde_json::Map::from_iter([("seq".to_string(), json!(i))])));
    }

    let stop = rt.stop_handle();
    let sink = MockSink::new();
    let task = tokio::spawn(rt.run(sink.shared()));
    let handled = || trace.calls().iter().filter(|c| c.starts_with("handle:")).count();
    wait_until(Duration::from_secs(5), || handled() == INBOX_CAPACITY)
        .await
        .unwrap();
    tokio::time::sleep(BEAT * 2).await;
    assert_eq!(handled(), INBOX_CAPACITY);

    stop.stop();
    task.await.unwrap().unwrap();
}
