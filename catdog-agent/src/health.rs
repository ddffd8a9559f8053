use std::sync::Arc;

use catdog_core::unix_now;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sysinfo::System;

use crate::heartbeats::HeartbeatTable;

/// Santé du device telle que diffusée dans les vibes
#[derive(Clone)]
pub struct HealthTracker {
    start_time: f64,
    sys: Arc<Mutex<System>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: unix_now(),
            sys: Arc::new(Mutex::new(System::new())),
        }
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// (cpu, ram) en ratio 0..1 ; le premier échantillon CPU vaut 0
    pub fn sample(&self) -> (f32, f32) {
        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = sys.global_cpu_info().cpu_usage() / 100.0;
        let cpu_ratio = if cpu.is_finite() { cpu.clamp(0.0, 1.0) } else { 0.0 };
        let total = sys.total_memory() as f32;
        let used = sys.used_memory() as f32;
        let ram_ratio = if total > 0.0 { used / total } else { 0.0 };
        (cpu_ratio, ram_ratio)
    }

    /// `{modules: {name: status}, start_time, cpu, ram}`
    pub fn snapshot(&self, table: &HeartbeatTable) -> Map<String, Value> {
        let (cpu, ram) = self.sample();
        let mut health = Map::new();
        health.insert("modules".into(), json!(table.snapshot()));
        health.insert("start_time".into(), json!(self.start_time));
        health.insert("cpu".into(), json!(cpu));
        health.insert("ram".into(), json!(ram));
        health
    }
}
