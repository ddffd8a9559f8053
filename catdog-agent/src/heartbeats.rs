/**
 * HEARTBEAT TABLE - Dernier signe de vie de chaque module du roster
 *
 * ROLE : Alimentée par le client du canal global de l'agent, lue par
 * l'attente de démarrage, le moniteur et le snapshot de santé.
 *
 * RÈGLES : une entrée est créée au spawn (statut `unknown`) et jamais
 * supprimée ; les heartbeats de modules hors roster (autres devices sur le
 * même relay) sont ignorés.
 */

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use catdog_core::{new_state, HeartbeatReport, HeartbeatStatus, Message, Shared};
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatEntry {
    pub last_seen: OffsetDateTime,
    /// `None` tant qu'aucun heartbeat n'est arrivé
    pub status: Option<HeartbeatStatus>,
    pub dying: bool,
    pub error: Option<String>,
}

impl HeartbeatEntry {
    fn registered() -> Self {
        Self {
            last_seen: OffsetDateTime::now_utc(),
            status: None,
            dying: false,
            error: None,
        }
    }

    pub fn status_label(&self) -> &'static str {
        self.status.map(|s| s.as_str()).unwrap_or("unknown")
    }

    pub fn is_online(&self) -> bool {
        !self.dying && self.status.is_some_and(|s| s.is_online())
    }

    pub fn silent_for(&self, now: OffsetDateTime) -> f64 {
        (now - self.last_seen).as_seconds_f64()
    }
}

#[derive(Clone)]
pub struct HeartbeatTable {
    entries: Shared<HashMap<String, HeartbeatEntry>>,
}

impl Default for HeartbeatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTable {
    pub fn new() -> Self {
        Self {
            entries: new_state(HashMap::new()),
        }
    }

    /// Ajoute un module avec le statut `unknown` (sans écraser une entrée existante)
    pub fn register(&self, name: &str) {
        self.entries
            .lock()
            .entry(name.to_string())
            .or_insert_with(HeartbeatEntry::registered);
    }

    /// Retourne false si le module n'est pas dans la table
    pub fn record(&self, report: &HeartbeatReport) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&report.module_name) else {
            return false;
        };
        if entry.status != Some(report.status) {
            info!(module = %report.module_name, status = %report.status, "module status");
        }
        entry.last_seen = OffsetDateTime::now_utc();
        entry.status = Some(report.status);
        entry.dying = report.dying;
        entry.error = report.error.clone();
        true
    }

    /// Point d'entrée du client du canal global : tout ce qui n'est pas un
    /// heartbeat d'un module connu est ignoré.
    pub fn observe(&self, message: &Message) {
        if !message.is_heartbeat() {
            return;
        }
        match HeartbeatReport::from_message(message) {
            Ok(report) => {
                if !self.record(&report) {
                    debug!(module = %report.module_name, "heartbeat from a module outside the roster");
                }
            }
            Err(e) => debug!(sender = message.sender(), error = %e, "malformed heartbeat ignored"),
        }
    }

    pub fn get(&self, name: &str) -> Option<HeartbeatEntry> {
        self.entries.lock().get(name).cloned()
    }

    pub fn status(&self, name: &str) -> Option<&'static str> {
        self.entries.lock().get(name).map(|e| e.status_label())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// `{module: status}` trié par nom
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .iter()
            .map(|(name, e)| (name.clone(), e.status_label().to_string()))
            .collect()
    }

    /// Modules pas encore `operational`/`processing`
    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_online())
            .map(|(name, _)| name.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Modules silencieux depuis plus de `timeout`, avec la durée de silence
    pub fn stale(&self, timeout: Duration) -> Vec<(String, f64)> {
        let now = OffsetDateTime::now_utc();
        let limit = timeout.as_secs_f64();
        let mut stale: Vec<(String, f64)> = self
            .entries
            .lock()
            .iter()
            .map(|(name, e)| (name.clone(), e.silent_for(now)))
            .filter(|(_, silent)| *silent > limit)
            .collect();
        stale.sort_by(|a, b| a.0.cmp(&b.0));
        stale
    }

    /// Modules dont le dernier heartbeat annonçait `dying`
    pub fn dying(&self) -> Vec<(String, Option<String>)> {
        let mut dying: Vec<(String, Option<String>)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.dying)
            .map(|(name, e)| (name.clone(), e.error.clone()))
            .collect();
        dying.sort_by(|a, b| a.0.cmp(&b.0));
        dying
    }
}
