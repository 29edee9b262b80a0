//! Event log for stage execution
//!
//! - Event: envelope with id + timestamp + kind
//! - EventKind: stage, unit and task level variants
//! - EventLog: thread-safe, append-only log persisted as
//!   `<output>/logs/<stage>_events.json`

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Single event in the stage execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since stage start (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// All event types (3 levels)
///
/// Unit and task identifiers are `Arc<str>` so events clone cheaply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // STAGE LEVEL
    // ═══════════════════════════════════════════
    StageStarted {
        stage: String,
        units: usize,
        task_count: usize,
    },
    StageCompleted {
        succeeded: usize,
        skipped: usize,
        failed: usize,
        total_duration_ms: u64,
    },
    StageFailed {
        error: String,
    },

    // ═══════════════════════════════════════════
    // UNIT LEVEL
    // ═══════════════════════════════════════════
    /// Left out before execution (missing input, ambiguity, planning error)
    UnitSkipped {
        unit: Arc<str>,
        reason: String,
    },
    UnitStarted {
        unit: Arc<str>,
        task_count: usize,
    },
    UnitCompleted {
        unit: Arc<str>,
        duration_ms: u64,
    },
    UnitFailed {
        unit: Arc<str>,
        failed_task: Arc<str>,
        error: String,
    },

    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    TaskStarted {
        task_id: Arc<str>,
        /// Declared inputs as `name -> path`
        inputs: Value,
    },
    TaskCompleted {
        task_id: Arc<str>,
        outputs: Value,
        duration_ms: u64,
    },
    TaskPassthrough {
        task_id: Arc<str>,
    },
    TaskDegraded {
        task_id: Arc<str>,
        reason: String,
        substitute: String,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Arc<str>,
        error: String,
        duration_ms: u64,
    },
    /// Not run because an upstream task of the same unit failed
    TaskAborted {
        task_id: Arc<str>,
    },
}

impl EventKind {
    /// Extract task_id if event is task-related
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskPassthrough { task_id }
            | Self::TaskDegraded { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskAborted { task_id } => Some(task_id),
            _ => None,
        }
    }

    /// Extract unit prefix if event is unit-related
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::UnitSkipped { unit, .. }
            | Self::UnitStarted { unit, .. }
            | Self::UnitCompleted { unit, .. }
            | Self::UnitFailed { unit, .. } => Some(unit),
            _ => None,
        }
    }

    pub fn is_stage_event(&self) -> bool {
        matches!(
            self,
            Self::StageStarted { .. } | Self::StageCompleted { .. } | Self::StageFailed { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at stage start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        // id and push under one lock so ids stay in log order
        let mut events = self.events.write();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        events.push(Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        });
        id
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    pub fn filter_task(&self, task_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.task_id() == Some(task_id))
            .collect()
    }

    /// Unit-level events plus the task events of that unit
    #[cfg(test)]
    pub fn filter_unit(&self, unit: &str) -> Vec<Event> {
        let task_prefix = format!("{unit}/");
        self.events()
            .into_iter()
            .filter(|e| {
                e.kind.unit() == Some(unit)
                    || e.kind.task_id().is_some_and(|id| id.starts_with(&task_prefix))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn stage_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_stage_event())
            .collect()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    /// Write the log as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.events())?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started(task_id: &str) -> EventKind {
        EventKind::TaskStarted {
            task_id: task_id.into(),
            inputs: json!({}),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // EventKind tests
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn eventkind_id_extraction() {
        assert_eq!(started("sub-01/denoise").task_id(), Some("sub-01/denoise"));
        assert_eq!(started("sub-01/denoise").unit(), None);

        let unit = EventKind::UnitStarted {
            unit: "sub-01".into(),
            task_count: 6,
        };
        assert_eq!(unit.unit(), Some("sub-01"));
        assert_eq!(unit.task_id(), None);
        assert!(!unit.is_stage_event());
    }

    #[test]
    fn eventkind_serializes_with_type_tag() {
        let kind = EventKind::TaskDegraded {
            task_id: "sub-01/fod".into(),
            reason: "normalisation failed".to_string(),
            substitute: "msmt_csd".to_string(),
            duration_ms: 150,
        };

        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "task_degraded");
        assert_eq!(json["task_id"], "sub-01/fod");
        assert_eq!(json["substitute"], "msmt_csd");
    }

    #[test]
    fn eventkind_deserializes_from_tagged_json() {
        let json = json!({
            "type": "unit_failed",
            "unit": "sub-02",
            "failed_task": "sub-02/undistort",
            "error": "eddy exited with 1"
        });

        let kind: EventKind = serde_json::from_value(json).unwrap();
        assert_eq!(
            kind,
            EventKind::UnitFailed {
                unit: "sub-02".into(),
                failed_task: "sub-02/undistort".into(),
                error: "eddy exited with 1".to_string(),
            }
        );
    }

    // ═══════════════════════════════════════════════════════════════
    // EventLog tests
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn eventlog_emit_returns_monotonic_ids() {
        let log = EventLog::new();
        assert!(log.is_empty());

        let id1 = log.emit(EventKind::StageStarted {
            stage: "preprocess".to_string(),
            units: 1,
            task_count: 3,
        });
        let id2 = log.emit(started("t1"));
        let id3 = log.emit(started("t2"));

        assert_eq!((id1, id2, id3), (0, 1, 2));
        assert_eq!(log.len(), 3);
        assert_eq!(log.stage_events().len(), 1);
    }

    #[test]
    fn eventlog_filters_by_task_and_unit() {
        let log = EventLog::new();
        log.emit(EventKind::UnitStarted {
            unit: "sub-01".into(),
            task_count: 2,
        });
        log.emit(started("sub-01/denoise"));
        log.emit(started("sub-010/denoise"));
        log.emit(EventKind::TaskPassthrough {
            task_id: "sub-01/unring".into(),
        });

        assert_eq!(log.filter_task("sub-01/denoise").len(), 1);
        // prefix match stops at the unit boundary
        assert_eq!(log.filter_unit("sub-01").len(), 3);
        assert_eq!(log.filter_unit("sub-010").len(), 1);
    }

    #[test]
    fn eventlog_clone_shares_storage() {
        let log = EventLog::new();
        let cloned = log.clone();
        log.emit(started("t1"));
        assert_eq!(cloned.len(), 1);
    }

    #[test]
    fn eventlog_thread_safe_concurrent_emits() {
        use std::thread;

        let log = EventLog::new();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let log = log.clone();
                thread::spawn(move || log.emit(started(&format!("sub-{i}/denoise"))))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let ids: Vec<u64> = log.events().iter().map(|e| e.id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn eventlog_saves_json_array() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/preprocess_events.json");
        let log = EventLog::new();
        log.emit(started("sub-01/denoise"));
        log.save(&path).unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, log.to_json());
        assert_eq!(saved[0]["kind"]["type"], "task_started");
    }
}
