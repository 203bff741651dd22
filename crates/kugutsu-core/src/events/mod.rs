//! Typed pub/sub connecting the pipeline stages.
//!
//! The bus carries exactly the seven pipeline event kinds. Dispatch is
//! synchronous: `emit` returns only after every listener for the kind has
//! run, in registration order. A listener that errors or panics is logged
//! and unregistered; the remaining listeners still fire.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::task::{EngineerResult, FailurePhase, ReviewResult, Task};

/// Discriminant of a [`PipelineEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DevelopmentCompleted,
    ReviewCompleted,
    MergeReady,
    MergeConflictDetected,
    MergeCompleted,
    TaskFailed,
    DependencyResolved,
}

/// One pipeline event with its kind-specific payload.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The engineer returned success for a task.
    DevelopmentCompleted {
        task: Task,
        result: EngineerResult,
        engineer_id: String,
    },
    /// The review workflow returned a verdict.
    ReviewCompleted {
        task: Task,
        review: ReviewResult,
        result: EngineerResult,
        needs_revision: bool,
    },
    /// Review approved and the task has not merged yet.
    MergeReady {
        task: Task,
        result: EngineerResult,
        reviews: Vec<ReviewResult>,
        engineer_id: String,
    },
    /// A merge attempt hit conflicts.
    MergeConflictDetected {
        task: Task,
        result: EngineerResult,
        reviews: Vec<ReviewResult>,
        engineer_id: String,
    },
    /// The base branch now contains the task's changes (or the merge
    /// terminally failed).
    MergeCompleted {
        task: Task,
        success: bool,
        error: Option<String>,
    },
    /// Terminal failure in some phase.
    TaskFailed {
        task: Task,
        error: String,
        phase: FailurePhase,
    },
    /// A merge promoted dependents to ready.
    DependencyResolved {
        merged_task_id: Uuid,
        ready_tasks: Vec<Task>,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DevelopmentCompleted { .. } => EventKind::DevelopmentCompleted,
            Self::ReviewCompleted { .. } => EventKind::ReviewCompleted,
            Self::MergeReady { .. } => EventKind::MergeReady,
            Self::MergeConflictDetected { .. } => EventKind::MergeConflictDetected,
            Self::MergeCompleted { .. } => EventKind::MergeCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::DependencyResolved { .. } => EventKind::DependencyResolved,
        }
    }

    /// The task this event concerns. `DependencyResolved` reports the
    /// merged task.
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::DevelopmentCompleted { task, .. }
            | Self::ReviewCompleted { task, .. }
            | Self::MergeReady { task, .. }
            | Self::MergeConflictDetected { task, .. }
            | Self::MergeCompleted { task, .. }
            | Self::TaskFailed { task, .. } => task.id,
            Self::DependencyResolved { merged_task_id, .. } => *merged_task_id,
        }
    }
}

/// Event plus the emission timestamp, as delivered to listeners.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: PipelineEvent,
    pub timestamp: DateTime<Utc>,
}

type Listener = Arc<dyn Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    listener: Listener,
}

/// Handle returned by [`EventBus::subscribe`]; pass to
/// [`EventBus::unsubscribe`] to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    kind: EventKind,
    id: u64,
}

/// The pipeline event bus.
///
/// One instance per orchestrator run, injected into every stage. Not a
/// global: test isolation depends on each pipeline owning its own bus.
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
    /// Soft ceiling on live listeners; exceeded count warns and continues.
    max_listeners: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("live_listeners", &self.listener_count())
            .field("max_listeners", &self.max_listeners)
            .finish()
    }
}

impl EventBus {
    pub fn new(max_listeners: usize) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            max_listeners,
        }
    }

    /// Register a listener for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(kind).or_default().push(Registration {
            id,
            listener: Arc::new(listener),
        });

        let live: usize = map.values().map(Vec::len).sum();
        if live > self.max_listeners {
            tracing::warn!(
                live,
                ceiling = self.max_listeners,
                "event bus listener count exceeds ceiling (possible leak)"
            );
        }

        ListenerHandle { kind, id }
    }

    /// Deregister a listener. Unknown handles are a no-op.
    pub fn unsubscribe(&self, handle: ListenerHandle) {
        let mut map = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(regs) = map.get_mut(&handle.kind) {
            regs.retain(|r| r.id != handle.id);
        }
    }

    /// Number of live listeners across all kinds.
    pub fn listener_count(&self) -> usize {
        let map = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        map.values().map(Vec::len).sum()
    }

    /// Dispatch an event synchronously to every listener of its kind, in
    /// registration order. Listeners that error or panic are unregistered;
    /// the rest still run. Returns after all listeners have been invoked.
    pub fn emit(&self, event: PipelineEvent) {
        let envelope = EventEnvelope {
            event,
            timestamp: Utc::now(),
        };
        let kind = envelope.event.kind();

        // Snapshot outside the lock so listeners can subscribe/unsubscribe
        // (or emit) without deadlocking.
        let snapshot: Vec<(u64, Listener)> = {
            let map = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&kind)
                .map(|regs| regs.iter().map(|r| (r.id, Arc::clone(&r.listener))).collect())
                .unwrap_or_default()
        };

        let mut faulty = Vec::new();
        for (id, listener) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(&envelope)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        kind = ?kind,
                        task_id = %envelope.event.task_id(),
                        error = %e,
                        "event listener failed, unregistering"
                    );
                    faulty.push(id);
                }
                Err(_) => {
                    tracing::error!(
                        kind = ?kind,
                        task_id = %envelope.event.task_id(),
                        "event listener panicked, unregistering"
                    );
                    faulty.push(id);
                }
            }
        }

        if !faulty.is_empty() {
            let mut map = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(regs) = map.get_mut(&kind) {
                regs.retain(|r| !faulty.contains(&r.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;
    use std::sync::atomic::AtomicUsize;

    fn merged_event(task: &Task) -> PipelineEvent {
        PipelineEvent::MergeCompleted {
            task: task.clone(),
            success: true,
            error: None,
        }
    }

    #[test]
    fn emit_reaches_listeners_in_registration_order() {
        let bus = EventBus::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(EventKind::MergeCompleted, move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        let task = Task::new(TaskType::Feature, "t", "d");
        bus.emit(merged_event(&task));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn emit_only_dispatches_matching_kind() {
        let bus = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        bus.subscribe(EventKind::TaskFailed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let task = Task::new(TaskType::Feature, "t", "d");
        bus.emit(merged_event(&task));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.emit(PipelineEvent::TaskFailed {
            task,
            error: "boom".into(),
            phase: FailurePhase::Development,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let handle = bus.subscribe(EventKind::MergeCompleted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let task = Task::new(TaskType::Feature, "t", "d");
        bus.emit(merged_event(&task));
        bus.unsubscribe(handle);
        bus.emit(merged_event(&task));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn failing_listener_is_unregistered_others_still_fire() {
        let bus = EventBus::new(16);
        let good_count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::MergeCompleted, |_| anyhow::bail!("broken listener"));
        let c = Arc::clone(&good_count);
        bus.subscribe(EventKind::MergeCompleted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let task = Task::new(TaskType::Feature, "t", "d");
        bus.emit(merged_event(&task));
        assert_eq!(good_count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 1, "faulty listener should be gone");

        bus.emit(merged_event(&task));
        assert_eq!(good_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_is_unregistered() {
        let bus = EventBus::new(16);
        bus.subscribe(EventKind::MergeCompleted, |_| panic!("listener bug"));

        let task = Task::new(TaskType::Feature, "t", "d");
        bus.emit(merged_event(&task));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn ceiling_warns_but_accepts() {
        let bus = EventBus::new(2);
        for _ in 0..4 {
            bus.subscribe(EventKind::MergeCompleted, |_| Ok(()));
        }
        assert_eq!(bus.listener_count(), 4);
    }

    #[test]
    fn event_kind_and_task_id_accessors() {
        let task = Task::new(TaskType::Bugfix, "t", "d");
        let event = PipelineEvent::DependencyResolved {
            merged_task_id: task.id,
            ready_tasks: vec![],
        };
        assert_eq!(event.kind(), EventKind::DependencyResolved);
        assert_eq!(event.task_id(), task.id);
    }
}
