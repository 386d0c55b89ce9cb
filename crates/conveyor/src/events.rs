//! Worker lifecycle events
//!
//! Listeners are plain closures registered per event kind. The dispatcher
//! is shared between the manager (where listeners are registered) and the
//! workers and sync driver (which emit).

use crate::envelope::Envelope;
use crate::error::JobError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Event kinds a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Processing,
    Processed,
    ExceptionOccurred,
    Failed,
    Looping,
    Stopping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Processing => "processing",
            EventKind::Processed => "processed",
            EventKind::ExceptionOccurred => "exceptionOccurred",
            EventKind::Failed => "failed",
            EventKind::Looping => "looping",
            EventKind::Stopping => "stopping",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A leased job is about to run
    Processing { connection: String, job: Envelope },
    /// The job ran and was acknowledged
    Processed { connection: String, job: Envelope },
    /// The job failed and was released for another attempt
    ExceptionOccurred {
        connection: String,
        job: Envelope,
        error: JobError,
    },
    /// The job failed for good and was removed
    Failed {
        connection: String,
        job: Envelope,
        error: JobError,
    },
    /// Start of a worker loop iteration
    Looping {
        connection: String,
        queues: Vec<String>,
    },
    /// The worker loop is exiting
    Stopping { connection: String, reason: String },
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Processing { .. } => EventKind::Processing,
            WorkerEvent::Processed { .. } => EventKind::Processed,
            WorkerEvent::ExceptionOccurred { .. } => EventKind::ExceptionOccurred,
            WorkerEvent::Failed { .. } => EventKind::Failed,
            WorkerEvent::Looping { .. } => EventKind::Looping,
            WorkerEvent::Stopping { .. } => EventKind::Stopping,
        }
    }

    pub fn connection(&self) -> &str {
        match self {
            WorkerEvent::Processing { connection, .. }
            | WorkerEvent::Processed { connection, .. }
            | WorkerEvent::ExceptionOccurred { connection, .. }
            | WorkerEvent::Failed { connection, .. }
            | WorkerEvent::Looping { connection, .. }
            | WorkerEvent::Stopping { connection, .. } => connection,
        }
    }

    /// The job the event is about, if any
    pub fn job(&self) -> Option<&Envelope> {
        match self {
            WorkerEvent::Processing { job, .. }
            | WorkerEvent::Processed { job, .. }
            | WorkerEvent::ExceptionOccurred { job, .. }
            | WorkerEvent::Failed { job, .. } => Some(job),
            WorkerEvent::Looping { .. } | WorkerEvent::Stopping { .. } => None,
        }
    }
}

type Listener = Arc<dyn Fn(&WorkerEvent) + Send + Sync>;

/// Event sink with per-kind listener lists
#[derive(Clone, Default)]
pub struct Events {
    listeners: Arc<RwLock<HashMap<EventKind, Vec<Listener>>>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(kind).or_default().push(Arc::new(listener));
    }

    /// Deliver an event to every listener of its kind.
    ///
    /// Listeners run outside the table lock so they may register more
    /// listeners without deadlocking.
    pub fn emit(&self, event: &WorkerEvent) {
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners.get(&event.kind()).cloned().unwrap_or_default()
        };

        tracing::trace!(
            event = %event.kind(),
            connection = %event.connection(),
            listeners = targets.len(),
            "Dispatching queue event"
        );

        for listener in targets {
            listener(event);
        }
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.get(&kind).map_or(false, |l| !l.is_empty())
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<&'static str, usize> =
            listeners.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("Events").field("listeners", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn looping() -> WorkerEvent {
        WorkerEvent::Looping {
            connection: "memory".to_string(),
            queues: vec!["default".to_string()],
        }
    }

    #[test]
    fn only_matching_listeners_fire() {
        let events = Events::new();
        let loops = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let counter = loops.clone();
        events.listen(EventKind::Looping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = stops.clone();
        events.listen(EventKind::Stopping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.emit(&looping());
        events.emit(&looping());

        assert_eq!(loops.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert!(events.has_listeners(EventKind::Stopping));
        assert!(!events.has_listeners(EventKind::Failed));
    }

    #[test]
    fn event_names() {
        assert_eq!(looping().kind().as_str(), "looping");
        assert_eq!(EventKind::ExceptionOccurred.to_string(), "exceptionOccurred");
        assert!(looping().job().is_none());
    }
}
