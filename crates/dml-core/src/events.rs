//! Lifecycle events and observers.
//!
//! Four events are checkpoints (`ModuleDownloaded`, `ModuleExtracted`, `ModuleInstalled`,
//! `ModuleLoaded`): the pipeline waits for every observer and stops if any of them fails.
//! `ModuleEvicted` and `ModuleDestroyed` are notifications: observer failures are logged only.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::try_join_all;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{BoxError, DmlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ModuleDownloaded,
    ModuleExtracted,
    ModuleInstalled,
    ModuleLoaded,
    ModuleEvicted,
    ModuleDestroyed,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::ModuleDownloaded,
        EventKind::ModuleExtracted,
        EventKind::ModuleInstalled,
        EventKind::ModuleLoaded,
        EventKind::ModuleEvicted,
        EventKind::ModuleDestroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ModuleDownloaded => "moduleDownloaded",
            EventKind::ModuleExtracted => "moduleExtracted",
            EventKind::ModuleInstalled => "moduleInstalled",
            EventKind::ModuleLoaded => "moduleLoaded",
            EventKind::ModuleEvicted => "moduleEvicted",
            EventKind::ModuleDestroyed => "moduleDestroyed",
        }
    }

    /// Checkpoints gate the pipeline; the rest are fire-and-forget.
    pub fn is_checkpoint(&self) -> bool {
        !matches!(self, EventKind::ModuleEvicted | EventKind::ModuleDestroyed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleEvent {
    Downloaded { name: String, file: PathBuf },
    Extracted { name: String, path: PathBuf },
    Installed { name: String, path: PathBuf },
    Loaded { name: String },
    Evicted { name: String },
    Destroyed { name: String },
}

impl ModuleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ModuleEvent::Downloaded { .. } => EventKind::ModuleDownloaded,
            ModuleEvent::Extracted { .. } => EventKind::ModuleExtracted,
            ModuleEvent::Installed { .. } => EventKind::ModuleInstalled,
            ModuleEvent::Loaded { .. } => EventKind::ModuleLoaded,
            ModuleEvent::Evicted { .. } => EventKind::ModuleEvicted,
            ModuleEvent::Destroyed { .. } => EventKind::ModuleDestroyed,
        }
    }

    pub fn module_name(&self) -> &str {
        match self {
            ModuleEvent::Downloaded { name, .. }
            | ModuleEvent::Extracted { name, .. }
            | ModuleEvent::Installed { name, .. }
            | ModuleEvent::Loaded { name }
            | ModuleEvent::Evicted { name }
            | ModuleEvent::Destroyed { name } => name,
        }
    }
}

#[async_trait]
pub trait EventObserver: Send + Sync + 'static {
    /// Return an error to veto a checkpoint. Ignored for notifications.
    async fn observe(&self, event: &ModuleEvent) -> std::result::Result<(), BoxError>;
}

struct FnObserver<F>(F);

#[async_trait]
impl<F> EventObserver for FnObserver<F>
where
    F: Fn(&ModuleEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    async fn observe(&self, event: &ModuleEvent) -> std::result::Result<(), BoxError> {
        (self.0)(event)
    }
}

/// Handle returned by `subscribe`; pass to `unsubscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    observer: Arc<dyn EventObserver>,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, observer: Arc<dyn EventObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Subscription { id, kind, observer });
        id
    }

    /// Subscribe a synchronous closure.
    pub fn subscribe_fn<F>(&self, kind: EventKind, f: F) -> SubscriptionId
    where
        F: Fn(&ModuleEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(FnObserver(f)))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    fn observers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventObserver>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.observer.clone())
            .collect()
    }

    /// Run every observer of the event concurrently and wait for all of them.
    /// No observers: resolves immediately. Any failure rejects the checkpoint.
    pub async fn checkpoint(&self, event: &ModuleEvent) -> Result<()> {
        let kind = event.kind();
        let observers = self.observers_for(kind);
        if observers.is_empty() {
            return Ok(());
        }
        debug!(event = %kind, module = event.module_name(), observers = observers.len(), "checkpoint");
        let calls = observers.iter().map(|o| {
            std::panic::AssertUnwindSafe(o.observe(event))
                .catch_unwind()
                .map(|outcome| match outcome {
                    Ok(res) => res,
                    Err(panic) => Err(panic_message(panic).into()),
                })
        });
        try_join_all(calls)
            .await
            .map(|_| ())
            .map_err(|e| DmlError::CheckpointRejected {
                event: kind,
                message: e.to_string(),
            })
    }

    /// Deliver a notification. Observer errors and panics are logged and swallowed.
    pub async fn notify(&self, event: &ModuleEvent) {
        let kind = event.kind();
        for observer in self.observers_for(kind) {
            match std::panic::AssertUnwindSafe(observer.observe(event))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = %kind, module = event.module_name(), error = %e, "observer failed"),
                Err(panic) => warn!(
                    event = %kind,
                    module = event.module_name(),
                    panic = %panic_message(panic),
                    "observer panicked"
                ),
            }
        }
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn loaded(name: &str) -> ModuleEvent {
        ModuleEvent::Loaded {
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn checkpoint_without_observers_resolves() {
        let bus = EventBus::new();
        bus.checkpoint(&loaded("m")).await.expect("no observers");
    }

    #[tokio::test]
    async fn checkpoint_waits_for_slow_observers() {
        struct Slow(Arc<AtomicUsize>);
        #[async_trait]
        impl EventObserver for Slow {
            async fn observe(&self, _: &ModuleEvent) -> std::result::Result<(), BoxError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let bus = EventBus::new();
        let done = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::ModuleLoaded, Arc::new(Slow(done.clone())));
        bus.subscribe(EventKind::ModuleLoaded, Arc::new(Slow(done.clone())));
        bus.checkpoint(&loaded("m")).await.expect("both succeed");
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_observer_rejects_checkpoint() {
        let bus = EventBus::new();
        bus.subscribe_fn(EventKind::ModuleLoaded, |_| Ok(()));
        bus.subscribe_fn(EventKind::ModuleLoaded, |_| Err("not today".into()));
        let err = bus.checkpoint(&loaded("m")).await.expect_err("veto");
        match err {
            DmlError::CheckpointRejected { event, message } => {
                assert_eq!(event, EventKind::ModuleLoaded);
                assert!(message.contains("not today"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn panicking_observer_rejects_checkpoint() {
        let bus = EventBus::new();
        bus.subscribe_fn(EventKind::ModuleLoaded, |_| panic!("boom"));
        let err = bus.checkpoint(&loaded("m")).await.expect_err("panic is a veto");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn notify_swallows_failures_and_reaches_every_observer() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn(EventKind::ModuleEvicted, |_| Err("ignored".into()));
        bus.subscribe_fn(EventKind::ModuleEvicted, |_| panic!("also ignored"));
        let h = hits.clone();
        bus.subscribe_fn(EventKind::ModuleEvicted, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.notify(&ModuleEvent::Evicted {
            name: "m".to_string(),
        })
        .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observers_only_see_their_kind_and_unsubscribe_works() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.subscribe_fn(EventKind::ModuleInstalled, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.checkpoint(&loaded("m")).await.expect("other kind");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(EventKind::ModuleInstalled), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(EventKind::ModuleInstalled), 0);
    }

    #[test]
    fn event_names_and_checkpoint_split() {
        assert_eq!(EventKind::ModuleDownloaded.to_string(), "moduleDownloaded");
        let checkpoints: Vec<_> = EventKind::ALL.iter().filter(|k| k.is_checkpoint()).collect();
        assert_eq!(checkpoints.len(), 4);
        assert!(!EventKind::ModuleDestroyed.is_checkpoint());
    }
}
