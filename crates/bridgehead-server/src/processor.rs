//! Event dispatch.
//!
//! Handlers register per event type. In [`ExecMode::Sync`] an event's
//! handlers all finish before the next event is looked at, so handlers can
//! mutate per-room state without further locking.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use bridgehead_core::{Event, EventType};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// How events are handed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// One event at a time, in receipt order, handlers in registration order.
    #[default]
    Sync,
    /// Each event in its own task; its handlers run in order.
    Async,
    /// Each handler of each event in its own task.
    AsyncHandlers,
}

/// Receives events of the types it was registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, evt: &Event);
}

/// Fans events from the transport out to handlers.
pub struct EventProcessor {
    mode: ExecMode,
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor").field("mode", &self.mode).finish_non_exhaustive()
    }
}

impl EventProcessor {
    /// Processor with no handlers.
    pub fn new(mode: ExecMode) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { mode, handlers: RwLock::new(HashMap::new()), shutdown }
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Register `handler` for `event_type`.
    pub fn on(&self, event_type: impl Into<EventType>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    fn handlers_for(&self, event_type: &EventType) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Hand `evt` to its handlers according to the execution mode.
    pub async fn dispatch(&self, evt: Event) {
        let handlers = self.handlers_for(&evt.event_type);
        if handlers.is_empty() {
            trace!(event_type = %evt.event_type, "no handlers");
            return;
        }
        match self.mode {
            ExecMode::Sync => {
                for handler in &handlers {
                    handler.handle(&evt).await;
                }
            },
            ExecMode::Async => {
                tokio::spawn(async move {
                    for handler in &handlers {
                        handler.handle(&evt).await;
                    }
                });
            },
            ExecMode::AsyncHandlers => {
                let evt = Arc::new(evt);
                for handler in handlers {
                    let evt = Arc::clone(&evt);
                    tokio::spawn(async move { handler.handle(&evt).await });
                }
            },
        }
    }

    /// Dispatch events from `events` until stopped or the sender is gone.
    pub async fn start(&self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        debug!(mode = ?self.mode, "event processor started");
        loop {
            tokio::select! {
                evt = events.recv() => match evt {
                    Some(evt) => self.dispatch(evt).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("event processor stopped");
    }

    /// Stop the dispatch loop after the current event.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}
