//! Host event surface
//!
//! The host is whatever delivers window-level events (a browser bridge, a
//! kiosk shell, a test harness). Adapters only see it through [`EventHost`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Event class a listener registers for. One adapter per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Visibility,
    Fullscreen,
    Clipboard,
    ContextMenu,
    Focus,
}

/// Clipboard operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipboardAction {
    Copy,
    Cut,
    Paste,
}

/// Host event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum HostEventKind {
    VisibilityChange { hidden: bool },
    FullscreenChange { active: bool },
    Clipboard { action: ClipboardAction },
    ContextMenu,
    Blur,
    Focus,
}

impl HostEventKind {
    pub fn class(&self) -> EventClass {
        match self {
            HostEventKind::VisibilityChange { .. } => EventClass::Visibility,
            HostEventKind::FullscreenChange { .. } => EventClass::Fullscreen,
            HostEventKind::Clipboard { .. } => EventClass::Clipboard,
            HostEventKind::ContextMenu => EventClass::ContextMenu,
            HostEventKind::Blur | HostEventKind::Focus => EventClass::Focus,
        }
    }
}

/// A timestamped host event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
    #[serde(flatten)]
    pub kind: HostEventKind,
    /// Wall-clock UTC. The live fullscreen probe stamps with `Utc::now()`
    /// and shares cool-downs with these events, so hosts must not supply a
    /// skewed clock.
    pub at: DateTime<Utc>,
}

impl HostEvent {
    pub fn new(kind: HostEventKind, at: DateTime<Utc>) -> Self {
        Self { kind, at }
    }

    pub fn class(&self) -> EventClass {
        self.kind.class()
    }
}

/// What a listener asks the host to do with the event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerResponse {
    pub prevent_default: bool,
}

/// Identifier returned by [`EventHost::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub type HostListener = Arc<dyn Fn(&HostEvent) -> ListenerResponse + Send + Sync>;

/// Window-level event source
pub trait EventHost: Send + Sync {
    /// Register a listener for one event class
    fn add_listener(&self, class: EventClass, listener: HostListener) -> ListenerId;

    /// Remove a listener; returns false if it was not registered
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Current fullscreen state, used by the periodic probe
    fn is_fullscreen(&self) -> bool;
}

/// Result of dispatching an event through a [`SimulatedHost`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub listeners_invoked: usize,
    pub default_prevented: bool,
}

/// In-process host used by the replay CLI and by tests
#[derive(Default)]
pub struct SimulatedHost {
    listeners: Mutex<HashMap<ListenerId, (EventClass, HostListener)>>,
    next_id: AtomicU64,
    fullscreen: AtomicBool,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every listener of its class.
    ///
    /// Fullscreen changes also update the state seen by `is_fullscreen`.
    pub fn dispatch(&self, event: HostEvent) -> DispatchOutcome {
        if let HostEventKind::FullscreenChange { active } = event.kind {
            self.fullscreen.store(active, Ordering::SeqCst);
        }

        // Listeners run outside the lock so they may call back into the host.
        let targets: Vec<HostListener> = match self.listeners.lock() {
            Ok(listeners) => listeners
                .values()
                .filter(|(class, _)| *class == event.class())
                .map(|(_, listener)| Arc::clone(listener))
                .collect(),
            Err(_) => Vec::new(),
        };

        let mut default_prevented = false;
        for listener in &targets {
            default_prevented |= listener(&event).prevent_default;
        }

        DispatchOutcome {
            listeners_invoked: targets.len(),
            default_prevented,
        }
    }

    pub fn set_fullscreen(&self, active: bool) {
        self.fullscreen.store(active, Ordering::SeqCst);
    }

    /// Total registered listeners across all classes
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn listener_count_for(&self, class: EventClass) -> usize {
        self.listeners
            .lock()
            .map(|l| l.values().filter(|(c, _)| *c == class).count())
            .unwrap_or(0)
    }
}

impl EventHost for SimulatedHost {
    fn add_listener(&self, class: EventClass, listener: HostListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, (class, listener));
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .map(|mut l| l.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }
}
