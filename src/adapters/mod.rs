//! Host signal adapters
//!
//! Each adapter observes exactly one [`EventClass`] on an [`EventHost`] and
//! converts matching events into [`RawSignal`]s. Adapters never judge; the
//! classifier decides what becomes a violation.

mod clipboard;
mod context_menu;
mod focus;
mod fullscreen;
pub mod host;
mod visibility;

pub use clipboard::ClipboardAdapter;
pub use context_menu::ContextMenuAdapter;
pub use focus::FocusAdapter;
pub use fullscreen::FullscreenAdapter;
pub use host::{EventClass, EventHost, HostEvent, HostEventKind, SimulatedHost};
pub use visibility::VisibilityAdapter;

use crate::config::PolicyConfig;
use crate::types::{RawSignal, SignalKind};
use host::{ListenerId, ListenerResponse};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Channel adapters emit into
pub type SignalSink = UnboundedSender<RawSignal>;

/// Trait for host event adapters
pub trait SignalAdapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// The single event class this adapter listens to
    fn event_class(&self) -> EventClass;

    /// Map a host event to a signal, if it is one this adapter reports
    fn translate(&self, event: &HostEvent) -> Option<SignalKind>;

    /// Whether the host should suppress its default action
    fn prevent_default(&self, _event: &HostEvent) -> bool {
        false
    }
}

/// Registration handle; dropping it removes the host listener
pub struct Subscription {
    host: Arc<dyn EventHost>,
    id: Option<ListenerId>,
}

impl Subscription {
    /// Register `adapter` on `host`, forwarding translated signals to `sink`
    pub fn register(
        host: Arc<dyn EventHost>,
        adapter: Arc<dyn SignalAdapter>,
        sink: SignalSink,
    ) -> Self {
        let class = adapter.event_class();
        let listener = Arc::new(move |event: &HostEvent| {
            if let Some(kind) = adapter.translate(event) {
                // A closed receiver means the session is gone; nothing to do.
                let _ = sink.send(RawSignal::new(kind, event.at));
            }
            ListenerResponse {
                prevent_default: adapter.prevent_default(event),
            }
        });
        let id = host.add_listener(class, listener);
        Self { host, id: Some(id) }
    }

    /// Remove the listener now; later calls and the drop are no-ops
    pub fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            self.host.remove_listener(id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The adapters attached for one session, at most one per event class
pub struct AdapterSet {
    host: Arc<dyn EventHost>,
    sink: SignalSink,
    attached: HashMap<EventClass, Subscription>,
}

impl AdapterSet {
    pub fn new(host: Arc<dyn EventHost>, sink: SignalSink) -> Self {
        Self {
            host,
            sink,
            attached: HashMap::new(),
        }
    }

    /// Attach an adapter. Returns false if its class is already attached.
    pub fn attach(&mut self, adapter: Arc<dyn SignalAdapter>) -> bool {
        let class = adapter.event_class();
        if self.attached.contains_key(&class) {
            debug!(adapter = adapter.name(), "Adapter already attached");
            return false;
        }
        debug!(adapter = adapter.name(), "Attaching adapter");
        let subscription =
            Subscription::register(Arc::clone(&self.host), adapter, self.sink.clone());
        self.attached.insert(class, subscription);
        true
    }

    /// Detach the adapter for `class`. Returns false if none was attached.
    pub fn detach(&mut self, class: EventClass) -> bool {
        match self.attached.remove(&class) {
            Some(mut subscription) => {
                subscription.cancel();
                true
            }
            None => false,
        }
    }

    /// Detach everything; safe to call repeatedly
    pub fn detach_all(&mut self) {
        for (_, mut subscription) in self.attached.drain() {
            subscription.cancel();
        }
    }

    pub fn is_attached(&self, class: EventClass) -> bool {
        self.attached.contains_key(&class)
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }
}

/// Adapters a session attaches under `policy`.
///
/// Clipboard, context-menu and focus adapters are always attached so the
/// prevent-default behavior applies even when reporting is off; the
/// classifier drops their signals in that case.
pub fn standard_adapters(policy: &PolicyConfig) -> Vec<Arc<dyn SignalAdapter>> {
    let mut adapters: Vec<Arc<dyn SignalAdapter>> = vec![
        Arc::new(VisibilityAdapter),
        Arc::new(ClipboardAdapter::new(policy.block_clipboard)),
        Arc::new(ContextMenuAdapter::new(policy.block_context_menu)),
        Arc::new(FocusAdapter),
    ];
    if policy.require_fullscreen {
        adapters.push(Arc::new(FullscreenAdapter));
    }
    adapters
}
