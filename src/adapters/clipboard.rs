//! Clipboard adapter

use super::host::{EventClass, HostEvent, HostEventKind};
use super::SignalAdapter;
use crate::types::SignalKind;

/// Emits `Clipboard` for copy, cut and paste.
///
/// When `block` is set the default action is prevented as well; emission
/// happens either way.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClipboardAdapter {
    pub block: bool,
}

impl ClipboardAdapter {
    pub fn new(block: bool) -> Self {
        Self { block }
    }
}

impl SignalAdapter for ClipboardAdapter {
    fn name(&self) -> &'static str {
        "clipboard"
    }

    fn event_class(&self) -> EventClass {
        EventClass::Clipboard
    }

    fn translate(&self, event: &HostEvent) -> Option<SignalKind> {
        match event.kind {
            HostEventKind::Clipboard { .. } => Some(SignalKind::Clipboard),
            _ => None,
        }
    }

    fn prevent_default(&self, event: &HostEvent) -> bool {
        self.block && matches!(event.kind, HostEventKind::Clipboard { .. })
    }
}
