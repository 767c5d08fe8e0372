//! Context menu (right-click) adapter

use super::host::{EventClass, HostEvent, HostEventKind};
use super::SignalAdapter;
use crate::types::SignalKind;

/// Emits `RightClick` whenever a context menu is requested
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextMenuAdapter {
    pub block: bool,
}

impl ContextMenuAdapter {
    pub fn new(block: bool) -> Self {
        Self { block }
    }
}

impl SignalAdapter for ContextMenuAdapter {
    fn name(&self) -> &'static str {
        "context_menu"
    }

    fn event_class(&self) -> EventClass {
        EventClass::ContextMenu
    }

    fn translate(&self, event: &HostEvent) -> Option<SignalKind> {
        match event.kind {
            HostEventKind::ContextMenu => Some(SignalKind::RightClick),
            _ => None,
        }
    }

    fn prevent_default(&self, event: &HostEvent) -> bool {
        self.block && event.kind == HostEventKind::ContextMenu
    }
}
