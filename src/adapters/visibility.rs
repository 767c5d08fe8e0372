//! Page visibility adapter

use super::host::{EventClass, HostEvent, HostEventKind};
use super::SignalAdapter;
use crate::types::SignalKind;

/// Emits `VisibilityLost` whenever the page becomes hidden
#[derive(Debug, Default, Clone, Copy)]
pub struct VisibilityAdapter;

impl SignalAdapter for VisibilityAdapter {
    fn name(&self) -> &'static str {
        "visibility"
    }

    fn event_class(&self) -> EventClass {
        EventClass::Visibility
    }

    fn translate(&self, event: &HostEvent) -> Option<SignalKind> {
        match event.kind {
            HostEventKind::VisibilityChange { hidden: true } => Some(SignalKind::VisibilityLost),
            _ => None,
        }
    }
}
