//! Window focus adapter

use super::host::{EventClass, HostEvent, HostEventKind};
use super::SignalAdapter;
use crate::types::SignalKind;

/// Emits `WindowBlur` when the window loses focus; regaining focus is silent
#[derive(Debug, Default, Clone, Copy)]
pub struct FocusAdapter;

impl SignalAdapter for FocusAdapter {
    fn name(&self) -> &'static str {
        "focus"
    }

    fn event_class(&self) -> EventClass {
        EventClass::Focus
    }

    fn translate(&self, event: &HostEvent) -> Option<SignalKind> {
        match event.kind {
            HostEventKind::Blur => Some(SignalKind::WindowBlur),
            _ => None,
        }
    }
}
