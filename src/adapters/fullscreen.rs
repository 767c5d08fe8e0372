//! Fullscreen adapter

use super::host::{EventClass, HostEvent, HostEventKind};
use super::SignalAdapter;
use crate::types::SignalKind;

/// Emits `FullscreenExit` when the document leaves fullscreen
#[derive(Debug, Default, Clone, Copy)]
pub struct FullscreenAdapter;

impl SignalAdapter for FullscreenAdapter {
    fn name(&self) -> &'static str {
        "fullscreen"
    }

    fn event_class(&self) -> EventClass {
        EventClass::Fullscreen
    }

    fn translate(&self, event: &HostEvent) -> Option<SignalKind> {
        match event.kind {
            HostEventKind::FullscreenChange { active: false } => Some(SignalKind::FullscreenExit),
            _ => None,
        }
    }
}
