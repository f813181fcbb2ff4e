//! Soft-error and protocol event plumbing.
//!
//! Nothing on the sample path returns a `Result`. Anything worth telling
//! the operator about crosses component boundaries as an [`Event`] instead,
//! and the runtime fans events out to whichever [`EventSink`] it was given.

use std::sync::{Arc, Mutex};

use serde::Serialize;

/// What happened. The wire name (`decoder.overrun` etc) is what shows up in
/// logs and session exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    DecoderOverrun,
    DecoderUnknownPattern,
    DecoderAnomalousTiming,
    QsoUnexpectedInput,
    QsoComplete,
    PatternsInvalid,
    TemplateUnresolved,
    AudioError,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::DecoderOverrun => "decoder.overrun",
            EventKind::DecoderUnknownPattern => "decoder.unknown_pattern",
            EventKind::DecoderAnomalousTiming => "decoder.anomalous_timing",
            EventKind::QsoUnexpectedInput => "qso.unexpected_input",
            EventKind::QsoComplete => "qso.complete",
            EventKind::PatternsInvalid => "config.patterns_invalid",
            EventKind::TemplateUnresolved => "config.template_unresolved",
            EventKind::AudioError => "audio.error",
        }
    }
}

/// One event record.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub detail: String,
}

impl Event {
    pub fn new(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.detail)
    }
}

/// Where events go. Implementations must tolerate being called from worker
/// threads.
pub trait EventSink: Send + Sync {
    fn event(&self, event: Event);
}

/// Sink that forwards everything to the `log` crate.
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: Event) {
        match event.kind {
            EventKind::AudioError | EventKind::TemplateUnresolved => log::error!("{event}"),
            EventKind::PatternsInvalid | EventKind::DecoderOverrun => log::warn!("{event}"),
            _ => log::debug!("{event}"),
        }
    }
}

/// Sink that keeps everything, for tests and for the session export.
#[derive(Default)]
pub struct CollectorSink {
    events: Mutex<Vec<Event>>,
}

impl CollectorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl EventSink for CollectorSink {
    fn event(&self, event: Event) {
        log::debug!("{event}");
        let mut events = self.events.lock().unwrap();
        events.push(event);
        // Keep the tail if some component goes event-happy.
        if events.len() > 2000 {
            let excess = events.len() - 1000;
            events.drain(..excess);
        }
    }
}
