// src/progress.rs

//! Transaction progress notifications
//!
//! The runner reports what it is doing through a `TransactionCallback`.
//! The install-open-file event is the one place a callback can hand
//! something back: a caller that wants to supply the package file itself
//! (for instance from a download cache) returns it there.

use std::fs::File;
use tracing::{debug, info, warn};

/// What a progress event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    TransStart,
    TransProgress,
    TransStop,
    InstStart,
    InstProgress,
    InstStop,
    /// The payload of a package is needed; the callback may return the file
    InstOpenFile,
    InstCloseFile,
    UninstStart,
    UninstProgress,
    UninstStop,
    RepackageStart,
    RepackageProgress,
    RepackageStop,
    /// Payload extraction failed
    UnpackError,
    /// An archive entry could not be written
    CpioError,
}

/// One notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub kind: CallbackKind,
    /// NEVRA of the package concerned (empty for transaction-wide events)
    pub key: String,
    pub amount: u64,
    pub total: u64,
}

impl CallbackEvent {
    pub fn new(kind: CallbackKind, key: impl Into<String>, amount: u64, total: u64) -> Self {
        Self {
            kind,
            key: key.into(),
            amount,
            total,
        }
    }
}

/// Receiver of transaction progress
pub trait TransactionCallback {
    /// Handle one event; only `InstOpenFile` looks at the return value
    fn notify(&mut self, event: &CallbackEvent) -> Option<File>;
}

/// Logs every event through `tracing`
#[derive(Debug, Default)]
pub struct LogCallback;

impl TransactionCallback for LogCallback {
    fn notify(&mut self, event: &CallbackEvent) -> Option<File> {
        match event.kind {
            CallbackKind::TransStart => info!("Preparing {} elements", event.total),
            CallbackKind::InstStart => info!("Installing {}", event.key),
            CallbackKind::UninstStart => info!("Removing {}", event.key),
            CallbackKind::RepackageStart => info!("Repackaging {}", event.key),
            CallbackKind::UnpackError | CallbackKind::CpioError => {
                warn!("Unpacking {} failed", event.key)
            }
            CallbackKind::TransProgress
            | CallbackKind::TransStop
            | CallbackKind::InstProgress
            | CallbackKind::InstStop
            | CallbackKind::InstOpenFile
            | CallbackKind::InstCloseFile
            | CallbackKind::UninstProgress
            | CallbackKind::UninstStop
            | CallbackKind::RepackageProgress
            | CallbackKind::RepackageStop => debug!(
                "{:?} {} ({}/{})",
                event.kind, event.key, event.amount, event.total
            ),
        }
        None
    }
}

/// Ignores every event
#[derive(Debug, Default)]
pub struct SilentCallback;

impl TransactionCallback for SilentCallback {
    fn notify(&mut self, _event: &CallbackEvent) -> Option<File> {
        None
    }
}

/// Records every event, for inspecting a run after the fact
#[derive(Debug, Default)]
pub struct RecordingCallback {
    pub events: Vec<CallbackEvent>,
}

impl RecordingCallback {
    pub fn kinds(&self) -> Vec<CallbackKind> {
        self.events.iter().map(|e| e.kind).collect()
    }

    /// Events of one kind for one package
    pub fn for_key(&self, kind: CallbackKind, key: &str) -> Vec<&CallbackEvent> {
        self.events
            .iter()
            .filter(|e| e.kind == kind && e.key == key)
            .collect()
    }
}

impl TransactionCallback for RecordingCallback {
    fn notify(&mut self, event: &CallbackEvent) -> Option<File> {
        self.events.push(event.clone());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_callback_filters_by_key() {
        let mut cb = RecordingCallback::default();
        cb.notify(&CallbackEvent::new(CallbackKind::InstStart, "a-1-1.noarch", 0, 1));
        cb.notify(&CallbackEvent::new(CallbackKind::InstStart, "b-1-1.noarch", 0, 1));
        cb.notify(&CallbackEvent::new(CallbackKind::InstStop, "a-1-1.noarch", 1, 1));

        assert_eq!(cb.for_key(CallbackKind::InstStart, "a-1-1.noarch").len(), 1);
        assert_eq!(cb.kinds().len(), 3);
    }

    #[test]
    fn test_log_and_silent_callbacks_supply_no_file() {
        let event = CallbackEvent::new(CallbackKind::InstOpenFile, "a-1-1.noarch", 0, 0);
        assert!(LogCallback.notify(&event).is_none());
        assert!(SilentCallback.notify(&event).is_none());
    }
}
