//! Domain events surfaced to the shell.

use tokio::sync::mpsc;

use crate::types::{Model, Photo};

/// Notifications emitted by the engine, at-least-once and best-effort ordered.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    FolderAdded(String),
    FolderRemoved(String),
    PhotoAdded(Box<Photo>),
    PhotoRemoved(String),
    ModelAdded {
        version_id: i64,
        name: String,
        version_name: String,
    },
    ModelRemoved {
        version_id: i64,
        name: String,
        version_name: String,
    },
    ScanProgress {
        path: String,
        processed: usize,
        total: usize,
    },
}

impl DomainEvent {
    pub fn model_added(model: &Model) -> Self {
        DomainEvent::ModelAdded {
            version_id: model.version_id,
            name: model.name.clone(),
            version_name: model.version_name.clone(),
        }
    }

    pub fn model_removed(model: &Model) -> Self {
        DomainEvent::ModelRemoved {
            version_id: model.version_id,
            name: model.name.clone(),
            version_name: model.version_name.clone(),
        }
    }
}

/// Outbound event channel. Sending never blocks; a closed receiver drops events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: DomainEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("event receiver closed; dropping event");
        }
    }
}
