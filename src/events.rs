//! # Events.

use anyhow::{Context as _, Result};
use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender, TryRecvError};
use tokio::sync::Mutex;

use crate::attachment::UploadRequestId;
use crate::message::{AttachmentId, MsgId};

/// Event channel.
#[derive(Debug, Clone)]
pub struct Events {
    /// Unused receiver to prevent the channel from closing.
    _receiver: InactiveReceiver<Event>,

    /// Sender side of the event channel.
    sender: Sender<Event>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    /// Creates a new event channel.
    pub fn new() -> Self {
        let (mut sender, _receiver) = broadcast(1_000);

        // We only keep this receiver around
        // to prevent the channel from closing.
        // Deactivating it to prevent it from consuming memory
        // holding events that are not going to be received.
        let _receiver = _receiver.deactivate();

        // Remove oldest event on overflow.
        sender.set_overflow(true);

        Self { _receiver, sender }
    }

    /// Emits an event into event channel.
    ///
    /// If the channel is full, deletes the oldest event first.
    pub fn emit(&self, event: Event) {
        self.sender.try_broadcast(event).ok();
    }

    /// Creates an event emitter.
    pub fn get_emitter(&self) -> EventEmitter {
        EventEmitter(Mutex::new(self.sender.new_receiver()))
    }
}

/// A receiver of events from a [`Context`].
///
/// See [`Context::get_event_emitter`] to create an instance. Every emitter receives
/// the events emitted after its creation.
///
/// [`Context`]: crate::context::Context
/// [`Context::get_event_emitter`]: crate::context::Context::get_event_emitter
#[derive(Debug)]
pub struct EventEmitter(Mutex<Receiver<Event>>);

impl EventEmitter {
    /// Async recv of an event. Return `None` if the `Sender` has been dropped.
    pub async fn recv(&self) -> Option<Event> {
        let mut lock = self.0.lock().await;
        match lock.recv().await {
            Err(async_broadcast::RecvError::Overflowed(n)) => Some(Event {
                id: 0,
                typ: EventType::EventChannelOverflow { n },
            }),
            Err(async_broadcast::RecvError::Closed) => None,
            Ok(event) => Some(event),
        }
    }

    /// Tries to receive an event without blocking.
    ///
    /// Returns error if no events are available for reception
    /// or if receiver mutex is locked by a concurrent call to [`recv`]
    /// or `try_recv`.
    ///
    /// [`recv`]: Self::recv
    pub fn try_recv(&self) -> Result<Event> {
        // Using `try_lock` instead of `lock`
        // to avoid blocking
        // in case there is a concurrent call to `recv`.
        let mut lock = self.0.try_lock().context("EventEmitter is busy")?;
        match lock.try_recv() {
            Err(TryRecvError::Overflowed(n)) => Ok(Event {
                id: 0,
                typ: EventType::EventChannelOverflow { n },
            }),
            Err(err) => Err(err.into()),
            Ok(event) => Ok(event),
        }
    }
}

/// The event emitted by a [`Context`] from an [`EventEmitter`].
///
/// [`Context`]: crate::context::Context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The ID of the [`Context`] which emitted this event.
    ///
    /// This allows using multiple [`Context`]s in a single process as they are identified
    /// by this ID.
    ///
    /// [`Context`]: crate::context::Context
    pub id: u32,
    /// The event payload.
    pub typ: EventType,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// The library-user may write an informational string to the log.
    ///
    /// This event should *not* be reported to the end-user using a popup or something like
    /// that.
    Info(String),

    /// The library-user should write a warning string to the log.
    ///
    /// This event should *not* be reported to the end-user using a popup or something like
    /// that.
    Warning(String),

    /// The library-user should report an error to the end-user.
    Error(String),

    /// Upload progress of one attachment, in percent.
    ///
    /// The first event of an upload has `is_start` set and reports 1.
    /// Successful uploads end with exactly one event reporting 100.
    AttachmentUploadProgress {
        /// Request the progress belongs to.
        request_id: UploadRequestId,
        /// Message the attachment is uploaded for.
        msg_id: MsgId,
        /// Percentage, never decreasing for one request.
        progress: u8,
        /// Set on the first event of the request only.
        is_start: bool,
    },

    /// The server accepted an attachment upload.
    AttachmentUploaded {
        /// Request that finished.
        request_id: UploadRequestId,
        /// Message the attachment belongs to.
        msg_id: MsgId,
        /// Number of attachments uploaded in the same batch.
        total: usize,
    },

    /// An attachment upload failed.
    AttachmentUploadFailed {
        /// Request that failed.
        request_id: UploadRequestId,
        /// Message the attachment was uploaded for.
        msg_id: MsgId,
        /// Human readable reason, possibly translated.
        reason: String,
    },

    /// An attachment upload was aborted, either by the user or because the
    /// network went away.
    AttachmentUploadCancelled {
        /// Request that was aborted.
        request_id: UploadRequestId,
        /// Message the attachment was uploaded for.
        msg_id: MsgId,
    },

    /// Embedded content of a message was resolved.
    EmbeddedReady {
        /// Message the content belongs to.
        msg_id: MsgId,
        /// Number of `cid:` references that point at decrypted content.
        resolved: usize,
        /// Number of `cid:` references left unresolved.
        unresolved: usize,
    },

    /// The signature of a freshly decrypted attachment should be verified again.
    AttachmentSignatureRecheck {
        /// Message the attachment belongs to.
        msg_id: MsgId,
        /// The attachment to verify.
        attachment_id: AttachmentId,
    },

    /// Event channel overflowed, `n` events were dropped.
    EventChannelOverflow {
        /// Number of events dropped.
        n: u64,
    },
}
