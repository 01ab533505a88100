//! # Attachment transfer.
//!
//! Uploads encrypted attachment packets with progress reports and
//! cancellation, and wraps the remaining attachment endpoints.
//!
//! Every upload in flight is a [`PendingUploadRequest`] in the
//! [`UploadRegistry`] of the context. A request leaves the registry before
//! its outcome is reported, whatever the outcome is.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Context as _, Result};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    UPLOAD_PROGRESS_DONE, UPLOAD_PROGRESS_START, UPLOAD_PROGRESS_TRANSFER_MAX,
};
use crate::context::Context;
use crate::crypto::{Decrypted, SessionKey, SignatureStatus};
use crate::embedded;
use crate::events::EventType;
use crate::message::{Attachment, AttachmentId, Message, MsgId};
use crate::net::{self, ApiResponse, FormPart, Method, RequestBody};
use crate::stock_str;
use crate::tools::{create_id, time_ms, truncate};

/// Locally generated identifier of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadRequestId(String);

impl UploadRequestId {
    fn generate() -> Self {
        Self(format!("up{}-{}", create_id(), time_ms()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An upload in flight.
#[derive(Debug, Clone)]
pub struct PendingUploadRequest {
    pub id: UploadRequestId,
    pub msg_id: MsgId,
    pub filename: String,
    pub mime_type: String,
    pub content_id: Option<String>,

    /// Size of the encrypted data packet.
    pub size: u64,

    pub(crate) abort: CancellationToken,
}

/// Uploads in flight, reachable by request and by message.
///
/// Requests live in one arena, both indices only hold slot numbers.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    slots: Vec<Option<PendingUploadRequest>>,
    free: Vec<usize>,
    by_request: HashMap<UploadRequestId, usize>,
    by_message: HashMap<MsgId, Vec<usize>>,
}

impl UploadRegistry {
    /// Returns a request id that is not in use.
    fn next_id(&self) -> UploadRequestId {
        loop {
            let id = UploadRequestId::generate();
            if !self.by_request.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, request: PendingUploadRequest) {
        let id = request.id.clone();
        let msg_id = request.msg_id.clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                if let Some(entry) = self.slots.get_mut(slot) {
                    *entry = Some(request);
                }
                slot
            }
            None => {
                self.slots.push(Some(request));
                self.slots.len() - 1
            }
        };
        self.by_request.insert(id, slot);
        self.by_message.entry(msg_id).or_default().push(slot);
    }

    fn remove(&mut self, id: &UploadRequestId) -> Option<PendingUploadRequest> {
        let slot = self.by_request.remove(id)?;
        let request = self.slots.get_mut(slot).and_then(Option::take)?;
        if let Some(slots) = self.by_message.get_mut(&request.msg_id) {
            slots.retain(|s| *s != slot);
            if slots.is_empty() {
                self.by_message.remove(&request.msg_id);
            }
        }
        self.free.push(slot);
        Some(request)
    }

    pub fn get(&self, id: &UploadRequestId) -> Option<&PendingUploadRequest> {
        let slot = self.by_request.get(id)?;
        self.slots.get(*slot).and_then(Option::as_ref)
    }

    pub fn contains(&self, id: &UploadRequestId) -> bool {
        self.by_request.contains_key(id)
    }

    /// Requests of `msg_id` in the order they were started.
    pub fn for_message(&self, msg_id: &MsgId) -> Vec<&PendingUploadRequest> {
        self.by_message
            .get(msg_id)
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|slot| self.slots.get(*slot).and_then(Option::as_ref))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingUploadRequest> {
        self.by_request.clear();
        self.by_message.clear();
        self.free.clear();
        self.slots.drain(..).flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_request.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (id, slot) in &self.by_request {
            let request = self.slots[*slot].as_ref().unwrap();
            assert_eq!(&request.id, id);
            assert!(self.by_message[&request.msg_id].contains(slot));
        }
        for (msg_id, slots) in &self.by_message {
            assert!(!slots.is_empty());
            for slot in slots {
                let request = self.slots[*slot].as_ref().unwrap();
                assert_eq!(&request.msg_id, msg_id);
                assert_eq!(self.by_request[&request.id], *slot);
            }
        }
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        assert_eq!(live, self.by_request.len());
    }
}

/// Encrypted attachment ready for upload.
#[derive(Debug, Clone, Default)]
pub struct EncryptedPacket {
    pub filename: String,
    pub mime_type: String,

    /// Session key encrypted to the sender's keys.
    pub keys: Vec<u8>,

    /// Encrypted payload.
    pub data: Vec<u8>,

    /// Detached signature of the plaintext.
    pub signature: Option<Vec<u8>>,
}

/// What the composer knows about an attachment while it is uploaded.
#[derive(Debug, Clone, Default)]
pub struct PendingAttachment {
    pub filename: String,

    /// Set for images inserted into the body.
    pub content_id: Option<String>,

    /// Plaintext of an inline image, shown without downloading it again
    /// once the upload succeeded.
    pub inline: Option<Vec<u8>>,
}

/// Terminal outcome of an upload that did not fail.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Uploaded {
        request_id: UploadRequestId,
        session_key: SessionKey,
        attachment: Attachment,
    },

    /// Cancelled by the user or because the network went away.
    Aborted { request_id: UploadRequestId },
}

impl UploadOutcome {
    pub fn request_id(&self) -> &UploadRequestId {
        match self {
            UploadOutcome::Uploaded { request_id, .. } | UploadOutcome::Aborted { request_id } => {
                request_id
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, UploadOutcome::Aborted { .. })
    }
}

/// Upload failures.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The server refused the upload.
    #[error("upload rejected with status {status}: {reason}")]
    Server { status: u16, reason: String },

    /// The server answered with something that is not an upload result.
    #[error("invalid upload response: {reason}")]
    InvalidResponse { reason: String, raw: String },

    /// The upload went through, but the key packets could not be
    /// decrypted locally.
    #[error("failed to recover session key: {0:#}")]
    SessionKey(anyhow::Error),

    /// No upload with this id is in flight for the message.
    #[error("no upload request {0}")]
    UnknownRequest(UploadRequestId),

    #[error("upload failed: {0:#}")]
    Transport(anyhow::Error),
}

impl UploadError {
    /// Reason suitable for the user.
    pub fn reason(&self) -> String {
        match self {
            UploadError::Server { reason, .. } | UploadError::InvalidResponse { reason, .. } => {
                reason.clone()
            }
            UploadError::SessionKey(err) | UploadError::Transport(err) => format!("{err:#}"),
            UploadError::UnknownRequest(_) => self.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UploadResponse {
    attachment: Option<Attachment>,
    error: Option<String>,
}

/// Emits monotonic progress events for one request.
#[derive(Debug)]
struct ProgressReporter {
    context: Context,
    request_id: UploadRequestId,
    msg_id: MsgId,
    last: AtomicU8,
}

impl ProgressReporter {
    fn report(&self, progress: u8, is_start: bool) {
        let previous = self.last.fetch_max(progress, Ordering::SeqCst);
        if progress <= previous && !is_start {
            return;
        }
        self.context.emit_event(EventType::AttachmentUploadProgress {
            request_id: self.request_id.clone(),
            msg_id: self.msg_id.clone(),
            progress,
            is_start,
        });
    }

    fn transferred(&self, sent: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = sent.saturating_mul(u64::from(UPLOAD_PROGRESS_TRANSFER_MAX)) / total;
        let percent = percent.clamp(
            u64::from(UPLOAD_PROGRESS_START),
            u64::from(UPLOAD_PROGRESS_TRANSFER_MAX),
        );
        self.report(percent as u8, false);
    }
}

/// Uploads `packet` as attachment of `message`.
///
/// Progress is reported with [`EventType::AttachmentUploadProgress`].
/// `total` is the number of attachments uploaded in the same batch and
/// is passed on in [`EventType::AttachmentUploaded`].
///
/// Cancellation with [`cancel`] or [`Context::set_online`] is not an
/// error, the upload then resolves to [`UploadOutcome::Aborted`].
pub async fn upload(
    context: &Context,
    packet: EncryptedPacket,
    message: &Message,
    pending: PendingAttachment,
    total: usize,
) -> Result<UploadOutcome, UploadError> {
    let msg_id = message.id.clone();
    let filename = if packet.filename.is_empty() {
        pending.filename.clone()
    } else {
        packet.filename.clone()
    };
    let abort = CancellationToken::new();
    let request_id = {
        let mut uploads = context.uploads.lock();
        let id = uploads.next_id();
        uploads.insert(PendingUploadRequest {
            id: id.clone(),
            msg_id: msg_id.clone(),
            filename: filename.clone(),
            mime_type: packet.mime_type.clone(),
            content_id: pending.content_id.clone(),
            size: packet.data.len() as u64,
            abort: abort.clone(),
        });
        id
    };

    let reporter = Arc::new(ProgressReporter {
        context: context.clone(),
        request_id: request_id.clone(),
        msg_id: msg_id.clone(),
        last: AtomicU8::new(0),
    });
    reporter.report(UPLOAD_PROGRESS_START, true);

    let form = upload_form(&packet, &filename, message, &pending);
    let mut request = match net::api_request(
        context,
        Method::Post,
        "attachments",
        RequestBody::Multipart(form),
    ) {
        Ok(request) => request,
        Err(err) => {
            context.uploads.lock().remove(&request_id);
            let err = UploadError::Transport(err);
            return Err(fail(context, &request_id, &msg_id, &filename, err).await);
        }
    };
    let progress = Arc::clone(&reporter);
    request.progress = Some(Arc::new(move |sent: u64, total: u64| {
        progress.transferred(sent, total)
    }));

    let mut network = context.network_status();
    let result = tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        _ = async { network.wait_for(|online| !*online).await.ok(); } => None,
        res = context.transport.send(request) => Some(res),
    };
    context.uploads.lock().remove(&request_id);

    let Some(result) = result else {
        context.emit_event(EventType::AttachmentUploadCancelled {
            request_id: request_id.clone(),
            msg_id: msg_id.clone(),
        });
        let text = stock_str::upload_cancelled(context, &filename).await;
        info!(context, "{}", text);
        return Ok(UploadOutcome::Aborted { request_id });
    };

    let attachment = match result {
        Ok(response) => parse_response(context, &response).await,
        Err(err) => Err(UploadError::Transport(err)),
    };
    let mut attachment = match attachment {
        Ok(attachment) => attachment,
        Err(err) => return Err(fail(context, &request_id, &msg_id, &filename, err).await),
    };

    reporter.report(UPLOAD_PROGRESS_DONE, false);
    context.emit_event(EventType::AttachmentUploaded {
        request_id: request_id.clone(),
        msg_id: msg_id.clone(),
        total,
    });

    let session_key = match recover_session_key(context, message, &packet).await {
        Ok(session_key) => session_key,
        Err(err) => {
            warn!(
                context,
                "Uploaded {} for {} but could not recover its session key: {:#}.",
                attachment.id,
                msg_id,
                err
            );
            return Err(UploadError::SessionKey(err));
        }
    };

    attachment.session_key = Some(session_key.clone());
    if attachment.key_packets.is_none() {
        attachment.key_packets = Some(packet.keys.clone());
    }
    if attachment.signature.is_none() {
        attachment.signature.clone_from(&packet.signature);
    }

    let cid = pending.content_id.clone().or_else(|| attachment.cid());
    if let (Some(cid), Some(plaintext)) = (cid, pending.inline) {
        let signature = if packet.signature.is_some() {
            SignatureStatus::Valid
        } else {
            SignatureStatus::NotSigned
        };
        embedded::add_embedded(context, &msg_id, &cid, plaintext.clone(), &packet.mime_type);
        context.loader.insert(
            &msg_id,
            &attachment.id,
            Decrypted {
                data: plaintext,
                signature,
            },
        );
    }

    info!(context, "Uploaded {} as {} for {}.", filename, attachment.id, msg_id);
    Ok(UploadOutcome::Uploaded {
        request_id,
        session_key,
        attachment,
    })
}

fn upload_form(
    packet: &EncryptedPacket,
    filename: &str,
    message: &Message,
    pending: &PendingAttachment,
) -> Vec<FormPart> {
    let mut parts = vec![
        FormPart::text("Filename", filename),
        FormPart::text("MessageID", message.id.as_str()),
        FormPart::text("ContentID", pending.content_id.clone().unwrap_or_default()),
        FormPart::text("MIMEType", &packet.mime_type),
        FormPart::blob("KeyPackets", packet.keys.clone()),
        FormPart::blob("DataPacket", packet.data.clone()),
    ];
    if let Some(signature) = &packet.signature {
        parts.push(FormPart::blob("Signature", signature.clone()));
    }
    parts
}

async fn parse_response(
    context: &Context,
    response: &ApiResponse,
) -> Result<Attachment, UploadError> {
    let parsed: UploadResponse = match serde_json::from_slice(&response.body) {
        Ok(parsed) => parsed,
        Err(err) => {
            let raw = truncate(&response.text(), 500).to_string();
            warn!(context, "Unparsable upload response ({}): {}", err, raw);
            return Err(UploadError::InvalidResponse {
                reason: stock_str::upload_failed_retry(context).await,
                raw,
            });
        }
    };

    if response.status == 413 {
        // Size limit, the server text is not meant for users.
        return Err(UploadError::Server {
            status: response.status,
            reason: stock_str::upload_failed_retry(context).await,
        });
    }
    if !response.is_success() || parsed.error.is_some() {
        return Err(UploadError::Server {
            status: response.status,
            reason: parsed
                .error
                .unwrap_or_else(|| format!("HTTP status {}", response.status)),
        });
    }
    match parsed.attachment {
        Some(attachment) => Ok(attachment),
        None => Err(UploadError::InvalidResponse {
            reason: stock_str::upload_failed_retry(context).await,
            raw: truncate(&response.text(), 500).to_string(),
        }),
    }
}

async fn recover_session_key(
    context: &Context,
    message: &Message,
    packet: &EncryptedPacket,
) -> Result<SessionKey> {
    let keys = context
        .keys
        .private_keys(&message.address_id)
        .with_context(|| format!("no private keys for address {}", message.address_id))?;
    context.crypto.decrypt_session_key(&packet.keys, &keys).await
}

async fn fail(
    context: &Context,
    request_id: &UploadRequestId,
    msg_id: &MsgId,
    filename: &str,
    err: UploadError,
) -> UploadError {
    let reason = err.reason();
    context.emit_event(EventType::AttachmentUploadFailed {
        request_id: request_id.clone(),
        msg_id: msg_id.clone(),
        reason: reason.clone(),
    });
    let text = stock_str::upload_failed(context, filename, &reason).await;
    error!(context, "{}", text);
    err
}

/// Aborts the upload `request_id` of `msg_id`.
///
/// Fails if no such upload is in flight, cancelling twice is a bug in
/// the caller.
pub fn cancel(
    context: &Context,
    request_id: &UploadRequestId,
    msg_id: &MsgId,
) -> Result<(), UploadError> {
    let request = {
        let mut uploads = context.uploads.lock();
        let owned = uploads
            .get(request_id)
            .map_or(false, |request| &request.msg_id == msg_id);
        if owned {
            uploads.remove(request_id)
        } else {
            None
        }
    };
    let Some(request) = request else {
        return Err(UploadError::UnknownRequest(request_id.clone()));
    };
    request.abort.cancel();
    Ok(())
}

/// Aborts every upload of `msg_id`, returns how many were aborted.
pub fn cancel_all(context: &Context, msg_id: &MsgId) -> usize {
    let aborted: Vec<_> = {
        let mut uploads = context.uploads.lock();
        let ids: Vec<_> = uploads
            .for_message(msg_id)
            .into_iter()
            .map(|request| request.id.clone())
            .collect();
        ids.iter().filter_map(|id| uploads.remove(id)).collect()
    };
    for request in &aborted {
        request.abort.cancel();
    }
    aborted.len()
}

/// Uploads of `msg_id` still in flight.
pub fn pending_uploads(context: &Context, msg_id: &MsgId) -> Vec<UploadRequestId> {
    context
        .uploads
        .lock()
        .for_message(msg_id)
        .into_iter()
        .map(|request| request.id.clone())
        .collect()
}

/// Number of uploads in flight in the session.
pub fn uploading_count(context: &Context) -> usize {
    context.uploads.lock().len()
}

/// Downloads the raw, still encrypted, data packet of an attachment.
pub async fn download(context: &Context, attachment_id: &AttachmentId) -> Result<Vec<u8>> {
    let request = net::api_request(
        context,
        Method::Get,
        &format!("attachments/{}", attachment_id.as_str()),
        RequestBody::Empty,
    )?;
    let response = context.transport.send(request).await?;
    ensure!(
        response.is_success(),
        "failed to download {attachment_id}: HTTP status {}",
        response.status
    );
    Ok(response.body.to_vec())
}

/// Deletes `attachment` of `message` on the server.
pub async fn delete_remote(
    context: &Context,
    message: &Message,
    attachment: &Attachment,
) -> Result<()> {
    let request = net::api_request(
        context,
        Method::Delete,
        &format!("attachments/{}", attachment.id.as_str()),
        RequestBody::Json(json!({ "MessageID": message.id })),
    )?;
    let response = context.transport.send(request).await?;
    check_response(&response).with_context(|| format!("failed to delete {}", attachment.id))?;
    context.loader.remove(&attachment.id);
    info!(context, "Deleted {} of {}.", attachment.id, message.id);
    Ok(())
}

/// Replaces the detached signature of an attachment.
pub async fn update_signature(
    context: &Context,
    attachment_id: &AttachmentId,
    signature: &[u8],
) -> Result<()> {
    let request = net::api_request(
        context,
        Method::Put,
        &format!("attachments/{}/signature", attachment_id.as_str()),
        RequestBody::Json(json!({
            "Signature": base64::engine::general_purpose::STANDARD.encode(signature)
        })),
    )?;
    let response = context.transport.send(request).await?;
    check_response(&response)
        .with_context(|| format!("failed to update signature of {attachment_id}"))
}

fn check_response(response: &ApiResponse) -> Result<()> {
    let error = serde_json::from_slice::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|json| json.get("Error").and_then(|e| e.as_str()).map(ToString::to_string));
    if let Some(error) = error {
        bail!("{error} (HTTP status {})", response.status);
    }
    ensure!(response.is_success(), "HTTP status {}", response.status);
    Ok(())
}
