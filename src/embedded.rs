//! # Embedded content resolver.
//!
//! Binds the `cid:` references of a message body to the decrypted
//! attachments they name. A render goes through
//! [`RenderState::Unscanned`], [`RenderState::Scanned`],
//! [`RenderState::Decrypting`] and ends [`RenderState::Ready`]; the body
//! is then rewritten in one of two [`Direction`]s:
//!
//! * [`Direction::Blob`] points image nodes at blob handles of the
//!   [`EmbeddedStore`](crate::embedded_store::EmbeddedStore) for display,
//! * [`Direction::Cid`] turns them back into `cid:` references before the
//!   body is saved or sent.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::future::join_all;
use sha2::{Digest, Sha256};

use crate::base64_cache::Base64Cache;
use crate::constants::{
    DEFAULT_SIGNATURE_RECHECK_DELAY, EMBEDDED_CID_ATTR, EMBEDDED_CLASS, NEUTRALIZED_PREFIX,
};
use crate::context::Context;
use crate::crypto::SignatureStatus;
use crate::dom::{Document, Element};
use crate::embedded_store::BlobHandle;
use crate::events::EventType;
use crate::loader;
use crate::log::LogExt;
use crate::message::{Attachment, AttachmentId, EncryptionScheme, Message, MsgId};
use crate::neutralize::{neutralize, NeutralizeOptions};
use crate::stock_str;
use crate::tools::{addr_domain, create_id};

const CID_SCHEME: &str = "cid:";

/// Which way image nodes are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// `cid:` references become blob handles, for display.
    #[default]
    Blob,

    /// Blob handles become `cid:` references again, for storage.
    Cid,
}

impl Direction {
    /// Rewrites `element`, which refers to `cid`. Returns whether the
    /// element changed.
    fn apply(self, element: &mut Element, cid: &str, handle: Option<&BlobHandle>) -> bool {
        match self {
            Direction::Blob => to_blob(element, cid, handle),
            Direction::Cid => to_cid(element, cid),
        }
    }
}

fn to_blob(element: &mut Element, cid: &str, handle: Option<&BlobHandle>) -> bool {
    // Nothing decrypted yet, keep referring to nothing loadable.
    let Some(handle) = handle else {
        return false;
    };
    element.rename_attr(&format!("{NEUTRALIZED_PREFIX}src"), "src");
    element.set_attr("src", handle.as_str());
    element.set_attr(EMBEDDED_CID_ATTR, cid);
    element.add_class(EMBEDDED_CLASS);
    true
}

fn to_cid(element: &mut Element, cid: &str) -> bool {
    element.rename_attr(&format!("{NEUTRALIZED_PREFIX}src"), "src");
    element.set_attr("src", format!("{CID_SCHEME}{cid}"));
    element.remove_attr(EMBEDDED_CID_ATTR);
    element.remove_class(EMBEDDED_CLASS);
    true
}

/// Progress of an [`EmbeddedRender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Unscanned,
    Scanned,
    Decrypting,
    Ready,
}

/// An attachment referenced from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedReference {
    pub attachment_id: AttachmentId,
    pub cid: String,

    /// Number of elements referring to the attachment.
    pub nodes: usize,
}

/// One render of a message body.
#[derive(Debug)]
pub struct EmbeddedRender {
    direction: Direction,
    state: RenderState,
    source: String,
    document: Document,
    cache: Base64Cache,
    references: Vec<EmbeddedReference>,

    /// Cids whose attachment failed to decrypt.
    failed: BTreeSet<String>,
    failed_alt: Option<String>,
}

impl EmbeddedRender {
    pub fn new(body: impl Into<String>, direction: Direction) -> Self {
        Self {
            direction,
            state: RenderState::Unscanned,
            source: body.into(),
            document: Document::default(),
            cache: Base64Cache::new(),
            references: Vec::new(),
            failed: BTreeSet::new(),
            failed_alt: None,
        }
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Attachments referenced from the body, in order of first reference.
    pub fn references(&self) -> &[EmbeddedReference] {
        &self.references
    }

    /// Cids that stay unresolved because decryption failed.
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(String::as_str)
    }

    /// Inline payloads moved out of the body while scanning.
    pub fn base64_cache(&self) -> &Base64Cache {
        &self.cache
    }

    /// Parses the body and collects the attachments it references.
    ///
    /// Bodies rendered for display are neutralized first. Scanning twice
    /// returns the first result.
    pub fn scan(&mut self, context: &Context, message: &Message) -> Result<&[EmbeddedReference]> {
        if self.state != RenderState::Unscanned {
            return Ok(&self.references);
        }

        self.document = match self.direction {
            Direction::Blob => {
                let options = NeutralizeOptions {
                    cache: Some(&mut self.cache),
                    action: None,
                    base64_threshold: context.base64_threshold()?,
                };
                neutralize(self.source.as_str(), options)
            }
            Direction::Cid => Document::parse(&self.source),
        };

        let mut references: Vec<EmbeddedReference> = Vec::new();
        for element in self.document.elements() {
            let Some(cid) = referenced_cid(element) else {
                continue;
            };
            if let Some(reference) = references.iter_mut().find(|r| r.cid == cid) {
                reference.nodes += 1;
                continue;
            }
            if let Some(attachment) = message.attachment_by_cid(&cid) {
                references.push(EmbeddedReference {
                    attachment_id: attachment.id.clone(),
                    cid,
                    nodes: 1,
                });
            }
        }
        self.references = references;
        self.state = RenderState::Scanned;
        Ok(&self.references)
    }

    /// Makes sure every referenced attachment the policy allows is
    /// decrypted and stored.
    ///
    /// A failing attachment leaves its cid unresolved and does not stop
    /// the others. Content decrypted after the message was released is
    /// dropped.
    pub async fn decrypt(&mut self, context: &Context, message: &Message) -> Result<()> {
        if self.state == RenderState::Unscanned {
            self.scan(context, message)?;
        }
        self.state = RenderState::Decrypting;

        let show = message.show_embedded || context.show_embedded_images()?;
        let recheck_delay = context
            .signature_recheck_delay()
            .log(context)
            .unwrap_or(DEFAULT_SIGNATURE_RECHECK_DELAY);
        let guard = DecryptGuard::new(context, &message.id);

        let mut wanted: Vec<(&str, &Attachment)> = Vec::new();
        for reference in &self.references {
            let Some(attachment) = message.attachment(&reference.attachment_id) else {
                continue;
            };
            // Nothing to decrypt, e.g. mail from before encryption.
            if message.encryption_of(attachment) == EncryptionScheme::None {
                continue;
            }
            if context
                .embedded_store
                .lock()
                .adopt(&message.id, &reference.cid)
                .is_some()
            {
                continue;
            }
            if !show && !context.loader.has(&attachment.id) {
                continue;
            }
            wanted.push((reference.cid.as_str(), attachment));
        }

        let results = join_all(
            wanted
                .iter()
                .map(|(_, attachment)| loader::get(context, message, attachment)),
        )
        .await;

        let mut failed = Vec::new();
        let mut released = false;
        for ((cid, attachment), result) in wanted.into_iter().zip(results) {
            let decrypted = match result {
                Ok(decrypted) => decrypted,
                Err(err) => {
                    warn!(
                        context,
                        "Failed to decrypt embedded {} of {}: {:#}.", attachment.id, message.id, err
                    );
                    failed.push(cid.to_string());
                    continue;
                }
            };
            let stored = context.embedded_store.lock().put_if_current(
                &message.id,
                guard.epoch,
                cid,
                decrypted.data,
                &attachment.mime_type,
            );
            if stored.is_none() {
                released = true;
                continue;
            }
            if attachment.signature_status == SignatureStatus::Unknown {
                schedule_signature_recheck(context, &message.id, &attachment.id, recheck_delay);
            }
        }

        if released {
            context.loader.forget(&message.id);
            info!(
                context,
                "{} was released while decrypting, dropped its content.", message.id
            );
        }
        if !failed.is_empty() {
            self.failed.extend(failed);
            self.failed_alt = Some(stock_str::embedded_decrypt_failed(context).await);
        }

        let resolved = {
            let store = context.embedded_store.lock();
            self.references
                .iter()
                .filter(|reference| store.has(&reference.cid))
                .count()
        };
        context.emit_event(EventType::EmbeddedReady {
            msg_id: message.id.clone(),
            resolved,
            unresolved: self.references.len() - resolved,
        });
        self.state = RenderState::Ready;
        Ok(())
    }

    /// Rewrites the referencing elements in the direction of the render.
    /// Returns the number of rewritten elements.
    pub fn rewrite(&mut self, context: &Context) -> usize {
        if self.state == RenderState::Unscanned {
            return 0;
        }
        let cids: HashSet<&str> = self.references.iter().map(|r| r.cid.as_str()).collect();
        let direction = self.direction;
        let failed = &self.failed;
        let failed_alt = self.failed_alt.as_deref();
        let store = context.embedded_store.lock();

        let mut rewritten = 0;
        self.document.for_each_element_mut(|element| {
            let Some(cid) = referenced_cid(element) else {
                return;
            };
            if !cids.contains(cid.as_str()) {
                return;
            }
            let handle = store.get(&cid).map(|entry| &entry.handle);
            if direction.apply(element, &cid, handle) {
                rewritten += 1;
            }
            if direction == Direction::Blob && failed.contains(&cid) && !element.has_attr("alt") {
                if let Some(alt) = failed_alt {
                    element.set_attr("alt", alt);
                }
            }
        });
        self.state = RenderState::Ready;
        rewritten
    }

    /// The rewritten body.
    pub fn html(&self) -> String {
        self.document.to_html()
    }

    pub fn into_html(self) -> String {
        self.document.to_html()
    }
}

/// Keeps a decrypt of one message registered with the store until it
/// finishes or is dropped.
struct DecryptGuard<'a> {
    context: &'a Context,
    msg_id: &'a MsgId,
    epoch: u64,
}

impl<'a> DecryptGuard<'a> {
    fn new(context: &'a Context, msg_id: &'a MsgId) -> Self {
        let epoch = context.embedded_store.lock().begin_decrypt(msg_id);
        Self {
            context,
            msg_id,
            epoch,
        }
    }
}

impl Drop for DecryptGuard<'_> {
    fn drop(&mut self) {
        self.context.embedded_store.lock().end_decrypt(self.msg_id);
    }
}

fn schedule_signature_recheck(
    context: &Context,
    msg_id: &MsgId,
    attachment_id: &AttachmentId,
    delay: Duration,
) {
    let context = context.clone();
    let msg_id = msg_id.clone();
    let attachment_id = attachment_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        context.emit_event(EventType::AttachmentSignatureRecheck {
            msg_id,
            attachment_id,
        });
    });
}

/// Returns the cid an element refers to.
///
/// Looks at the neutralized `src`, the live one and finally at the cid
/// recorded by a blob rewrite.
pub fn referenced_cid(element: &Element) -> Option<String> {
    let from_src = [format!("{NEUTRALIZED_PREFIX}src").as_str(), "src"]
        .into_iter()
        .find_map(|name| element.attr(name).and_then(strip_cid_scheme));
    let cid = match from_src {
        Some(cid) => cid,
        None => element.attr(EMBEDDED_CID_ATTR)?.trim(),
    };
    if cid.is_empty() {
        None
    } else {
        Some(cid.to_string())
    }
}

fn strip_cid_scheme(value: &str) -> Option<&str> {
    let value = value.trim();
    let scheme = value.get(..CID_SCHEME.len())?;
    if scheme.eq_ignore_ascii_case(CID_SCHEME) {
        value.get(CID_SCHEME.len()..).map(str::trim)
    } else {
        None
    }
}

/// Options of [`parse`].
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub direction: Direction,

    /// Content to parse instead of the decrypted body.
    pub text: Option<String>,

    /// The message is read outside of the mailbox, e.g. an encrypted
    /// message opened from a link.
    pub is_outside: bool,
}

/// Resolves the embedded attachments of `message` and returns its body
/// rewritten in `options.direction`.
///
/// Updates [`Message::num_embedded`] with the referenced attachments that
/// are marked as embedded. Content to be stored is returned unchanged
/// when it references no attachment. Content for display is always
/// neutralized.
pub async fn parse(context: &Context, message: &mut Message, options: ParseOptions) -> Result<String> {
    let content = match options.text {
        Some(text) => text,
        None => message
            .decrypted_body()
            .with_context(|| format!("body of {} is not decrypted", message.id))?
            .to_string(),
    };

    let mut render = EmbeddedRender::new(content.as_str(), options.direction);
    let references = render.scan(context, message)?;
    let referenced = references.len();
    let embedded = references
        .iter()
        .filter_map(|reference| message.attachment(&reference.attachment_id))
        .filter(|attachment| attachment.is_embedded())
        .count();
    message.num_embedded = embedded;

    if options.direction == Direction::Cid && referenced == 0 && !options.is_outside {
        return Ok(content);
    }
    if options.direction == Direction::Blob {
        render.decrypt(context, message).await?;
    }
    render.rewrite(context);
    Ok(render.into_html())
}

/// Stores `data` as content of `cid` for `msg_id`, e.g. an image the
/// user just inserted into the composer, so it renders without a
/// download.
pub fn add_embedded(
    context: &Context,
    msg_id: &MsgId,
    cid: &str,
    data: Vec<u8>,
    mime: &str,
) -> BlobHandle {
    context
        .embedded_store
        .lock()
        .put(msg_id, cid, data, mime)
}

/// Returns the blob handle an element should display, if its content is
/// decrypted.
pub fn get_url(context: &Context, element: &Element) -> Option<String> {
    let cid = referenced_cid(element)?;
    let store = context.embedded_store.lock();
    store.get(&cid).map(|entry| entry.handle.to_string())
}

/// Removes the elements referring to `attachment` from `html`.
pub fn remove_embedded(attachment: &Attachment, html: &str) -> String {
    let Some(cid) = attachment.cid() else {
        return html.to_string();
    };
    let mut document = Document::parse(html);
    let removed =
        document.retain_elements(|element| referenced_cid(element).as_deref() != Some(cid.as_str()));
    if removed == 0 {
        return html.to_string();
    }
    document.to_html()
}

/// Generates a fresh content identifier in the domain of `sender`.
pub fn generate_cid(input: &str, sender: &str) -> String {
    let hash = hex::encode(Sha256::digest(format!("{input}{}", create_id()).as_bytes()));
    let random = hash.get(..16).unwrap_or(&hash);
    let domain = addr_domain(sender).unwrap_or("pm.me");
    format!("{random}@{domain}")
}

/// Tears down the view of `msg_id`: revokes its blob handles and forgets
/// the plaintext loaded for it.
pub fn release(context: &Context, msg_id: &MsgId) -> usize {
    let dropped = context.embedded_store.lock().release(msg_id);
    let forgotten = context.loader.forget(msg_id);
    info!(
        context,
        "Released {}: {} embedded entries, {} attachments.", msg_id, dropped, forgotten
    );
    dropped
}
