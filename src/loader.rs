//! # Attachment loader.
//!
//! Fetches and decrypts attachment payloads, remembering the plaintext
//! until the message view that asked for it is released.

use std::collections::HashMap;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;

use crate::attachment;
use crate::context::Context;
use crate::crypto::{Decrypted, SignatureStatus};
use crate::message::{Attachment, AttachmentId, EncryptionScheme, Message, MsgId};

#[derive(Debug, Clone)]
struct Loaded {
    msg_id: MsgId,
    decrypted: Decrypted,
}

/// Memo of decrypted attachment payloads.
#[derive(Debug, Default)]
pub struct AttachmentLoader {
    memo: Mutex<HashMap<AttachmentId, Loaded>>,
}

impl AttachmentLoader {
    /// Whether the plaintext of `attachment_id` is known.
    pub fn has(&self, attachment_id: &AttachmentId) -> bool {
        self.memo.lock().contains_key(attachment_id)
    }

    pub fn get_cached(&self, attachment_id: &AttachmentId) -> Option<Decrypted> {
        self.memo
            .lock()
            .get(attachment_id)
            .map(|loaded| loaded.decrypted.clone())
    }

    pub(crate) fn insert(&self, msg_id: &MsgId, attachment_id: &AttachmentId, decrypted: Decrypted) {
        self.memo.lock().insert(
            attachment_id.clone(),
            Loaded {
                msg_id: msg_id.clone(),
                decrypted,
            },
        );
    }

    pub(crate) fn remove(&self, attachment_id: &AttachmentId) -> bool {
        self.memo.lock().remove(attachment_id).is_some()
    }

    /// Forgets everything loaded for `msg_id`.
    pub(crate) fn forget(&self, msg_id: &MsgId) -> usize {
        let mut memo = self.memo.lock();
        let before = memo.len();
        memo.retain(|_, loaded| &loaded.msg_id != msg_id);
        before - memo.len()
    }

    pub(crate) fn clear(&self) {
        self.memo.lock().clear();
    }
}

/// Returns the plaintext of `attachment`.
///
/// PGP/MIME attachments arrive decrypted with the body. Separately
/// encrypted ones are downloaded and decrypted with the private keys of
/// the address the message belongs to.
pub async fn get(context: &Context, message: &Message, attachment: &Attachment) -> Result<Decrypted> {
    if let Some(decrypted) = context.loader.get_cached(&attachment.id) {
        return Ok(decrypted);
    }

    let decrypted = match message.encryption_of(attachment) {
        EncryptionScheme::Mime => Decrypted {
            data: attachment
                .data
                .clone()
                .with_context(|| format!("no PGP/MIME plaintext for {}", attachment.id))?,
            signature: attachment.signature_status,
        },
        EncryptionScheme::None => Decrypted {
            data: attachment::download(context, &attachment.id).await?,
            signature: SignatureStatus::NotSigned,
        },
        EncryptionScheme::Inline => {
            let key_packets = attachment
                .key_packets
                .as_deref()
                .with_context(|| format!("{} has no key packets", attachment.id))?;
            let data = attachment::download(context, &attachment.id).await?;
            let keys = context
                .keys
                .private_keys(&message.address_id)
                .with_context(|| format!("no private keys for address {}", message.address_id))?;
            context
                .crypto
                .decrypt_attachment(key_packets, &data, &keys)
                .await
                .with_context(|| format!("failed to decrypt {}", attachment.id))?
        }
    };

    context
        .loader
        .insert(&message.id, &attachment.id, decrypted.clone());
    Ok(decrypted)
}
