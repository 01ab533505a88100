//! # Embedded content store.
//!
//! Owns the decrypted bytes of embedded images and the blob handles that
//! render them. Handles are only valid until the owning message is
//! released.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::message::MsgId;

/// Dereferenceable in-memory locator of decrypted content, `blob:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHandle(String);

impl BlobHandle {
    fn generate() -> Self {
        Self(format!("blob:{}", Uuid::new_v4()))
    }

    /// The locator as it is written into `src` attributes.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `value` looks like a blob locator.
    pub fn is_blob_url(value: &str) -> bool {
        value.trim_start().starts_with("blob:")
    }
}

// Lets the handle index be queried with the `src` text directly.
impl Borrow<str> for BlobHandle {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A handle that was released or never created.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown blob handle {0}")]
pub struct UnknownHandle(pub String);

/// Decrypted content of one cid.
#[derive(Debug, Clone)]
pub struct EmbeddedEntry {
    pub data: Arc<[u8]>,
    pub mime: String,
    pub handle: BlobHandle,
    owners: BTreeSet<MsgId>,
}

impl EmbeddedEntry {
    /// Messages whose view currently uses the entry.
    pub fn owners(&self) -> impl Iterator<Item = &MsgId> {
        self.owners.iter()
    }
}

/// Decrypts of one message that are still running.
#[derive(Debug, Default, Clone, Copy)]
struct PendingDecrypts {
    /// Bumped when the message is released while decrypts run.
    epoch: u64,
    count: usize,
}

/// Store of decrypted embedded content, keyed by cid.
///
/// An entry stays alive as long as at least one message view uses it.
#[derive(Debug, Default)]
pub struct EmbeddedStore {
    entries: HashMap<String, EmbeddedEntry>,
    by_handle: HashMap<BlobHandle, String>,
    by_message: HashMap<MsgId, BTreeSet<String>>,

    /// Only messages with a decrypt in flight have an entry.
    pending: HashMap<MsgId, PendingDecrypts>,
}

impl EmbeddedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores decrypted content for `cid` and returns its handle.
    ///
    /// Content is stored once per cid, storing it again only registers
    /// `msg_id` as another owner and returns the existing handle.
    pub fn put(&mut self, msg_id: &MsgId, cid: &str, data: Vec<u8>, mime: &str) -> BlobHandle {
        let entry = self.entries.entry(cid.to_string()).or_insert_with(|| {
            let handle = BlobHandle::generate();
            EmbeddedEntry {
                data: data.into(),
                mime: mime.to_string(),
                handle,
                owners: BTreeSet::new(),
            }
        });
        entry.owners.insert(msg_id.clone());
        let handle = entry.handle.clone();

        self.by_handle.insert(handle.clone(), cid.to_string());
        self.by_message
            .entry(msg_id.clone())
            .or_default()
            .insert(cid.to_string());
        handle
    }

    /// Registers `msg_id` as owner of the content already stored for
    /// `cid`. Returns `None` if nothing is stored.
    pub fn adopt(&mut self, msg_id: &MsgId, cid: &str) -> Option<BlobHandle> {
        let entry = self.entries.get_mut(cid)?;
        entry.owners.insert(msg_id.clone());
        self.by_message
            .entry(msg_id.clone())
            .or_default()
            .insert(cid.to_string());
        Some(entry.handle.clone())
    }

    /// Registers a decrypt for `msg_id` and returns the epoch its results
    /// must be stored under. Every call must be paired with
    /// [`Self::end_decrypt`].
    pub fn begin_decrypt(&mut self, msg_id: &MsgId) -> u64 {
        let pending = self.pending.entry(msg_id.clone()).or_default();
        pending.count += 1;
        pending.epoch
    }

    pub fn end_decrypt(&mut self, msg_id: &MsgId) {
        if let Some(pending) = self.pending.get_mut(msg_id) {
            pending.count = pending.count.saturating_sub(1);
            if pending.count == 0 {
                self.pending.remove(msg_id);
            }
        }
    }

    /// Like [`Self::put`], but stores nothing if `msg_id` was released
    /// since the decrypt registered with `epoch` began.
    pub fn put_if_current(
        &mut self,
        msg_id: &MsgId,
        epoch: u64,
        cid: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Option<BlobHandle> {
        let pending = self.pending.get(msg_id)?;
        if pending.epoch != epoch {
            return None;
        }
        Some(self.put(msg_id, cid, data, mime))
    }

    /// Number of messages with a decrypt in flight.
    pub fn pending_decrypts(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, cid: &str) -> Option<&EmbeddedEntry> {
        self.entries.get(cid)
    }

    pub fn has(&self, cid: &str) -> bool {
        self.entries.contains_key(cid)
    }

    /// Dereferences a handle.
    pub fn resolve(&self, handle: &str) -> Result<&EmbeddedEntry, UnknownHandle> {
        self.by_handle
            .get(handle)
            .and_then(|cid| self.entries.get(cid))
            .ok_or_else(|| UnknownHandle(handle.to_string()))
    }

    /// Revokes every handle the view of `msg_id` uses.
    ///
    /// Entries shared with another open message stay alive for that
    /// message. Returns the number of dropped entries.
    pub fn release(&mut self, msg_id: &MsgId) -> usize {
        if let Some(pending) = self.pending.get_mut(msg_id) {
            pending.epoch += 1;
        }
        let Some(cids) = self.by_message.remove(msg_id) else {
            return 0;
        };

        let mut dropped = 0;
        for cid in cids {
            let Some(entry) = self.entries.get_mut(&cid) else {
                continue;
            };
            entry.owners.remove(msg_id);
            if entry.owners.is_empty() {
                if let Some(entry) = self.entries.remove(&cid) {
                    self.by_handle.remove(&entry.handle);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Revokes all handles, used when the session ends.
    pub fn release_all(&mut self) -> usize {
        let dropped = self.entries.len();
        for pending in self.pending.values_mut() {
            pending.epoch += 1;
        }
        self.entries.clear();
        self.by_handle.clear();
        self.by_message.clear();
        dropped
    }

    /// Number of cids of `msg_id` with decrypted content.
    pub fn count_for(&self, msg_id: &MsgId) -> usize {
        self.by_message.get(msg_id).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
