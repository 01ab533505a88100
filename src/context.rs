//! Context module.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::attachment::UploadRegistry;
use crate::config::Config;
use crate::crypto::{AttachmentCrypto, KeyProvider};
use crate::embedded_store::{EmbeddedStore, UnknownHandle};
use crate::events::{Event, EventEmitter, EventType, Events};
use crate::loader::AttachmentLoader;
use crate::net::Transport;
use crate::stock_str::StockStrings;

/// Collaborators the application plugs into a [`Context`].
#[derive(Debug, Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub crypto: Arc<dyn AttachmentCrypto>,
    pub keys: Arc<dyn KeyProvider>,
}

/// The context for one mail session.
///
/// Cloning is cheap, all clones share the same session. The session state
/// (in-flight uploads, decrypted content) is torn down by
/// [`Context::end_session`].
#[derive(Clone, Debug)]
pub struct Context {
    pub(crate) inner: Arc<InnerContext>,
}

impl Deref for Context {
    type Target = InnerContext;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Actual context, expensive to clone.
#[derive(Debug)]
pub struct InnerContext {
    /// ID for this `Context` in the current process.
    ///
    /// This allows for multiple `Context`s open in a single process where each context can
    /// be identified by this ID.
    pub(crate) id: u32,

    pub(crate) events: Events,

    pub(crate) config: RwLock<HashMap<Config, String>>,

    pub(crate) translated_stockstrings: StockStrings,

    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) crypto: Arc<dyn AttachmentCrypto>,
    pub(crate) keys: Arc<dyn KeyProvider>,

    /// In-flight attachment uploads.
    pub(crate) uploads: Mutex<UploadRegistry>,

    /// Decrypted embedded content and its blob handles.
    pub(crate) embedded_store: Mutex<EmbeddedStore>,

    /// Memoized attachment plaintext.
    pub(crate) loader: AttachmentLoader,

    /// Network status as last reported by the application.
    online: watch::Sender<bool>,
}

impl Context {
    /// Creates a new session context.
    pub fn new(id: u32, events: Events, stock_strings: StockStrings, services: Services) -> Context {
        let Services {
            transport,
            crypto,
            keys,
        } = services;
        let (online, _) = watch::channel(true);
        let inner = InnerContext {
            id,
            events,
            config: RwLock::new(HashMap::new()),
            translated_stockstrings: stock_strings,
            transport,
            crypto,
            keys,
            uploads: Mutex::new(UploadRegistry::default()),
            embedded_store: Mutex::new(EmbeddedStore::new()),
            loader: AttachmentLoader::default(),
            online,
        };
        Context {
            inner: Arc::new(inner),
        }
    }

    /// Returns the context ID.
    pub fn get_id(&self) -> u32 {
        self.id
    }

    /// Returns a receiver for emitted events.
    ///
    /// Every emitter receives all events emitted after its creation.
    pub fn get_event_emitter(&self) -> EventEmitter {
        self.events.get_emitter()
    }

    /// Emits a single event.
    pub fn emit_event(&self, event: EventType) {
        self.events.emit(Event {
            id: self.id,
            typ: event,
        });
    }

    /// Records the network status. Going offline aborts every upload in
    /// flight.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.send_replace(online);
        if was_online && !online {
            info!(self, "Network went away, aborting uploads.");
        }
    }

    /// Whether the application reported the network as available.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub(crate) fn network_status(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Returns the decrypted content behind a blob handle.
    pub fn resolve_blob(&self, handle: &str) -> Result<(Arc<[u8]>, String), UnknownHandle> {
        let store = self.embedded_store.lock();
        let entry = store.resolve(handle)?;
        Ok((Arc::clone(&entry.data), entry.mime.clone()))
    }

    /// Tears the session down: aborts all uploads, revokes every blob
    /// handle and forgets decrypted plaintext.
    pub fn end_session(&self) {
        let aborted = self.uploads.lock().drain();
        for request in &aborted {
            request.abort.cancel();
        }
        let released = self.embedded_store.lock().release_all();
        self.loader.clear();
        info!(
            self,
            "Session ended, aborted {} uploads and released {} embedded entries.",
            aborted.len(),
            released
        );
    }
}
