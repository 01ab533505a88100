//! Utilities to help writing tests.
//!
//! This module is only compiled for test runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::context::{Context, Services};
use crate::crypto::{
    AttachmentCrypto, Decrypted, KeyProvider, PrivateKey, SessionKey, SignatureStatus,
};
use crate::events::{EventEmitter, EventType, Events};
use crate::message::{Attachment, AttachmentId, Message, MsgId};
use crate::net::{ApiRequest, ApiResponse, Method, RequestBody, Transport};
use crate::stock_str::StockStrings;

/// A [`Context`] wired to scripted fakes.
pub(crate) struct TestContext {
    pub ctx: Context,
    pub transport: Arc<FakeTransport>,
    pub crypto: Arc<FakeCrypto>,
    pub evtracker: EventTracker,
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("ctx", &self.ctx)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl TestContext {
    /// Creates a new [`TestContext`].
    ///
    /// The event tracker is subscribed before anything is emitted, so no
    /// event of the test gets lost.
    pub fn new() -> Self {
        use rand::Rng;

        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
            .ok();

        let transport = Arc::new(FakeTransport::default());
        let crypto = Arc::new(FakeCrypto::default());
        let services = Services {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            crypto: Arc::clone(&crypto) as Arc<dyn AttachmentCrypto>,
            keys: Arc::new(FakeKeys),
        };
        let id = rand::thread_rng().gen();
        let ctx = Context::new(id, Events::new(), StockStrings::new(), services);
        let evtracker = EventTracker(ctx.get_event_emitter());
        Self {
            ctx,
            transport,
            crypto,
            evtracker,
        }
    }
}

impl Deref for TestContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

/// Scripted answer of the [`FakeTransport`].
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Reports the body as sent, then answers.
    Reply { status: u16, body: Bytes },

    /// Reports half of the body as sent, then never answers.
    Hang,

    /// Fails like a broken connection.
    Fail(String),
}

impl Script {
    pub fn bytes(body: &[u8]) -> Self {
        Script::Reply {
            status: 200,
            body: Bytes::copy_from_slice(body),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Script::Reply {
            status,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Script::status(status, &body.to_string())
    }
}

/// [`Transport`] answering from scripts, keyed by method and path.
///
/// Scripts of one endpoint are played in order, the last one played
/// repeats until another one is queued. Unscripted endpoints answer 404.
#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    scripts: Mutex<HashMap<(Method, String), Endpoint>>,
    requests: Mutex<Vec<ApiRequest>>,
}

#[derive(Debug, Default)]
struct Endpoint {
    queue: VecDeque<Script>,
    last: Option<Script>,
}

impl FakeTransport {
    pub fn script(&self, method: Method, path: &str, script: Script) {
        self.scripts
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .queue
            .push_back(script);
    }

    /// Requests sent so far.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    fn next_script(&self, request: &ApiRequest) -> Option<Script> {
        let mut scripts = self.scripts.lock();
        let (_, endpoint) = scripts.iter_mut().find(|((method, path), _)| {
            *method == request.method && request.url.ends_with(&format!("/{path}"))
        })?;
        if let Some(script) = endpoint.queue.pop_front() {
            endpoint.last = Some(script);
        }
        endpoint.last.clone()
    }
}

impl Transport for FakeTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse>> {
        Box::pin(async move {
            self.requests.lock().push(request.clone());
            let script = self.next_script(&request);

            let total: u64 = match &request.body {
                RequestBody::Multipart(parts) => parts.iter().map(|part| part.binary_len()).sum(),
                _ => 0,
            };
            let report = |sent: u64| {
                if let Some(progress) = &request.progress {
                    progress(sent, total);
                }
            };

            match script {
                None => Ok(ApiResponse {
                    status: 404,
                    body: Bytes::from_static(br#"{"Code":2501,"Error":"Not found"}"#),
                }),
                Some(Script::Reply { status, body }) => {
                    report(total / 2);
                    tokio::task::yield_now().await;
                    report(total);
                    tokio::task::yield_now().await;
                    Ok(ApiResponse { status, body })
                }
                Some(Script::Hang) => {
                    report(total / 2);
                    std::future::pending().await
                }
                Some(Script::Fail(reason)) => bail!("{reason}"),
            }
        })
    }
}

/// Test double of the OpenPGP primitives.
///
/// Data packets are `enc:` followed by the plaintext. Key packets
/// `bad` cannot be decrypted, data packets starting with `FAIL` neither.
#[derive(Debug, Default)]
pub(crate) struct FakeCrypto {
    decrypted: AtomicUsize,
}

impl FakeCrypto {
    /// Number of successfully decrypted data packets.
    pub fn decrypted(&self) -> usize {
        self.decrypted.load(Ordering::SeqCst)
    }
}

impl AttachmentCrypto for FakeCrypto {
    fn decrypt_session_key<'a>(
        &'a self,
        key_packets: &'a [u8],
        keys: &'a [PrivateKey],
    ) -> BoxFuture<'a, Result<SessionKey>> {
        Box::pin(async move {
            ensure!(!keys.is_empty(), "no keys to decrypt with");
            ensure!(key_packets != b"bad", "corrupt key packets");
            Ok(SessionKey {
                data: [b"sk:".as_slice(), key_packets].concat(),
                algorithm: "aes256".to_string(),
            })
        })
    }

    fn decrypt_attachment<'a>(
        &'a self,
        key_packets: &'a [u8],
        data: &'a [u8],
        keys: &'a [PrivateKey],
    ) -> BoxFuture<'a, Result<Decrypted>> {
        Box::pin(async move {
            self.decrypt_session_key(key_packets, keys).await?;
            ensure!(!data.starts_with(b"FAIL"), "corrupt data packet");
            let Some(plaintext) = data.strip_prefix(b"enc:") else {
                bail!("not a data packet");
            };
            self.decrypted.fetch_add(1, Ordering::SeqCst);
            Ok(Decrypted {
                data: plaintext.to_vec(),
                signature: SignatureStatus::Unknown,
            })
        })
    }
}

/// Key provider with one key per address, except for `locked`.
#[derive(Debug)]
pub(crate) struct FakeKeys;

impl KeyProvider for FakeKeys {
    fn private_keys(&self, address_id: &str) -> Result<Vec<PrivateKey>> {
        ensure!(address_id != "locked", "keys of {address_id} are locked");
        Ok(vec![PrivateKey(address_id.as_bytes().to_vec())])
    }
}

/// Receives the events of a [`TestContext`].
#[derive(Debug)]
pub(crate) struct EventTracker(EventEmitter);

impl EventTracker {
    /// Consumes emitted events until one matches, returning it.
    ///
    /// Panics if nothing matches within 10 seconds.
    pub async fn get_matching<F: Fn(&EventType) -> bool>(&self, event_matcher: F) -> EventType {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = self.0.recv().await.unwrap();
                if event_matcher(&event.typ) {
                    return event.typ;
                }
            }
        })
        .await
        .expect("timeout waiting for event match")
    }

    /// Returns every event emitted so far that was not consumed yet.
    pub fn drain(&self) -> Vec<EventType> {
        let mut events = Vec::new();
        while let Ok(event) = self.0.try_recv() {
            events.push(event.typ);
        }
        events
    }
}

/// A message of `alice@example.org` without attachments.
pub(crate) fn test_message(id: &str) -> Message {
    let mut msg = Message::new(MsgId::new(id));
    msg.address_id = "addr1".to_string();
    msg.sender = "alice@example.org".to_string();
    msg.mime_type = "text/html".to_string();
    msg
}

/// An inline image encrypted on its own, referenced as `cid:<cid>`.
pub(crate) fn encrypted_attachment(id: &str, cid: &str) -> Attachment {
    let mut attachment = Attachment {
        id: AttachmentId::new(id),
        name: format!("{id}.png"),
        mime_type: "image/png".to_string(),
        key_packets: Some(b"kp".to_vec()),
        ..Default::default()
    };
    attachment.headers.content_id = Some(format!("<{cid}>"));
    attachment.headers.content_disposition = Some("inline".to_string());
    attachment
}
