//! # Mailshield
//!
//! Safe rendering of untrusted mail bodies and the lifecycle of the
//! encrypted attachments bound to them.
//!
//! The crate has two halves. [`neutralize`] turns attacker-controlled
//! HTML into a tree that cannot load anything on its own. The
//! [`embedded`] resolver and the [`attachment`] transfer service move
//! encrypted attachment packets over the wire, decrypt them and bind
//! the plaintext to the `cid:` references found in message bodies.
//!
//! Everything that outlives a single call hangs off a [`Context`].

#![recursion_limit = "256"]
#![warn(unused, clippy::correctness, missing_debug_implementations)]
#![warn(
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), warn(clippy::indexing_slicing))]

#[macro_use]
pub mod log;

pub mod attachment;
pub mod base64_cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod crypto;
pub mod css;
pub mod dom;
pub mod embedded;
pub mod embedded_store;
pub mod events;
pub mod loader;
pub mod message;
pub mod net;
pub mod neutralize;
pub mod stock_str;
pub mod tools;

pub use attachment::{UploadError, UploadOutcome, UploadRequestId};
pub use context::Context;
pub use events::{Event, EventEmitter, EventType, Events};
pub use neutralize::{expand, neutralize, unlock_remote_content, Action, NeutralizeOptions};

#[cfg(test)]
mod test_utils;
