//! Module to work with translatable stock strings.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use strum::EnumProperty as EnumPropertyTrait;
use strum_macros::EnumProperty;
use tokio::sync::RwLock;

use crate::context::Context;

/// Storage for string translations.
#[derive(Debug, Clone)]
pub struct StockStrings {
    /// Map from stock string ID to the translation.
    translated_stockstrings: Arc<RwLock<HashMap<usize, String>>>,
}

/// Stock strings
///
/// These identify the string to return in [Context.stock_str].
///
/// [Context]: crate::context::Context
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumProperty)]
#[repr(u32)]
pub enum StockMessage {
    #[strum(props(fallback = "Unable to upload file. Please try again"))]
    UploadFailedRetry = 1,

    #[strum(props(fallback = "Upload of %1$s failed: %2$s"))]
    UploadFailed = 2,

    #[strum(props(fallback = "Upload of %1$s was cancelled"))]
    UploadCancelled = 3,

    #[strum(props(fallback = "Unable to decrypt the embedded image"))]
    EmbeddedDecryptFailed = 4,
}

impl StockMessage {
    /// Default untranslated strings for stock messages.
    ///
    /// These could be used in logging calls, so no logging here.
    fn fallback(self) -> &'static str {
        self.get_str("fallback").unwrap_or_default()
    }
}

impl Default for StockStrings {
    fn default() -> Self {
        StockStrings::new()
    }
}

impl StockStrings {
    /// Creates a new translated string storage.
    pub fn new() -> Self {
        Self {
            translated_stockstrings: Arc::new(RwLock::new(Default::default())),
        }
    }

    async fn translated(&self, id: StockMessage) -> String {
        self.translated_stockstrings
            .read()
            .await
            .get(&(id as usize))
            .map(AsRef::as_ref)
            .unwrap_or_else(|| id.fallback())
            .to_string()
    }

    async fn set_stock_translation(&self, id: StockMessage, stockstring: String) -> Result<()> {
        if stockstring.contains("%1") && !id.fallback().contains("%1") {
            bail!(
                "translation {} contains invalid %1 placeholder, default is {}",
                stockstring,
                id.fallback()
            );
        }
        if stockstring.contains("%2") && !id.fallback().contains("%2") {
            bail!(
                "translation {} contains invalid %2 placeholder, default is {}",
                stockstring,
                id.fallback()
            );
        }
        self.translated_stockstrings
            .write()
            .await
            .insert(id as usize, stockstring);
        Ok(())
    }
}

async fn translated(context: &Context, id: StockMessage) -> String {
    context.translated_stockstrings.translated(id).await
}

/// Helper trait only meant to be implemented for [`String`].
trait StockStringMods: AsRef<str> + Sized {
    /// Substitutes the first replacement value if one is present.
    fn replace1(&self, replacement: &str) -> String {
        self.as_ref()
            .replacen("%1$s", replacement, 1)
            .replacen("%1$d", replacement, 1)
            .replacen("%1$@", replacement, 1)
    }

    /// Substitutes the second replacement value if one is present.
    ///
    /// Be aware you probably should have also called [`StockStringMods::replace1`] if
    /// you are calling this.
    fn replace2(&self, replacement: &str) -> String {
        self.as_ref()
            .replacen("%2$s", replacement, 1)
            .replacen("%2$d", replacement, 1)
            .replacen("%2$@", replacement, 1)
    }
}

impl StockStringMods for String {}

/// Stock string: `Unable to upload file. Please try again`.
pub(crate) async fn upload_failed_retry(context: &Context) -> String {
    translated(context, StockMessage::UploadFailedRetry).await
}

/// Stock string: `Upload of %1$s failed: %2$s`.
pub(crate) async fn upload_failed(context: &Context, filename: &str, reason: &str) -> String {
    translated(context, StockMessage::UploadFailed)
        .await
        .replace1(filename)
        .replace2(reason)
}

/// Stock string: `Upload of %1$s was cancelled`.
pub(crate) async fn upload_cancelled(context: &Context, filename: &str) -> String {
    translated(context, StockMessage::UploadCancelled)
        .await
        .replace1(filename)
}

/// Stock string: `Unable to decrypt the embedded image`.
pub(crate) async fn embedded_decrypt_failed(context: &Context) -> String {
    translated(context, StockMessage::EmbeddedDecryptFailed).await
}

impl Context {
    /// Set the stock string for the [StockMessage].
    pub async fn set_stock_translation(&self, id: StockMessage, stockstring: String) -> Result<()> {
        self.translated_stockstrings
            .set_stock_translation(id, stockstring)
            .await?;
        Ok(())
    }
}
