//! # Key-value configuration management.

use std::time::Duration;

use anyhow::{ensure, Context as _, Result};
use strum::{EnumProperty, IntoEnumIterator};
use strum_macros::{AsRefStr, Display, EnumIter, EnumProperty, EnumString};

use crate::constants::{SHOW_IMAGES_EMBEDDED, SHOW_IMAGES_REMOTE};
use crate::context::Context;

/// The available configuration keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter, EnumProperty,
)]
#[strum(serialize_all = "snake_case")]
pub enum Config {
    /// Base URL of the mail API, without trailing slash.
    #[strum(props(default = "https://mail.proton.me/api"))]
    ApiUrl,

    /// Client version sent as `x-pm-appversion`.
    #[strum(props(default = "Web_3.16.54"))]
    AppVersion,

    /// API version sent as `x-pm-apiversion`.
    #[strum(props(default = "3"))]
    ApiVersion,

    /// Identifier of the authenticated session, sent as `x-pm-uid`.
    SessionUid,

    /// Bearer token of the authenticated session.
    AccessToken,

    /// Which kinds of images may be shown without asking,
    /// a combination of `SHOW_IMAGES_*` flags.
    #[strum(props(default = "2"))]
    ShowImages,

    /// Inline data URIs longer than this many bytes are moved out of the markup.
    #[strum(props(default = "256"))]
    Base64Threshold,

    /// Delay before re-verifying the signature of a decrypted attachment,
    /// in milliseconds.
    #[strum(props(default = "1000"))]
    SignatureRecheckDelay,
}

impl Config {
    /// Returns the default value of the key, if any.
    pub fn default_value(self) -> Option<&'static str> {
        self.get_str("default")
    }
}

impl Context {
    /// Returns the configured value of `key`, falling back to its default.
    pub fn get_config(&self, key: Config) -> Result<Option<String>> {
        let value = self.config.read().get(&key).cloned();
        Ok(value.or_else(|| key.default_value().map(ToString::to_string)))
    }

    /// Returns the value of an integer key, 0 if unset.
    pub fn get_config_int(&self, key: Config) -> Result<i32> {
        self.get_config(key)?
            .map(|s| s.parse::<i32>())
            .transpose()
            .with_context(|| format!("{key} is not an integer"))
            .map(|v| v.unwrap_or_default())
    }

    /// Returns the value of an unsigned integer key, 0 if unset.
    pub fn get_config_u64(&self, key: Config) -> Result<u64> {
        self.get_config(key)?
            .map(|s| s.parse::<u64>())
            .transpose()
            .with_context(|| format!("{key} is not an unsigned integer"))
            .map(|v| v.unwrap_or_default())
    }

    /// Returns the value of a boolean key, `false` if unset.
    pub fn get_config_bool(&self, key: Config) -> Result<bool> {
        Ok(self.get_config_int(key)? != 0)
    }

    /// Sets `key` to `value`, `None` restores the default.
    pub fn set_config(&self, key: Config, value: Option<&str>) -> Result<()> {
        match key {
            Config::ShowImages => {
                if let Some(value) = value {
                    let flags: i32 = value.parse().context("ShowImages must be numeric")?;
                    ensure!(
                        flags & !(SHOW_IMAGES_REMOTE | SHOW_IMAGES_EMBEDDED) == 0,
                        "unknown ShowImages flags in {flags}"
                    );
                }
            }
            Config::Base64Threshold | Config::SignatureRecheckDelay => {
                if let Some(value) = value {
                    value
                        .parse::<u64>()
                        .with_context(|| format!("{key} must be an unsigned integer"))?;
                }
            }
            Config::ApiUrl => {
                if let Some(value) = value {
                    url::Url::parse(value).context("ApiUrl is not a valid URL")?;
                }
            }
            _ => {}
        }

        let mut config = self.config.write();
        match value {
            Some(value) => {
                let value = match key {
                    Config::ApiUrl => value.trim_end_matches('/'),
                    _ => value,
                };
                config.insert(key, value.to_string());
            }
            None => {
                config.remove(&key);
            }
        }
        Ok(())
    }

    /// Returns whether embedded images may be decrypted and shown without asking.
    pub fn show_embedded_images(&self) -> Result<bool> {
        Ok(self.get_config_int(Config::ShowImages)? & SHOW_IMAGES_EMBEDDED != 0)
    }

    /// Returns the threshold above which inline base64 payloads are moved out
    /// of the markup.
    pub fn base64_threshold(&self) -> Result<usize> {
        let threshold = self.get_config_u64(Config::Base64Threshold)?;
        usize::try_from(threshold).context("Base64Threshold out of range")
    }

    /// Returns the delay before signatures of decrypted attachments are
    /// verified again.
    pub fn signature_recheck_delay(&self) -> Result<Duration> {
        Ok(Duration::from_millis(
            self.get_config_u64(Config::SignatureRecheckDelay)?,
        ))
    }

    /// Returns all keys that currently differ from their default, as
    /// `key=value` lines. Secrets are masked.
    pub fn get_config_summary(&self) -> Result<String> {
        let mut lines = Vec::new();
        for key in Config::iter() {
            let Some(value) = self.config.read().get(&key).cloned() else {
                continue;
            };
            let value = match key {
                Config::AccessToken | Config::SessionUid => "***".to_string(),
                _ => value,
            };
            lines.push(format!("{key}={value}"));
        }
        Ok(lines.join("\n"))
    }
}
