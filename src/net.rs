//! # Mail API transport.
//!
//! Requests are described as plain [`ApiRequest`] values and handed to a
//! [`Transport`]. The default transport is [`http::HttpTransport`], tests
//! script their own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use strum_macros::Display;

use crate::config::Config;
use crate::constants::API_CONTENT_TYPE;
use crate::context::Context;

pub mod http;

pub use http::HttpTransport;

/// Connection timeout.
pub(crate) const TIMEOUT: Duration = Duration::from_secs(60);

/// Reports `(bytes_sent, bytes_total)` of a request body.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// HTTP method of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// One field of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub data: FormData,
}

/// Content of a form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormData {
    Text(String),
    Binary {
        bytes: Bytes,
        filename: String,
        mime: String,
    },
}

impl FormPart {
    /// A plain text field.
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            data: FormData::Text(value.into()),
        }
    }

    /// A binary field, sent as `application/octet-stream` blob.
    pub fn blob(name: &str, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.to_string(),
            data: FormData::Binary {
                bytes: bytes.into(),
                filename: "blob".to_string(),
                mime: "application/octet-stream".to_string(),
            },
        }
    }

    /// Number of body bytes the field contributes to progress reports.
    pub fn binary_len(&self) -> u64 {
        match &self.data {
            FormData::Text(_) => 0,
            FormData::Binary { bytes, .. } => bytes.len() as u64,
        }
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Multipart(Vec<FormPart>),
}

/// An authenticated call to the mail API.
#[derive(Clone)]
pub struct ApiRequest {
    pub method: Method,

    /// Absolute URL.
    pub url: String,

    pub headers: Vec<(String, String)>,

    pub body: RequestBody,

    /// Called while the body is being sent.
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("body", &self.body)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

impl ApiRequest {
    /// Returns the value of the header `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the text field `name` of a multipart body.
    pub fn form_text(&self, name: &str) -> Option<&str> {
        let RequestBody::Multipart(parts) = &self.body else {
            return None;
        };
        parts.iter().find(|part| part.name == name).and_then(|part| match &part.data {
            FormData::Text(text) => Some(text.as_str()),
            FormData::Binary { .. } => None,
        })
    }

    /// Returns the binary field `name` of a multipart body.
    pub fn form_blob(&self, name: &str) -> Option<&Bytes> {
        let RequestBody::Multipart(parts) = &self.body else {
            return None;
        };
        parts.iter().find(|part| part.name == name).and_then(|part| match &part.data {
            FormData::Binary { bytes, .. } => Some(bytes),
            FormData::Text(_) => None,
        })
    }
}

/// Raw response of the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends API requests.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Performs `request`.
    ///
    /// Only transport failures are errors, any HTTP status is a response.
    /// Dropping the returned future aborts the request.
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse>>;
}

/// Headers every API call carries.
pub(crate) fn api_headers(context: &Context) -> Result<Vec<(String, String)>> {
    let mut headers = vec![
        ("Accept".to_string(), API_CONTENT_TYPE.to_string()),
        ("X-Requested-With".to_string(), "XMLHttpRequest".to_string()),
    ];
    for (name, key) in [
        ("x-pm-appversion", Config::AppVersion),
        ("x-pm-apiversion", Config::ApiVersion),
        ("x-pm-uid", Config::SessionUid),
    ] {
        if let Some(value) = context.get_config(key)? {
            headers.push((name.to_string(), value));
        }
    }
    if let Some(token) = context.get_config(Config::AccessToken)? {
        headers.push(("Authorization".to_string(), format!("Bearer {token}")));
    }
    Ok(headers)
}

/// Absolute URL of the API endpoint `path`.
pub(crate) fn api_url(context: &Context, path: &str) -> Result<String> {
    let base = context
        .get_config(Config::ApiUrl)?
        .context("ApiUrl is not configured")?;
    Ok(format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/')))
}

/// Builds an authenticated request for `path`.
pub(crate) fn api_request(
    context: &Context,
    method: Method,
    path: &str,
    body: RequestBody,
) -> Result<ApiRequest> {
    Ok(ApiRequest {
        method,
        url: api_url(context, path)?,
        headers: api_headers(context)?,
        body,
        progress: None,
    })
}
