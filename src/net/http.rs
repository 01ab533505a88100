//! # HTTP transport.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context as _, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::sync::mpsc;

use super::{
    ApiRequest, ApiResponse, FormData, FormPart, Method, ProgressFn, RequestBody, Transport,
    TIMEOUT,
};

/// Size of the chunks binary form fields are streamed in.
const CHUNK_SIZE: usize = 64 * 1024;

/// [`Transport`] talking to the API over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn perform(&self, request: ApiRequest) -> Result<ApiResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(parts) => builder.multipart(build_form(parts, request.progress)?),
        };

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .context("failed to read response body")?;
        Ok(ApiResponse { status, body })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse>> {
        Box::pin(self.perform(request))
    }
}

fn build_form(parts: Vec<FormPart>, progress: Option<ProgressFn>) -> Result<Form> {
    let total: u64 = parts.iter().map(FormPart::binary_len).sum();
    let bytes_sent = Arc::new(AtomicU64::new(0));

    let mut form = Form::new();
    for FormPart { name, data } in parts {
        let part = match data {
            FormData::Text(text) => Part::text(text),
            FormData::Binary {
                bytes,
                filename,
                mime,
            } => {
                let len = bytes.len() as u64;
                let stream = ProgressTrackingStream::new(
                    bytes,
                    Arc::clone(&bytes_sent),
                    total,
                    progress.clone(),
                );
                Part::stream_with_length(Body::wrap_stream(stream), len)
                    .file_name(filename)
                    .mime_str(&mime)
                    .with_context(|| format!("invalid MIME type {mime:?}"))?
            }
        };
        form = form.part(name, part);
    }
    Ok(form)
}

/// Upload stream reporting how much of the body was handed to the
/// connection.
struct ProgressTrackingStream {
    total_size: u64,
    bytes_sent: Arc<AtomicU64>,
    progress: Option<ProgressFn>,
    inner: mpsc::Receiver<Result<Bytes, std::io::Error>>,
}

impl ProgressTrackingStream {
    fn new(
        data: Bytes,
        bytes_sent: Arc<AtomicU64>,
        total_size: u64,
        progress: Option<ProgressFn>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let mut position = 0;
            while position < data.len() {
                let end = std::cmp::min(position + CHUNK_SIZE, data.len());
                if tx.send(Ok(data.slice(position..end))).await.is_err() {
                    // Request was dropped.
                    break;
                }
                position = end;
            }
        });

        Self {
            total_size,
            bytes_sent,
            progress,
            inner: rx,
        }
    }
}

impl Stream for ProgressTrackingStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_recv(cx) {
            Poll::Ready(Some(result)) => {
                if let Ok(chunk) = &result {
                    let sent = self
                        .bytes_sent
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed)
                        + chunk.len() as u64;
                    if let Some(progress) = &self.progress {
                        progress(sent, self.total_size);
                    }
                }
                Poll::Ready(Some(result))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
