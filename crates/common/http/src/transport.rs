// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, pin::Pin, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use http::{HeaderMap, Method, StatusCode, header};
use reqwest::Url;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::error::{BodySnafu, ClientSnafu, RequestSnafu, TransportError};

/// Response body as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// A single HTTP request, before default headers are applied.
#[derive(Debug, Clone, Builder)]
pub struct Request {
    #[builder(default = Method::GET)]
    pub method:  Method,
    pub url:     Url,
    #[builder(default)]
    pub headers: HeaderMap,
    /// Query parameters appended to `url` when the request is sent.
    #[builder(default)]
    pub query:   Vec<(String, String)>,
    pub body:    Option<Bytes>,
}

impl Request {
    pub fn get(url: Url) -> Self { Self::builder().url(url).build() }

    pub fn head(url: Url) -> Self { Self::builder().method(Method::HEAD).url(url).build() }

    /// The URL with `query` applied.
    #[must_use]
    pub fn full_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

/// Status line and headers of a response, plus its body if it has one.
pub struct Response {
    pub status:  StatusCode,
    pub headers: HeaderMap,
    pub url:     Url,
    /// `None` for responses that carry no body (HEAD, 204, 205, 304).
    pub body:    Option<ByteStream>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("url", &self.url.as_str())
            .field("body", &self.body.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

impl Response {
    /// Header value as a string, if present and valid ASCII.
    pub fn header_str(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(header::CONTENT_LENGTH)
            .and_then(|value| value.trim().parse().ok())
    }

    /// Collect the whole body into memory.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        let Some(body) = self.body else {
            return Ok(Bytes::new());
        };
        let buffer = body
            .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }
}

/// The network collaborator used by [`HttpClient`](crate::HttpClient).
///
/// Implementations must stop the underlying I/O when `cancel` fires, both
/// while waiting for the response head and while the body is being read,
/// and report it as [`TransportError::Cancelled`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// `idle_timeout` bounds connecting and each wait for the next body
    /// chunk. The transfer as a whole is not limited.
    pub fn new(idle_timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = idle_timeout {
            builder = builder.connect_timeout(timeout).read_timeout(timeout);
        }
        let client = builder.build().context(ClientSnafu)?;
        Ok(Self { client })
    }

    pub const fn from_client(client: reqwest::Client) -> Self { Self { client } }

    fn has_body(method: &Method, status: StatusCode) -> bool {
        *method != Method::HEAD
            && status != StatusCode::NO_CONTENT
            && status != StatusCode::RESET_CONTENT
            && status != StatusCode::NOT_MODIFIED
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, TransportError> {
        let url = request.full_url();
        let Request {
            method,
            headers,
            body,
            ..
        } = request;

        let mut builder = self.client.request(method.clone(), url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = builder.send() => response.context(RequestSnafu)?,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = if Self::has_body(&method, status) {
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.context(BodySnafu));
            Some(cancellable(chunks, cancel.clone()))
        } else {
            None
        };

        Ok(Response {
            status,
            headers,
            url,
            body,
        })
    }
}

/// Wrap a body so that it yields [`TransportError::Cancelled`] and ends as
/// soon as `cancel` fires, even while a read is pending.
pub fn cancellable<S>(stream: S, cancel: CancellationToken) -> ByteStream
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    let state = Some((Box::pin(stream), cancel));
    Box::pin(futures::stream::unfold(state, |state| async move {
        let (mut stream, cancel) = state?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Some((Err(TransportError::Cancelled), None)),
            chunk = stream.next() => chunk.map(|chunk| (chunk, Some((stream, cancel)))),
        }
    }))
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[test]
    fn full_url_appends_query() {
        let request = Request::builder()
            .url(Url::parse("https://registry.test/v2/search?limit=5").unwrap())
            .query(vec![
                ("query".to_string(), "sodium lithium".to_string()),
                ("offset".to_string(), "20".to_string()),
            ])
            .build();

        assert_eq!(
            request.full_url().as_str(),
            "https://registry.test/v2/search?limit=5&query=sodium+lithium&offset=20"
        );
    }

    #[test]
    fn head_responses_have_no_body() {
        assert!(!ReqwestTransport::has_body(&Method::HEAD, StatusCode::OK));
        assert!(!ReqwestTransport::has_body(&Method::GET, StatusCode::NO_CONTENT));
        assert!(!ReqwestTransport::has_body(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(ReqwestTransport::has_body(&Method::GET, StatusCode::OK));
    }

    #[tokio::test]
    async fn cancellable_stream_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let chunks = stream::iter(vec![Ok::<_, TransportError>(Bytes::from_static(b"one"))])
            .chain(stream::pending());
        let mut body = cancellable(chunks, cancel.clone());

        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"one"));

        cancel.cancel();
        assert!(matches!(body.next().await, Some(Err(TransportError::Cancelled))));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn bytes_collects_chunks() {
        let chunks = stream::iter(vec![
            Ok::<_, TransportError>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let response = Response {
            status:  StatusCode::OK,
            headers: HeaderMap::new(),
            url:     Url::parse("https://cdn.test/file").unwrap(),
            body:    Some(Box::pin(chunks)),
        };

        assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"hello world"));
    }
}
