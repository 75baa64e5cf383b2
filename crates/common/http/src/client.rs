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

use std::{fmt, sync::Arc, time::Duration};

use http::{HeaderValue, header};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{InvalidHeaderSnafu, RequestError, TransportError},
    retry::{self, DEFAULT_RETRIES, MAX_RETRY_DELAY, RetryDelay},
    transport::{Request, Response, Transport},
};

/// Turns a failed response into the caller's domain error.
pub type ErrorMapper<E> = Arc<dyn Fn(&Response) -> E + Send + Sync>;

/// HTTP client that applies default headers and retries transient failures.
///
/// A request is retried when the server signals a transient condition
/// (`Retry-After`, rate limiting, or one of the backoff statuses) and the
/// wait fits under [`MAX_RETRY_DELAY`]. Every other non-success response is
/// handed to the error mapper and returned as [`RequestError::Status`].
pub struct HttpClient<E> {
    transport:   Arc<dyn Transport>,
    user_agent:  String,
    credentials: Option<String>,
    map_error:   ErrorMapper<E>,
}

impl<E> Clone for HttpClient<E> {
    fn clone(&self) -> Self {
        Self {
            transport:   Arc::clone(&self.transport),
            user_agent:  self.user_agent.clone(),
            credentials: self.credentials.clone(),
            map_error:   Arc::clone(&self.map_error),
        }
    }
}

impl<E> fmt::Debug for HttpClient<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("user_agent", &self.user_agent)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl<E> HttpClient<E> {
    pub fn new<F>(transport: Arc<dyn Transport>, user_agent: impl Into<String>, map_error: F) -> Self
    where
        F: Fn(&Response) -> E + Send + Sync + 'static,
    {
        Self {
            transport,
            user_agent: user_agent.into(),
            credentials: None,
            map_error: Arc::new(map_error),
        }
    }

    /// Send `credentials` verbatim as the `Authorization` header.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Option<String>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn user_agent(&self) -> &str { &self.user_agent }

    /// Fill in `User-Agent` and `Authorization` unless the caller already set
    /// them.
    pub fn prepare(&self, mut request: Request) -> Result<Request, TransportError> {
        if !request.headers.contains_key(header::USER_AGENT) {
            let value = HeaderValue::from_str(&self.user_agent).context(InvalidHeaderSnafu {
                name: header::USER_AGENT.as_str(),
            })?;
            request.headers.insert(header::USER_AGENT, value);
        }

        if let Some(credentials) = &self.credentials
            && !request.headers.contains_key(header::AUTHORIZATION)
        {
            let mut value = HeaderValue::from_str(credentials).context(InvalidHeaderSnafu {
                name: header::AUTHORIZATION.as_str(),
            })?;
            value.set_sensitive(true);
            request.headers.insert(header::AUTHORIZATION, value);
        }

        Ok(request)
    }

    /// Send `request` with the default retry budget.
    pub async fn request(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, RequestError<E>> {
        self.request_with_retries(request, DEFAULT_RETRIES, cancel).await
    }

    /// Send `request`, retrying transient failures at most `retries` times.
    ///
    /// Unknown delays back off exponentially: 1 s, 2 s, 4 s and so on,
    /// counted by the retries already spent. Transport failures are not
    /// retried.
    pub async fn request_with_retries(
        &self,
        request: Request,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Response, RequestError<E>> {
        let request = self.prepare(request)?;
        let mut remaining = retries;

        loop {
            let response = self.transport.send(request.clone(), cancel).await?;
            if response.status.is_success() {
                return Ok(response);
            }

            if remaining == 0 {
                warn!(
                    url = %response.url,
                    status = %response.status,
                    retries,
                    "Retry budget exhausted"
                );
                return Err(self.permanent(&response));
            }

            let wait = match retry::transient_retry_delay(response.status, &response.headers) {
                None => return Err(self.permanent(&response)),
                Some(RetryDelay::After(seconds)) => seconds,
                Some(RetryDelay::Unknown) => retry::backoff_delay(retries - remaining),
            };

            if wait > MAX_RETRY_DELAY {
                warn!(
                    url = %response.url,
                    status = %response.status,
                    wait,
                    "Server asked for a longer wait than allowed, giving up"
                );
                return Err(self.permanent(&response));
            }

            debug!(
                url = %response.url,
                status = %response.status,
                wait,
                remaining,
                "Retrying request"
            );
            drop(response);

            if wait > 0 {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(RequestError::Cancelled),
                    () = tokio::time::sleep(Duration::from_secs(wait)) => {}
                }
            } else if cancel.is_cancelled() {
                return Err(RequestError::Cancelled);
            }

            remaining -= 1;
        }
    }

    fn permanent(&self, response: &Response) -> RequestError<E> {
        RequestError::Status {
            error: (self.map_error)(response),
        }
    }
}
