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

use std::fmt;

use snafu::Snafu;

/// Failures below the HTTP status layer: DNS, connect, body reads, and
/// cancellation of an in-flight call.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("Failed to build HTTP client: {source}"))]
    Client { source: reqwest::Error },

    #[snafu(display("Request failed: {source}"))]
    Request { source: reqwest::Error },

    #[snafu(display("Failed to read response body: {source}"))]
    Body { source: reqwest::Error },

    #[snafu(display("Invalid value for header {name}: {source}"))]
    InvalidHeader {
        name:   String,
        source: http::header::InvalidHeaderValue,
    },

    #[snafu(display("Request cancelled"))]
    Cancelled,
}

impl TransportError {
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }
}

/// Outcome of a failed logical request issued through
/// [`HttpClient`](crate::HttpClient).
///
/// `E` is the domain error produced by the caller's error mapper for
/// permanent HTTP failures.
#[derive(Debug)]
pub enum RequestError<E> {
    /// The server answered with a non-retryable status, the retry budget ran
    /// out, or the next wait would exceed the delay cap.
    Status { error: E },
    /// The request never produced an HTTP response.
    Transport { source: TransportError },
    /// The cancellation token fired while the request was in flight or
    /// waiting to be retried.
    Cancelled,
}

impl<E> From<TransportError> for RequestError<E> {
    fn from(source: TransportError) -> Self {
        match source {
            TransportError::Cancelled => Self::Cancelled,
            source => Self::Transport { source },
        }
    }
}

impl<E: fmt::Display> fmt::Display for RequestError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { error } => write!(f, "{error}"),
            Self::Transport { source } => write!(f, "{source}"),
            Self::Cancelled => f.write_str("Request cancelled"),
        }
    }
}

impl<E> std::error::Error for RequestError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Status { error } => Some(error),
            Self::Transport { source } => Some(source),
            Self::Cancelled => None,
        }
    }
}
