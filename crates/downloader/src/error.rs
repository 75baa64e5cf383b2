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

use bulkfetch_common_http::{RequestError, TransportError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DownloadError {
    #[snafu(display("HTTP error {status} for URL: {url}"))]
    Http { status: u16, url: String },

    #[snafu(display("Network error: {source}"))]
    Network { source: TransportError },

    #[snafu(display("File write error: {source}"))]
    FileWrite { source: std::io::Error },

    #[snafu(display("Download cancelled"))]
    Cancelled,

    #[snafu(display("Concurrency must be at least 1"))]
    InvalidConcurrency,
}

impl DownloadError {
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }
}

impl From<TransportError> for DownloadError {
    fn from(source: TransportError) -> Self {
        match source {
            TransportError::Cancelled => Self::Cancelled,
            source => Self::Network { source },
        }
    }
}

impl From<RequestError<Self>> for DownloadError {
    fn from(error: RequestError<Self>) -> Self {
        match error {
            RequestError::Status { error } => error,
            RequestError::Transport { source } => source.into(),
            RequestError::Cancelled => Self::Cancelled,
        }
    }
}
