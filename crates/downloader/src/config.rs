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

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use jiff::SignedDuration;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Identity sent as `User-Agent` unless overridden.
pub const DEFAULT_USER_AGENT: &str = concat!("bulkfetch/", env!("CARGO_PKG_VERSION"));

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_RETRIES: u32 = bulkfetch_common_http::DEFAULT_RETRIES;
const DEFAULT_TIMEOUT: SignedDuration = SignedDuration::from_secs(30);

/// Configuration for one download run.
#[derive(Debug, Clone, SmartDefault, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Custom User-Agent header
    #[default(DEFAULT_USER_AGENT.to_string())]
    #[builder(into, default = DEFAULT_USER_AGENT.to_string())]
    pub user_agent: String,

    /// Number of concurrent workers. Must be at least 1.
    #[default(DEFAULT_CONCURRENCY)]
    #[builder(default = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Directory the files are written into
    #[default(std::env::temp_dir().join("bulkfetch"))]
    #[builder(into)]
    pub directory: PathBuf,

    /// Sent verbatim as the `Authorization` header.
    #[serde(skip_serializing)]
    #[builder(into)]
    pub credentials: Option<String>,

    /// Retries per request for transient failures
    #[default(DEFAULT_RETRIES)]
    #[builder(default = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Longest the connection may stay idle, while connecting or between
    /// body reads. A slow transfer that keeps making progress never hits
    /// it. Zero disables it.
    #[default(DEFAULT_TIMEOUT)]
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: SignedDuration,
}

impl DownloaderConfig {
    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        if self.timeout.is_positive() {
            Duration::try_from(self.timeout).ok()
        } else {
            None
        }
    }
}
