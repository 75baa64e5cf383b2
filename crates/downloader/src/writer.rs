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

//! Moves a response body into a sink and keeps progress accounting.

use std::collections::HashMap;

use bulkfetch_common_http::ByteStream;
use futures::StreamExt;
use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::{
    entry::FileSink,
    error::{DownloadError, FileWriteSnafu},
};

/// Bytes transferred per descriptor hash.
#[derive(Debug, Default)]
pub struct ProgressTable {
    entries: Mutex<HashMap<String, u64>>,
}

impl ProgressTable {
    /// Reset the entry for `hash` to zero.
    pub fn start(&self, hash: &str) { self.entries.lock().insert(hash.to_owned(), 0); }

    /// Add `bytes` and return the new total.
    pub fn advance(&self, hash: &str, bytes: u64) -> u64 {
        let mut entries = self.entries.lock();
        let total = entries.entry(hash.to_owned()).or_insert(0);
        *total = total.saturating_add(bytes);
        *total
    }

    pub fn get(&self, hash: &str) -> Option<u64> { self.entries.lock().get(hash).copied() }
}

/// Share of `size` covered by `transferred`, as a percentage clamped to
/// `[0, 100]`. An unknown or zero size counts as complete.
#[allow(clippy::cast_precision_loss)]
pub fn percent(transferred: u64, size: Option<u64>) -> f64 {
    match size {
        Some(size) if size > 0 => (transferred as f64 / size as f64 * 100.0).min(100.0),
        _ => 100.0,
    }
}

/// Copy `body` into `sink`, calling `on_chunk` with each chunk's length
/// before it is written, then flush and shut the sink down.
///
/// Stops with [`DownloadError::Cancelled`] when `cancel` fires between
/// chunks or while a read is pending. Returns the number of bytes written.
pub async fn pipe<F>(
    mut body: ByteStream,
    mut sink: FileSink,
    cancel: &CancellationToken,
    mut on_chunk: F,
) -> Result<u64, DownloadError>
where
    F: FnMut(u64),
{
    let mut written = 0_u64;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;

        let len = chunk.len() as u64;
        on_chunk(len);
        sink.write_all(&chunk).await.context(FileWriteSnafu)?;
        written += len;
    }

    sink.shutdown().await.context(FileWriteSnafu)?;
    Ok(written)
}
