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

use std::sync::Arc;

use bulkfetch_common_http::{Request, Response};
use bytes::Bytes;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    downloader::{Claim, RunState},
    entry::FileTarget,
    error::{DownloadError, FileWriteSnafu},
    events::{DownloadEvent, PoolEvent},
    writer::{self, percent},
};

/// How a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// The queue was empty.
    Drained,
    /// The run was aborted.
    Cancelled,
    /// A transfer failed.
    Failed,
}

enum Failure {
    /// Interrupted by the run's cancellation. The target goes back on the
    /// queue.
    Cancelled,
    /// The request itself failed. Aborts the whole run.
    Fetch(DownloadError),
    /// Reading the body or writing it to storage failed. Only this worker
    /// stops.
    Stream(DownloadError),
}

impl Failure {
    fn fetch(error: DownloadError) -> Self {
        if error.is_cancelled() { Self::Cancelled } else { Self::Fetch(error) }
    }

    fn stream(error: DownloadError) -> Self {
        if error.is_cancelled() { Self::Cancelled } else { Self::Stream(error) }
    }
}

pub(crate) async fn run(state: Arc<RunState>) -> WorkerExit {
    loop {
        let target = match state.claim() {
            Claim::Next(target) => target,
            Claim::Empty => return WorkerExit::Drained,
            Claim::Aborted => return WorkerExit::Cancelled,
        };

        match transfer(&state, &target).await {
            Ok(()) => {}
            Err(Failure::Cancelled) => {
                debug!(name = %target.descriptor().name, "Download interrupted, requeueing");
                state.queue.lock().push_front(target);
                return WorkerExit::Cancelled;
            }
            Err(Failure::Fetch(error)) => {
                warn!(url = %target.descriptor().url, %error, "Request failed, aborting");
                report(&state, target, error);
                state.internal.emit(&PoolEvent::WorkerFailed);
                return WorkerExit::Failed;
            }
            Err(Failure::Stream(error)) => {
                warn!(name = %target.descriptor().name, %error, "Transfer failed");
                report(&state, target, error);
                return WorkerExit::Failed;
            }
        }
    }
}

fn report(state: &RunState, target: Arc<dyn FileTarget>, error: DownloadError) {
    state.events.emit(&DownloadEvent::DownloadError {
        target,
        error: Arc::new(error),
    });
}

async fn transfer(state: &RunState, target: &Arc<dyn FileTarget>) -> Result<(), Failure> {
    let descriptor = target.descriptor();
    state.events.emit(&DownloadEvent::Start(Arc::clone(target)));
    debug!(url = %descriptor.url, name = %descriptor.name, "Downloading");

    let response = state
        .client
        .request_with_retries(
            Request::get(descriptor.url.clone()),
            state.retries,
            &state.cancel,
        )
        .await
        .map_err(|error| Failure::fetch(error.into()))?;

    state.progress.start(&descriptor.hash);
    write_body(state, target, response)
        .await
        .map_err(Failure::stream)?;

    state.events.emit(&DownloadEvent::End(Arc::clone(target)));

    if !target.verify(&state.directory).await {
        warn!(name = %descriptor.name, hash = %descriptor.hash, "Hash mismatch");
        state
            .events
            .emit(&DownloadEvent::HashError(Arc::clone(target)));
    }
    Ok(())
}

async fn write_body(
    state: &RunState,
    target: &Arc<dyn FileTarget>,
    response: Response,
) -> Result<(), DownloadError> {
    let descriptor = target.descriptor();
    let progress = |value: f64| {
        state.events.emit(&DownloadEvent::Progress {
            target:  Arc::clone(target),
            percent: value,
        });
    };

    let Some(body) = response.body else {
        target
            .persist(&state.directory, Bytes::new())
            .await
            .context(FileWriteSnafu)?;
        progress(100.0);
        return Ok(());
    };

    let sink = target
        .open_stream(&state.directory)
        .await
        .context(FileWriteSnafu)?;

    match descriptor.size {
        Some(size) if size > 0 => {
            writer::pipe(body, sink, &state.cancel, |len| {
                let transferred = state.progress.advance(&descriptor.hash, len);
                progress(percent(transferred, Some(size)));
            })
            .await?;
        }
        _ => {
            writer::pipe(body, sink, &state.cancel, |len| {
                state.progress.advance(&descriptor.hash, len);
            })
            .await?;
            progress(100.0);
        }
    }
    Ok(())
}
