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

use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use bulkfetch_common_http::{HttpClient, ReqwestTransport, Request, Response, Transport};
use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::Url;
use snafu::ensure;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::DownloaderConfig,
    entry::FileTarget,
    error::{DownloadError, InvalidConcurrencySnafu},
    events::{DownloadEvent, EventTarget, PoolEvent},
    file_info::FileInfo,
    worker::{self, WorkerExit},
    writer::ProgressTable,
};

/// State shared by the coordinator and its workers for one run.
#[derive(Debug)]
pub(crate) struct RunState {
    pub(crate) queue:     Mutex<VecDeque<Arc<dyn FileTarget>>>,
    pub(crate) progress:  ProgressTable,
    pub(crate) cancel:    CancellationToken,
    pub(crate) client:    HttpClient<DownloadError>,
    pub(crate) directory: PathBuf,
    pub(crate) retries:   u32,
    pub(crate) events:    EventTarget<DownloadEvent>,
    pub(crate) internal:  EventTarget<PoolEvent>,
}

/// Outcome of a worker asking for its next file.
pub(crate) enum Claim {
    Next(Arc<dyn FileTarget>),
    Empty,
    Aborted,
}

impl RunState {
    /// Pop the front of the queue unless the run was aborted. The abort check
    /// and the pop happen under the queue lock, so no file is claimed after
    /// [`RunState::abort`] returns.
    pub(crate) fn claim(&self) -> Claim {
        let mut queue = self.queue.lock();
        if self.cancel.is_cancelled() {
            return Claim::Aborted;
        }
        queue.pop_front().map_or(Claim::Empty, Claim::Next)
    }

    pub(crate) fn abort(&self) {
        let _queue = self.queue.lock();
        self.cancel.cancel();
    }
}

/// Downloads a fixed set of files with a pool of concurrent workers.
///
/// Workers share one FIFO queue. When any request fails for a reason other
/// than cancellation, the whole run is aborted and the remaining workers
/// stop before claiming another file. Files interrupted by an abort are put
/// back at the front of the queue.
#[derive(Debug)]
pub struct Downloader {
    state:       Arc<RunState>,
    concurrency: usize,
}

impl Downloader {
    /// Create a downloader that talks HTTP through `reqwest`.
    pub fn new<I>(config: DownloaderConfig, entries: I) -> Result<Self, DownloadError>
    where
        I: IntoIterator<Item = Arc<dyn FileTarget>>,
    {
        let transport = ReqwestTransport::new(config.idle_timeout())?;
        Self::with_transport(config, Arc::new(transport), entries)
    }

    pub fn with_transport<I>(
        config: DownloaderConfig,
        transport: Arc<dyn Transport>,
        entries: I,
    ) -> Result<Self, DownloadError>
    where
        I: IntoIterator<Item = Arc<dyn FileTarget>>,
    {
        ensure!(config.concurrency > 0, InvalidConcurrencySnafu);

        let client = HttpClient::new(transport, config.user_agent, |response: &Response| {
            DownloadError::Http {
                status: response.status.as_u16(),
                url:    response.url.to_string(),
            }
        })
        .with_credentials(config.credentials);

        let state = RunState {
            queue: Mutex::new(entries.into_iter().collect()),
            progress: ProgressTable::default(),
            cancel: CancellationToken::new(),
            client,
            directory: config.directory,
            retries: config.retries,
            events: EventTarget::new(),
            internal: EventTarget::new(),
        };

        Ok(Self {
            state:       Arc::new(state),
            concurrency: config.concurrency,
        })
    }

    /// Subscribe here for lifecycle notifications.
    pub fn events(&self) -> &EventTarget<DownloadEvent> { &self.state.events }

    /// Download every queued file.
    ///
    /// Returns `true` if all workers emptied the queue, `false` if the run
    /// was aborted or any transfer failed.
    pub async fn download(&self) -> bool {
        // Removed below once the workers are joined, which drops this clone.
        let state = Arc::clone(&self.state);
        let listener = self
            .state
            .internal
            .once(PoolEvent::WorkerFailed, move |_| state.abort());

        info!(
            workers = self.concurrency,
            queued = self.remaining(),
            directory = %self.state.directory.display(),
            "Starting downloads"
        );

        let workers = (0..self.concurrency)
            .map(|_| tokio::spawn(worker::run(Arc::clone(&self.state))))
            .collect::<Vec<_>>();
        let exits = join_all(workers).await;

        self.state.internal.off(PoolEvent::WorkerFailed, listener);

        let mut completed = true;
        for exit in exits {
            match exit {
                Ok(WorkerExit::Drained) => {}
                Ok(_) => completed = false,
                Err(error) => {
                    warn!(%error, "Download worker panicked");
                    completed = false;
                }
            }
        }

        info!(completed, remaining = self.remaining(), "Downloads finished");
        completed
    }

    /// Stop all workers. Files in flight go back to the queue.
    pub fn abort(&self) { self.state.abort(); }

    pub fn is_aborted(&self) -> bool { self.state.cancel.is_cancelled() }

    /// Bytes received so far for the file with this hash.
    pub fn progress_of(&self, hash: &str) -> Option<u64> { self.state.progress.get(hash) }

    /// Number of files not yet claimed by a worker.
    pub fn remaining(&self) -> usize { self.state.queue.lock().len() }

    /// Names of queued files, front first.
    pub fn queued(&self) -> Vec<String> {
        self.state
            .queue
            .lock()
            .iter()
            .map(|target| target.descriptor().name.clone())
            .collect()
    }

    /// Look up the size and name of a remote file with a HEAD request.
    pub async fn probe(&self, url: &Url) -> Result<FileInfo, DownloadError> {
        let response = self
            .state
            .client
            .request_with_retries(Request::head(url.clone()), self.state.retries, &self.state.cancel)
            .await?;
        Ok(FileInfo::from_response(url, &response))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use bulkfetch_common_http::{TransportError, cancellable};
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use sha2::{Digest, Sha512};
    use strum::IntoEnumIterator;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        entry::{FileDescriptor, LocalFile},
        events::DownloadEventKind,
    };

    #[derive(Clone)]
    enum Reply {
        Body(Vec<&'static [u8]>),
        Status(u16, Vec<(&'static str, &'static str)>),
        NoContent,
        /// Sends the first chunk, then never finishes.
        Stall(&'static [u8]),
        /// Fails before any response arrives.
        Unreachable,
    }

    /// Serves scripted replies per URL path. The last reply for a path
    /// repeats.
    #[derive(Default)]
    struct MockTransport {
        routes:   Mutex<HashMap<String, VecDeque<Reply>>>,
        requests: Mutex<Vec<(Method, String)>>,
    }

    impl MockTransport {
        fn route(self: Arc<Self>, path: &str, replies: Vec<Reply>) -> Arc<Self> {
            self.routes.lock().insert(path.to_string(), replies.into());
            self
        }

        fn peek(&self, path: &str) -> Option<Reply> {
            self.routes
                .lock()
                .get(path)
                .and_then(|replies| replies.front().cloned())
        }

        fn hits(&self, path: &str) -> usize {
            self.requests
                .lock()
                .iter()
                .filter(|(_, p)| p == path)
                .count()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            request: Request,
            cancel: &CancellationToken,
        ) -> Result<Response, TransportError> {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let path = request.url.path().to_string();
            self.requests.lock().push((request.method.clone(), path.clone()));

            if matches!(self.peek(&path), Some(Reply::Unreachable)) {
                return Err(TransportError::InvalidHeader {
                    name:   "host".to_string(),
                    source: HeaderValue::from_str("\n").unwrap_err(),
                });
            }

            let reply = {
                let mut routes = self.routes.lock();
                routes.get_mut(&path).and_then(|replies| {
                    if replies.len() > 1 {
                        replies.pop_front()
                    } else {
                        replies.front().cloned()
                    }
                })
            }
            .unwrap_or_else(|| Reply::Status(404, Vec::new()));

            let mut headers = HeaderMap::new();
            let (status, body) = match reply {
                Reply::Body(chunks) => {
                    let chunks: Vec<Result<Bytes, TransportError>> =
                        chunks.into_iter().map(|c| Ok(Bytes::from_static(c))).collect();
                    (200, Some(cancellable(stream::iter(chunks), cancel.clone())))
                }
                Reply::Status(status, pairs) => {
                    for (name, value) in pairs {
                        headers.insert(name, HeaderValue::from_static(value));
                    }
                    let empty = stream::empty::<Result<Bytes, TransportError>>();
                    (status, Some(cancellable(empty, cancel.clone())))
                }
                Reply::NoContent | Reply::Unreachable => (204, None),
                Reply::Stall(first) => {
                    let first = Ok::<_, TransportError>(Bytes::from_static(first));
                    let chunks = stream::iter(vec![first]).chain(stream::pending());
                    (200, Some(cancellable(chunks, cancel.clone())))
                }
            };
            let body = if request.method == Method::HEAD { None } else { body };

            Ok(Response {
                status: StatusCode::from_u16(status).unwrap(),
                headers,
                url: request.url,
                body,
            })
        }
    }

    fn sha512_hex(content: &[u8]) -> String { format!("{:x}", Sha512::digest(content)) }

    fn file(name: &str, content: &[u8]) -> Arc<dyn FileTarget> {
        Arc::new(LocalFile::new(
            FileDescriptor::builder()
                .url(Url::parse(&format!("https://cdn.test/{name}")).unwrap())
                .hash(sha512_hex(content))
                .name(name)
                .size(content.len() as u64)
                .build(),
        ))
    }

    fn downloader(
        dir: &Path,
        concurrency: usize,
        transport: Arc<MockTransport>,
        entries: Vec<Arc<dyn FileTarget>>,
    ) -> Downloader {
        let config = DownloaderConfig::builder()
            .directory(dir)
            .concurrency(concurrency)
            .build();
        Downloader::with_transport(config, transport, entries).unwrap()
    }

    type Log = Arc<Mutex<Vec<(DownloadEventKind, String)>>>;

    fn record(downloader: &Downloader) -> Log {
        let log: Log = Arc::default();
        for kind in DownloadEventKind::iter() {
            let log = Arc::clone(&log);
            downloader.events().on(kind, move |event: &DownloadEvent| {
                let name = event.target().descriptor().name.clone();
                log.lock().push((kind, name));
            });
        }
        log
    }

    fn kinds_for(log: &Log, name: &str) -> Vec<DownloadEventKind> {
        log.lock()
            .iter()
            .filter(|(_, n)| n == name)
            .map(|(kind, _)| *kind)
            .filter(|kind| *kind != DownloadEventKind::Progress)
            .collect()
    }

    #[tokio::test]
    async fn single_worker_keeps_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/a", vec![Reply::Body(vec![b"alpha"])])
            .route("/b", vec![Reply::Body(vec![b"bravo"])])
            .route("/c", vec![Reply::Body(vec![b"char", b"lie"])]);
        let downloader = downloader(dir.path(), 1, transport, vec![
            file("a", b"alpha"),
            file("b", b"bravo"),
            file("c", b"charlie"),
        ]);
        let log = record(&downloader);

        assert!(downloader.download().await);

        let ends: Vec<String> = log
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == DownloadEventKind::End)
            .map(|(_, name)| name.clone())
            .collect();
        assert_eq!(ends, vec!["a", "b", "c"]);
        assert_eq!(tokio::fs::read(dir.path().join("c")).await.unwrap(), b"charlie");
        assert_eq!(downloader.remaining(), 0);
        assert_eq!(downloader.progress_of(&sha512_hex(b"charlie")), Some(7));
    }

    #[tokio::test]
    async fn hash_mismatch_is_reported_but_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/x", vec![Reply::Body(vec![b"tampered"])])
            .route("/y", vec![Reply::Body(vec![b"yankee"])])
            .route("/z", vec![Reply::Body(vec![b"zulu"])]);
        let downloader = downloader(dir.path(), 2, transport, vec![
            file("x", b"expected"),
            file("y", b"yankee"),
            file("z", b"zulu"),
        ]);
        let log = record(&downloader);

        assert!(downloader.download().await);

        use DownloadEventKind::{End, HashError, Start};
        assert_eq!(kinds_for(&log, "x"), vec![Start, End, HashError]);
        assert_eq!(kinds_for(&log, "y"), vec![Start, End]);
        assert_eq!(kinds_for(&log, "z"), vec![Start, End]);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_other_workers() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/slow", vec![Reply::Stall(b"partial")])
            .route("/bad", vec![Reply::Status(404, vec![])])
            .route("/c", vec![Reply::Body(vec![b"c"])])
            .route("/d", vec![Reply::Body(vec![b"d"])]);
        let downloader = downloader(dir.path(), 2, transport.clone(), vec![
            file("slow", b"partial and more"),
            file("bad", b"bad"),
            file("c", b"c"),
            file("d", b"d"),
        ]);
        let log = record(&downloader);
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            downloader
                .events()
                .on(DownloadEventKind::DownloadError, move |event| {
                    if let DownloadEvent::DownloadError { error, .. } = event {
                        errors.lock().push(error.to_string());
                    }
                });
        }

        assert!(!downloader.download().await);

        assert!(downloader.is_aborted());
        assert_eq!(downloader.queued(), vec!["slow", "c", "d"]);
        assert_eq!(transport.hits("/c"), 0);
        assert_eq!(kinds_for(&log, "c"), vec![]);
        assert_eq!(*errors.lock(), vec!["HTTP error 404 for URL: https://cdn.test/bad"]);
        assert!(!kinds_for(&log, "slow").contains(&DownloadEventKind::DownloadError));
    }

    #[tokio::test]
    async fn transport_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/down", vec![Reply::Unreachable])
            .route("/b", vec![Reply::Body(vec![b"b"])])
            .route("/c", vec![Reply::Body(vec![b"c"])]);
        let downloader = downloader(dir.path(), 1, transport.clone(), vec![
            file("down", b"down"),
            file("b", b"b"),
            file("c", b"c"),
        ]);
        let log = record(&downloader);
        let network = Arc::new(AtomicUsize::new(0));
        {
            let network = Arc::clone(&network);
            downloader
                .events()
                .on(DownloadEventKind::DownloadError, move |event| {
                    if matches!(
                        event,
                        DownloadEvent::DownloadError { error, .. }
                            if matches!(error.as_ref(), DownloadError::Network { .. })
                    ) {
                        network.fetch_add(1, Ordering::SeqCst);
                    }
                });
        }

        assert!(!downloader.download().await);

        assert!(downloader.is_aborted());
        assert_eq!(network.load(Ordering::SeqCst), 1);
        assert_eq!(transport.hits("/down"), 1);
        assert_eq!(transport.hits("/b"), 0);
        assert_eq!(downloader.queued(), vec!["b", "c"]);
        assert_eq!(kinds_for(&log, "down"), vec![
            DownloadEventKind::Start,
            DownloadEventKind::DownloadError
        ]);
    }

    #[tokio::test]
    async fn abort_requeues_in_flight_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/slow", vec![Reply::Stall(b"some")])
            .route("/next", vec![Reply::Body(vec![b"next"])]);
        let downloader = Arc::new(downloader(dir.path(), 1, transport, vec![
            file("slow", b"some bytes"),
            file("next", b"next"),
        ]));
        let log = record(&downloader);

        let (tx, mut rx) = mpsc::unbounded_channel();
        downloader
            .events()
            .once(DownloadEventKind::Progress, move |_| {
                let _ = tx.send(());
            });

        let run = {
            let downloader = Arc::clone(&downloader);
            tokio::spawn(async move { downloader.download().await })
        };
        rx.recv().await.unwrap();
        downloader.abort();
        downloader.abort();

        assert!(!run.await.unwrap());
        assert_eq!(downloader.queued(), vec!["slow", "next"]);
        assert_eq!(kinds_for(&log, "slow"), vec![DownloadEventKind::Start]);

        // An aborted downloader does not start again.
        assert!(!downloader.download().await);
        assert_eq!(downloader.remaining(), 2);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/big", vec![Reply::Body(vec![b"0123", b"4567", b"89", b"ab"])]);
        let downloader = downloader(dir.path(), 1, transport, vec![file("big", b"0123456789ab")]);

        let percents = Arc::new(Mutex::new(Vec::new()));
        {
            let percents = Arc::clone(&percents);
            downloader.events().on(DownloadEventKind::Progress, move |event| {
                if let DownloadEvent::Progress { percent, .. } = event {
                    percents.lock().push(*percent);
                }
            });
        }

        assert!(downloader.download().await);

        let percents = percents.lock();
        assert_eq!(percents.len(), 4);
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(percents.iter().all(|p| (0.0..=100.0).contains(p)));
        assert!((percents[3] - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unknown_size_reports_completion_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/u", vec![Reply::Body(vec![b"un", b"known"])]);
        let target: Arc<dyn FileTarget> = Arc::new(LocalFile::new(
            FileDescriptor::builder()
                .url(Url::parse("https://cdn.test/u").unwrap())
                .hash(sha512_hex(b"unknown"))
                .name("u")
                .build(),
        ));
        let downloader = downloader(dir.path(), 1, transport, vec![target]);
        let log = record(&downloader);

        assert!(downloader.download().await);

        let progress = log
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == DownloadEventKind::Progress)
            .count();
        assert_eq!(progress, 1);
        assert_eq!(downloader.progress_of(&sha512_hex(b"unknown")), Some(7));
    }

    #[tokio::test]
    async fn empty_response_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            Arc::new(MockTransport::default()).route("/empty", vec![Reply::NoContent]);
        let downloader = downloader(dir.path(), 1, transport, vec![file("empty", b"")]);
        let log = record(&downloader);

        assert!(downloader.download().await);

        assert!(dir.path().join("empty").exists());
        use DownloadEventKind::{End, Start};
        assert_eq!(kinds_for(&log, "empty"), vec![Start, End]);
        assert_eq!(downloader.progress_of(&sha512_hex(b"")), Some(0));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default()).route("/r", vec![
            Reply::Status(503, vec![("retry-after", "0")]),
            Reply::Status(429, vec![("ratelimit-reset", "0")]),
            Reply::Body(vec![b"ready"]),
        ]);
        let downloader = downloader(dir.path(), 1, transport.clone(), vec![file("r", b"ready")]);

        assert!(downloader.download().await);
        assert_eq!(transport.hits("/r"), 3);
    }

    #[tokio::test]
    async fn storage_failure_stops_only_that_worker() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default())
            .route("/evil", vec![Reply::Body(vec![b"evil"])])
            .route("/b", vec![Reply::Body(vec![b"b"])])
            .route("/c", vec![Reply::Body(vec![b"c"])]);
        let evil: Arc<dyn FileTarget> = Arc::new(LocalFile::new(
            FileDescriptor::builder()
                .url(Url::parse("https://cdn.test/evil").unwrap())
                .hash(sha512_hex(b"evil"))
                .name("../evil")
                .build(),
        ));
        let downloader = downloader(dir.path(), 2, transport, vec![
            evil,
            file("b", b"b"),
            file("c", b"c"),
        ]);
        let log = record(&downloader);

        assert!(!downloader.download().await);

        assert!(!downloader.is_aborted());
        use DownloadEventKind as Kind;
        assert_eq!(kinds_for(&log, "../evil"), vec![Kind::Start, Kind::DownloadError]);
        assert_eq!(kinds_for(&log, "b"), vec![Kind::Start, Kind::End]);
        assert_eq!(kinds_for(&log, "c"), vec![Kind::Start, Kind::End]);
    }

    #[tokio::test]
    async fn probe_reads_head_response() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default()).route("/files/pack.zip", vec![
            Reply::Status(200, vec![
                ("content-length", "4096"),
                ("content-disposition", "attachment; filename=\"modpack.zip\""),
            ]),
        ]);
        let downloader = downloader(dir.path(), 1, transport.clone(), vec![]);

        let info = downloader
            .probe(&Url::parse("https://cdn.test/files/pack.zip").unwrap())
            .await
            .unwrap();

        assert_eq!(info, FileInfo {
            size: Some(4096),
            name: "modpack.zip".to_string(),
        });
        assert_eq!(transport.requests.lock()[0].0, Method::HEAD);

        let missing = downloader
            .probe(&Url::parse("https://cdn.test/nope").unwrap())
            .await;
        assert!(matches!(missing, Err(DownloadError::Http { status: 404, .. })));
    }

    #[test]
    fn nothing_is_claimed_after_abort() {
        let downloader = downloader(
            Path::new("/tmp"),
            1,
            Arc::new(MockTransport::default()),
            vec![file("a", b"a"), file("b", b"b")],
        );
        let state = &downloader.state;
        assert!(matches!(state.claim(), Claim::Next(target) if target.descriptor().name == "a"));

        downloader.abort();

        assert!(matches!(state.claim(), Claim::Aborted));
        assert_eq!(downloader.queued(), vec!["b"]);
    }

    #[test]
    fn drained_queue_claims_nothing() {
        let downloader = downloader(
            Path::new("/tmp"),
            1,
            Arc::new(MockTransport::default()),
            Vec::new(),
        );
        assert!(matches!(downloader.state.claim(), Claim::Empty));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = DownloaderConfig::builder()
            .directory("/tmp")
            .concurrency(0)
            .build();
        let result =
            Downloader::with_transport(config, Arc::new(MockTransport::default()), Vec::new());
        assert!(matches!(result, Err(DownloadError::InvalidConcurrency)));
    }
}
