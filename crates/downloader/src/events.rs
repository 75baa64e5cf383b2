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

//! Synchronous publish/subscribe for download lifecycle notifications.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{entry::FileTarget, error::DownloadError};

/// An event that can be dispatched through an [`EventTarget`].
pub trait Event {
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventTarget::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registration<E> {
    id:       ListenerId,
    once:     bool,
    listener: Listener<E>,
}

/// Per-kind listener lists.
///
/// Listeners run synchronously in registration order on the emitting task,
/// after the internal lock is released, so a listener may subscribe,
/// unsubscribe or emit again.
pub struct EventTarget<E: Event> {
    next_id:   AtomicU64,
    listeners: Mutex<HashMap<E::Kind, Vec<Registration<E>>>>,
}

impl<E: Event> Default for EventTarget<E> {
    fn default() -> Self {
        Self {
            next_id:   AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl<E: Event> fmt::Debug for EventTarget<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let counts: HashMap<_, _> = listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventTarget").field("listeners", &counts).finish()
    }
}

impl<E: Event> EventTarget<E> {
    pub fn new() -> Self { Self::default() }

    pub fn on<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(listener))
    }

    /// Subscribe for a single delivery.
    pub fn once<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(listener))
    }

    /// Returns `false` if no such listener was registered for `kind`.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|registration| registration.id != id);
        before != list.len()
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let mut listeners = self.listeners.lock();
            let Some(list) = listeners.get_mut(&event.kind()) else {
                return;
            };
            let snapshot = list
                .iter()
                .map(|registration| Arc::clone(&registration.listener))
                .collect();
            list.retain(|registration| !registration.once);
            snapshot
        };

        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    fn register(&self, kind: E::Kind, once: bool, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push(Registration { id, once, listener });
        id
    }
}

/// Lifecycle notifications published by the downloader.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A worker claimed the target and is about to request it.
    Start(Arc<dyn FileTarget>),
    /// Percentage of the declared size written so far, in `[0, 100]`.
    Progress {
        target:  Arc<dyn FileTarget>,
        percent: f64,
    },
    /// The body was written completely. Verification follows.
    End(Arc<dyn FileTarget>),
    DownloadError {
        target: Arc<dyn FileTarget>,
        error:  Arc<DownloadError>,
    },
    /// The written file failed verification.
    HashError(Arc<dyn FileTarget>),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::AsRefStr,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "camelCase")]
pub enum DownloadEventKind {
    Start,
    Progress,
    End,
    DownloadError,
    HashError,
}

impl DownloadEvent {
    pub fn target(&self) -> &Arc<dyn FileTarget> {
        match self {
            Self::Start(target)
            | Self::End(target)
            | Self::HashError(target)
            | Self::Progress { target, .. }
            | Self::DownloadError { target, .. } => target,
        }
    }
}

impl Event for DownloadEvent {
    type Kind = DownloadEventKind;

    fn kind(&self) -> DownloadEventKind {
        match self {
            Self::Start(_) => DownloadEventKind::Start,
            Self::Progress { .. } => DownloadEventKind::Progress,
            Self::End(_) => DownloadEventKind::End,
            Self::DownloadError { .. } => DownloadEventKind::DownloadError,
            Self::HashError(_) => DownloadEventKind::HashError,
        }
    }
}

/// Coordination signals between workers and the pool. Never exposed to
/// observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PoolEvent {
    WorkerFailed,
}

impl Event for PoolEvent {
    type Kind = Self;

    fn kind(&self) -> Self { *self }
}
