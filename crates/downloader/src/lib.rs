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

//! Concurrent downloader for sets of content-addressed files.
//!
//! A [`Downloader`] drains a queue of [`FileTarget`]s with a fixed number of
//! workers. Each file is requested through a retrying HTTP client, streamed
//! into storage with progress events, and verified against its SHA-512 hash
//! afterwards. Observers subscribe through [`Downloader::events`].

mod config;
mod downloader;
mod entry;
mod error;
mod events;
mod file_info;
mod worker;
mod writer;

pub use config::{DEFAULT_USER_AGENT, DownloaderConfig};
pub use downloader::Downloader;
pub use entry::{FileDescriptor, FileSink, FileTarget, LocalFile, sha512_file};
pub use error::DownloadError;
pub use events::{DownloadEvent, DownloadEventKind, Event, EventTarget, ListenerId};
pub use file_info::FileInfo;
pub use writer::{ProgressTable, percent};
