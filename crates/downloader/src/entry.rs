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

//! What to download and where it goes.

use std::{
    fmt,
    io,
    path::{Component, Path, PathBuf},
    pin::Pin,
};

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use reqwest::Url;
use sha2::{Digest, Sha512};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWrite, BufWriter},
};

/// Immutable identity of one remote file.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct FileDescriptor {
    pub url:  Url,
    /// Hex-encoded SHA-512 of the file content.
    #[builder(into)]
    pub hash: String,
    #[builder(into)]
    pub name: String,
    /// Declared size in bytes, used for progress reporting.
    pub size: Option<u64>,
}

/// Streaming destination for a response body.
pub type FileSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A file to download together with the storage operations for it.
///
/// The downloader never touches storage directly; it only goes through
/// these three operations.
#[async_trait]
pub trait FileTarget: fmt::Debug + Send + Sync {
    fn descriptor(&self) -> &FileDescriptor;

    /// Write `contents` in one piece.
    async fn persist(&self, dir: &Path, contents: Bytes) -> io::Result<()>;

    /// Open a sink for incremental writes. The caller shuts it down when the
    /// body is complete.
    async fn open_stream(&self, dir: &Path) -> io::Result<FileSink>;

    /// Whether the stored file exists and matches the descriptor's hash.
    async fn verify(&self, dir: &Path) -> bool;
}

/// [`FileTarget`] on the local filesystem, stored as `dir/name`.
#[derive(Debug, Clone)]
pub struct LocalFile {
    descriptor: FileDescriptor,
}

impl LocalFile {
    pub const fn new(descriptor: FileDescriptor) -> Self { Self { descriptor } }

    /// Path of the file inside `dir`.
    ///
    /// The name must be a single plain path component, so a hostile name
    /// cannot escape `dir`.
    pub fn path_in(&self, dir: &Path) -> io::Result<PathBuf> {
        let name = Path::new(&self.descriptor.name);
        let mut components = name.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(dir.join(name)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name: {:?}", self.descriptor.name),
            )),
        }
    }
}

#[async_trait]
impl FileTarget for LocalFile {
    fn descriptor(&self) -> &FileDescriptor { &self.descriptor }

    async fn persist(&self, dir: &Path, contents: Bytes) -> io::Result<()> {
        let path = self.path_in(dir)?;
        fs::create_dir_all(dir).await?;
        fs::write(path, contents).await
    }

    async fn open_stream(&self, dir: &Path) -> io::Result<FileSink> {
        let path = self.path_in(dir)?;
        fs::create_dir_all(dir).await?;
        let file = File::create(path).await?;
        Ok(Box::pin(BufWriter::new(file)))
    }

    async fn verify(&self, dir: &Path) -> bool {
        let Ok(path) = self.path_in(dir) else {
            return false;
        };
        match sha512_file(&path).await {
            Ok(actual) => actual.eq_ignore_ascii_case(self.descriptor.hash.trim()),
            Err(_) => false,
        }
    }
}

/// Lowercase hex SHA-512 of a file, read in 64 KiB blocks.
pub async fn sha512_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
