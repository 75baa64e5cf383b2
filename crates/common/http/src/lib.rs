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

//! HTTP plumbing shared by bulkfetch crates: a cancellable transport
//! abstraction and a client that retries transient failures.

mod client;
mod error;
pub mod retry;
mod transport;

pub use client::{ErrorMapper, HttpClient};
pub use error::{RequestError, TransportError};
pub use retry::{DEFAULT_RETRIES, MAX_RETRY_DELAY, RetryDelay};
pub use transport::{ByteStream, ReqwestTransport, Request, Response, Transport, cancellable};
