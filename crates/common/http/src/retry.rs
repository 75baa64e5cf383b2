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

//! Classification of failed responses into transient and permanent, and the
//! delay to wait before the next attempt.

use http::{HeaderMap, StatusCode, header};
use jiff::{Timestamp, fmt::rfc2822};

/// Default number of retries for one logical request.
pub const DEFAULT_RETRIES: u32 = 3;

/// Longest wait, in seconds, the client accepts before a retry. Anything
/// longer turns the failure permanent.
pub const MAX_RETRY_DELAY: u64 = 30;

/// Statuses that are retried with exponential backoff when the server gives
/// no explicit delay.
const BACKOFF_STATUSES: [u16; 5] = [408, 503, 504, 507, 522];

const RATE_LIMIT_RESET: &str = "ratelimit-reset";
const X_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// How long to wait before retrying a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Server-provided delay in seconds. Zero means retry immediately.
    After(u64),
    /// Transient, but the server did not say for how long. Use exponential
    /// backoff.
    Unknown,
}

/// Decide whether a non-success response is worth retrying.
///
/// Returns `None` for permanent failures.
pub fn transient_retry_delay(status: StatusCode, headers: &HeaderMap) -> Option<RetryDelay> {
    transient_retry_delay_at(status, headers, Timestamp::now())
}

pub(crate) fn transient_retry_delay_at(
    status: StatusCode,
    headers: &HeaderMap,
    now: Timestamp,
) -> Option<RetryDelay> {
    if let Some(value) = headers.get(header::RETRY_AFTER) {
        return Some(delay_from_header(value.to_str().ok(), now));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset = headers
            .get(RATE_LIMIT_RESET)
            .or_else(|| headers.get(X_RATE_LIMIT_RESET));
        return Some(match reset {
            Some(value) => delay_from_header(value.to_str().ok(), now),
            None => RetryDelay::Unknown,
        });
    }

    BACKOFF_STATUSES
        .contains(&status.as_u16())
        .then_some(RetryDelay::Unknown)
}

fn delay_from_header(value: Option<&str>, now: Timestamp) -> RetryDelay {
    match value.and_then(|value| parse_relative_time(value, now)) {
        // An instant that already passed means there is nothing to wait for.
        Some(seconds) => RetryDelay::After(u64::try_from(seconds).unwrap_or(0)),
        None => RetryDelay::Unknown,
    }
}

/// Parse either a whole number of seconds or a date, returning the number of
/// seconds from `now` until that instant, rounded up.
pub fn parse_relative_time(value: &str, now: Timestamp) -> Option<i64> {
    let value = value.trim();
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        // Saturate values too large for i64.
        return Some(value.parse().unwrap_or(i64::MAX));
    }

    let instant = rfc2822::DateTimeParser::new()
        .parse_timestamp(value)
        .ok()
        .or_else(|| value.parse::<Timestamp>().ok())?;

    let millis = instant.as_millisecond() - now.as_millisecond();
    let seconds = millis / 1000;
    Some(if millis % 1000 > 0 { seconds + 1 } else { seconds })
}

/// Exponential backoff in seconds: `2^attempts_used`.
pub const fn backoff_delay(attempts_used: u32) -> u64 { 2_u64.saturating_pow(attempts_used) }
