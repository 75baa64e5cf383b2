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

use std::{
    env,
    io::IsTerminal,
    sync::{
        Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu, ensure};
use tracing::Subscriber;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, layer::SubscriberExt, registry::LookupSpan,
};

/// Deserializes a string value, using `Default::default()` if the string is
/// empty.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// Conventional directory name for log files.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Fallback filter when neither `LoggingOptions::level` nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoggingError {
    #[snafu(display("Global logging is already initialized"))]
    AlreadyInitialized,

    #[snafu(display("Invalid log level filter '{level}': {source}"))]
    InvalidLevel {
        level:  String,
        source: filter::ParseError,
    },

    #[snafu(display("Failed to create rolling log file in {dir}: {source}"))]
    RollingFile {
        dir:    String,
        source: tracing_appender::rolling::InitError,
    },

    #[snafu(display("Failed to install log bridge: {source}"))]
    LogBridge { source: tracing_log::log::SetLoggerError },

    #[snafu(display("Failed to set global subscriber: {source}"))]
    GlobalSubscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for log files. Empty disables file logging. Files rotate
    /// hourly.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Filter string such as `"info"` or `"debug,hyper=warn"`. Falls back to
    /// `RUST_LOG`, then `"info"`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log stream.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Also write to stdout when file logging is on.
    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Output format for log lines.
#[derive(
    Clone,
    Debug,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line, with span context.
    Json,
    #[default]
    Text,
}

/// Stdout-only logging with default options.
pub fn init_tracing_subscriber(app_name: &str) -> Result<Vec<WorkerGuard>, LoggingError> {
    init_global_logging(app_name, &LoggingOptions::default())
}

/// Logging for unit tests. Safe to call from every test; only the first call
/// does anything.
///
/// Reads `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) and
/// `UNITTEST_LOG_LEVEL`.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();
    static GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| {
            "debug,hyper=warn,hyper_util=warn,tower=warn,reqwest=warn,h2=info".to_string()
        });
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };

        // Another subscriber may already be installed by the test harness.
        if let Ok(guards) = init_global_logging("unittest", &opts)
            && let Ok(mut slot) = GUARDS.lock()
        {
            *slot = guards;
            tracing::info!("logs dir = {}", dir);
        }
    });
}

/// Install the global `tracing` subscriber.
///
/// Sets up a non-blocking stdout layer, an hourly rolling file layer and an
/// error-only rolling file layer (the file layers only when `opts.dir` is
/// set), and bridges `log` records into `tracing`.
///
/// The returned guards flush buffered lines when dropped and must be kept
/// alive for as long as the process logs. Only the first call succeeds.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, LoggingError> {
    static INITIALIZED: AtomicBool = AtomicBool::new(false);

    let level = opts
        .level
        .clone()
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_string());
    let targets = level
        .parse::<filter::Targets>()
        .context(InvalidLevelSnafu { level: &level })?;

    ensure!(
        INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok(),
        AlreadyInitializedSnafu
    );

    let mut guards = vec![];

    let stdout_logging_layer = if opts.append_stdout || opts.dir.is_empty() {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        Some(fmt_layer(writer, opts.log_format, std::io::stdout().is_terminal()))
    } else {
        None
    };

    let file_logging_layer = if opts.dir.is_empty() {
        None
    } else {
        let (writer, guard) = rolling_writer(opts, app_name)?;
        guards.push(guard);
        Some(fmt_layer(writer, opts.log_format, false))
    };

    let err_file_logging_layer = if opts.dir.is_empty() {
        None
    } else {
        let (writer, guard) = rolling_writer(opts, &format!("{app_name}-err"))?;
        guards.push(guard);
        Some(
            fmt_layer(writer, opts.log_format, false)
                .with_filter(filter::LevelFilter::ERROR)
                .boxed(),
        )
    };

    let subscriber = Registry::default()
        .with(targets)
        .with(stdout_logging_layer)
        .with(file_logging_layer)
        .with(err_file_logging_layer);

    tracing::subscriber::set_global_default(subscriber).context(GlobalSubscriberSnafu)?;
    LogTracer::init().context(LogBridgeSnafu)?;

    Ok(guards)
}

fn rolling_writer(
    opts: &LoggingOptions,
    prefix: &str,
) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .context(RollingFileSnafu { dir: &opts.dir })?;
    Ok(tracing_appender::non_blocking(appender))
}

fn fmt_layer<S>(
    writer: NonBlocking,
    format: LogFormat,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}
