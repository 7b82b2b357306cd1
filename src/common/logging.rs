// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process-wide `tracing` setup.
//!
//! Every event is rendered as one glog-style line. The spans an event was emitted
//! under are printed between the source location and the message, so lines logged
//! inside a `query` span carry its query id:
//!
//! `I20260101 12:00:00.000001 main main.rs:42] query{query_id=6772:1}: message`

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

const LOG_FILE_ENV: &str = "GRACEFLOW_LOG_FILE";
const LOG_DIR_ENV: &str = "GRACEFLOW_LOG_DIR";
const LOG_FILE_NAME: &str = "graceflow.log";

/// Where log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogTarget {
    Stderr,
    File(PathBuf),
}

impl LogTarget {
    /// An explicit file wins over a directory; with neither, logs go to stderr.
    fn resolve(file: Option<String>, dir: Option<String>) -> Self {
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        if let Some(file) = non_empty(file) {
            return LogTarget::File(PathBuf::from(file));
        }
        match non_empty(dir) {
            Some(dir) => LogTarget::File(Path::new(&dir).join(LOG_FILE_NAME)),
            None => LogTarget::Stderr,
        }
    }

    fn from_env() -> Self {
        Self::resolve(std::env::var(LOG_FILE_ENV).ok(), std::env::var(LOG_DIR_ENV).ok())
    }

    /// Opens the target and returns the writer with the target actually in use.
    /// A file that cannot be opened falls back to stderr.
    fn open(self) -> (BoxMakeWriter, LogTarget) {
        let path = match self {
            LogTarget::Stderr => return (BoxMakeWriter::new(std::io::stderr), LogTarget::Stderr),
            LogTarget::File(path) => path,
        };
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), LogTarget::File(path)),
            Err(err) => {
                eprintln!(
                    "graceflow: cannot log to {}: {}, using stderr",
                    path.display(),
                    err
                );
                LogTarget::Stderr.open()
            }
        }
    }
}

fn level_char(level: &tracing::Level) -> char {
    match *level {
        tracing::Level::ERROR => 'E',
        tracing::Level::WARN => 'W',
        tracing::Level::INFO => 'I',
        tracing::Level::DEBUG => 'D',
        tracing::Level::TRACE => 'T',
    }
}

fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id())
            .trim_start_matches("ThreadId(")
            .trim_end_matches(')')
            .to_string(),
    }
}

struct GraceflowFormatter;

impl<S, N> FormatEvent<S, N> for GraceflowFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let file = metadata
            .file()
            .map(|f| f.rsplit('/').next().unwrap_or(f))
            .unwrap_or("unknown");
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level_char(metadata.level()),
            Local::now().format("%Y%m%d %H:%M:%S%.6f"),
            thread_label(),
            file,
            metadata.line().unwrap_or(0)
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{{{}}}", fields)?;
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber once. Later calls are no-ops.
///
/// `filter` is a full `EnvFilter` expression, e.g. `"info"` or
/// `"graceflow::runtime=debug,info"`. `GRACEFLOW_LOG_FILE` or `GRACEFLOW_LOG_DIR`
/// redirect output to a file.
pub fn init_with_level(filter: &str) {
    INIT.get_or_init(|| {
        let (writer, target) = LogTarget::from_env().open();
        // ANSI codes only on an interactive stderr.
        let ansi = target == LogTarget::Stderr && atty::is(atty::Stream::Stderr);
        let _ = tracing_fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(writer)
            .with_ansi(ansi)
            .event_format(GraceflowFormatter)
            .try_init();
    });
}

pub fn init() {
    init_with_level("info");
}

pub use tracing::{debug, error, info, info_span, trace, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_wins_over_dir() {
        assert_eq!(
            LogTarget::resolve(Some("/tmp/a.log".into()), Some("/var/log".into())),
            LogTarget::File(PathBuf::from("/tmp/a.log"))
        );
        assert_eq!(
            LogTarget::resolve(Some("  ".into()), Some("/var/log".into())),
            LogTarget::File(PathBuf::from("/var/log/graceflow.log"))
        );
        assert_eq!(LogTarget::resolve(None, Some(String::new())), LogTarget::Stderr);
    }

    #[test]
    fn unopenable_file_falls_back_to_stderr() {
        let temp = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let (_, target) = LogTarget::File(temp.path().to_path_buf()).open();
        assert_eq!(target, LogTarget::Stderr);

        let path = temp.path().join("nested").join("graceflow.log");
        let (_, target) = LogTarget::File(path.clone()).open();
        assert_eq!(target, LogTarget::File(path.clone()));
        assert!(path.exists());
    }
}
