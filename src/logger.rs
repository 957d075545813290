// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Asynchronous single-writer log sink behind the [`log`] facade.
//!
//! Producers stamp records at enqueue time under a mutex; a background
//! drain thread swaps the queue out and writes it to the configured sink
//! once the queue grows past a count threshold or enough time has passed
//! since the last flush. Ordering across threads is best-effort.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Queue length that triggers a flush.
pub const COUNT_THRESHOLD: usize = 1000;
/// Elapsed time since the last flush that triggers one.
pub const REFRESH_THRESHOLD: Duration = Duration::from_millis(3000);

/// Where drained records are written.
#[derive(Debug, Clone)]
pub enum LogSink {
    /// Line-buffered standard output.
    Stdout,
    /// A file named `<path>_<date>`, created on startup, appended to.
    File(PathBuf),
}

struct LogState {
    queue: Vec<String>,
    last_flush: Instant,
}

struct Inner {
    state: Mutex<LogState>,
    wakeup: Condvar,
    done: AtomicBool,
}

impl Inner {
    fn enqueue(&self, line: String) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.queue.push(line);
        if state.queue.len() > COUNT_THRESHOLD || state.last_flush.elapsed() > REFRESH_THRESHOLD {
            self.wakeup.notify_one();
        }
    }
}

enum SinkWriter {
    Stdout(io::Stdout),
    File(File),
}

impl SinkWriter {
    fn open(sink: &LogSink) -> io::Result<Self> {
        match sink {
            LogSink::Stdout => Ok(Self::Stdout(io::stdout())),
            LogSink::File(path) => {
                let dated = format!(
                    "{}_{}",
                    path.display(),
                    chrono::Local::now().format("%d%b%Y")
                );
                let file = OpenOptions::new().create(true).append(true).open(dated)?;
                Ok(Self::File(file))
            }
        }
    }

    fn write_batch(&mut self, batch: &[String]) {
        let result = match self {
            Self::Stdout(out) => {
                let mut out = out.lock();
                batch
                    .iter()
                    .try_for_each(|line| out.write_all(line.as_bytes()))
                    .and_then(|()| out.flush())
            }
            Self::File(file) => batch
                .iter()
                .try_for_each(|line| file.write_all(line.as_bytes()))
                .and_then(|()| file.flush()),
        };
        if let Err(err) = result {
            eprintln!("logger: sink write failed: {err}");
        }
    }
}

fn drain_loop(inner: Arc<Inner>, mut writer: SinkWriter) {
    loop {
        let (batch, exit) = {
            let Ok(mut state) = inner.state.lock() else {
                return;
            };
            while !inner.done.load(Ordering::Acquire)
                && state.queue.len() <= COUNT_THRESHOLD
                && state.last_flush.elapsed() <= REFRESH_THRESHOLD
            {
                match inner.wakeup.wait_timeout(state, REFRESH_THRESHOLD) {
                    Ok((guard, _)) => state = guard,
                    Err(_) => return,
                }
            }
            state.last_flush = Instant::now();
            (
                std::mem::take(&mut state.queue),
                inner.done.load(Ordering::Acquire),
            )
        };
        if !batch.is_empty() {
            writer.write_batch(&batch);
        }
        if exit {
            break;
        }
    }
}

/// Owns the drain thread and the producer queue. Dropping (or calling
/// [`Logger::shutdown`]) flushes the remainder and joins the drain thread.
pub struct Logger {
    inner: Arc<Inner>,
    drain: Option<JoinHandle<()>>,
}

impl Logger {
    /// Spawns the drain thread writing to `sink`. Fails when a file sink
    /// cannot be created.
    pub fn new(sink: LogSink) -> io::Result<Self> {
        let writer = SinkWriter::open(&sink)?;
        let inner = Arc::new(Inner {
            state: Mutex::new(LogState {
                queue: Vec::new(),
                last_flush: Instant::now(),
            }),
            wakeup: Condvar::new(),
            done: AtomicBool::new(false),
        });
        let drain_inner = Arc::clone(&inner);
        let drain = thread::Builder::new()
            .name("seine-logger".into())
            .spawn(move || drain_loop(drain_inner, writer))?;
        Ok(Self {
            inner,
            drain: Some(drain),
        })
    }

    /// A facade suitable for [`log::set_boxed_logger`], feeding this
    /// logger's queue.
    pub fn facade(&self) -> LoggerFacade {
        LoggerFacade {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Enqueues a pre-stamped line directly, bypassing the facade.
    pub fn enqueue(&self, line: String) {
        self.inner.enqueue(line);
    }

    /// Flushes everything still queued and joins the drain thread.
    pub fn shutdown(&mut self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.wakeup.notify_all();
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("running", &self.drain.is_some())
            .finish_non_exhaustive()
    }
}

/// The [`Log`] implementation installed process-wide by [`init`].
pub struct LoggerFacade {
    inner: Arc<Inner>,
}

impl Log for LoggerFacade {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] {}: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        );
        self.inner.enqueue(line);
    }

    fn flush(&self) {
        self.inner.wakeup.notify_one();
    }
}

impl fmt::Debug for LoggerFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerFacade").finish_non_exhaustive()
    }
}

/// Installs an async logger process-wide. Returns `Ok(None)` when another
/// logger already owns the facade (the new drain thread is torn down
/// again); `Ok(Some(logger))` hands back the handle whose drop flushes and
/// joins.
pub fn init(sink: LogSink) -> io::Result<Option<Logger>> {
    let logger = Logger::new(sink)?;
    match log::set_boxed_logger(Box::new(logger.facade())) {
        Ok(()) => {
            log::set_max_level(LevelFilter::Info);
            Ok(Some(logger))
        }
        Err(_) => Ok(None),
    }
}
