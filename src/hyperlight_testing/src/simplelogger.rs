/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::{Mutex, MutexGuard, Once};

use log::{Level, LevelFilter, Log, Metadata, Record};

pub static LOGGER: SimpleLogger = SimpleLogger {};
static INSTALL: Once = Once::new();
static CAPTURED: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());

/// Records from other crates are dropped.
const CAPTURE_TARGET: &str = "hyperlight_virtq";

/// One captured record, owned so it outlives the `log` call.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub module_path: Option<String>,
    pub line: Option<u32>,
}

impl From<&Record<'_>> for LogCall {
    fn from(record: &Record<'_>) -> Self {
        Self {
            level: record.level(),
            args: record.args().to_string(),
            target: record.target().to_owned(),
            module_path: record.module_path().map(str::to_owned),
            line: record.line(),
        }
    }
}

pub struct SimpleLogger {}

impl SimpleLogger {
    /// Install as the global logger. Later calls do nothing.
    pub fn initialize_test_logger() {
        INSTALL.call_once(|| {
            log::set_logger(&LOGGER).unwrap();
            log::set_max_level(LevelFilter::Trace);
        });
    }

    fn captured(&self) -> MutexGuard<'static, Vec<LogCall>> {
        // a failed assertion in another test must not poison this one
        CAPTURED.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn num_log_calls(&self) -> usize {
        self.captured().len()
    }

    pub fn clear_log_calls(&self) {
        self.captured().clear();
    }

    /// Run `f` over everything captured so far, then forget it. The lock is
    /// held throughout so no record slips in between.
    pub fn test_log_records<F: FnOnce(&[LogCall])>(&self, f: F) {
        let mut calls = self.captured();
        f(calls.as_slice());
        calls.clear();
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level() && metadata.target().starts_with(CAPTURE_TARGET)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
            self.captured().push(record.into());
        }
    }

    fn flush(&self) {}
}
