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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::common::status::Status;

/// Restartable wall-clock timer for one fragment instance.
#[derive(Debug, Default)]
pub struct Stopwatch {
    start: Option<Instant>,
    elapsed: Duration,
}

impl Stopwatch {
    pub fn start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(start) = self.start.take() {
            self.elapsed += start.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.start {
            Some(start) => self.elapsed + start.elapsed(),
            None => self.elapsed,
        }
    }
}

/// Streaming min/max/mean/stddev accumulator (Welford's update).
#[derive(Clone, Debug, Default)]
pub struct SummaryStats {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl SummaryStats {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }
}

/// Run `f` over every item using at most `pool_size` worker threads and
/// return the first error observed. All items are attempted even after a
/// failure so that callers see a consistent per-item outcome.
pub fn parallel_exec<T, F>(pool_size: usize, items: &[T], f: F) -> Result<(), Status>
where
    T: Sync,
    F: Fn(&T) -> Result<(), Status> + Sync,
{
    if items.is_empty() {
        return Ok(());
    }
    let workers = pool_size.max(1).min(items.len());
    let next = AtomicUsize::new(0);
    let first_error: Mutex<Option<Status>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= items.len() {
                    break;
                }
                if let Err(status) = f(&items[idx]) {
                    let mut guard = first_error.lock().unwrap_or_else(|e| e.into_inner());
                    if guard.is_none() {
                        *guard = Some(status);
                    }
                }
            });
        }
    });

    let guard = first_error.lock().unwrap_or_else(|e| e.into_inner());
    match guard.clone() {
        Some(status) => Err(status),
        None => Ok(()),
    }
}

pub fn format_bytes(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    if bytes >= GIB {
        format!("{:.2} GB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.2} MB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.2} KB", bytes / KIB)
    } else {
        format!("{:.0} B", bytes)
    }
}

pub fn format_time_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.0}ms", ms)
    }
}
