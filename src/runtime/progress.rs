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
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::info;

/// Tracks completed scan ranges for one query and logs a line whenever
/// progress crosses another 10% of the total.
pub struct ProgressUpdater {
    label: String,
    total: i64,
    num_complete: AtomicI64,
}

impl ProgressUpdater {
    pub fn new(label: impl Into<String>, total: i64) -> Self {
        Self {
            label: label.into(),
            total,
            num_complete: AtomicI64::new(0),
        }
    }

    pub fn update(&self, delta: i64) {
        debug_assert!(delta >= 0, "progress cannot move backwards");
        if delta <= 0 || self.total <= 0 {
            return;
        }
        let old = self.num_complete.fetch_add(delta, Ordering::Relaxed);
        let new = (old + delta).min(self.total);
        let old_pct = old * 100 / self.total;
        let new_pct = new * 100 / self.total;
        if new_pct / 10 > old_pct / 10 {
            info!(
                label = %self.label,
                complete = new,
                total = self.total,
                percent = new_pct,
                "query progress"
            );
        }
    }

    pub fn num_complete(&self) -> i64 {
        self.num_complete.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn done(&self) -> bool {
        self.num_complete() >= self.total
    }
}
