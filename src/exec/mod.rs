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

//! Seams toward the fragment executor. The coordinator runs at most one
//! fragment in process (the unpartitioned root); everything below
//! `open`/`get_next` is the executor's business.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::common::status::Status;
use crate::runtime::profile::RuntimeProfile;
use crate::service::messages::{ExecPlanFragmentParams, InsertExecStatus};

/// Counter names every scan node publishes in its instance profile. The
/// coordinator aggregates these across backends.
pub const TOTAL_THROUGHPUT_COUNTER: &str = "TotalThroughput";
pub const SCAN_RANGES_COMPLETE_COUNTER: &str = "ScanRangesComplete";

/// One batch of result rows pulled from the root fragment. Row contents
/// are opaque to the coordinator; only the count matters here.
#[derive(Clone, Debug)]
pub struct RowBatch {
    pub num_rows: usize,
}

/// Session-visible execution statistics for one query.
#[derive(Debug, Default)]
pub struct ExecStats {
    num_rows: AtomicI64,
}

impl ExecStats {
    pub fn add_rows(&self, rows: i64) {
        self.num_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn num_rows(&self) -> i64 {
        self.num_rows.load(Ordering::Relaxed)
    }
}

/// In-process executor for one fragment instance.
///
/// Implementations own their worker threads; `open` blocks until the
/// fragment's subtree is fully consumed by its sink, `get_next` blocks
/// until a batch is available, and `cancel` is safe to call from another
/// thread at any time.
pub trait PlanFragmentExecutor: Send + Sync {
    /// Set the instance up and register its stream receivers. Must
    /// complete before any remote sender starts pushing data.
    fn prepare(&self, params: &ExecPlanFragmentParams) -> Result<(), Status>;

    fn open(&self) -> Result<(), Status>;

    /// `Ok(None)` is end-of-stream.
    fn get_next(&self) -> Result<Option<RowBatch>, Status>;

    fn cancel(&self);

    fn profile(&self) -> RuntimeProfile;

    /// Snapshot of INSERT side effects; only meaningful after `open`
    /// returned for a fragment with a table sink.
    fn insert_exec_status(&self) -> InsertExecStatus;

    fn error_log(&self) -> Vec<String>;
}

/// Creates the root executor when a query has a coordinator fragment.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self) -> std::sync::Arc<dyn PlanFragmentExecutor>;
}
