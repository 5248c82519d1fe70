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

//! The per-query coordinator: assigns fragments to hosts, dispatches them
//! to backends, absorbs status reports, streams the root fragment's
//! output and drives cancellation and INSERT finalization.
//!
//! Locking: `lock` (coordinator-wide) may only be acquired before a
//! backend state's lock, never after. `wait_lock` serializes `wait` and
//! is independent of the pair. The completion condvar pairs with `lock`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};

use tracing::{debug, info, trace, warn};

use crate::common::config;
use crate::common::ids::PlanNodeId;
use crate::common::status::Status;
use crate::common::types::{HostPort, UniqueId};
use crate::common::util::{format_bytes, format_time_ms, parallel_exec, Stopwatch, SummaryStats};
use crate::exec::{
    ExecStats, PlanFragmentExecutor, RowBatch, SCAN_RANGES_COMPLETE_COUNTER,
    TOTAL_THROUGHPUT_COUNTER,
};
use crate::plan::{FinalizeParams, PartitionType, QueryExecRequest, QueryOptions, ScanRange};
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::exec_params::{
    compute_fragment_exec_params, compute_scan_range_assignment, FragmentExecParams,
    FragmentScanRangeAssignment,
};
use crate::runtime::finalize::finalize_insert;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};
use crate::runtime::progress::ProgressUpdater;
use crate::service::client_cache::RpcError;
use crate::service::messages::{
    CancelPlanFragmentParams, ExecPlanFragmentParams, PlanFragmentInstanceParams,
    ReportExecStatusParams,
};

/// Lifecycle of one query as seen by the coordinator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueryState {
    Created,
    Running,
    Draining,
    Finalized,
    Cancelled,
    Failed,
}

/// Partitions an INSERT touched, for the caller's catalog update.
#[derive(Debug, Default)]
pub struct CatalogUpdate {
    pub created_partitions: BTreeSet<String>,
}

/// Cached scan-node counter handles of one fragment instance's profile.
#[derive(Clone, Default)]
struct FragmentInstanceCounters {
    throughput: HashMap<PlanNodeId, CounterRef>,
    scan_ranges_complete: HashMap<PlanNodeId, CounterRef>,
}

struct BackendExecStateInner {
    /// Monotone: once non-OK it never goes back to OK; a non-OK status
    /// also means cancellation of this instance is a no-op.
    status: Status,
    /// Exec RPC acknowledged by the backend.
    initiated: bool,
    /// Backend reported a terminal state; do not cancel in that case.
    done: bool,
    profile_created: bool,
    error_log: Vec<String>,
    /// Completed ranges at the last report, for delta progress.
    total_ranges_complete: i64,
    aggregate_counters: FragmentInstanceCounters,
    stopwatch: Stopwatch,
}

/// Execution state of one remote fragment instance.
struct BackendExecState {
    fragment_instance_id: UniqueId,
    hostport: HostPort,
    fragment_idx: usize,
    backend_num: usize,
    /// Summed over this instance's file splits, in bytes.
    total_split_size: i64,
    rpc_params: ExecPlanFragmentParams,
    /// Cumulative instance profile, updated in place from reports.
    profile: RuntimeProfile,
    /// Lock ordering: `Coordinator::lock` may only be taken before this.
    lock: Mutex<BackendExecStateInner>,
}

impl BackendExecState {
    fn new(
        backend_num: usize,
        fragment_idx: usize,
        params: &FragmentExecParams,
        instance_idx: usize,
        rpc_params: ExecPlanFragmentParams,
    ) -> Self {
        let fragment_instance_id = params.instance_ids[instance_idx];
        let total_split_size = rpc_params
            .params
            .per_node_scan_ranges
            .values()
            .flatten()
            .map(|range_params| match &range_params.scan_range {
                ScanRange::HdfsFileSplit { length, .. } => *length,
                ScanRange::KvRange { .. } => 0,
            })
            .sum();
        Self {
            fragment_instance_id,
            hostport: params.hosts[instance_idx].clone(),
            fragment_idx,
            backend_num,
            total_split_size,
            rpc_params,
            profile: RuntimeProfile::new(format!("Instance {fragment_instance_id}")),
            lock: Mutex::new(BackendExecStateInner {
                status: Status::ok(),
                initiated: false,
                done: false,
                profile_created: false,
                error_log: Vec::new(),
                total_ranges_complete: 0,
                aggregate_counters: FragmentInstanceCounters::default(),
                stopwatch: Stopwatch::default(),
            }),
        }
    }

    /// Value of this instance's throughput counter for `node_id`, or 0.
    /// The counter handle is cloned under the lock and read after release
    /// so a slow counter read never extends the critical section.
    fn node_throughput(&self, node_id: PlanNodeId) -> i64 {
        let counter = {
            let inner = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            inner.aggregate_counters.throughput.get(&node_id).cloned()
        };
        counter.map(|c| c.value()).unwrap_or(0)
    }

    fn num_scan_ranges_completed(&self, node_id: PlanNodeId) -> i64 {
        let counter = {
            let inner = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .aggregate_counters
                .scan_ranges_complete
                .get(&node_id)
                .cloned()
        };
        counter.map(|c| c.value()).unwrap_or(0)
    }

    /// Total completed ranges across scan nodes, returned as the delta
    /// since the previous call. Caller holds the state lock.
    fn update_num_scan_ranges_completed(inner: &mut BackendExecStateInner) -> i64 {
        let total: i64 = inner
            .aggregate_counters
            .scan_ranges_complete
            .values()
            .map(|c| c.value())
            .sum();
        let delta = total - inner.total_ranges_complete;
        debug_assert!(delta >= 0, "completed-range count went backwards");
        inner.total_ranges_complete = total;
        delta.max(0)
    }
}

struct PerFragmentProfile {
    num_instances: usize,
    averaged_profile: RuntimeProfile,
    root_profile: RuntimeProfile,
    bytes_assigned: Mutex<SummaryStats>,
    completion_times: Mutex<SummaryStats>,
    rates: Mutex<SummaryStats>,
}

/// Everything that is fixed once `exec` has planned the query. Reports
/// and cancellation navigate this without any coordinator-wide lock.
struct QueryExecInfo {
    query_id: UniqueId,
    finalize_params: Option<FinalizeParams>,
    fragment_exec_params: Vec<FragmentExecParams>,
    executor: Option<Arc<dyn PlanFragmentExecutor>>,
    root_instance_id: Option<UniqueId>,
    backend_states: Vec<Arc<BackendExecState>>,
    num_backends: usize,
    query_profile: RuntimeProfile,
    fragment_profiles: Vec<PerFragmentProfile>,
    progress: ProgressUpdater,
}

struct CoordShared {
    query_state: QueryState,
    /// OK until the first fault; the first non-OK value wins for good.
    query_status: Status,
    num_remaining_backends: usize,
    /// Staged-file moves merged from workers or snapshotted from the root
    /// executor (exactly one of the two sources, never both).
    files_to_move: BTreeMap<String, String>,
    partition_row_counts: BTreeMap<String, i64>,
}

pub struct Coordinator {
    exec_env: Arc<ExecEnv>,
    exec_stats: Arc<ExecStats>,
    exec_info: OnceLock<QueryExecInfo>,
    lock: Mutex<CoordShared>,
    backend_completion_cv: Condvar,
    wait_lock: Mutex<()>,
    has_called_wait: AtomicBool,
    summary_reported: AtomicBool,
}

impl Coordinator {
    pub fn new(exec_env: Arc<ExecEnv>, exec_stats: Arc<ExecStats>) -> Self {
        Self {
            exec_env,
            exec_stats,
            exec_info: OnceLock::new(),
            lock: Mutex::new(CoordShared {
                query_state: QueryState::Created,
                query_status: Status::ok(),
                num_remaining_backends: 0,
                files_to_move: BTreeMap::new(),
                partition_row_counts: BTreeMap::new(),
            }),
            backend_completion_cv: Condvar::new(),
            wait_lock: Mutex::new(()),
            has_called_wait: AtomicBool::new(false),
            summary_reported: AtomicBool::new(false),
        }
    }

    /// Plan host and scan-range assignment, prepare the in-process root
    /// fragment if there is one, then start every remote fragment
    /// instance. Receivers are always running before their senders:
    /// the root is prepared before any dispatch, and fragments dispatch
    /// in consumer-before-producer index order.
    pub fn exec(
        &self,
        query_id: UniqueId,
        request: &QueryExecRequest,
        options: &QueryOptions,
    ) -> Result<(), Status> {
        if self.exec_info.get().is_some() {
            return Err(Status::internal_error("exec called twice"));
        }
        if request.fragments.is_empty() {
            return Err(Status::internal_error("request has no fragments"));
        }
        info!(query_id = %query_id, "exec query");

        let coord_addr = self.exec_env.backend_address().clone();
        let (fragment_exec_params, num_backends) = compute_fragment_exec_params(
            request,
            query_id,
            &coord_addr,
            self.exec_env.scheduler(),
        )?;
        let (scan_range_assignment, num_scan_ranges) =
            compute_scan_range_assignment(request, &fragment_exec_params)?;

        let query_profile = RuntimeProfile::new(format!("Query {query_id}"));
        let _total_timer = ScopedTimer::new(query_profile.total_time_counter());

        // We run the root fragment ourselves if it is unpartitioned.
        let has_coordinator_fragment =
            request.fragments[0].partition == PartitionType::Unpartitioned;
        let executor = has_coordinator_fragment
            .then(|| self.exec_env.executor_factory().create());

        let root_rpc_params = executor.is_some().then(|| {
            set_exec_plan_fragment_params(
                request,
                query_id,
                0,
                0,
                &fragment_exec_params[0],
                0,
                &scan_range_assignment,
                &coord_addr,
                options,
            )
        });
        let root_instance_id =
            has_coordinator_fragment.then(|| fragment_exec_params[0].instance_ids[0]);

        // The aggregate profile registers ahead of the per-fragment ones
        // so it shows up at the top of the tree.
        let aggregate_profile = RuntimeProfile::new("Aggregate Profile");
        query_profile.add_child(aggregate_profile.clone());

        // Backend states for every remote instance, rpc payloads included.
        let mut backend_states: Vec<Arc<BackendExecState>> = Vec::new();
        let first_remote_fragment = usize::from(has_coordinator_fragment);
        let mut backend_num = 0usize;
        for fragment_idx in first_remote_fragment..request.fragments.len() {
            let params = &fragment_exec_params[fragment_idx];
            debug_assert!(!params.hosts.is_empty());
            for instance_idx in 0..params.hosts.len() {
                let rpc_params = set_exec_plan_fragment_params(
                    request,
                    query_id,
                    backend_num,
                    fragment_idx,
                    params,
                    instance_idx,
                    &scan_range_assignment,
                    &coord_addr,
                    options,
                );
                debug!(
                    query_id = %query_id,
                    fragment_idx,
                    instance_id = %params.instance_ids[instance_idx],
                    backend = %params.hosts[instance_idx],
                    "created backend exec state"
                );
                backend_states.push(Arc::new(BackendExecState::new(
                    backend_num,
                    fragment_idx,
                    params,
                    instance_idx,
                    rpc_params,
                )));
                backend_num += 1;
            }
        }
        debug_assert_eq!(backend_num, num_backends);

        // Serialize with async cancel until every instance has either
        // been initiated or recorded as never-initiated.
        let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        shared.num_remaining_backends = num_backends;

        let mut coordinator_counters = FragmentInstanceCounters::default();
        if let Some(executor) = &executor {
            let rpc_params = root_rpc_params.as_ref().expect("root params present");
            if let Err(e) = executor.prepare(rpc_params) {
                shared.query_status = e.clone();
                shared.query_state = QueryState::Failed;
                return Err(e);
            }
            let exec_profile = executor.profile();
            exec_profile.set_name("Coordinator Fragment");
            query_profile.add_child(exec_profile.clone());
            collect_scan_node_counters(&exec_profile, &mut coordinator_counters);
        }

        let mut fragment_profiles = Vec::with_capacity(request.fragments.len());
        for i in 0..request.fragments.len() {
            let num_instances = fragment_exec_params[i].hosts.len();
            if i == 0 && has_coordinator_fragment {
                // Only one instance, so the average is the profile itself.
                let exec_profile = executor.as_ref().expect("executor present").profile();
                fragment_profiles.push(PerFragmentProfile {
                    num_instances,
                    averaged_profile: exec_profile.clone(),
                    root_profile: exec_profile,
                    bytes_assigned: Mutex::new(SummaryStats::default()),
                    completion_times: Mutex::new(SummaryStats::default()),
                    rates: Mutex::new(SummaryStats::default()),
                });
                continue;
            }
            let averaged_profile = RuntimeProfile::new(format!("Averaged Fragment {i}"));
            query_profile.add_child(averaged_profile.clone());
            let root_profile = RuntimeProfile::new(format!("Fragment {i}"));
            query_profile.add_child(root_profile.clone());
            fragment_profiles.push(PerFragmentProfile {
                num_instances,
                averaged_profile,
                root_profile,
                bytes_assigned: Mutex::new(SummaryStats::default()),
                completion_times: Mutex::new(SummaryStats::default()),
                rates: Mutex::new(SummaryStats::default()),
            });
        }

        create_aggregate_counters(
            &aggregate_profile,
            request,
            &backend_states,
            &coordinator_counters,
        );

        let info = QueryExecInfo {
            query_id,
            finalize_params: request.finalize_params.clone(),
            fragment_exec_params,
            executor,
            root_instance_id,
            backend_states,
            num_backends,
            query_profile,
            fragment_profiles,
            progress: ProgressUpdater::new(format!("Query {query_id}"), num_scan_ranges as i64),
        };
        let _ = self.exec_info.set(info);
        let info = self.exec_info.get().expect("exec info just set");

        if !shared.query_status.is_ok() {
            // Cancelled before anything was dispatched.
            return Err(shared.query_status.clone());
        }

        // Start fragment instances consumer-first, so receivers have
        // prepared before senders start pushing. Within one fragment the
        // dispatch is fan-out parallel.
        info!(
            query_id = %query_id,
            num_backends,
            "starting remote fragment instances"
        );
        let dispatch_threads = config::dispatch_threads();
        let mut idx = 0usize;
        while idx < info.backend_states.len() {
            let fragment_idx = info.backend_states[idx].fragment_idx;
            let mut end = idx;
            while end < info.backend_states.len()
                && info.backend_states[end].fragment_idx == fragment_idx
            {
                end += 1;
            }
            let batch = &info.backend_states[idx..end];
            let dispatch_result = parallel_exec(dispatch_threads, batch, |state| {
                self.exec_remote_fragment(state)
            });
            if let Err(e) = dispatch_result {
                debug_assert!(shared.query_status.is_ok());
                shared.query_status = e.clone();
                shared.query_state = QueryState::Failed;
                self.cancel_internal(&mut shared);
                return Err(e);
            }
            idx = end;
        }

        self.print_backend_info(info);
        shared.query_state = QueryState::Running;
        Ok(())
    }

    /// Send `ExecPlanFragment` to one backend, reopening the connection
    /// and retrying exactly once on a transport failure so a silently
    /// restarted peer does not fail the query. The state lock is held for
    /// the duration to serialize with concurrent cancellation.
    fn exec_remote_fragment(&self, state: &Arc<BackendExecState>) -> Result<(), Status> {
        debug!(
            query_id = %state.rpc_params.params.query_id,
            instance_id = %state.fragment_instance_id,
            backend = %state.hostport,
            "making rpc: ExecPlanFragment"
        );
        let mut inner = state.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut client = self.exec_env.client_cache().get_client(&state.hostport)?;
        let mut result = client.exec_plan_fragment(&state.rpc_params);
        if matches!(result, Err(RpcError::Transport(_))) {
            // An existing connection to a backend that restarted may still
            // look connected; force a reopen and retry once.
            debug!(backend = %state.hostport, "retrying ExecPlanFragment after transport error");
            self.exec_env.client_cache().reopen_client(&mut client)?;
            result = client.exec_plan_fragment(&state.rpc_params);
        }

        match result {
            Err(e) => {
                let status = Status::rpc_error(format!(
                    "ExecPlanFragment rpc query_id={} instance_id={} failed: {}",
                    state.rpc_params.params.query_id, state.fragment_instance_id, e
                ));
                warn!(
                    instance_id = %state.fragment_instance_id,
                    backend = %state.hostport,
                    error = %status.message(),
                    "ExecPlanFragment failed"
                );
                inner.status = status.clone();
                Err(status)
            }
            Ok(result) => {
                inner.status = result.status.clone();
                if inner.status.is_ok() {
                    inner.initiated = true;
                    inner.stopwatch.start();
                    Ok(())
                } else {
                    Err(inner.status.clone())
                }
            }
        }
    }

    /// Absorb one status report from a backend.
    pub fn update_fragment_exec_status(
        &self,
        params: &ReportExecStatusParams,
    ) -> Result<(), Status> {
        let Some(info) = self.exec_info.get() else {
            return Err(Status::internal_error("no query executing"));
        };
        trace!(
            query_id = %info.query_id,
            backend_num = params.backend_num,
            done = params.done,
            "update fragment exec status"
        );
        let Some(state) = info.backend_states.get(params.backend_num) else {
            return Err(Status::internal_error("unknown backend number"));
        };
        let status = params.status.clone();
        {
            let mut inner = state.lock.lock().unwrap_or_else(|e| e.into_inner());
            // A fragment must not transition from an error status back to
            // OK; keep the first error and record later ones as detail.
            debug_assert!(
                inner.status.is_ok() || !status.is_ok(),
                "fragment transitioning from error to OK: instance_id={}",
                state.fragment_instance_id
            );
            if inner.status.is_ok() {
                inner.status = status.clone();
            } else if !status.is_ok() && status != inner.status {
                inner.status.add_status(&status);
            }
            inner.done = params.done;
            state.profile.update(&params.profile);
            if !inner.profile_created {
                let mut counters = FragmentInstanceCounters::default();
                collect_scan_node_counters(&state.profile, &mut counters);
                inner.aggregate_counters = counters;
            }
            inner.profile_created = true;

            if !params.error_log.is_empty() {
                inner.error_log.extend(params.error_log.iter().cloned());
                debug!(
                    instance_id = %state.fragment_instance_id,
                    error_log = %inner.error_log.join("\n"),
                    "backend reported errors"
                );
            }
            if params.done {
                inner.stopwatch.stop();
            }
            let delta = BackendExecState::update_num_scan_ranges_completed(&mut inner);
            drop(inner);
            info.progress.update(delta);
        }

        if params.done {
            if let Some(insert_status) = &params.insert_exec_status {
                // Merge table-update side effects destined for
                // finalization.
                let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
                for (partition, rows) in &insert_status.num_appended_rows {
                    *shared
                        .partition_row_counts
                        .entry(partition.clone())
                        .or_insert(0) += rows;
                }
                for (src, dst) in &insert_status.files_to_move {
                    shared
                        .files_to_move
                        .entry(src.clone())
                        .or_insert_with(|| dst.clone());
                }
            }
        }

        // Any error aborts the whole query; update_status starts the
        // cancellation sweep unless one is already underway.
        if !status.is_ok() {
            self.update_status(status, Some(state.fragment_instance_id));
            return Ok(());
        }

        if params.done {
            let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            debug_assert!(shared.num_remaining_backends > 0);
            info!(
                query_id = %info.query_id,
                backend_num = params.backend_num,
                remaining = shared.num_remaining_backends.saturating_sub(1),
                "backend completed"
            );
            if shared.num_remaining_backends > 0 {
                shared.num_remaining_backends -= 1;
                if shared.num_remaining_backends == 0 {
                    self.backend_completion_cv.notify_all();
                }
            }
        }

        Ok(())
    }

    /// Record the first non-OK status and start cancellation. Returns the
    /// query status, which is the first error ever recorded.
    fn update_status(&self, status: Status, failed_instance: Option<UniqueId>) -> Status {
        let (result, newly_failed) = {
            let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            // Nothing to update, or an error already won and cancellation
            // has started.
            if status.is_ok() || !shared.query_status.is_ok() {
                (shared.query_status.clone(), false)
            } else {
                shared.query_status = status.clone();
                shared.query_state = if status.is_cancelled() {
                    QueryState::Cancelled
                } else {
                    QueryState::Failed
                };
                self.cancel_internal(&mut shared);
                (status, true)
            }
        };
        if newly_failed {
            if let (Some(instance_id), Some(info)) = (failed_instance, self.exec_info.get()) {
                info!(
                    query_id = %info.query_id,
                    instance_id = %instance_id,
                    "query failed because fragment instance failed"
                );
            }
        }
        result
    }

    /// Block until the root executor has drained (when there is one) or
    /// every remote backend has reported done. Idempotent; concurrent
    /// callers serialize on `wait_lock`. Runs INSERT finalization before
    /// returning.
    pub fn wait(&self) -> Result<(), Status> {
        let _wait_guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.has_called_wait.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(info) = self.exec_info.get() else {
            return Err(Status::internal_error("wait called before exec"));
        };
        {
            let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            if shared.query_state == QueryState::Running {
                shared.query_state = QueryState::Draining;
            }
        }

        if let Some(executor) = &info.executor {
            // open blocks until the root's input is drained.
            let open_status = match executor.open() {
                Ok(()) => Status::ok(),
                Err(e) => e,
            };
            let status = self.update_status(open_status, info.root_instance_id);
            if !status.is_ok() {
                return Err(status);
            }

            // The root sink owns every insert side effect when the
            // coordinator runs a fragment (backends have a table sink
            // only when it does not), so copying replaces merging.
            let insert_status = executor.insert_exec_status();
            let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            debug_assert!(shared.files_to_move.is_empty());
            debug_assert!(shared.partition_row_counts.is_empty());
            shared.files_to_move = insert_status.files_to_move;
            shared.partition_row_counts = insert_status.num_appended_rows;
        } else {
            // Finalization needs the reports of all backends; they are
            // the only source of relevant state for parallel INSERTs.
            let status = self.wait_for_all_backends();
            if !status.is_ok() {
                return Err(status);
            }
        }

        if info.finalize_params.is_some() {
            self.finalize_query(info)?;
            let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            if shared.query_status.is_ok() {
                shared.query_state = QueryState::Finalized;
            }
        }
        Ok(())
    }

    fn wait_for_all_backends(&self) -> Status {
        let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        debug!(
            remaining = shared.num_remaining_backends,
            "waiting for backends to finish"
        );
        while shared.num_remaining_backends > 0 && shared.query_status.is_ok() {
            shared = self
                .backend_completion_cv
                .wait(shared)
                .unwrap_or_else(|e| e.into_inner());
        }
        debug!("all backends finished or error");
        shared.query_status.clone()
    }

    /// Pull one batch from the root fragment. `Ok(None)` is terminal and
    /// is only returned once every remote backend has finished, so
    /// post-query work sees a quiesced world.
    pub fn get_next(&self) -> Result<Option<RowBatch>, Status> {
        debug_assert!(
            self.has_called_wait.load(Ordering::SeqCst),
            "get_next before wait"
        );
        let Some(info) = self.exec_info.get() else {
            return Err(Status::internal_error("get_next called before exec"));
        };
        trace!(query_id = %info.query_id, "get_next");
        let _total_timer = ScopedTimer::new(info.query_profile.total_time_counter());

        let Some(executor) = &info.executor else {
            // No local fragment: no output, and execution finished in
            // wait.
            let status = self.get_status();
            return if status.is_ok() { Ok(None) } else { Err(status) };
        };

        // Do not hold the coordinator lock here; an async cancel must be
        // able to proceed while we block in the executor.
        match executor.get_next() {
            Err(e) => {
                // Return the query's first error, not whatever the local
                // executor produced after cancellation.
                let status = self.update_status(e, info.root_instance_id);
                Err(status)
            }
            Ok(None) => {
                let status = self.wait_for_all_backends();
                if !status.is_ok() {
                    return Err(status);
                }
                self.report_query_summary();
                let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
                if shared.query_status.is_ok() && shared.query_state == QueryState::Draining {
                    shared.query_state = QueryState::Finalized;
                }
                Ok(None)
            }
            Ok(Some(batch)) => {
                self.exec_stats.add_rows(batch.num_rows as i64);
                Ok(Some(batch))
            }
        }
    }

    /// Cancel the query. Idempotent: only the first non-OK transition
    /// fans out cancel RPCs.
    pub fn cancel(&self) {
        let mut shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if !shared.query_status.is_ok() {
            return;
        }
        shared.query_status = Status::cancelled();
        shared.query_state = QueryState::Cancelled;
        self.cancel_internal(&mut shared);
    }

    /// Cancellation sweep. Caller holds the coordinator lock; each
    /// backend state lock is taken in turn (never the reverse order).
    /// RPC failures are recorded on the state and do not stop the sweep.
    fn cancel_internal(&self, shared: &mut MutexGuard<'_, CoordShared>) {
        debug_assert!(!shared.query_status.is_ok());
        let Some(info) = self.exec_info.get() else {
            self.backend_completion_cv.notify_all();
            return;
        };
        info!(query_id = %info.query_id, "cancelling query");

        if let Some(executor) = &info.executor {
            executor.cancel();
        }

        for state in &info.backend_states {
            let mut inner = state.lock.lock().unwrap_or_else(|e| e.into_inner());
            // Already terminated with an error, or cancellation already
            // touched it.
            if !inner.status.is_ok() {
                continue;
            }
            inner.status = Status::cancelled();
            // Nothing to cancel if the exec rpc was never sent.
            if !inner.initiated {
                continue;
            }
            if inner.done {
                continue;
            }

            let mut client = match self.exec_env.client_cache().get_client(&state.hostport) {
                Ok(client) => client,
                Err(_) => continue,
            };
            let params = CancelPlanFragmentParams {
                fragment_instance_id: state.fragment_instance_id,
            };
            debug!(
                instance_id = %state.fragment_instance_id,
                backend = %state.hostport,
                "sending CancelPlanFragment rpc"
            );
            let mut result = client.cancel_plan_fragment(&params);
            if matches!(result, Err(RpcError::Transport(_))) {
                debug!(backend = %state.hostport, "retrying CancelPlanFragment");
                match self.exec_env.client_cache().reopen_client(&mut client) {
                    Ok(()) => result = client.cancel_plan_fragment(&params),
                    Err(status) => {
                        inner.status.add_status(&status);
                        continue;
                    }
                }
            }
            match result {
                Err(e) => {
                    inner.status.add_error_msg(format!(
                        "CancelPlanFragment rpc query_id={} instance_id={} failed: {}",
                        info.query_id, state.fragment_instance_id, e
                    ));
                    continue;
                }
                Ok(result) => {
                    if !result.status.is_ok() {
                        inner.status.add_status(&result.status);
                    }
                }
            }
        }

        self.backend_completion_cv.notify_all();
        self.report_query_summary();
    }

    fn finalize_query(&self, info: &QueryExecInfo) -> Result<(), Status> {
        debug_assert!(self.has_called_wait.load(Ordering::SeqCst));
        let Some(finalize_params) = &info.finalize_params else {
            return Ok(());
        };
        let (files_to_move, partition_row_counts) = {
            let shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            (
                shared.files_to_move.clone(),
                shared.partition_row_counts.clone(),
            )
        };
        if let Err(e) = finalize_insert(
            self.exec_env.fs(),
            finalize_params,
            &partition_row_counts,
            &files_to_move,
        ) {
            let status = self.update_status(e, None);
            return Err(status);
        }
        Ok(())
    }

    pub fn get_status(&self) -> Status {
        self.lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .query_status
            .clone()
    }

    pub fn query_state(&self) -> QueryState {
        self.lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .query_state
    }

    /// All error output: the root fragment's log first, then each
    /// backend's log prefixed with its ordinal.
    pub fn get_error_log(&self) -> String {
        let mut out = String::new();
        let _shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(info) = self.exec_info.get() else {
            return out;
        };
        if let Some(executor) = &info.executor {
            let log = executor.error_log();
            if !log.is_empty() {
                out.push_str(&log.join("\n"));
                out.push('\n');
            }
        }
        for state in &info.backend_states {
            let inner = state.lock.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.error_log.is_empty() {
                out.push_str(&format!(
                    "Backend {}:{}\n",
                    state.backend_num,
                    inner.error_log.join("\n")
                ));
            }
        }
        out
    }

    /// Fill in the partitions an INSERT touched. Returns false when there
    /// is nothing to update.
    pub fn prepare_catalog_update(&self, update: &mut CatalogUpdate) -> bool {
        debug_assert!(
            self.has_called_wait.load(Ordering::SeqCst),
            "catalog update before wait"
        );
        let shared = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        for partition in shared.partition_row_counts.keys() {
            update.created_partitions.insert(partition.clone());
        }
        !update.created_partitions.is_empty()
    }

    pub fn query_profile(&self) -> Option<RuntimeProfile> {
        self.exec_info.get().map(|info| info.query_profile.clone())
    }

    /// Rows appended per partition, merged across all reporting sinks.
    /// Meaningful once the query has drained.
    pub fn partition_row_counts(&self) -> BTreeMap<String, i64> {
        self.lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .partition_row_counts
            .clone()
    }

    pub fn fragment_exec_params(&self) -> Option<&[FragmentExecParams]> {
        self.exec_info
            .get()
            .map(|info| info.fragment_exec_params.as_slice())
    }

    pub fn progress(&self) -> Option<&ProgressUpdater> {
        self.exec_info.get().map(|info| &info.progress)
    }

    pub fn num_remaining_backends(&self) -> usize {
        self.lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .num_remaining_backends
    }

    /// Number of remote fragment instances started by `exec`.
    pub fn num_backends(&self) -> usize {
        self.exec_info
            .get()
            .map(|info| info.num_backends)
            .unwrap_or(0)
    }

    /// Per-fragment byte-split summary, recorded once dispatch finished.
    fn print_backend_info(&self, info: &QueryExecInfo) {
        for state in &info.backend_states {
            let data = &info.fragment_profiles[state.fragment_idx];
            data.bytes_assigned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update(state.total_split_size as f64);
        }
        let first = usize::from(info.executor.is_some());
        for (i, data) in info.fragment_profiles.iter().enumerate().skip(first) {
            let stats = data
                .bytes_assigned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if stats.count() == 0 {
                continue;
            }
            let label = format!(
                "min: {}, max: {}, avg: {}, stddev: {}",
                format_bytes(stats.min()),
                format_bytes(stats.max()),
                format_bytes(stats.mean()),
                format_bytes(stats.stddev())
            );
            debug!(fragment = i, split_sizes = %label, "byte split for fragment");
            data.averaged_profile.add_info_string("split sizes", label);
        }
    }

    /// Attach per-fragment summaries to the query profile: averaged
    /// instance profiles plus completion-time and rate statistics. Runs
    /// once, after the query quiesced (normally or via cancellation).
    fn report_query_summary(&self) {
        if !self.has_called_wait.load(Ordering::SeqCst) {
            // The query made so little progress that a summary would be
            // mostly uninitialized state.
            return;
        }
        if self.summary_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(info) = self.exec_info.get() else {
            return;
        };

        for state in &info.backend_states {
            let completion_ms = {
                let inner = state.lock.lock().unwrap_or_else(|e| e.into_inner());
                inner.stopwatch.elapsed().as_secs_f64() * 1000.0
            };
            let data = &info.fragment_profiles[state.fragment_idx];
            data.completion_times
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update(completion_ms);
            if completion_ms > 0.0 {
                data.rates
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .update(state.total_split_size as f64 / (completion_ms / 1000.0));
            }
            data.averaged_profile.merge(&state.profile);
            data.root_profile.add_child(state.profile.clone());
        }

        let first = usize::from(info.executor.is_some());
        for data in info.fragment_profiles.iter().skip(first) {
            if data.num_instances > 0 {
                data.averaged_profile.divide(data.num_instances);
            }
            let times = data
                .completion_times
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let rates = data.rates.lock().unwrap_or_else(|e| e.into_inner()).clone();
            data.averaged_profile.add_info_string(
                "completion times",
                format!(
                    "min:{}  max:{}  mean:{}  stddev:{}",
                    format_time_ms(times.min()),
                    format_time_ms(times.max()),
                    format_time_ms(times.mean()),
                    format_time_ms(times.stddev())
                ),
            );
            data.averaged_profile.add_info_string(
                "execution rates",
                format!(
                    "min:{}/sec  max:{}/sec  mean:{}/sec  stddev:{}/sec",
                    format_bytes(rates.min()),
                    format_bytes(rates.max()),
                    format_bytes(rates.mean()),
                    format_bytes(rates.stddev())
                ),
            );
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                query_id = %info.query_id,
                profile = %info.query_profile.pretty_print(),
                "final query profile"
            );
        }
    }
}

/// Assemble the exec RPC payload for one fragment instance.
#[allow(clippy::too_many_arguments)]
fn set_exec_plan_fragment_params(
    request: &QueryExecRequest,
    query_id: UniqueId,
    backend_num: usize,
    fragment_idx: usize,
    params: &FragmentExecParams,
    instance_idx: usize,
    scan_range_assignment: &[FragmentScanRangeAssignment],
    coord: &HostPort,
    options: &QueryOptions,
) -> ExecPlanFragmentParams {
    let exec_host = &params.hosts[instance_idx];
    let per_node_scan_ranges = scan_range_assignment[fragment_idx]
        .get(exec_host)
        .cloned()
        .unwrap_or_default();
    ExecPlanFragmentParams {
        fragment: request.fragments[fragment_idx].clone(),
        params: PlanFragmentInstanceParams {
            query_id,
            fragment_instance_id: params.instance_ids[instance_idx],
            per_node_scan_ranges,
            per_exch_num_senders: params.per_exch_num_senders.clone(),
            destinations: params.destinations.clone(),
        },
        coord: coord.clone(),
        backend_num,
        query_options: options.clone(),
    }
}

/// Cache the scan-node counter handles out of an instance profile. Only
/// profile nodes whose metadata names a plan node participate.
fn collect_scan_node_counters(
    profile: &RuntimeProfile,
    counters: &mut FragmentInstanceCounters,
) {
    for child in profile.all_children() {
        let Some(node_id) = PlanNodeId::from_metadata(child.metadata()) else {
            continue;
        };
        if let Some(counter) = child.get_counter(TOTAL_THROUGHPUT_COUNTER) {
            counters.throughput.insert(node_id, counter);
        }
        if let Some(counter) = child.get_counter(SCAN_RANGES_COMPLETE_COUNTER) {
            counters.scan_ranges_complete.insert(node_id, counter);
        }
    }
}

/// Publish, per scan node, query-wide throughput and completed-range
/// counters that sum over every backend plus the coordinator's own
/// fragment.
fn create_aggregate_counters(
    aggregate_profile: &RuntimeProfile,
    request: &QueryExecRequest,
    backend_states: &[Arc<BackendExecState>],
    coordinator_counters: &FragmentInstanceCounters,
) {
    for fragment in &request.fragments {
        for node in &fragment.plan {
            if !node.node_type.is_scan() {
                continue;
            }
            let node_id = node.node_id;

            let states: Vec<Arc<BackendExecState>> = backend_states.to_vec();
            let coord_counter = coordinator_counters.throughput.get(&node_id).cloned();
            aggregate_profile.add_derived_counter(
                format!("{:?} (id={}) Throughput", node.node_type, node_id),
                CounterUnit::BytesPerSecond,
                Box::new(move || {
                    let mut value: i64 =
                        states.iter().map(|s| s.node_throughput(node_id)).sum();
                    if let Some(counter) = &coord_counter {
                        value += counter.value();
                    }
                    value
                }),
            );

            let states: Vec<Arc<BackendExecState>> = backend_states.to_vec();
            let coord_counter = coordinator_counters
                .scan_ranges_complete
                .get(&node_id)
                .cloned();
            aggregate_profile.add_derived_counter(
                format!("{:?} (id={}) CompletedScanRanges", node.node_type, node_id),
                CounterUnit::Unit,
                Box::new(move || {
                    let mut value: i64 = states
                        .iter()
                        .map(|s| s.num_scan_ranges_completed(node_id))
                        .sum();
                    if let Some(counter) = &coord_counter {
                        value += counter.value();
                    }
                    value
                }),
            );
        }
    }
}
