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

//! In-process fakes for coordinator tests: a recording RPC fabric, a
//! scripted root executor and a mapping scheduler.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use novacoord::common::ids::PlanNodeId;
use novacoord::exec::{
    ExecutorFactory, PlanFragmentExecutor, RowBatch, SCAN_RANGES_COMPLETE_COUNTER,
    TOTAL_THROUGHPUT_COUNTER,
};
use novacoord::plan::{
    DataStreamSink, FinalizeParams, OutputSink, PartitionType, PlanFragment, PlanNode,
    PlanNodeType, QueryExecRequest, ScanRange, ScanRangeLocation, ScanRangeLocations,
};
use novacoord::runtime::profile::{CounterUnit, ProfileTree, RuntimeProfile};
use novacoord::scheduler::Scheduler;
use novacoord::service::client_cache::{ClientFactory, InternalServiceClient, RpcError};
use novacoord::service::messages::{
    CancelPlanFragmentParams, CancelPlanFragmentResult, ExecPlanFragmentParams,
    ExecPlanFragmentResult, InsertExecStatus,
};
use novacoord::{HostPort, Status, UniqueId};

pub const COORD_HOST: &str = "coord";
pub const COORD_PORT: u16 = 9060;
pub const WORKER_PORT: u16 = 9060;

pub fn coord_address() -> HostPort {
    HostPort::new(COORD_HOST, COORD_PORT)
}

#[derive(Clone, Debug)]
pub enum RpcEvent {
    ExecAttempt {
        host: HostPort,
    },
    Exec {
        host: HostPort,
        params: Box<ExecPlanFragmentParams>,
    },
    Cancel {
        host: HostPort,
        instance_id: UniqueId,
    },
}

#[derive(Default)]
struct FabricState {
    events: Vec<RpcEvent>,
    /// Remaining transport failures to inject, per backend address.
    transport_failures: HashMap<HostPort, usize>,
    /// Non-OK exec result status per backend address.
    exec_statuses: HashMap<HostPort, Status>,
}

/// Shared state of the fake RPC fabric; clients created by the factory
/// all record into it.
#[derive(Default)]
pub struct RpcFabric {
    state: Mutex<FabricState>,
}

impl RpcFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_exec_transport(&self, host: &HostPort, times: usize) {
        self.state
            .lock()
            .expect("fabric lock")
            .transport_failures
            .insert(host.clone(), times);
    }

    pub fn set_exec_status(&self, host: &HostPort, status: Status) {
        self.state
            .lock()
            .expect("fabric lock")
            .exec_statuses
            .insert(host.clone(), status);
    }

    pub fn events(&self) -> Vec<RpcEvent> {
        self.state.lock().expect("fabric lock").events.clone()
    }

    pub fn exec_params_for(&self, host: &HostPort) -> Vec<ExecPlanFragmentParams> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RpcEvent::Exec { host: h, params } if &h == host => Some(*params),
                _ => None,
            })
            .collect()
    }

    pub fn exec_attempts_for(&self, host: &HostPort) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, RpcEvent::ExecAttempt { host: h } if h == host))
            .count()
    }

    pub fn cancelled_hosts(&self) -> Vec<HostPort> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RpcEvent::Cancel { host, .. } => Some(host),
                _ => None,
            })
            .collect()
    }
}

struct FabricClient {
    host: HostPort,
    fabric: Arc<RpcFabric>,
}

impl InternalServiceClient for FabricClient {
    fn exec_plan_fragment(
        &mut self,
        params: &ExecPlanFragmentParams,
    ) -> Result<ExecPlanFragmentResult, RpcError> {
        let mut state = self.fabric.state.lock().expect("fabric lock");
        state.events.push(RpcEvent::ExecAttempt {
            host: self.host.clone(),
        });
        if let Some(remaining) = state.transport_failures.get_mut(&self.host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RpcError::Transport("connection reset by peer".to_string()));
            }
        }
        state.events.push(RpcEvent::Exec {
            host: self.host.clone(),
            params: Box::new(params.clone()),
        });
        let status = state
            .exec_statuses
            .get(&self.host)
            .cloned()
            .unwrap_or_else(Status::ok);
        Ok(ExecPlanFragmentResult { status })
    }

    fn cancel_plan_fragment(
        &mut self,
        params: &CancelPlanFragmentParams,
    ) -> Result<CancelPlanFragmentResult, RpcError> {
        let mut state = self.fabric.state.lock().expect("fabric lock");
        state.events.push(RpcEvent::Cancel {
            host: self.host.clone(),
            instance_id: params.fragment_instance_id,
        });
        Ok(CancelPlanFragmentResult {
            status: Status::ok(),
        })
    }
}

pub struct FabricClientFactory {
    fabric: Arc<RpcFabric>,
}

impl FabricClientFactory {
    pub fn new(fabric: Arc<RpcFabric>) -> Box<Self> {
        Box::new(Self { fabric })
    }
}

impl ClientFactory for FabricClientFactory {
    fn create(&self, addr: &HostPort) -> Result<Box<dyn InternalServiceClient>, Status> {
        Ok(Box::new(FabricClient {
            host: addr.clone(),
            fabric: Arc::clone(&self.fabric),
        }))
    }
}

/// Scheduler backed by an explicit data-host to exec-host map; unmapped
/// hosts pass through with the worker port.
pub struct MapScheduler {
    map: HashMap<HostPort, HostPort>,
}

impl MapScheduler {
    pub fn new(map: HashMap<HostPort, HostPort>) -> Arc<Self> {
        Arc::new(Self { map })
    }

    pub fn identity() -> Arc<Self> {
        Arc::new(Self {
            map: HashMap::new(),
        })
    }
}

impl Scheduler for MapScheduler {
    fn get_hosts(&self, data_hosts: &[HostPort]) -> Result<Vec<HostPort>, Status> {
        Ok(data_hosts
            .iter()
            .map(|h| {
                self.map
                    .get(h)
                    .cloned()
                    .unwrap_or_else(|| HostPort::new(h.hostname.clone(), WORKER_PORT))
            })
            .collect())
    }
}

/// Root executor with a scripted batch sequence. `get_next` fails once
/// the executor has been cancelled, the way a real executor surfaces an
/// async cancel.
pub struct ScriptedExecutor {
    batches: Mutex<VecDeque<usize>>,
    open_error: Mutex<Option<Status>>,
    insert_status: Mutex<InsertExecStatus>,
    error_log: Mutex<Vec<String>>,
    profile: RuntimeProfile,
    prepared_params: Mutex<Option<ExecPlanFragmentParams>>,
    opened: AtomicBool,
    cancelled: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new(batches: Vec<usize>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into_iter().collect()),
            open_error: Mutex::new(None),
            insert_status: Mutex::new(InsertExecStatus::default()),
            error_log: Mutex::new(Vec::new()),
            profile: RuntimeProfile::new("Root Instance"),
            prepared_params: Mutex::new(None),
            opened: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn set_open_error(&self, status: Status) {
        *self.open_error.lock().expect("executor lock") = Some(status);
    }

    pub fn set_insert_status(&self, status: InsertExecStatus) {
        *self.insert_status.lock().expect("executor lock") = status;
    }

    pub fn set_error_log(&self, log: Vec<String>) {
        *self.error_log.lock().expect("executor lock") = log;
    }

    pub fn prepared_params(&self) -> Option<ExecPlanFragmentParams> {
        self.prepared_params.lock().expect("executor lock").clone()
    }

    pub fn was_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl PlanFragmentExecutor for ScriptedExecutor {
    fn prepare(&self, params: &ExecPlanFragmentParams) -> Result<(), Status> {
        *self.prepared_params.lock().expect("executor lock") = Some(params.clone());
        Ok(())
    }

    fn open(&self) -> Result<(), Status> {
        self.opened.store(true, Ordering::SeqCst);
        match self.open_error.lock().expect("executor lock").clone() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn get_next(&self) -> Result<Option<RowBatch>, Status> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Status::cancelled());
        }
        Ok(self
            .batches
            .lock()
            .expect("executor lock")
            .pop_front()
            .map(|num_rows| RowBatch { num_rows }))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn profile(&self) -> RuntimeProfile {
        self.profile.clone()
    }

    fn insert_exec_status(&self) -> InsertExecStatus {
        self.insert_status.lock().expect("executor lock").clone()
    }

    fn error_log(&self) -> Vec<String> {
        self.error_log.lock().expect("executor lock").clone()
    }
}

pub struct ScriptedExecutorFactory {
    executor: Arc<ScriptedExecutor>,
}

impl ScriptedExecutorFactory {
    pub fn new(executor: Arc<ScriptedExecutor>) -> Arc<Self> {
        Arc::new(Self { executor })
    }
}

impl ExecutorFactory for ScriptedExecutorFactory {
    fn create(&self) -> Arc<dyn PlanFragmentExecutor> {
        Arc::clone(&self.executor) as Arc<dyn PlanFragmentExecutor>
    }
}

pub fn scan_node(id: i32) -> PlanNode {
    PlanNode {
        node_id: PlanNodeId::new(id),
        node_type: PlanNodeType::HdfsScan,
        num_children: 0,
    }
}

pub fn exchange_node(id: i32) -> PlanNode {
    PlanNode {
        node_id: PlanNodeId::new(id),
        node_type: PlanNodeType::Exchange,
        num_children: 0,
    }
}

pub fn hdfs_split(path: &str, length: i64, replicas: &[&str]) -> ScanRangeLocations {
    ScanRangeLocations {
        scan_range: ScanRange::HdfsFileSplit {
            path: path.to_string(),
            offset: 0,
            length,
        },
        locations: replicas
            .iter()
            .map(|host| ScanRangeLocation {
                server: HostPort::new(*host, 50010),
                volume_id: 0,
            })
            .collect(),
    }
}

/// One unpartitioned fragment scanning `ranges`; runs entirely on the
/// coordinator.
pub fn single_fragment_request(ranges: Vec<ScanRangeLocations>) -> QueryExecRequest {
    QueryExecRequest {
        fragments: vec![PlanFragment {
            plan: vec![scan_node(0)],
            partition: PartitionType::Unpartitioned,
            output_sink: None,
        }],
        dest_fragment_idx: vec![],
        per_node_scan_ranges: HashMap::from([(PlanNodeId::new(0), ranges)]),
        finalize_params: None,
    }
}

/// Unpartitioned root with exchange id 5 over a partitioned HDFS scan
/// fragment.
pub fn two_fragment_request(ranges: Vec<ScanRangeLocations>) -> QueryExecRequest {
    QueryExecRequest {
        fragments: vec![
            PlanFragment {
                plan: vec![exchange_node(5)],
                partition: PartitionType::Unpartitioned,
                output_sink: None,
            },
            PlanFragment {
                plan: vec![scan_node(0)],
                partition: PartitionType::HashPartitioned,
                output_sink: Some(OutputSink::Stream(DataStreamSink {
                    dest_node_id: PlanNodeId::new(5),
                })),
            },
        ],
        dest_fragment_idx: vec![0],
        per_node_scan_ranges: HashMap::from([(PlanNodeId::new(0), ranges)]),
        finalize_params: None,
    }
}

/// Single partitioned INSERT fragment with a table sink; no coordinator
/// fragment, so all side effects come from remote workers.
pub fn insert_request(
    ranges: Vec<ScanRangeLocations>,
    finalize_params: FinalizeParams,
) -> QueryExecRequest {
    QueryExecRequest {
        fragments: vec![PlanFragment {
            plan: vec![scan_node(0)],
            partition: PartitionType::HashPartitioned,
            output_sink: Some(OutputSink::Table),
        }],
        dest_fragment_idx: vec![],
        per_node_scan_ranges: HashMap::from([(PlanNodeId::new(0), ranges)]),
        finalize_params: Some(finalize_params),
    }
}

/// A cumulative instance profile tree with one scan node's counters, the
/// shape a worker reports.
pub fn instance_profile_tree(node_id: i32, ranges_complete: i64, throughput: i64) -> ProfileTree {
    let root = RuntimeProfile::new("Instance");
    let scan = root.child(format!("HDFS_SCAN (id={node_id})"));
    scan.set_metadata(node_id as i64);
    scan.add_counter(SCAN_RANGES_COMPLETE_COUNTER, CounterUnit::Unit)
        .set(ranges_complete);
    scan.add_counter(TOTAL_THROUGHPUT_COUNTER, CounterUnit::BytesPerSecond)
        .set(throughput);
    root.to_tree()
}
