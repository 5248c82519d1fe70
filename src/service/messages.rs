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

//! Wire contract between the coordinator and backend workers. The
//! transport encodes these with serde; the coordinator never sees the
//! encoding.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::common::ids::PlanNodeId;
use crate::common::status::Status;
use crate::common::types::{HostPort, UniqueId};
use crate::plan::{PlanFragment, QueryOptions, ScanRange};
use crate::runtime::profile::ProfileTree;

/// One scan range handed to a scan node instance, with the volume hint of
/// the chosen replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRangeParams {
    pub scan_range: ScanRange,
    pub volume_id: i32,
}

pub type PerNodeScanRanges = HashMap<PlanNodeId, Vec<ScanRangeParams>>;

/// Where one sender instance pushes its rows: a single instance of the
/// destination fragment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanFragmentDestination {
    pub fragment_instance_id: UniqueId,
    pub server: HostPort,
}

/// Per-instance execution parameters inside an exec request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanFragmentInstanceParams {
    pub query_id: UniqueId,
    pub fragment_instance_id: UniqueId,
    pub per_node_scan_ranges: PerNodeScanRanges,
    /// Sender count per exchange node in this fragment, for stream
    /// receiver setup.
    pub per_exch_num_senders: HashMap<PlanNodeId, usize>,
    pub destinations: Vec<PlanFragmentDestination>,
}

/// Full payload of the `ExecPlanFragment` RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecPlanFragmentParams {
    pub fragment: PlanFragment,
    pub params: PlanFragmentInstanceParams,
    /// Address status reports go back to.
    pub coord: HostPort,
    pub backend_num: usize,
    pub query_options: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecPlanFragmentResult {
    pub status: Status,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelPlanFragmentParams {
    pub fragment_instance_id: UniqueId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelPlanFragmentResult {
    pub status: Status,
}

/// INSERT side effects reported by a worker whose fragment carries a table
/// sink: rows appended per partition key, and staged files keyed by source
/// path. An empty destination means "delete this staging path during
/// finalization".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InsertExecStatus {
    pub num_appended_rows: BTreeMap<String, i64>,
    pub files_to_move: BTreeMap<String, String>,
}

/// Payload of the `ReportExecStatus` RPC a worker sends to the
/// coordinator. `profile` is cumulative, not a delta.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportExecStatusParams {
    pub backend_num: usize,
    pub fragment_instance_id: UniqueId,
    pub status: Status,
    pub done: bool,
    pub profile: ProfileTree,
    pub error_log: Vec<String>,
    pub insert_exec_status: Option<InsertExecStatus>,
}
