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

//! Immutable request model handed to the coordinator by the frontend
//! planner: the fragment DAG, per-node scan ranges and INSERT finalization
//! parameters. The coordinator never mutates any of this.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::ids::PlanNodeId;
use crate::common::types::HostPort;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PlanNodeType {
    HdfsScan,
    KvScan,
    Exchange,
    Aggregate,
    HashJoin,
    Sort,
}

impl PlanNodeType {
    pub fn is_scan(self) -> bool {
        matches!(self, PlanNodeType::HdfsScan | PlanNodeType::KvScan)
    }
}

/// One node of a fragment's pre-order plan list. `num_children == 0` marks
/// a leaf; the first leaf in list order is the fragment's leftmost node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanNode {
    pub node_id: PlanNodeId,
    pub node_type: PlanNodeType,
    pub num_children: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PartitionType {
    Unpartitioned,
    HashPartitioned,
    RandomPartitioned,
}

/// Rows stream to the exchange node `dest_node_id` in a downstream
/// fragment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataStreamSink {
    pub dest_node_id: PlanNodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OutputSink {
    Stream(DataStreamSink),
    Table,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanFragment {
    /// Pre-order list of plan nodes.
    pub plan: Vec<PlanNode>,
    pub partition: PartitionType,
    pub output_sink: Option<OutputSink>,
}

impl PlanFragment {
    pub fn stream_sink(&self) -> Option<&DataStreamSink> {
        match &self.output_sink {
            Some(OutputSink::Stream(sink)) => Some(sink),
            _ => None,
        }
    }
}

/// A byte range of a distributed-filesystem file, or an opaque KV range.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ScanRange {
    HdfsFileSplit {
        path: String,
        offset: i64,
        length: i64,
    },
    KvRange {
        start_key: Vec<u8>,
        stop_key: Vec<u8>,
    },
}

impl ScanRange {
    /// Byte size used for load balancing; KV ranges have no known size.
    pub fn length(&self) -> i64 {
        match self {
            ScanRange::HdfsFileSplit { length, .. } => *length,
            ScanRange::KvRange { .. } => 0,
        }
    }
}

/// One replica of a scan range: the data host advertising it plus the disk
/// volume it lives on there.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRangeLocation {
    pub server: HostPort,
    pub volume_id: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRangeLocations {
    pub scan_range: ScanRange,
    pub locations: Vec<ScanRangeLocation>,
}

/// Filesystem work required to finalize an INSERT against the target
/// table once all fragments have finished.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeParams {
    pub is_overwrite: bool,
    /// Root directory of the target table.
    pub base_dir: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub batch_size: usize,
    pub query_timeout_secs: u64,
}

/// The full execution request for one query, produced by the planner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryExecRequest {
    /// Fragment 0 is the root; producers have higher indices than their
    /// consumers.
    pub fragments: Vec<PlanFragment>,
    /// `dest_fragment_idx[i - 1]` is the consumer of fragment `i`'s stream
    /// sink. The root fragment has no entry.
    pub dest_fragment_idx: Vec<usize>,
    /// Scan ranges to read, keyed by the scan node that reads them.
    pub per_node_scan_ranges: HashMap<PlanNodeId, Vec<ScanRangeLocations>>,
    pub finalize_params: Option<FinalizeParams>,
}

impl QueryExecRequest {
    pub fn needs_finalization(&self) -> bool {
        self.finalize_params.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_range_length_is_zero_for_kv_ranges() {
        let split = ScanRange::HdfsFileSplit {
            path: "/t/f0".to_string(),
            offset: 0,
            length: 100,
        };
        assert_eq!(split.length(), 100);
        let kv = ScanRange::KvRange {
            start_key: vec![0x01],
            stop_key: vec![0xff],
        };
        assert_eq!(kv.length(), 0);
    }

    #[test]
    fn stream_sink_only_for_stream_variant() {
        let fragment = PlanFragment {
            plan: Vec::new(),
            partition: PartitionType::HashPartitioned,
            output_sink: Some(OutputSink::Table),
        };
        assert!(fragment.stream_sink().is_none());
    }
}
