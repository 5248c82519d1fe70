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

//! Derivation of per-fragment execution parameters from a plan: host
//! assignment, instance ids, exchange sender counts and locality-aware
//! scan-range assignment.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::common::ids::PlanNodeId;
use crate::common::status::Status;
use crate::common::types::{HostPort, UniqueId};
use crate::plan::{PlanNode, PlanNodeType, QueryExecRequest, ScanRangeLocations};
use crate::scheduler::Scheduler;
use crate::service::messages::{
    PerNodeScanRanges, PlanFragmentDestination, ScanRangeParams,
};

/// Execution parameters for one fragment: where it runs, the ids of its
/// instances, and how its output is wired to its consumer.
#[derive(Clone, Debug, Default)]
pub struct FragmentExecParams {
    pub hosts: Vec<HostPort>,
    /// Parallel to `hosts`.
    pub instance_ids: Vec<UniqueId>,
    /// Sender count per exchange node in this fragment.
    pub per_exch_num_senders: HashMap<PlanNodeId, usize>,
    /// One destination per instance of the consumer fragment.
    pub destinations: Vec<PlanFragmentDestination>,
    /// Data host to exec host, as chosen by the scheduler for this
    /// fragment's leftmost scan.
    pub data_server_map: HashMap<HostPort, HostPort>,
}

/// Scan ranges grouped by the exec host that reads them, then by scan
/// node.
pub type FragmentScanRangeAssignment = HashMap<HostPort, PerNodeScanRanges>;

const SCAN_NODE_TYPES: [PlanNodeType; 2] = [PlanNodeType::HdfsScan, PlanNodeType::KvScan];

/// Compute hosts, instance ids, sender counts and destinations for every
/// fragment. Returns the params plus the number of remote backends (the
/// coordinator-run root, if any, is excluded from the count).
pub fn compute_fragment_exec_params(
    request: &QueryExecRequest,
    query_id: UniqueId,
    coord: &HostPort,
    scheduler: &dyn Scheduler,
) -> Result<(Vec<FragmentExecParams>, usize), Status> {
    let mut params: Vec<FragmentExecParams> =
        vec![FragmentExecParams::default(); request.fragments.len()];
    compute_fragment_hosts(request, coord, scheduler, &mut params)?;

    // Assign globally-unique instance ids by offsetting the query id's low
    // word with the instance's backend ordinal.
    let mut num_backends = 0usize;
    for fragment_params in params.iter_mut() {
        for j in 0..fragment_params.hosts.len() {
            let instance_num = num_backends + j;
            let offset = i64::try_from(instance_num)
                .ok()
                .and_then(|n| n.checked_add(1))
                .and_then(|n| query_id.lo.checked_add(n));
            let Some(lo) = offset else {
                return Err(Status::internal_error(format!(
                    "instance id overflow: query_id={query_id} instance_num={instance_num}"
                )));
            };
            fragment_params
                .instance_ids
                .push(UniqueId::new(query_id.hi, lo));
        }
        num_backends += fragment_params.hosts.len();
    }
    if request.fragments[0].partition == crate::plan::PartitionType::Unpartitioned {
        // The root runs in-process and is not a remote backend.
        num_backends -= 1;
    }

    // Wire each non-root fragment's stream sink to its consumer: count
    // senders per exchange node and give every sender instance the full
    // list of receiver instances.
    for i in 1..params.len() {
        let dest_fragment_idx = *request.dest_fragment_idx.get(i - 1).ok_or_else(|| {
            Status::internal_error(format!("missing destination for fragment {i}"))
        })?;
        if dest_fragment_idx >= params.len() {
            return Err(Status::internal_error(format!(
                "destination fragment index {dest_fragment_idx} out of range for fragment {i}"
            )));
        }
        let sink = request.fragments[i].stream_sink().ok_or_else(|| {
            Status::internal_error(format!("fragment {i} has no stream sink"))
        })?;
        let exch_id = sink.dest_node_id;
        let num_senders = params[i].hosts.len();

        // Multiple fragments may sink into the same exchange (distributed
        // merge), so sender counts add up.
        let dest_params = &mut params[dest_fragment_idx];
        *dest_params.per_exch_num_senders.entry(exch_id).or_insert(0) += num_senders;
        let destinations: Vec<PlanFragmentDestination> = dest_params
            .hosts
            .iter()
            .zip(dest_params.instance_ids.iter())
            .map(|(server, instance_id)| PlanFragmentDestination {
                fragment_instance_id: *instance_id,
                server: server.clone(),
            })
            .collect();
        for dest in &destinations {
            debug!(
                fragment = i,
                instance_id = %dest.fragment_instance_id,
                server = %dest.server,
                "fragment destination"
            );
        }
        params[i].destinations = destinations;
    }

    Ok((params, num_backends))
}

/// Choose the hosts every fragment runs on, producers before consumers so
/// a consumer can inherit its input's host list.
fn compute_fragment_hosts(
    request: &QueryExecRequest,
    coord: &HostPort,
    scheduler: &dyn Scheduler,
    params: &mut [FragmentExecParams],
) -> Result<(), Status> {
    for i in (0..request.fragments.len()).rev() {
        let fragment = &request.fragments[i];
        if fragment.partition == crate::plan::PartitionType::Unpartitioned {
            // Single-node fragments run on the coordinator host.
            params[i].hosts.push(coord.clone());
            continue;
        }

        let Some(leftmost_scan_id) = find_leftmost_node(&fragment.plan, &SCAN_NODE_TYPES) else {
            // No leftmost scan: run on the hosts of the leftmost input
            // fragment so a partitioned aggregation sits on the hosts that
            // produce its input.
            let Some(input_fragment_idx) = find_leftmost_input_fragment(i, request) else {
                return Err(Status::internal_error(format!(
                    "fragment {i} has neither a scan nor an input fragment"
                )));
            };
            params[i].hosts = params[input_fragment_idx].hosts.clone();
            continue;
        };

        let scan_ranges = request.per_node_scan_ranges.get(&leftmost_scan_id);
        let Some(scan_ranges) = scan_ranges.filter(|ranges| !ranges.is_empty()) else {
            // Nothing to scan; run on the coordinator.
            params[i].hosts.push(coord.clone());
            continue;
        };

        // Unique data hosts across all replica locations, in first-seen
        // order so scheduler results are deterministic.
        let mut seen: HashSet<&HostPort> = HashSet::new();
        let mut data_hosts: Vec<HostPort> = Vec::new();
        for locations in scan_ranges {
            for location in &locations.locations {
                if seen.insert(&location.server) {
                    data_hosts.push(location.server.clone());
                }
            }
        }

        let exec_hosts = scheduler.get_hosts(&data_hosts)?;
        if exec_hosts.len() != data_hosts.len() {
            return Err(Status::internal_error(format!(
                "scheduler returned {} hosts for {} data hosts",
                exec_hosts.len(),
                data_hosts.len()
            )));
        }
        for (data_host, exec_host) in data_hosts.iter().zip(exec_hosts.iter()) {
            params[i]
                .data_server_map
                .insert(data_host.clone(), exec_host.clone());
        }

        let mut hosts = exec_hosts;
        hosts.sort();
        hosts.dedup();
        params[i].hosts = hosts;
    }
    Ok(())
}

/// First node in the pre-order list with no children, if its type is one
/// of `types`.
pub fn find_leftmost_node(plan: &[PlanNode], types: &[PlanNodeType]) -> Option<PlanNodeId> {
    let node = plan.iter().find(|node| node.num_children == 0)?;
    types
        .contains(&node.node_type)
        .then_some(node.node_id)
}

/// The fragment that sinks into `fragment_idx`'s leftmost exchange node.
fn find_leftmost_input_fragment(
    fragment_idx: usize,
    request: &QueryExecRequest,
) -> Option<usize> {
    let exch_id = find_leftmost_node(
        &request.fragments[fragment_idx].plan,
        &[PlanNodeType::Exchange],
    )?;
    for (i, dest_idx) in request.dest_fragment_idx.iter().enumerate() {
        if *dest_idx != fragment_idx {
            continue;
        }
        let input_fragment = &request.fragments[i + 1];
        if let Some(sink) = input_fragment.stream_sink() {
            if sink.dest_node_id == exch_id {
                return Some(i + 1);
            }
        }
    }
    None
}

/// Compute the scan-range assignment for every fragment. Returns one
/// assignment per fragment (parallel to `request.fragments`) plus the
/// total number of scan ranges.
pub fn compute_scan_range_assignment(
    request: &QueryExecRequest,
    params: &[FragmentExecParams],
) -> Result<(Vec<FragmentScanRangeAssignment>, usize), Status> {
    let mut node_to_fragment: HashMap<PlanNodeId, usize> = HashMap::new();
    for (i, fragment) in request.fragments.iter().enumerate() {
        for node in &fragment.plan {
            node_to_fragment.insert(node.node_id, i);
        }
    }

    let mut assignments: Vec<FragmentScanRangeAssignment> =
        vec![FragmentScanRangeAssignment::new(); request.fragments.len()];
    let mut num_scan_ranges = 0usize;
    for (node_id, locations) in &request.per_node_scan_ranges {
        let fragment_idx = *node_to_fragment.get(node_id).ok_or_else(|| {
            Status::internal_error(format!("scan ranges reference unknown node {node_id}"))
        })?;
        compute_node_scan_range_assignment(
            *node_id,
            locations,
            &params[fragment_idx],
            &mut assignments[fragment_idx],
        )?;
        num_scan_ranges += locations.len();
    }
    Ok((assignments, num_scan_ranges))
}

/// Assign one scan node's ranges to exec hosts: each range goes to the
/// replica whose data host has the fewest bytes assigned so far (ties
/// break in input order), then the data host is translated to its exec
/// host.
fn compute_node_scan_range_assignment(
    node_id: PlanNodeId,
    locations: &[ScanRangeLocations],
    params: &FragmentExecParams,
    assignment: &mut FragmentScanRangeAssignment,
) -> Result<(), Status> {
    let mut assigned_bytes_per_host: HashMap<HostPort, i64> = HashMap::new();
    for scan_range_locations in locations {
        let mut min_assigned_bytes = i64::MAX;
        let mut chosen: Option<&crate::plan::ScanRangeLocation> = None;
        for location in &scan_range_locations.locations {
            let assigned_bytes = *assigned_bytes_per_host
                .entry(location.server.clone())
                .or_insert(0);
            if assigned_bytes < min_assigned_bytes {
                min_assigned_bytes = assigned_bytes;
                chosen = Some(location);
            }
        }
        let Some(location) = chosen else {
            return Err(Status::internal_error(format!(
                "scan range for node {node_id} has no replica locations"
            )));
        };
        *assigned_bytes_per_host
            .entry(location.server.clone())
            .or_insert(0) += scan_range_locations.scan_range.length();

        let exec_host = if params.hosts.len() == 1 {
            // Everything runs on the single host anyway.
            params.hosts[0].clone()
        } else {
            params
                .data_server_map
                .get(&location.server)
                .cloned()
                .ok_or_else(|| {
                    Status::internal_error(format!(
                        "no exec host mapped for data host {}",
                        location.server
                    ))
                })?
        };

        assignment
            .entry(exec_host)
            .or_default()
            .entry(node_id)
            .or_default()
            .push(ScanRangeParams {
                scan_range: scan_range_locations.scan_range.clone(),
                volume_id: location.volume_id,
            });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{
        DataStreamSink, OutputSink, PartitionType, PlanFragment, ScanRange, ScanRangeLocation,
    };
    use crate::scheduler::LocalScheduler;

    fn scan_node(id: i32) -> PlanNode {
        PlanNode {
            node_id: PlanNodeId::new(id),
            node_type: PlanNodeType::HdfsScan,
            num_children: 0,
        }
    }

    fn exchange_node(id: i32) -> PlanNode {
        PlanNode {
            node_id: PlanNodeId::new(id),
            node_type: PlanNodeType::Exchange,
            num_children: 0,
        }
    }

    fn split(path: &str, length: i64, hosts: &[(&str, u16)]) -> ScanRangeLocations {
        ScanRangeLocations {
            scan_range: ScanRange::HdfsFileSplit {
                path: path.to_string(),
                offset: 0,
                length,
            },
            locations: hosts
                .iter()
                .map(|(host, port)| ScanRangeLocation {
                    server: HostPort::new(*host, *port),
                    volume_id: 0,
                })
                .collect(),
        }
    }

    fn coord() -> HostPort {
        HostPort::new("coord", 9060)
    }

    /// Root exchange fragment over one scan fragment with replicas on two
    /// hosts.
    fn two_fragment_request() -> QueryExecRequest {
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
            per_node_scan_ranges: HashMap::from([(
                PlanNodeId::new(0),
                vec![
                    split("/t/f0", 100, &[("host-b", 9060)]),
                    split("/t/f1", 100, &[("host-a", 9060)]),
                ],
            )]),
            finalize_params: None,
        }
    }

    #[test]
    fn unpartitioned_fragment_runs_on_coordinator() {
        let request = QueryExecRequest {
            fragments: vec![PlanFragment {
                plan: vec![scan_node(0)],
                partition: PartitionType::Unpartitioned,
                output_sink: None,
            }],
            dest_fragment_idx: vec![],
            per_node_scan_ranges: HashMap::new(),
            finalize_params: None,
        };
        let (params, num_backends) = compute_fragment_exec_params(
            &request,
            UniqueId::new(1, 1),
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect("compute params");
        assert_eq!(params[0].hosts, vec![coord()]);
        assert_eq!(num_backends, 0);
    }

    #[test]
    fn scan_fragment_hosts_are_deduped_and_sorted() {
        let request = two_fragment_request();
        let (params, num_backends) = compute_fragment_exec_params(
            &request,
            UniqueId::new(1, 0),
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect("compute params");
        assert_eq!(params[0].hosts, vec![coord()]);
        assert_eq!(
            params[1].hosts,
            vec![HostPort::new("host-a", 9060), HostPort::new("host-b", 9060)]
        );
        assert_eq!(num_backends, 2);

        // Sender count covers both scan instances; destinations point at
        // the root's single instance.
        assert_eq!(
            params[0].per_exch_num_senders.get(&PlanNodeId::new(5)),
            Some(&2)
        );
        assert_eq!(params[1].destinations.len(), 1);
        assert_eq!(
            params[1].destinations[0].fragment_instance_id,
            params[0].instance_ids[0]
        );
    }

    #[test]
    fn instance_ids_offset_query_id_by_ordinal_plus_one() {
        let request = two_fragment_request();
        let query_id = UniqueId::new(7, 100);
        let (params, _) = compute_fragment_exec_params(
            &request,
            query_id,
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect("compute params");
        assert_eq!(params[0].instance_ids, vec![UniqueId::new(7, 101)]);
        assert_eq!(
            params[1].instance_ids,
            vec![UniqueId::new(7, 102), UniqueId::new(7, 103)]
        );
    }

    #[test]
    fn instance_id_overflow_is_an_error() {
        let request = two_fragment_request();
        let err = compute_fragment_exec_params(
            &request,
            UniqueId::new(7, i64::MAX - 1),
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect_err("overflow must fail");
        assert!(err.message().contains("overflow"));
    }

    #[test]
    fn aggregation_fragment_inherits_input_hosts() {
        // F0 root <- F1 merge agg (exchange only) <- F2 scan.
        let request = QueryExecRequest {
            fragments: vec![
                PlanFragment {
                    plan: vec![exchange_node(9)],
                    partition: PartitionType::Unpartitioned,
                    output_sink: None,
                },
                PlanFragment {
                    plan: vec![exchange_node(5)],
                    partition: PartitionType::HashPartitioned,
                    output_sink: Some(OutputSink::Stream(DataStreamSink {
                        dest_node_id: PlanNodeId::new(9),
                    })),
                },
                PlanFragment {
                    plan: vec![scan_node(0)],
                    partition: PartitionType::HashPartitioned,
                    output_sink: Some(OutputSink::Stream(DataStreamSink {
                        dest_node_id: PlanNodeId::new(5),
                    })),
                },
            ],
            dest_fragment_idx: vec![0, 1],
            per_node_scan_ranges: HashMap::from([(
                PlanNodeId::new(0),
                vec![
                    split("/t/f0", 10, &[("host-a", 9060)]),
                    split("/t/f1", 10, &[("host-b", 9060)]),
                ],
            )]),
            finalize_params: None,
        };
        let (params, _) = compute_fragment_exec_params(
            &request,
            UniqueId::new(1, 0),
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect("compute params");
        assert_eq!(params[1].hosts, params[2].hosts);
        assert_eq!(params[1].hosts.len(), 2);
    }

    #[test]
    fn partitioned_fragment_without_scan_or_input_is_internal_error() {
        let request = QueryExecRequest {
            fragments: vec![PlanFragment {
                plan: vec![PlanNode {
                    node_id: PlanNodeId::new(3),
                    node_type: PlanNodeType::Aggregate,
                    num_children: 0,
                }],
                partition: PartitionType::HashPartitioned,
                output_sink: None,
            }],
            dest_fragment_idx: vec![],
            per_node_scan_ranges: HashMap::new(),
            finalize_params: None,
        };
        let err = compute_fragment_exec_params(
            &request,
            UniqueId::new(1, 0),
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect_err("must fail");
        assert!(err.message().contains("neither a scan nor an input"));
    }

    #[test]
    fn scan_without_ranges_runs_on_coordinator() {
        let mut request = two_fragment_request();
        request.per_node_scan_ranges.clear();
        let (params, num_backends) = compute_fragment_exec_params(
            &request,
            UniqueId::new(1, 0),
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect("compute params");
        assert_eq!(params[1].hosts, vec![coord()]);
        assert_eq!(num_backends, 1);
    }

    #[test]
    fn leftmost_node_is_first_leaf_in_preorder() {
        // join(exchange, scan): the exchange leaf comes first.
        let plan = vec![
            PlanNode {
                node_id: PlanNodeId::new(2),
                node_type: PlanNodeType::HashJoin,
                num_children: 2,
            },
            exchange_node(1),
            scan_node(0),
        ];
        assert_eq!(find_leftmost_node(&plan, &SCAN_NODE_TYPES), None);
        assert_eq!(
            find_leftmost_node(&plan, &[PlanNodeType::Exchange]),
            Some(PlanNodeId::new(1))
        );
    }

    #[test]
    fn assignment_preserves_input_ranges() {
        let request = two_fragment_request();
        let (params, _) = compute_fragment_exec_params(
            &request,
            UniqueId::new(1, 0),
            &coord(),
            &LocalScheduler::new(9060),
        )
        .expect("compute params");
        let (assignments, num_scan_ranges) =
            compute_scan_range_assignment(&request, &params).expect("assign ranges");
        assert_eq!(num_scan_ranges, 2);
        let total: usize = assignments[1]
            .values()
            .flat_map(|per_node| per_node.values())
            .map(|ranges| ranges.len())
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn least_loaded_replica_wins_and_ties_break_in_input_order() {
        // Three equal ranges, all replicated on both hosts: no host may
        // receive all three.
        let locations = vec![
            split("/t/f0", 10, &[("host-a", 9060), ("host-b", 9060)]),
            split("/t/f1", 10, &[("host-a", 9060), ("host-b", 9060)]),
            split("/t/f2", 10, &[("host-a", 9060), ("host-b", 9060)]),
        ];
        let params = FragmentExecParams {
            hosts: vec![HostPort::new("host-a", 9060), HostPort::new("host-b", 9060)],
            data_server_map: HashMap::from([
                (
                    HostPort::new("host-a", 9060),
                    HostPort::new("host-a", 9060),
                ),
                (
                    HostPort::new("host-b", 9060),
                    HostPort::new("host-b", 9060),
                ),
            ]),
            ..FragmentExecParams::default()
        };
        let mut assignment = FragmentScanRangeAssignment::new();
        compute_node_scan_range_assignment(
            PlanNodeId::new(0),
            &locations,
            &params,
            &mut assignment,
        )
        .expect("assign");

        let mut per_host: Vec<usize> = assignment
            .values()
            .map(|per_node| per_node[&PlanNodeId::new(0)].len())
            .collect();
        per_host.sort();
        assert_eq!(per_host, vec![1, 2]);
    }

    #[test]
    fn kv_ranges_assign_with_zero_length() {
        let locations = vec![ScanRangeLocations {
            scan_range: ScanRange::KvRange {
                start_key: vec![1],
                stop_key: vec![9],
            },
            locations: vec![ScanRangeLocation {
                server: HostPort::new("host-a", 9060),
                volume_id: -1,
            }],
        }];
        let params = FragmentExecParams {
            hosts: vec![HostPort::new("host-a", 9060)],
            ..FragmentExecParams::default()
        };
        let mut assignment = FragmentScanRangeAssignment::new();
        compute_node_scan_range_assignment(
            PlanNodeId::new(2),
            &locations,
            &params,
            &mut assignment,
        )
        .expect("assign");
        let ranges = &assignment[&HostPort::new("host-a", 9060)][&PlanNodeId::new(2)];
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].volume_id, -1);
    }
}
