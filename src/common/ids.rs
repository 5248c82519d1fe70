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
use std::fmt;

use serde::{Deserialize, Serialize};

/// Plan node id in the coordinator's internal representation.
///
/// Node ids are assigned by the frontend planner and are unique across the
/// whole plan, not just within one fragment. Instance profiles carry the id
/// in their metadata slot; `PlanNodeId::INVALID_METADATA` marks a profile
/// node that does not belong to a plan node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PlanNodeId(pub i32);

impl PlanNodeId {
    pub const INVALID_METADATA: i64 = -1;

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Reconstruct a node id from profile metadata, if it names one.
    pub fn from_metadata(metadata: i64) -> Option<Self> {
        if metadata < 0 || metadata > i32::MAX as i64 {
            return None;
        }
        Some(Self(metadata as i32))
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_metadata_rejects_invalid_markers() {
        assert_eq!(PlanNodeId::from_metadata(-1), None);
        assert_eq!(PlanNodeId::from_metadata(7), Some(PlanNodeId::new(7)));
        assert_eq!(PlanNodeId::from_metadata(i64::MAX), None);
    }
}
