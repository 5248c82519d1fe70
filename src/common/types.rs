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

/// 128-bit id shared by queries and fragment instances. Fragment instance
/// ids are derived from the query id by offsetting `lo`, so the two halves
/// are kept as plain signed words rather than a `u128`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub const fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hi = self.hi as u64;
        let lo = self.lo as u64;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (hi >> 32) as u32,
            (hi >> 16) as u16,
            hi as u16,
            (lo >> 48) as u16,
            lo & 0x0000_FFFF_FFFF_FFFF
        )
    }
}

/// Network address of a backend service or a data replica.
///
/// Ordered and hashable so host lists can be sorted, deduplicated and used
/// as map keys by the host-assignment and scan-range-assignment code.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct HostPort {
    pub hostname: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}
