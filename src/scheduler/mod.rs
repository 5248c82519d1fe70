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
use crate::common::status::Status;
use crate::common::types::HostPort;

/// Maps data-host addresses to executor addresses.
///
/// The returned list is parallel to the input and the call never fails for
/// a non-empty input on a healthy cluster; membership tracking lives
/// behind this seam.
pub trait Scheduler: Send + Sync {
    fn get_hosts(&self, data_hosts: &[HostPort]) -> Result<Vec<HostPort>, Status>;
}

/// Scheduler for deployments where every data host also runs an executor
/// on a fixed port, so the mapping is the identity on hostnames.
pub struct LocalScheduler {
    exec_port: u16,
}

impl LocalScheduler {
    pub fn new(exec_port: u16) -> Self {
        Self { exec_port }
    }
}

impl Scheduler for LocalScheduler {
    fn get_hosts(&self, data_hosts: &[HostPort]) -> Result<Vec<HostPort>, Status> {
        if data_hosts.is_empty() {
            return Err(Status::internal_error("no data hosts to schedule"));
        }
        Ok(data_hosts
            .iter()
            .map(|h| HostPort::new(h.hostname.clone(), self.exec_port))
            .collect())
    }
}
