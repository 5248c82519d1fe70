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
use std::sync::Arc;

use crate::common::types::HostPort;
use crate::exec::ExecutorFactory;
use crate::fs::FileSystem;
use crate::scheduler::Scheduler;
use crate::service::client_cache::ClientCache;

/// Process-wide collaborators a coordinator needs, injected at
/// construction so no query code touches globals.
pub struct ExecEnv {
    client_cache: Arc<ClientCache>,
    scheduler: Arc<dyn Scheduler>,
    fs: Arc<dyn FileSystem>,
    executor_factory: Arc<dyn ExecutorFactory>,
    /// Address this process serves fragment RPCs and status reports on.
    backend_address: HostPort,
}

impl ExecEnv {
    pub fn new(
        client_cache: Arc<ClientCache>,
        scheduler: Arc<dyn Scheduler>,
        fs: Arc<dyn FileSystem>,
        executor_factory: Arc<dyn ExecutorFactory>,
        backend_address: HostPort,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_cache,
            scheduler,
            fs,
            executor_factory,
            backend_address,
        })
    }

    pub fn client_cache(&self) -> &Arc<ClientCache> {
        &self.client_cache
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn fs(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    pub fn executor_factory(&self) -> &dyn ExecutorFactory {
        self.executor_factory.as_ref()
    }

    pub fn backend_address(&self) -> &HostPort {
        &self.backend_address
    }
}
