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

//! Pooled worker-RPC clients.
//!
//! The cache keeps idle connections per backend address. Callers check a
//! client out, issue RPCs on it, and the handle returns the connection to
//! the pool on drop, including on every error path. A peer that restarted
//! silently leaves stale connections behind; callers recover by asking the
//! cache to reopen the handle once and retrying.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::common::status::Status;
use crate::common::types::HostPort;
use crate::service::messages::{
    CancelPlanFragmentParams, CancelPlanFragmentResult, ExecPlanFragmentParams,
    ExecPlanFragmentResult,
};

/// RPC failure split by recoverability: `Transport` marks a dead or
/// half-open connection that a reopen may fix; `Other` is terminal for
/// this call.
#[derive(Clone, Debug)]
pub enum RpcError {
    Transport(String),
    Other(String),
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(msg) => write!(f, "transport error: {msg}"),
            RpcError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Client side of the worker-facing internal service.
pub trait InternalServiceClient: Send {
    fn exec_plan_fragment(
        &mut self,
        params: &ExecPlanFragmentParams,
    ) -> Result<ExecPlanFragmentResult, RpcError>;

    fn cancel_plan_fragment(
        &mut self,
        params: &CancelPlanFragmentParams,
    ) -> Result<CancelPlanFragmentResult, RpcError>;
}

/// Opens fresh connections; the transport lives behind this seam.
pub trait ClientFactory: Send + Sync {
    fn create(&self, addr: &HostPort) -> Result<Box<dyn InternalServiceClient>, Status>;
}

pub struct ClientCache {
    factory: Box<dyn ClientFactory>,
    pool: Mutex<HashMap<HostPort, Vec<Box<dyn InternalServiceClient>>>>,
}

impl ClientCache {
    pub fn new(factory: Box<dyn ClientFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            pool: Mutex::new(HashMap::new()),
        })
    }

    /// Check out a client for `addr`, reusing an idle pooled connection if
    /// one exists. The handle returns the connection on drop.
    pub fn get_client(self: &Arc<Self>, addr: &HostPort) -> Result<ClientHandle, Status> {
        let pooled = self
            .pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(addr)
            .and_then(|clients| clients.pop());
        let client = match pooled {
            Some(client) => client,
            None => self.factory.create(addr)?,
        };
        Ok(ClientHandle {
            cache: Arc::clone(self),
            addr: addr.clone(),
            client: Some(client),
        })
    }

    /// Replace the handle's connection with a freshly opened one. The old
    /// connection is dropped, not pooled.
    pub fn reopen_client(&self, handle: &mut ClientHandle) -> Result<(), Status> {
        let fresh = self.factory.create(&handle.addr)?;
        handle.client = Some(fresh);
        Ok(())
    }

    fn release(&self, addr: HostPort, client: Box<dyn InternalServiceClient>) {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(addr)
            .or_default()
            .push(client);
    }

    #[cfg(test)]
    fn pooled_count(&self, addr: &HostPort) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .map(|clients| clients.len())
            .unwrap_or(0)
    }
}

/// Checked-out connection; dereferences to the client trait.
pub struct ClientHandle {
    cache: Arc<ClientCache>,
    addr: HostPort,
    client: Option<Box<dyn InternalServiceClient>>,
}

impl ClientHandle {
    pub fn addr(&self) -> &HostPort {
        &self.addr
    }
}

impl std::ops::Deref for ClientHandle {
    type Target = dyn InternalServiceClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_deref().expect("client present until drop")
    }
}

impl std::ops::DerefMut for ClientHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client
            .as_deref_mut()
            .expect("client present until drop")
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.cache.release(self.addr.clone(), client);
        }
    }
}
