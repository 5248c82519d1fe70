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

/// Outcome code carried by every fragment status report and RPC result.
/// Transport-level failures are projected onto `RpcError` so callers can
/// treat them uniformly with remote-reported errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Cancelled,
    InternalError,
    RpcError,
}

/// Execution status: a code plus an appendable list of detail messages.
///
/// The first message is the summary; later messages accumulate detail from
/// follow-up failures (for example a cancel RPC that also failed) without
/// ever changing the code. An OK status never carries messages.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Status {
    code: StatusCode,
    error_msgs: Vec<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            error_msgs: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            code: StatusCode::Cancelled,
            error_msgs: vec!["Cancelled".to_string()],
        }
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self {
            code: StatusCode::InternalError,
            error_msgs: vec![msg.into()],
        }
    }

    pub fn rpc_error(msg: impl Into<String>) -> Self {
        Self {
            code: StatusCode::RpcError,
            error_msgs: vec![msg.into()],
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::Cancelled
    }

    /// Append one detail message. Appending to an OK status is a
    /// programming error and is ignored in release builds.
    pub fn add_error_msg(&mut self, msg: impl Into<String>) {
        debug_assert!(!self.is_ok(), "cannot attach error detail to OK status");
        if self.is_ok() {
            return;
        }
        self.error_msgs.push(msg.into());
    }

    /// Fold another non-OK status into this one as additional detail,
    /// keeping this status' code.
    pub fn add_status(&mut self, other: &Status) {
        if other.is_ok() {
            return;
        }
        for msg in &other.error_msgs {
            self.add_error_msg(msg.clone());
        }
    }

    pub fn error_msgs(&self) -> &[String] {
        &self.error_msgs
    }

    pub fn message(&self) -> String {
        self.error_msgs.join("; ")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            StatusCode::Ok => write!(f, "OK"),
            code => write!(f, "{:?}: {}", code, self.message()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status_has_no_messages() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert!(status.error_msgs().is_empty());
    }

    #[test]
    fn add_status_accumulates_detail_without_changing_code() {
        let mut status = Status::internal_error("scan failed");
        status.add_status(&Status::rpc_error("cancel rpc failed"));
        assert_eq!(status.code(), StatusCode::InternalError);
        assert_eq!(status.error_msgs().len(), 2);
        assert_eq!(status.message(), "scan failed; cancel rpc failed");
    }

    #[test]
    fn add_status_ignores_ok() {
        let mut status = Status::cancelled();
        status.add_status(&Status::ok());
        assert_eq!(status.error_msgs().len(), 1);
    }
}
