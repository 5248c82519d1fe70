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

//! Filesystem abstraction used by INSERT finalization.

#[cfg(feature = "hdfs")]
pub mod hdfs;
pub mod local;
pub mod object_store;

use anyhow::Result;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Clone, Debug)]
pub struct FileInfo {
    pub path: String,
    pub kind: FileKind,
}

/// The handful of metadata operations finalization needs.
///
/// Implementations are thread-safe. `delete` on a missing path succeeds;
/// `create_directory` on an existing directory succeeds; both are relied
/// on to make finalization steps retry-friendly.
pub trait FileSystem: Send + Sync {
    /// Direct children of `path`. Fails if `path` does not exist or is not
    /// a directory.
    fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>>;

    fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    fn rename(&self, src: &str, dst: &str) -> Result<()>;

    fn create_directory(&self, path: &str) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool>;
}
