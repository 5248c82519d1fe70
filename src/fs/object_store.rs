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

//! [`FileSystem`] over any opendal operator. The control plane is
//! synchronous, so every call bridges onto the global io runtime.

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use opendal::{EntryMode, ErrorKind, Operator};

use crate::fs::{FileInfo, FileKind, FileSystem};
use crate::runtime::global_async_runtime::io_runtime;

pub struct ObjectStoreFileSystem {
    op: Operator,
}

impl ObjectStoreFileSystem {
    pub fn from_operator(op: Operator) -> Self {
        Self { op }
    }

    /// Operator rooted at a local directory; single-node deployments and
    /// tests use this to exercise the same code path as remote stores.
    pub fn local(root: &str) -> Result<Self> {
        let builder = opendal::services::Fs::default().root(root);
        let op = Operator::new(builder)
            .context("init opendal fs operator")?
            .finish();
        Ok(Self { op })
    }

    fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: std::future::Future,
    {
        let runtime = io_runtime().map_err(|e| anyhow!(e))?;
        Ok(runtime.block_on(future))
    }
}

fn normalize(path: &str) -> String {
    path.trim().trim_start_matches('/').to_string()
}

fn dir_path(path: &str) -> String {
    format!("{}/", normalize(path).trim_end_matches('/'))
}

impl FileSystem for ObjectStoreFileSystem {
    fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let prefix = dir_path(path);
        let op = self.op.clone();
        let entries = self.block_on(async move {
            // Fail on a missing directory the way a posix listing would.
            op.stat(&prefix)
                .await
                .with_context(|| format!("list directory: {prefix}"))?;
            let mut out = Vec::new();
            let mut lister = op
                .lister_with(&prefix)
                .await
                .with_context(|| format!("list directory: {prefix}"))?;
            while let Some(entry) = lister.try_next().await.context("list next entry")? {
                if entry.path().trim_end_matches('/') == prefix.trim_end_matches('/') {
                    continue;
                }
                let kind = match entry.metadata().mode() {
                    EntryMode::DIR => FileKind::Directory,
                    _ => FileKind::File,
                };
                out.push(FileInfo {
                    path: format!("/{}", entry.path().trim_end_matches('/')),
                    kind,
                });
            }
            Ok::<_, anyhow::Error>(out)
        })??;
        Ok(entries)
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let rel = normalize(path);
        let op = self.op.clone();
        let result = self.block_on(async move {
            if recursive {
                // Directory targets need the trailing slash; try the file
                // form first so plain files also delete.
                match op.remove_all(&rel).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        op.remove_all(&format!("{rel}/")).await
                    }
                    Err(e) => Err(e),
                }
            } else {
                op.delete(&rel).await
            }
        })?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete: {path}")),
        }
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src_rel = normalize(src);
        let dst_rel = normalize(dst);
        let op = self.op.clone();
        self.block_on(async move { op.rename(&src_rel, &dst_rel).await })?
            .with_context(|| format!("rename: {src} -> {dst}"))
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        let dir = dir_path(path);
        let op = self.op.clone();
        self.block_on(async move { op.create_dir(&dir).await })?
            .with_context(|| format!("create directory: {path}"))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let rel = normalize(path);
        let dir = dir_path(path);
        let op = self.op.clone();
        let result = self.block_on(async move {
            match op.stat(&rel).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => match op.stat(&dir).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        })?;
        result.with_context(|| format!("stat: {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_operator_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_string_lossy().to_string();
        let fs = ObjectStoreFileSystem::local(&root).expect("build operator");

        fs.create_directory("/d=1").expect("create directory");
        fs.create_directory("/d=1").expect("create is idempotent");
        assert!(fs.exists("/d=1").expect("exists"));

        std::fs::write(dir.path().join("d=1/part-0"), b"rows").expect("write file");
        let listed = fs.list_dir("/d=1").expect("list dir");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, FileKind::File);

        fs.rename("/d=1/part-0", "/d=1/part-final").expect("rename");
        assert!(fs.exists("/d=1/part-final").expect("exists"));
        assert!(!fs.exists("/d=1/part-0").expect("exists"));

        fs.delete("/d=1", true).expect("recursive delete");
        assert!(!fs.exists("/d=1").expect("exists"));
        fs.delete("/d=1", true).expect("delete missing is ok");
    }

    #[test]
    fn list_missing_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_string_lossy().to_string();
        let fs = ObjectStoreFileSystem::local(&root).expect("build operator");
        assert!(fs.list_dir("/nope").is_err());
    }
}
