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
use std::io;
use std::path::Path;

use anyhow::{Context, Result};

use crate::fs::{FileInfo, FileKind, FileSystem};

/// Local-disk filesystem, used by single-node deployments and tests.
#[derive(Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl FileSystem for LocalFileSystem {
    fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        let entries =
            std::fs::read_dir(path).with_context(|| format!("list directory: {path}"))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("list directory: {path}"))?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat entry under: {path}"))?;
            let kind = if file_type.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            };
            out.push(FileInfo {
                path: entry.path().to_string_lossy().to_string(),
                kind,
            });
        }
        Ok(out)
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let target = Path::new(path);
        let result = match target.metadata() {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
            Ok(meta) if meta.is_dir() => {
                if recursive {
                    std::fs::remove_dir_all(target)
                } else {
                    std::fs::remove_dir(target)
                }
            }
            Ok(_) => std::fs::remove_file(target),
        };
        ignore_not_found(result).with_context(|| format!("delete: {path}"))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        std::fs::rename(src, dst).with_context(|| format!("rename: {src} -> {dst}"))
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(path).with_context(|| format!("create directory: {path}"))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(Path::new(path).exists())
    }
}
