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
use anyhow::{anyhow, bail, Context, Result};
use opendal::Operator;
use url::Url;

use crate::fs::object_store::ObjectStoreFileSystem;
use crate::fs::{FileInfo, FileSystem};

#[derive(Clone, Debug)]
pub struct HdfsPath {
    pub name_node: String,
    pub user: Option<String>,
    pub rel_path: String,
}

pub fn parse_hdfs_path(raw: &str) -> Result<HdfsPath> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("hdfs path is empty");
    }
    let url = Url::parse(trimmed).with_context(|| format!("invalid hdfs path: {trimmed}"))?;
    if url.scheme() != "hdfs" {
        bail!(
            "invalid hdfs path scheme: expected hdfs://, got {}",
            url.scheme()
        );
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("hdfs path missing host: {trimmed}"))?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    if url.password().is_some() {
        bail!("hdfs path must not include password in authority: {trimmed}");
    }
    if url.query().is_some() || url.fragment().is_some() {
        bail!("hdfs path must not include query or fragment: {trimmed}");
    }
    let rel_path = url.path().trim_start_matches('/').to_string();
    let user = (!url.username().is_empty()).then_some(url.username().to_string());

    Ok(HdfsPath {
        name_node: format!("hdfs://{authority}"),
        user,
        rel_path,
    })
}

fn build_hdfs_native_url(name_node: &str, user: Option<&str>) -> Result<String> {
    let Some(user) = user else {
        return Ok(name_node.to_string());
    };
    let mut url =
        Url::parse(name_node).with_context(|| format!("invalid hdfs namenode: {name_node}"))?;
    url.set_username(user)
        .map_err(|_| anyhow!("invalid hdfs user: {user}"))?;
    Ok(url.to_string().trim_end_matches('/').to_string())
}

/// HDFS-backed [`FileSystem`] over an opendal native-hdfs operator.
/// Accepts both `hdfs://nn[:port]/...` URIs on the configured namenode and
/// namenode-relative absolute paths.
pub struct HdfsFileSystem {
    name_node: String,
    inner: ObjectStoreFileSystem,
}

impl HdfsFileSystem {
    pub fn new(name_node: &str, user: Option<&str>) -> Result<Self> {
        let url = build_hdfs_native_url(name_node, user)?;
        let builder = opendal::services::HdfsNative::default()
            .name_node(&url)
            .root("/");
        let op = Operator::new(builder)
            .with_context(|| format!("init opendal hdfs-native operator, url={url}"))?
            .finish();
        Ok(Self {
            name_node: name_node.trim_end_matches('/').to_string(),
            inner: ObjectStoreFileSystem::from_operator(op),
        })
    }

    fn rel(&self, path: &str) -> Result<String> {
        let trimmed = path.trim();
        if trimmed.starts_with("hdfs://") {
            let parsed = parse_hdfs_path(trimmed)?;
            if parsed.name_node != self.name_node {
                bail!(
                    "path namenode {} does not match filesystem namenode {}",
                    parsed.name_node,
                    self.name_node
                );
            }
            return Ok(format!("/{}", parsed.rel_path));
        }
        Ok(trimmed.to_string())
    }
}

impl FileSystem for HdfsFileSystem {
    fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.inner.list_dir(&self.rel(path)?)
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.inner.delete(&self.rel(path)?, recursive)
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.rename(&self.rel(src)?, &self.rel(dst)?)
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        self.inner.create_directory(&self.rel(path)?)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(&self.rel(path)?)
    }
}
