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
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

static CONFIG: OnceLock<NovaCoordConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaCoordConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = NovaCoordConfig::load_from_file(path.as_ref())?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static NovaCoordConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = NovaCoordConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static NovaCoordConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVACOORD_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novacoord.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVACOORD_CONFIG or create ./novacoord.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct NovaCoordConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl NovaCoordConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: NovaCoordConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for NovaCoordConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,
    #[serde(default = "ServerConfig::default_be_port")]
    pub be_port: u16,
}

impl ServerConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_be_port() -> u16 {
        9060
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            be_port: Self::default_be_port(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Width of the pool that fans out fragment-exec RPCs.
    #[serde(default = "RuntimeConfig::default_dispatch_threads")]
    pub dispatch_threads: usize,
    #[serde(default = "RuntimeConfig::default_io_runtime_worker_threads")]
    pub io_runtime_worker_threads: usize,
    #[serde(default = "RuntimeConfig::default_io_runtime_max_blocking_threads")]
    pub io_runtime_max_blocking_threads: usize,
}

impl RuntimeConfig {
    fn default_dispatch_threads() -> usize {
        8
    }

    fn default_io_runtime_worker_threads() -> usize {
        4
    }

    fn default_io_runtime_max_blocking_threads() -> usize {
        16
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatch_threads: Self::default_dispatch_threads(),
            io_runtime_worker_threads: Self::default_io_runtime_worker_threads(),
            io_runtime_max_blocking_threads: Self::default_io_runtime_max_blocking_threads(),
        }
    }
}

pub(crate) fn dispatch_threads() -> usize {
    config()
        .ok()
        .map(|c| c.runtime.dispatch_threads)
        .unwrap_or_else(RuntimeConfig::default_dispatch_threads)
        .max(1)
}

pub(crate) fn io_runtime_worker_threads() -> usize {
    config()
        .ok()
        .map(|c| c.runtime.io_runtime_worker_threads)
        .unwrap_or_else(RuntimeConfig::default_io_runtime_worker_threads)
        .max(1)
}

pub(crate) fn io_runtime_max_blocking_threads() -> usize {
    config()
        .ok()
        .map(|c| c.runtime.io_runtime_max_blocking_threads)
        .unwrap_or_else(RuntimeConfig::default_io_runtime_max_blocking_threads)
        .max(1)
}
