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

//! Hierarchical runtime profiles.
//!
//! Workers ship cumulative [`ProfileTree`] snapshots with every status
//! report; the coordinator applies them in place to the per-instance
//! [`RuntimeProfile`] so counter handles stay valid across updates.
//! Profiles are cheaply cloneable shared handles.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
    BytesPerSecond,
    UnitPerSecond,
}

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: CounterUnit,
    value: AtomicI64,
}

pub type CounterRef = Arc<Counter>;

impl Counter {
    pub fn new(name: impl Into<String>, unit: CounterUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

struct DerivedCounter {
    name: String,
    unit: CounterUnit,
    eval: Box<dyn Fn() -> i64 + Send + Sync>,
}

/// Wire form of a profile: the tree flattened in pre-order, each node
/// carrying its child count (the layout thrift profile trees use).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileTree {
    pub nodes: Vec<ProfileNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileNode {
    pub name: String,
    pub num_children: usize,
    /// Plan node id for exec-node profiles, `-1` otherwise.
    pub metadata: i64,
    pub counters: Vec<ProfileCounter>,
    pub info_strings: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileCounter {
    pub name: String,
    pub unit: CounterUnit,
    pub value: i64,
}

#[derive(Clone)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

struct RuntimeProfileInner {
    name: RwLock<String>,
    metadata: AtomicI64,
    counters: Mutex<BTreeMap<String, CounterRef>>,
    derived: Mutex<Vec<DerivedCounter>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
    child_map: Mutex<HashMap<String, RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: RwLock::new(name.into()),
                metadata: AtomicI64::new(-1),
                counters: Mutex::new(BTreeMap::new()),
                derived: Mutex::new(Vec::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
                child_map: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let mut guard = self.inner.name.write().unwrap_or_else(|e| e.into_inner());
        *guard = name.into();
    }

    pub fn metadata(&self) -> i64 {
        self.inner.metadata.load(Ordering::Relaxed)
    }

    pub fn set_metadata(&self, md: i64) {
        self.inner.metadata.store(md, Ordering::Relaxed);
    }

    pub fn add_child(&self, child: RuntimeProfile) {
        let child_name = child.name();
        {
            let mut map = self
                .inner
                .child_map
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if map.contains_key(&child_name) {
                return;
            }
            map.insert(child_name, child.clone());
        }
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child);
    }

    /// Get-or-create a direct child by name.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        if let Some(existing) = self.get_child(&name) {
            return existing;
        }
        let child = RuntimeProfile::new(name);
        self.add_child(child.clone());
        child
    }

    pub fn get_child(&self, name: &str) -> Option<RuntimeProfile> {
        self.inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Every profile in this subtree except the root, depth-first.
    pub fn all_children(&self) -> Vec<RuntimeProfile> {
        let mut out = Vec::new();
        for child in self.children() {
            out.push(child.clone());
            out.extend(child.all_children());
        }
        out
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let name = name.into();
        let mut guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = guard.get(&name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(Counter::new(name.clone(), unit));
        guard.insert(name, Arc::clone(&counter));
        counter
    }

    pub fn get_counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Register a counter whose value is computed on demand, e.g. a sum
    /// over per-backend counters.
    pub fn add_derived_counter(
        &self,
        name: impl Into<String>,
        unit: CounterUnit,
        eval: Box<dyn Fn() -> i64 + Send + Sync>,
    ) {
        self.inner
            .derived
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DerivedCounter {
                name: name.into(),
                unit,
                eval,
            });
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn total_time_counter(&self) -> CounterRef {
        self.add_counter("TotalTime", CounterUnit::TimeNs)
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        let counter = self.add_counter(name, CounterUnit::TimeNs);
        ScopedTimer::new(counter)
    }

    /// Apply a cumulative snapshot in place: counters are overwritten with
    /// the reported values, missing counters and children are created,
    /// existing counter handles stay valid.
    pub fn update(&self, tree: &ProfileTree) {
        if tree.nodes.is_empty() {
            return;
        }
        let mut idx = 0;
        self.update_node(&tree.nodes, &mut idx);
    }

    fn update_node(&self, nodes: &[ProfileNode], idx: &mut usize) {
        let Some(node) = nodes.get(*idx) else {
            return;
        };
        *idx += 1;
        self.set_metadata(node.metadata);
        for counter in &node.counters {
            self.add_counter(counter.name.clone(), counter.unit)
                .set(counter.value);
        }
        for (key, value) in &node.info_strings {
            self.add_info_string(key.clone(), value.clone());
        }
        for _ in 0..node.num_children {
            let Some(child_node) = nodes.get(*idx) else {
                return;
            };
            let child = self.child(child_node.name.clone());
            child.update_node(nodes, idx);
        }
    }

    /// Flatten this subtree into wire form. Derived counters are
    /// evaluated and exported as plain counters.
    pub fn to_tree(&self) -> ProfileTree {
        let mut nodes = Vec::new();
        self.collect_nodes(&mut nodes);
        ProfileTree { nodes }
    }

    fn collect_nodes(&self, out: &mut Vec<ProfileNode>) {
        let mut counters: Vec<ProfileCounter> = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| ProfileCounter {
                name: c.name().to_string(),
                unit: c.unit(),
                value: c.value(),
            })
            .collect();
        {
            let derived = self.inner.derived.lock().unwrap_or_else(|e| e.into_inner());
            for d in derived.iter() {
                counters.push(ProfileCounter {
                    name: d.name.clone(),
                    unit: d.unit,
                    value: (d.eval)(),
                });
            }
        }
        let info_strings = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let children = self.children();
        out.push(ProfileNode {
            name: self.name(),
            num_children: children.len(),
            metadata: self.metadata(),
            counters,
            info_strings,
        });
        for child in children {
            child.collect_nodes(out);
        }
    }

    /// Accumulate another profile's counter values into this one,
    /// creating missing counters and children. Used to build averaged
    /// per-fragment profiles before [`RuntimeProfile::divide`].
    pub fn merge(&self, other: &RuntimeProfile) {
        let other_counters: Vec<(String, CounterUnit, i64)> = other
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| (c.name().to_string(), c.unit(), c.value()))
            .collect();
        for (name, unit, value) in other_counters {
            self.add_counter(name, unit).add(value);
        }
        for other_child in other.children() {
            let child = self.child(other_child.name());
            child.set_metadata(other_child.metadata());
            child.merge(&other_child);
        }
    }

    pub fn divide(&self, n: usize) {
        if n == 0 {
            return;
        }
        {
            let counters = self
                .inner
                .counters
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for counter in counters.values() {
                counter.set(counter.value() / n as i64);
            }
        }
        for child in self.children() {
            child.divide(n);
        }
    }

    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        self.pretty_print_indented(&mut out, 0);
        out
    }

    fn pretty_print_indented(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        let _ = writeln!(out, "{}{}:", pad, self.name());
        {
            let info_strings = self
                .inner
                .info_strings
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (key, value) in info_strings.iter() {
                let _ = writeln!(out, "{}   {}: {}", pad, key, value);
            }
        }
        {
            let counters = self
                .inner
                .counters
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for counter in counters.values() {
                let _ = writeln!(
                    out,
                    "{}   - {}: {}",
                    pad,
                    counter.name(),
                    format_counter_value(counter.unit(), counter.value())
                );
            }
        }
        {
            let derived = self.inner.derived.lock().unwrap_or_else(|e| e.into_inner());
            for d in derived.iter() {
                let _ = writeln!(
                    out,
                    "{}   - {}: {}",
                    pad,
                    d.name,
                    format_counter_value(d.unit, (d.eval)())
                );
            }
        }
        for child in self.children() {
            child.pretty_print_indented(out, indent + 1);
        }
    }

    /// JSON rendering of the tree for debug logging.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_tree()).unwrap_or_else(|_| "{}".to_string())
    }
}

fn format_counter_value(unit: CounterUnit, value: i64) -> String {
    match unit {
        CounterUnit::Unit => value.to_string(),
        CounterUnit::Bytes => crate::common::util::format_bytes(value as f64),
        CounterUnit::TimeNs => crate::common::util::format_time_ms(value as f64 / 1_000_000.0),
        CounterUnit::BytesPerSecond => {
            format!("{}/s", crate::common::util::format_bytes(value as f64))
        }
        CounterUnit::UnitPerSecond => format!("{value}/s"),
    }
}

pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed_ns = self.start.elapsed().as_nanos();
        let elapsed_ns = i64::try_from(elapsed_ns).unwrap_or(i64::MAX);
        self.counter.add(elapsed_ns);
    }
}
