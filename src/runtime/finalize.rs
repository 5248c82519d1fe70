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

//! INSERT finalization: the filesystem sequence that atomizes staged sink
//! output into the target table. Runs only after every fragment reported
//! done. Any failure is fatal to the query and leaves the table in an
//! undefined state; rollback is the caller's problem.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::common::status::Status;
use crate::fs::{FileKind, FileSystem};
use crate::plan::FinalizeParams;

/// Execute the four finalization steps in order:
/// 1. overwrite cleanup, 2. partition directory creation, 3. staged-file
/// rename, 4. staging-directory cleanup.
pub fn finalize_insert(
    fs: &dyn FileSystem,
    params: &FinalizeParams,
    partition_row_counts: &BTreeMap<String, i64>,
    files_to_move: &BTreeMap<String, String>,
) -> Result<(), Status> {
    for (partition_key, num_rows) in partition_row_counts {
        let partition_path = partition_path(&params.base_dir, partition_key);
        debug!(
            partition = %partition_key,
            path = %partition_path,
            num_rows,
            "finalizing partition"
        );
        if params.is_overwrite {
            if partition_key.is_empty() {
                // Unpartitioned table: the sink staged its output under the
                // table root, so only delete the file children. Directories
                // may be staging dirs or unrelated data and are left alone.
                let children = fs.list_dir(&partition_path).map_err(|e| {
                    Status::internal_error(format!(
                        "could not list directory {partition_path}: {e:#}"
                    ))
                })?;
                for child in children {
                    if child.kind != FileKind::File {
                        continue;
                    }
                    debug!(path = %child.path, "deleting file for overwrite");
                    fs.delete(&child.path, true).map_err(|e| {
                        Status::internal_error(format!(
                            "failed to delete existing file {} for INSERT OVERWRITE: {e:#}",
                            child.path
                        ))
                    })?;
                }
            } else {
                // A partition directory can be deleted wholesale. The
                // delete is best-effort about existence: a third party
                // racing us on the directory does not fail the query.
                fs.delete(&partition_path, true).map_err(|e| {
                    Status::internal_error(format!(
                        "failed to delete partition directory {partition_path} for INSERT OVERWRITE: {e:#}"
                    ))
                })?;
            }
        }
        fs.create_directory(&partition_path).map_err(|e| {
            Status::internal_error(format!(
                "failed to create partition directory {partition_path}: {e:#}"
            ))
        })?;
    }

    // Staged files move into place before any staging directory goes
    // away; an empty destination marks its source for the cleanup pass.
    let mut staging_dirs_to_delete: BTreeSet<&String> = BTreeSet::new();
    for (src, dst) in files_to_move {
        if dst.is_empty() {
            staging_dirs_to_delete.insert(src);
            continue;
        }
        debug!(src = %src, dst = %dst, "moving staged file");
        fs.rename(src, dst).map_err(|e| {
            Status::internal_error(format!("could not move staged file {src} to {dst}: {e:#}"))
        })?;
    }

    for staging_dir in staging_dirs_to_delete {
        fs.delete(staging_dir, true).map_err(|e| {
            Status::internal_error(format!(
                "failed to delete staging directory {staging_dir}: {e:#}"
            ))
        })?;
    }

    info!(
        base_dir = %params.base_dir,
        partitions = partition_row_counts.len(),
        moved_files = files_to_move.len(),
        "insert finalized"
    );
    Ok(())
}

fn partition_path(base_dir: &str, partition_key: &str) -> String {
    if partition_key.is_empty() {
        base_dir.trim_end_matches('/').to_string()
    } else {
        format!(
            "{}/{}",
            base_dir.trim_end_matches('/'),
            partition_key.trim_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::local::LocalFileSystem;

    fn params(base_dir: &str, is_overwrite: bool) -> FinalizeParams {
        FinalizeParams {
            is_overwrite,
            base_dir: base_dir.to_string(),
        }
    }

    #[test]
    fn overwrite_replaces_partition_directory_and_moves_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().to_string_lossy().to_string();
        let fs = LocalFileSystem::new();

        // Pre-existing partition data that the overwrite must remove.
        let old_partition = format!("{base}/d=1");
        fs.create_directory(&old_partition).expect("create");
        std::fs::write(format!("{old_partition}/old-file"), b"old").expect("write");

        // Staged sink output.
        let staging = format!("{base}/.staging");
        fs.create_directory(&staging).expect("create staging");
        std::fs::write(format!("{staging}/part-a"), b"a").expect("write");
        std::fs::write(format!("{staging}/part-b"), b"b").expect("write");

        let row_counts = BTreeMap::from([("d=1".to_string(), 30_i64)]);
        let files_to_move = BTreeMap::from([
            (
                format!("{staging}/part-a"),
                format!("{base}/d=1/part-a"),
            ),
            (
                format!("{staging}/part-b"),
                format!("{base}/d=1/part-b"),
            ),
            (staging.clone(), String::new()),
        ]);

        finalize_insert(&fs, &params(&base, true), &row_counts, &files_to_move)
            .expect("finalize");

        assert!(!fs.exists(&format!("{base}/d=1/old-file")).expect("exists"));
        assert!(fs.exists(&format!("{base}/d=1/part-a")).expect("exists"));
        assert!(fs.exists(&format!("{base}/d=1/part-b")).expect("exists"));
        assert!(!fs.exists(&staging).expect("exists"));
    }

    #[test]
    fn overwrite_of_unpartitioned_table_keeps_subdirectories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().to_string_lossy().to_string();
        let fs = LocalFileSystem::new();

        std::fs::write(format!("{base}/data-file"), b"old").expect("write");
        let staging = format!("{base}/.staging");
        fs.create_directory(&staging).expect("create staging");
        std::fs::write(format!("{staging}/part-a"), b"a").expect("write");

        let row_counts = BTreeMap::from([(String::new(), 10_i64)]);
        let files_to_move = BTreeMap::from([
            (format!("{staging}/part-a"), format!("{base}/part-a")),
            (staging.clone(), String::new()),
        ]);

        finalize_insert(&fs, &params(&base, true), &row_counts, &files_to_move)
            .expect("finalize");

        // The old data file is gone, the staged file landed, and the only
        // subdirectory that disappeared is the staging dir itself (via the
        // cleanup pass, not the overwrite pass).
        assert!(!fs.exists(&format!("{base}/data-file")).expect("exists"));
        assert!(fs.exists(&format!("{base}/part-a")).expect("exists"));
        assert!(!fs.exists(&staging).expect("exists"));
    }

    #[test]
    fn missing_partition_directory_does_not_fail_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().to_string_lossy().to_string();
        let fs = LocalFileSystem::new();

        let row_counts = BTreeMap::from([("d=2".to_string(), 5_i64)]);
        finalize_insert(&fs, &params(&base, true), &row_counts, &BTreeMap::new())
            .expect("finalize");
        assert!(fs.exists(&format!("{base}/d=2")).expect("exists"));
    }

    #[test]
    fn append_without_overwrite_keeps_existing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().to_string_lossy().to_string();
        let fs = LocalFileSystem::new();

        let partition = format!("{base}/d=1");
        fs.create_directory(&partition).expect("create");
        std::fs::write(format!("{partition}/existing"), b"keep").expect("write");

        let staging = format!("{base}/.staging");
        fs.create_directory(&staging).expect("create staging");
        std::fs::write(format!("{staging}/part-a"), b"a").expect("write");

        let row_counts = BTreeMap::from([("d=1".to_string(), 1_i64)]);
        let files_to_move = BTreeMap::from([
            (format!("{staging}/part-a"), format!("{partition}/part-a")),
            (staging.clone(), String::new()),
        ]);
        finalize_insert(&fs, &params(&base, false), &row_counts, &files_to_move)
            .expect("finalize");

        assert!(fs.exists(&format!("{partition}/existing")).expect("exists"));
        assert!(fs.exists(&format!("{partition}/part-a")).expect("exists"));
    }

    #[test]
    fn rename_failure_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().to_string_lossy().to_string();
        let fs = LocalFileSystem::new();

        let row_counts = BTreeMap::from([("d=1".to_string(), 1_i64)]);
        let files_to_move = BTreeMap::from([(
            format!("{base}/does-not-exist"),
            format!("{base}/d=1/part-a"),
        )]);
        let err = finalize_insert(&fs, &params(&base, false), &row_counts, &files_to_move)
            .expect_err("rename must fail");
        assert!(err.message().contains("could not move staged file"));
    }
}
