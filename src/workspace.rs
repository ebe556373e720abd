//! # Workspace Gateway
//!
//! Filesystem API over each container's `/workspace` root: read, write,
//! stat, list, delete, plus tar import/export and grouped batches. All
//! operations run through the runtime adapter (helper execs and the
//! daemon's archive endpoints) - the gateway never touches the host
//! filesystem.
//!
//! ## Path Containment
//!
//! Containment is non-negotiable and enforced twice:
//!
//! 1. **Lexically** ([`contain_path`]): literal `..` segments are rejected
//!    outright; after normalization the path must equal the mount root or
//!    start with it.
//! 2. **At the fileystem** (helper scripts): every operation resolves the
//!    target with `readlink -f` inside the container and verifies the
//!    resolution stays under the workspace root, so a symlink pointing
//!    outside is a `path_violation`, never a read.
//!
//! ## ETags
//!
//! `etag = "{size:x}-{mtime_ns:x}-{sha256[..16]}"`. The function is fixed
//! for the life of the process so clients can memoize. Conditional writes
//! (`if_match_etag`) fail with `etag_conflict` on mismatch and mutate
//! nothing.
//!
//! ## Atomic Writes
//!
//! Content is staged under a unique name in the destination directory
//! (daemon tar upload), then renamed into place. Tar imports stage an
//! entire validated archive the same way; a partial failure removes the
//! staging directory.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::audit::Audit;
use crate::constants::{ETAG_HASH_PREFIX_LEN, MAX_TAR_IMPORT_BYTES};
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ExecSpec, StreamKind};
use crate::security::SecurityDefaults;
use crate::store::ContainerRecord;

// =============================================================================
// Types
// =============================================================================

/// Stat-level metadata for a workspace path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Normalized container-absolute path.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    /// Octal permission string as `stat %a` reports it.
    pub mode: String,
    pub mtime: DateTime<Utc>,
    pub etag: String,
    /// Advisory, extension-derived.
    pub mime_type: Option<String>,
}

/// Result of a file read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub content: Vec<u8>,
    pub info: FileInfo,
}

/// Result of a tar import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// One operation in a grouped batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Read {
        path: String,
    },
    Write {
        path: String,
        content: Vec<u8>,
        if_match_etag: Option<String>,
    },
    Delete {
        path: String,
        recursive: bool,
    },
}

impl BatchOp {
    fn path(&self) -> &str {
        match self {
            Self::Read { path } | Self::Delete { path, .. } | Self::Write { path, .. } => path,
        }
    }
}

/// Per-op outcome of a batch.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Read(ReadResult),
    Written { etag: String, size: u64 },
    Deleted,
}

// =============================================================================
// Path Containment
// =============================================================================

/// Lexically contains `path` under `mount`. Relative inputs are joined
/// under the mount root. Literal `..` segments are rejected before
/// normalization; the normalized result must equal the root or live
/// beneath it.
pub fn contain_path(mount: &str, path: &str) -> Result<String> {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{mount}/{path}")
    };

    let mut normalized: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::PathViolation {
                    path: path.to_string(),
                    reason: "path contains '..' segments".to_string(),
                })
            }
            other => normalized.push(other),
        }
    }
    let result = format!("/{}", normalized.join("/"));

    if result != mount && !result.starts_with(&format!("{mount}/")) {
        return Err(Error::PathViolation {
            path: path.to_string(),
            reason: format!("path must be under {mount}"),
        });
    }
    Ok(result)
}

/// Computes the fixed ETag function.
pub fn compute_etag(size: u64, mtime_ns: i64, content_hash: &str) -> String {
    let prefix: String = content_hash.chars().take(ETAG_HASH_PREFIX_LEN).collect();
    format!("{size:x}-{mtime_ns:x}-{prefix}")
}

fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Advisory MIME type from the file extension.
pub fn guess_mime(path: &str) -> Option<String> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "py" => "text/x-python",
        "rs" => "text/x-rust",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" => "text/html",
        "css" => "text/css",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    };
    Some(mime.to_string())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// Helper-script exit codes, distinct from command failures.
const EXIT_NOT_FOUND: i64 = 3;
const EXIT_ESCAPE: i64 = 4;

// =============================================================================
// Gateway
// =============================================================================

/// Workspace filesystem gateway.
pub struct WorkspaceGateway {
    runtime: Arc<dyn ContainerRuntime>,
    audit: Arc<Audit>,
    security: SecurityDefaults,
    mount: String,
}

impl WorkspaceGateway {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, audit: Arc<Audit>, mount: String) -> Self {
        Self {
            runtime,
            audit,
            security: SecurityDefaults::default(),
            mount,
        }
    }

    /// The workspace mount path this gateway serves.
    pub fn mount(&self) -> &str {
        &self.mount
    }

    fn contain(&self, path: &str) -> Result<String> {
        contain_path(&self.mount, path)
    }

    /// Path relative to the mount root, `"."` for the root itself. Helper
    /// scripts run with cwd at the root and only ever see relative paths,
    /// which keeps the resolved-root containment check backend-agnostic.
    fn rel(&self, contained: &str) -> String {
        if contained == self.mount {
            ".".to_string()
        } else {
            contained[self.mount.len() + 1..].to_string()
        }
    }

    fn runtime_id<'a>(&self, container: &'a ContainerRecord) -> Result<&'a str> {
        container
            .runtime_id
            .as_deref()
            .ok_or_else(|| Error::ContainerNotFound(container.id.clone()))
    }

    /// Runs a helper script in the container, cwd at the workspace root.
    async fn run_script(
        &self,
        runtime_id: &str,
        script: String,
    ) -> Result<(i64, Vec<u8>, Vec<u8>)> {
        let spec = ExecSpec {
            argv: vec!["sh".to_string(), "-c".to_string(), script],
            cwd: self.mount.clone(),
            env: HashMap::new(),
            user: self.security.exec_user(false),
        };
        let mut running = self.runtime.exec_run(runtime_id, &spec).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = running.chunks.recv().await {
            match chunk.stream {
                StreamKind::Stdout => stdout.extend(chunk.data),
                StreamKind::Stderr => stderr.extend(chunk.data),
            }
        }
        let code = running.exit.await.unwrap_or(-1);
        Ok((code, stdout, stderr))
    }

    /// Script prologue resolving the workspace root and verifying that
    /// `rel` does not escape it through symlinks.
    fn containment_prologue(rel: &str) -> String {
        let q = shell_quote(rel);
        format!(
            "root=$(readlink -f .) || exit {EXIT_NOT_FOUND}; \
             rp=$(readlink -f -- {q}) || exit {EXIT_NOT_FOUND}; \
             case \"$rp\" in \"$root\"|\"$root\"/*) ;; *) exit {EXIT_ESCAPE};; esac; "
        )
    }

    fn map_script_failure(&self, container_id: &str, path: &str, code: i64) -> Error {
        match code {
            EXIT_ESCAPE => {
                self.audit.path_violation(container_id, path);
                Error::PathViolation {
                    path: path.to_string(),
                    reason: "symlink resolves outside the workspace".to_string(),
                }
            }
            _ => Error::PathNotFound(path.to_string()),
        }
    }

    // =========================================================================
    // stat
    // =========================================================================

    /// Stats a path, including the content hash for regular files.
    pub async fn stat(&self, container: &ContainerRecord, path: &str) -> Result<FileInfo> {
        let contained = self.contain(path)?;
        let rel = self.rel(&contained);
        let runtime_id = self.runtime_id(container)?;
        let q = shell_quote(&rel);

        let script = format!(
            "{}stat -c '%s|%a|%Y|%F' -- {q} || exit {EXIT_NOT_FOUND}; \
             if [ -f {q} ]; then sha256sum -- {q} | cut -d' ' -f1; fi",
            Self::containment_prologue(&rel)
        );
        let (code, stdout, _stderr) = self.run_script(runtime_id, script).await?;
        if code != 0 {
            return Err(self.map_script_failure(&container.id, path, code));
        }

        let text = String::from_utf8_lossy(&stdout);
        let mut lines = text.lines();
        let stat_line = lines
            .next()
            .ok_or_else(|| Error::internal("stat produced no output"))?;
        let hash = lines.next().unwrap_or("").trim().to_string();
        let info = parse_stat_line(&contained, stat_line, &hash)?;
        self.audit.fs_op("stat", &container.id, &contained);
        Ok(info)
    }

    // =========================================================================
    // read
    // =========================================================================

    /// Reads a regular file. Binary-safe: content rides the daemon's tar
    /// endpoint, not a shell pipe.
    pub async fn read(&self, container: &ContainerRecord, path: &str) -> Result<ReadResult> {
        let contained = self.contain(path)?;
        let rel = self.rel(&contained);
        let runtime_id = self.runtime_id(container)?;
        let q = shell_quote(&rel);

        // Resolve + type-check + mtime in one helper round trip.
        let script = format!(
            "{}test -f {q} || exit {EXIT_NOT_FOUND}; stat -c '%Y' -- {q}",
            Self::containment_prologue(&rel)
        );
        let (code, stdout, _) = self.run_script(runtime_id, script).await?;
        if code != 0 {
            return Err(self.map_script_failure(&container.id, path, code));
        }
        let mtime_secs: i64 = String::from_utf8_lossy(&stdout)
            .trim()
            .parse()
            .map_err(|_| Error::internal("unparseable stat mtime"))?;

        let tar_bytes = self.runtime.copy_out(runtime_id, &contained).await?;
        let content = extract_single_file(&tar_bytes)
            .ok_or_else(|| Error::PathNotFound(contained.clone()))?;

        let mtime = Utc
            .timestamp_opt(mtime_secs, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let etag = compute_etag(
            content.len() as u64,
            mtime_secs * 1_000_000_000,
            &sha256_hex(&content),
        );
        self.audit.fs_op("read", &container.id, &contained);
        Ok(ReadResult {
            info: FileInfo {
                path: contained.clone(),
                size: content.len() as u64,
                is_dir: false,
                mode: String::new(),
                mtime,
                etag,
                mime_type: guess_mime(&contained),
            },
            content,
        })
    }

    // =========================================================================
    // write
    // =========================================================================

    /// Writes a file atomically (stage + rename). With `if_match_etag`,
    /// fails `etag_conflict` unless the current content matches; a missing
    /// file satisfies any expectation (the write creates it).
    pub async fn write(
        &self,
        container: &ContainerRecord,
        path: &str,
        content: &[u8],
        if_match_etag: Option<&str>,
    ) -> Result<(String, u64)> {
        let contained = self.contain(path)?;
        if contained == self.mount {
            return Err(Error::PathViolation {
                path: path.to_string(),
                reason: "cannot write the workspace root".to_string(),
            });
        }
        let runtime_id = self.runtime_id(container)?;

        if let Some(expected) = if_match_etag {
            match self.stat(container, &contained).await {
                Ok(info) => {
                    if info.etag != expected {
                        return Err(Error::EtagConflict { path: contained });
                    }
                }
                Err(Error::PathNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let (parent, file_name) = split_parent(&contained, &self.mount);
        let parent_rel = self.rel(&parent);
        let stage_name = format!(".devbench-stage-{}", uuid::Uuid::now_v7().simple());

        // Parent directories are created on request, then re-checked for
        // symlink escape before anything lands in them.
        let mkdir = format!(
            "mkdir -p -- {q} || exit {EXIT_NOT_FOUND}; {}true",
            Self::containment_prologue(&parent_rel),
            q = shell_quote(&parent_rel),
        );
        let (code, _, _) = self.run_script(runtime_id, mkdir).await?;
        if code != 0 {
            return Err(self.map_script_failure(&container.id, path, code));
        }

        let tar_bytes = single_file_tar(&stage_name, content, self.security.uid, self.security.gid)?;
        self.runtime.copy_in(runtime_id, &parent, tar_bytes).await?;

        let rename = format!(
            "cd -- {parent_q} || exit {EXIT_NOT_FOUND}; \
             mv -f -- {stage_q} {final_q} || {{ rm -f -- {stage_q}; exit {EXIT_NOT_FOUND}; }}; \
             stat -c '%Y' -- {final_q}",
            parent_q = shell_quote(&parent_rel),
            stage_q = shell_quote(&stage_name),
            final_q = shell_quote(&file_name),
        );
        let (code, stdout, stderr) = self.run_script(runtime_id, rename).await?;
        if code != 0 {
            warn!(path = %contained, stderr = %String::from_utf8_lossy(&stderr), "staged rename failed");
            return Err(Error::RuntimeError(format!(
                "write to '{contained}' failed during rename"
            )));
        }
        let mtime_secs: i64 = String::from_utf8_lossy(&stdout)
            .trim()
            .parse()
            .unwrap_or_default();

        let etag = compute_etag(
            content.len() as u64,
            mtime_secs * 1_000_000_000,
            &sha256_hex(content),
        );
        self.audit.fs_op("write", &container.id, &contained);
        Ok((etag, content.len() as u64))
    }

    // =========================================================================
    // delete
    // =========================================================================

    /// Deletes a file, or a directory when `recursive` is set.
    pub async fn delete(
        &self,
        container: &ContainerRecord,
        path: &str,
        recursive: bool,
    ) -> Result<()> {
        let contained = self.contain(path)?;
        if contained == self.mount {
            return Err(Error::PathViolation {
                path: path.to_string(),
                reason: "cannot delete the workspace root".to_string(),
            });
        }
        let rel = self.rel(&contained);
        let runtime_id = self.runtime_id(container)?;
        let q = shell_quote(&rel);

        let rm = if recursive { "rm -rf" } else { "rm -f" };
        let script = format!(
            "{}test -e {q} || test -L {q} || exit {EXIT_NOT_FOUND}; \
             if [ -d {q} ] && [ ! -L {q} ] && [ {recursive} -eq 0 ]; then exit 5; fi; \
             {rm} -- {q}",
            Self::containment_prologue(&rel),
            recursive = if recursive { 1 } else { 0 },
        );
        let (code, _, _) = self.run_script(runtime_id, script).await?;
        match code {
            0 => {
                self.audit.fs_op("delete", &container.id, &contained);
                Ok(())
            }
            5 => Err(Error::PathViolation {
                path: contained,
                reason: "directory delete requires recursive=true".to_string(),
            }),
            c => Err(self.map_script_failure(&container.id, path, c)),
        }
    }

    // =========================================================================
    // list
    // =========================================================================

    /// Lists a directory with stat-level metadata per entry.
    pub async fn list(&self, container: &ContainerRecord, path: &str) -> Result<Vec<FileInfo>> {
        let contained = self.contain(path)?;
        let rel = self.rel(&contained);
        let runtime_id = self.runtime_id(container)?;
        let q = shell_quote(&rel);

        let script = format!(
            "{}test -d {q} || exit {EXIT_NOT_FOUND}; cd -- {q} || exit {EXIT_NOT_FOUND}; \
             find . -maxdepth 1 -mindepth 1 -printf '%f|%s|%m|%T@|%y\\n'; \
             echo '---'; \
             find . -maxdepth 1 -mindepth 1 -type f -exec sha256sum -- {{}} + 2>/dev/null; \
             true",
            Self::containment_prologue(&rel)
        );
        let (code, stdout, _) = self.run_script(runtime_id, script).await?;
        if code != 0 {
            return Err(self.map_script_failure(&container.id, path, code));
        }

        let text = String::from_utf8_lossy(&stdout);
        let (listing, hashes) = text.split_once("---").unwrap_or((text.as_ref(), ""));

        let mut hash_by_name: HashMap<String, String> = HashMap::new();
        for line in hashes.lines().filter(|l| !l.trim().is_empty()) {
            if let Some((hash, name)) = line.split_once("  ") {
                let name = name.trim().trim_start_matches("./").to_string();
                hash_by_name.insert(name, hash.trim().to_string());
            }
        }

        let mut entries = Vec::new();
        for line in listing.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.splitn(5, '|').collect();
            if parts.len() != 5 {
                continue;
            }
            let name = parts[0];
            let size: u64 = parts[1].parse().unwrap_or(0);
            let mode = parts[2].to_string();
            let mtime_secs = parts[3]
                .split('.')
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let is_dir = parts[4] == "d";
            let entry_path = format!("{contained}/{name}");
            let hash = hash_by_name.get(name).map(String::as_str).unwrap_or("");
            entries.push(FileInfo {
                path: entry_path.clone(),
                size: if is_dir { 0 } else { size },
                is_dir,
                mode,
                mtime: Utc
                    .timestamp_opt(mtime_secs, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                etag: compute_etag(size, mtime_secs * 1_000_000_000, hash),
                mime_type: (!is_dir).then(|| guess_mime(&entry_path)).flatten(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        self.audit.fs_op("list", &container.id, &contained);
        Ok(entries)
    }

    // =========================================================================
    // tar export / import
    // =========================================================================

    /// Exports a subtree as a tar archive, filtered by server-side globs.
    pub async fn tar_export(
        &self,
        container: &ContainerRecord,
        path: &str,
        include_globs: &[String],
        exclude_globs: &[String],
    ) -> Result<Vec<u8>> {
        let contained = self.contain(path)?;
        let runtime_id = self.runtime_id(container)?;

        // Resolve-and-verify before touching the archive endpoint.
        let rel = self.rel(&contained);
        let script = format!("{}true", Self::containment_prologue(&rel));
        let (code, _, _) = self.run_script(runtime_id, script).await?;
        if code != 0 {
            return Err(self.map_script_failure(&container.id, path, code));
        }

        let raw = self.runtime.copy_out(runtime_id, &contained).await?;
        let include = build_globset(include_globs, true)?;
        let exclude = build_globset(exclude_globs, false)?;
        let filtered = filter_tar(&raw, &include, &exclude)?;

        self.audit.tar_export(&container.id, &contained, filtered.len());
        Ok(filtered)
    }

    /// Imports a tar archive (optionally gzip-compressed) under `dest`.
    /// Entries are validated to stay inside the destination, staged, and
    /// renamed into place; a partial failure rolls the staging directory
    /// back.
    pub async fn tar_import(
        &self,
        container: &ContainerRecord,
        dest: &str,
        archive: &[u8],
    ) -> Result<ImportSummary> {
        let decompressed;
        let tar_bytes: &[u8] = if archive.starts_with(&[0x1f, 0x8b]) {
            decompressed = gunzip_bounded(archive, MAX_TAR_IMPORT_BYTES)?;
            &decompressed
        } else {
            archive
        };
        if tar_bytes.len() as u64 > MAX_TAR_IMPORT_BYTES {
            return Err(Error::RuntimeError(format!(
                "tar archive exceeds import limit of {MAX_TAR_IMPORT_BYTES} bytes"
            )));
        }
        let contained = self.contain(dest)?;
        let runtime_id = self.runtime_id(container)?;

        let summary = validate_import_archive(tar_bytes)?;
        let top_level = top_level_names(tar_bytes)?;

        // Stage under the destination's parent so the final rename is a
        // same-filesystem move.
        let dest_rel = self.rel(&contained);
        let stage_name = format!(".devbench-import-{}", uuid::Uuid::now_v7().simple());
        let stage_abs = format!("{}/{stage_name}", self.mount);

        let prep = format!(
            "mkdir -p -- {dest_q} {stage_q} || exit {EXIT_NOT_FOUND}; {}true",
            Self::containment_prologue(&dest_rel),
            dest_q = shell_quote(&dest_rel),
            stage_q = shell_quote(&stage_name),
        );
        let (code, _, _) = self.run_script(runtime_id, prep).await?;
        if code != 0 {
            return Err(self.map_script_failure(&container.id, dest, code));
        }

        if let Err(e) = self
            .runtime
            .copy_in(runtime_id, &stage_abs, tar_bytes.to_vec())
            .await
        {
            self.rollback_staging(runtime_id, &stage_name).await;
            return Err(e);
        }

        let mut moves = String::new();
        for name in &top_level {
            moves.push_str(&format!(
                "mv -f -- {}/{} {}/ || exit 5; ",
                shell_quote(&stage_name),
                shell_quote(name),
                shell_quote(&dest_rel),
            ));
        }
        let finish = format!("{moves}rmdir -- {} 2>/dev/null; true", shell_quote(&stage_name));
        let (code, _, stderr) = self.run_script(runtime_id, finish).await?;
        if code != 0 {
            warn!(dest = %contained, stderr = %String::from_utf8_lossy(&stderr), "tar import move failed; rolling back");
            self.rollback_staging(runtime_id, &stage_name).await;
            return Err(Error::RuntimeError(format!(
                "tar import into '{contained}' failed; staging rolled back"
            )));
        }

        self.audit
            .tar_import(&container.id, &contained, summary.entries);
        Ok(summary)
    }

    async fn rollback_staging(&self, runtime_id: &str, stage_name: &str) {
        let script = format!("rm -rf -- {}", shell_quote(stage_name));
        if let Err(e) = self.run_script(runtime_id, script).await {
            warn!(stage = %stage_name, error = %e, "staging rollback failed");
        }
    }

    // =========================================================================
    // batch
    // =========================================================================

    /// Runs grouped single-file operations. All paths and ETag
    /// preconditions are validated before the first mutation; the batch
    /// fails fast and rolls written/deleted files back best-effort.
    pub async fn batch(
        &self,
        container: &ContainerRecord,
        ops: &[BatchOp],
    ) -> Result<Vec<BatchOutcome>> {
        // Validate every path up front.
        for op in ops {
            self.contain(op.path())?;
        }
        // Validate every ETag precondition up front (fail fast).
        for op in ops {
            if let BatchOp::Write {
                path,
                if_match_etag: Some(expected),
                ..
            } = op
            {
                match self.stat(container, path).await {
                    Ok(info) if &info.etag != expected => {
                        return Err(Error::EtagConflict { path: path.clone() })
                    }
                    Ok(_) | Err(Error::PathNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let mut outcomes = Vec::new();
        let mut rollback: Vec<(String, Option<Vec<u8>>)> = Vec::new();

        for op in ops {
            let result = self.apply_batch_op(container, op, &mut rollback).await;
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    self.rollback_batch(container, &rollback).await;
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }

    async fn apply_batch_op(
        &self,
        container: &ContainerRecord,
        op: &BatchOp,
        rollback: &mut Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<BatchOutcome> {
        match op {
            BatchOp::Read { path } => Ok(BatchOutcome::Read(self.read(container, path).await?)),
            BatchOp::Write {
                path,
                content,
                if_match_etag,
            } => {
                let original = match self.read(container, path).await {
                    Ok(r) => Some(r.content),
                    Err(Error::PathNotFound(_)) => None,
                    Err(e) => return Err(e),
                };
                rollback.push((path.clone(), original));
                let (etag, size) = self
                    .write(container, path, content, if_match_etag.as_deref())
                    .await?;
                Ok(BatchOutcome::Written { etag, size })
            }
            BatchOp::Delete { path, recursive } => {
                let original = match self.read(container, path).await {
                    Ok(r) => Some(r.content),
                    Err(_) => None,
                };
                rollback.push((path.clone(), original));
                self.delete(container, path, *recursive).await?;
                Ok(BatchOutcome::Deleted)
            }
        }
    }

    async fn rollback_batch(
        &self,
        container: &ContainerRecord,
        rollback: &[(String, Option<Vec<u8>>)],
    ) {
        for (path, original) in rollback.iter().rev() {
            let result = match original {
                Some(content) => self
                    .write(container, path, content, None)
                    .await
                    .map(|_| ()),
                None => match self.delete(container, path, false).await {
                    Err(Error::PathNotFound(_)) => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = result {
                warn!(%path, error = %e, "batch rollback step failed");
            }
        }
        debug!("batch rolled back");
    }
}

// =============================================================================
// Tar Helpers
// =============================================================================

/// Decompresses a gzip stream, refusing to inflate past `limit` (guards
/// against compression bombs).
fn gunzip_bounded(compressed: &[u8], limit: u64) -> Result<Vec<u8>> {
    let decoder = flate2::read::GzDecoder::new(compressed);
    let mut out = Vec::new();
    let mut bounded = decoder.take(limit + 1);
    bounded.read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(Error::RuntimeError(format!(
            "archive inflates past the import limit of {limit} bytes"
        )));
    }
    Ok(out)
}

/// Builds a tar archive holding one regular file.
fn single_file_tar(name: &str, content: &[u8], uid: u32, gid: u32) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_uid(uid.into());
    header.set_gid(gid.into());
    header.set_cksum();
    builder.append_data(&mut header, name, content)?;
    builder.into_inner().map_err(Error::from)
}

/// Extracts the first regular-file entry from an archive.
fn extract_single_file(tar_bytes: &[u8]) -> Option<Vec<u8>> {
    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).ok()?;
            return Some(content);
        }
    }
    None
}

fn build_globset(patterns: &[String], default_match_all: bool) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(if default_match_all { None } else { Some(GlobSet::empty()) });
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| Error::RuntimeError(format!(
            "invalid glob '{pattern}': {e}"
        )))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::RuntimeError(format!("glob set: {e}")))
}

/// Rebuilds an export archive keeping directories plus the file/link
/// entries selected by the glob sets. Globs are evaluated against paths
/// relative to the export root.
fn filter_tar(raw: &[u8], include: &Option<GlobSet>, exclude: &Option<GlobSet>) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(raw);
    let mut builder = tar::Builder::new(Vec::new());

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        // The daemon roots the archive at the exported basename.
        let rel: PathBuf = path.components().skip(1).collect();
        let keep = if entry.header().entry_type().is_dir() {
            true
        } else {
            let included = include.as_ref().map(|g| g.is_match(&rel)).unwrap_or(true);
            let excluded = exclude.as_ref().map(|g| g.is_match(&rel)).unwrap_or(false);
            included && !excluded
        };
        if !keep {
            continue;
        }
        let mut header = entry.header().clone();
        if header.entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            builder.append_data(&mut header, &path, &content[..])?;
        } else {
            builder.append_data(&mut header, &path, std::io::empty())?;
        }
    }
    builder.into_inner().map_err(Error::from)
}

/// Validates an import archive: no absolute entry paths, no `..`
/// segments, no symlinks with absolute or escaping targets.
fn validate_import_archive(tar_bytes: &[u8]) -> Result<ImportSummary> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut entries = 0usize;
    let mut bytes = 0u64;

    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        let display = path.display().to_string();

        if path.is_absolute() {
            return Err(Error::PathViolation {
                path: display,
                reason: "absolute entry path".to_string(),
            });
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::PathViolation {
                path: display,
                reason: "entry path contains '..'".to_string(),
            });
        }
        if entry.header().entry_type().is_symlink() {
            let target = entry
                .link_name()?
                .ok_or_else(|| Error::PathViolation {
                    path: display.clone(),
                    reason: "symlink without target".to_string(),
                })?
                .into_owned();
            if target.is_absolute() {
                return Err(Error::PathViolation {
                    path: display,
                    reason: "symlink with absolute target".to_string(),
                });
            }
            if link_escapes(&path, &target) {
                return Err(Error::PathViolation {
                    path: display,
                    reason: "symlink target escapes the destination".to_string(),
                });
            }
        }
        entries += 1;
        bytes += entry.size();
    }
    Ok(ImportSummary { entries, bytes })
}

/// Whether a relative symlink, resolved from the entry's directory,
/// escapes the archive root.
fn link_escapes(entry_path: &Path, target: &Path) -> bool {
    let mut depth: i64 = entry_path.components().count() as i64 - 1;
    for component in target.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return true;
        }
    }
    false
}

/// First-level names in an archive, in first-seen order.
fn top_level_names(tar_bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        if let Some(Component::Normal(first)) = path.components().next() {
            let name = first.to_string_lossy().into_owned();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

fn parse_stat_line(contained: &str, line: &str, hash: &str) -> Result<FileInfo> {
    let parts: Vec<&str> = line.trim().splitn(4, '|').collect();
    if parts.len() != 4 {
        return Err(Error::internal(format!("unparseable stat line '{line}'")));
    }
    let size: u64 = parts[0].parse().unwrap_or(0);
    let mode = parts[1].to_string();
    let mtime_secs: i64 = parts[2].parse().unwrap_or(0);
    let is_dir = parts[3].to_ascii_lowercase().contains("directory");

    Ok(FileInfo {
        path: contained.to_string(),
        size: if is_dir { 0 } else { size },
        is_dir,
        mode,
        mtime: Utc
            .timestamp_opt(mtime_secs, 0)
            .single()
            .unwrap_or_else(Utc::now),
        etag: compute_etag(size, mtime_secs * 1_000_000_000, hash),
        mime_type: (!is_dir).then(|| guess_mime(contained)).flatten(),
    })
}

/// Splits a contained path into `(parent_dir, file_name)`.
fn split_parent(contained: &str, mount: &str) -> (String, String) {
    match contained.rsplit_once('/') {
        Some((parent, name)) if !parent.is_empty() => (parent.to_string(), name.to_string()),
        _ => (mount.to_string(), contained.trim_start_matches('/').to_string()),
    }
}
