/// Append-only execution audit log
///
/// One JSON line per execution, written by a dedicated thread. Records never
/// contain raw code or output unless `retain_content` is set. Each record
/// carries the hash of its predecessor, so any edit, deletion or reordering
/// of earlier lines is detectable with [`verify_chain`].
use crate::config::config::AuditConfig;
use crate::config::policy::PolicyProfile;
use crate::config::types::{
    ExecutionRequest, ExecutionResult, Result, SandboxError, StatusKind, TerminationReason,
};
use crate::observability::events;
use chrono::{SecondsFormat, Utc};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// `prev_hash` of the first record in a log
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub request_id: String,
    /// UTC, RFC 3339
    pub timestamp: String,
    pub runtime: String,
    /// SHA256 of the submitted artifact
    pub artifact_sha256: String,
    pub policy_name: Option<String>,
    pub policy_fingerprint: Option<String>,
    pub status_kind: StatusKind,
    pub termination_reason: Option<TerminationReason>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub peak_memory_bytes: Option<u64>,
    /// Request-level failure that prevented a result
    pub error: Option<String>,
    pub code: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub prev_hash: String,
    pub record_hash: String,
}

impl AuditRecord {
    /// Hash over the record with `record_hash` blanked
    fn compute_hash(&self) -> String {
        let mut unsealed = self.clone();
        unsealed.record_hash = String::new();
        let canonical = serde_json::to_vec(&unsealed).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }

    fn seal(&mut self, prev_hash: &str) {
        self.prev_hash = prev_hash.to_string();
        self.record_hash = self.compute_hash();
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

struct WriteJob {
    record: AuditRecord,
    ack: Sender<Result<AuditRecord>>,
}

/// Handle to the audit writer thread
pub struct AuditRecorder {
    tx: Sender<WriteJob>,
    path: PathBuf,
    timeout: Duration,
    retain_content: bool,
}

impl AuditRecorder {
    pub fn open(config: &AuditConfig) -> Result<Self> {
        let path = config.path.clone();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!(
                    "Failed to create audit directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let last_hash = last_record_hash(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                SandboxError::Config(format!("Failed to open audit log {}: {}", path.display(), e))
            })?;

        let (tx, rx) = unbounded::<WriteJob>();
        let writer_path = path.clone();
        thread::Builder::new()
            .name("codebox-audit".to_string())
            .spawn(move || {
                let mut writer = ChainWriter {
                    file,
                    path: writer_path,
                    last_hash,
                };
                for job in rx.iter() {
                    let _ = job.ack.send(writer.append(job.record));
                }
            })
            .map_err(|e| SandboxError::Config(format!("Failed to spawn audit writer: {}", e)))?;

        Ok(Self {
            tx,
            path,
            timeout: Duration::from_millis(config.timeout_ms),
            retain_content: config.retain_content,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a finished execution. Never fails the caller: a missing record
    /// is reported as an `AuditWriteFailed` security event instead.
    pub fn record(
        &self,
        request: &ExecutionRequest,
        profile: &PolicyProfile,
        result: &ExecutionResult,
    ) -> Option<AuditRecord> {
        let mut record = self.draft(request, Some(profile));
        record.status_kind = result.status_kind;
        record.termination_reason = Some(result.termination_reason.clone());
        record.exit_code = result.exit_code;
        record.signal = result.signal;
        record.duration_ms = result.wall_clock_ms;
        record.peak_memory_bytes = result.peak_memory_bytes;
        if self.retain_content {
            record.stdout = Some(result.stdout.clone());
            record.stderr = Some(result.stderr.clone());
        }
        self.submit(record)
    }

    /// Record a request that failed before producing a result
    pub fn record_failure(
        &self,
        request: &ExecutionRequest,
        profile: Option<&PolicyProfile>,
        err: &SandboxError,
    ) -> Option<AuditRecord> {
        let mut record = self.draft(request, profile);
        record.status_kind = err.status_kind();
        record.error = Some(format!("{}: {}", err.kind_name(), err));
        self.submit(record)
    }

    fn draft(&self, request: &ExecutionRequest, profile: Option<&PolicyProfile>) -> AuditRecord {
        AuditRecord {
            request_id: request.id().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            runtime: request.runtime().to_string(),
            artifact_sha256: sha256_hex(request.code()),
            policy_name: profile.map(|p| p.name().to_string()),
            policy_fingerprint: profile.map(PolicyProfile::fingerprint),
            status_kind: StatusKind::InfrastructureFailure,
            termination_reason: None,
            exit_code: None,
            signal: None,
            duration_ms: 0,
            peak_memory_bytes: None,
            error: None,
            code: self
                .retain_content
                .then(|| String::from_utf8_lossy(request.code()).into_owned()),
            stdout: None,
            stderr: None,
            prev_hash: String::new(),
            record_hash: String::new(),
        }
    }

    fn submit(&self, record: AuditRecord) -> Option<AuditRecord> {
        let request_id = record.request_id.clone();
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(WriteJob { record, ack: ack_tx }).is_err() {
            events::audit_write_failed(&request_id, "audit writer is not running");
            return None;
        }

        match ack_rx.recv_timeout(self.timeout) {
            Ok(Ok(record)) => {
                debug!("Audit record {} written", record.record_hash);
                Some(record)
            }
            Ok(Err(e)) => {
                events::audit_write_failed(&request_id, &e.to_string());
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                events::audit_write_failed(
                    &request_id,
                    &format!("no acknowledgement within {:?}", self.timeout),
                );
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                events::audit_write_failed(&request_id, "audit writer stopped");
                None
            }
        }
    }
}

struct ChainWriter {
    file: File,
    path: PathBuf,
    last_hash: String,
}

impl ChainWriter {
    fn append(&mut self, mut record: AuditRecord) -> Result<AuditRecord> {
        record.seal(&self.last_hash);
        let line = serde_json::to_string(&record)
            .map_err(|e| SandboxError::AuditWriteFailed(format!("serialize: {}", e)))?;

        writeln!(self.file, "{}", line)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| {
                error!("Failed to append to audit log {}: {}", self.path.display(), e);
                SandboxError::AuditWriteFailed(e.to_string())
            })?;

        self.last_hash = record.record_hash.clone();
        Ok(record)
    }
}

/// Hash to chain the next record onto
fn last_record_hash(path: &Path) -> Result<String> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(GENESIS_HASH.to_string()),
        Err(e) => return Err(SandboxError::Io(e)),
    };

    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }

    Ok(match last {
        None => GENESIS_HASH.to_string(),
        Some(line) => match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => record.record_hash,
            Err(e) => {
                warn!(
                    "Last audit line in {} is not a record ({}); chaining onto its raw hash",
                    path.display(),
                    e
                );
                sha256_hex(line.as_bytes())
            }
        },
    })
}

/// Outcome of a chain verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub records: usize,
    /// 1-based line number of the first record that does not verify
    pub broken_at: Option<usize>,
    pub reason: Option<String>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

/// Recompute the hash chain of an audit log
pub fn verify_chain(path: &Path) -> Result<ChainReport> {
    let file = File::open(path)?;
    let mut prev = GENESIS_HASH.to_string();
    let mut records = 0;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let broken = |reason: String| ChainReport {
            records,
            broken_at: Some(line_no),
            reason: Some(reason),
        };

        let record: AuditRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => return Ok(broken(format!("unparsable record: {}", e))),
        };
        if record.prev_hash != prev {
            return Ok(broken("prev_hash does not match the preceding record".to_string()));
        }
        if record.compute_hash() != record.record_hash {
            return Ok(broken("record_hash does not match record content".to_string()));
        }

        prev = record.record_hash;
        records += 1;
    }

    Ok(ChainReport {
        records,
        broken_at: None,
        reason: None,
    })
}
