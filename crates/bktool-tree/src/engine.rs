//! Backup engine: drive key derivation, metadata and tree replication for a run
//!
//! - `backup`: derive a key with a fresh salt, write `bktool-backup.info`, then
//!   replicate every source into `<run root>/<source name>` encrypted
//! - `restore`: read the metadata, re-derive the key, replicate each recorded
//!   source back out decrypted
//! - `verify`: authenticate every file of a backup without writing anything
//!
//! With `workers != 1` top-level sources run on a rayon pool, each worker with
//! its own `StreamCipher` built from its own copy of the key.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bktool_core::config::{validate_source_dirs, BktoolConfig};
use bktool_core::{BkError, BkResult, EntryKind, FailurePolicy, Mode};
use bktool_crypto::{
    derive_key, BackupMetadata, DerivedKey, KdfParams, StreamCipher, KEY_SIZE, METADATA_FILE,
};
use rayon::prelude::*;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::attrs::{self, Attributes};
use crate::replicate::{ensure_dir, EntryFailure, ProgressFn, ReplicateReport, Replicator};

/// Knobs shared by every run type
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub policy: FailurePolicy,
    /// Copy uid/gid onto replicated entries
    pub preserve_ownership: bool,
    /// 0 = one worker per CPU, 1 = sequential
    pub workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::BestEffort,
            preserve_ownership: true,
            workers: 1,
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &BktoolConfig) -> Self {
        Self {
            policy: config.run.failure_policy(),
            preserve_ownership: config.run.preserve_ownership,
            workers: config.run.workers,
        }
    }
}

/// Everything a backup run needs besides the passphrase.
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub sources: Vec<PathBuf>,
    /// Where run roots are created
    pub destination: PathBuf,
    pub timestamped: bool,
    pub kdf: KdfParams,
    pub chunk_size: u32,
    pub options: RunOptions,
}

impl BackupPlan {
    pub fn from_config(config: &BktoolConfig) -> Self {
        Self {
            sources: config.directories.clone(),
            destination: config.destination.clone(),
            timestamped: config.timestamped,
            kdf: KdfParams::from(&config.crypto),
            chunk_size: config.crypto.chunk_size,
            options: RunOptions::from_config(config),
        }
    }
}

/// Everything a restore run needs besides the passphrase.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// A directory holding `bktool-backup.info`
    pub backup_root: PathBuf,
    /// Each source is restored to `<target>/<name>`
    pub target: PathBuf,
    pub options: RunOptions,
}

/// Outcome of one top-level source
#[derive(Debug)]
pub struct SourceReport {
    pub name: String,
    pub source: PathBuf,
    /// Replica root; equal to `source` for verification
    pub dest: PathBuf,
    pub outcome: BkResult<ReplicateReport>,
}

impl SourceReport {
    pub fn bytes(&self) -> u64 {
        self.outcome.as_ref().map(|r| r.bytes).unwrap_or(0)
    }
}

/// Outcome of a whole run; plain numbers for the caller to format.
#[derive(Debug)]
pub struct RunReport {
    /// Backup root written (backup) or read (restore, verify)
    pub root: PathBuf,
    pub sources: Vec<SourceReport>,
    pub elapsed: Duration,
}

impl RunReport {
    /// Plaintext bytes of every file processed successfully
    pub fn bytes(&self) -> u64 {
        self.sources.iter().map(SourceReport::bytes).sum()
    }

    pub fn files(&self) -> u64 {
        self.completed().map(|r| r.files).sum()
    }

    /// Plaintext bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes() as f64 / secs
        } else {
            0.0
        }
    }

    /// Entries skipped across all sources
    pub fn failures(&self) -> impl Iterator<Item = &EntryFailure> {
        self.completed().flat_map(|r| r.failures.iter())
    }

    /// Sources that could not be processed at all
    pub fn failed_sources(&self) -> impl Iterator<Item = (&SourceReport, &BkError)> {
        self.sources
            .iter()
            .filter_map(|s| s.outcome.as_ref().err().map(|e| (s, e)))
    }

    /// The run finished but not everything made it.
    pub fn is_partial(&self) -> bool {
        self.failures().next().is_some() || self.failed_sources().next().is_some()
    }

    fn completed(&self) -> impl Iterator<Item = &ReplicateReport> {
        self.sources.iter().filter_map(|s| s.outcome.as_ref().ok())
    }
}

/// Name of a timestamped run directory, e.g. `backup-2026-10-18T09:30:00+0200`.
pub fn run_dir_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("backup-{}", now.format("%Y-%m-%dT%H:%M:%S%z"))
}

/// Name a source gets inside the backup root: its last path component.
pub fn source_name(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct Job {
    name: String,
    source: PathBuf,
    /// None verifies `source` in place
    dest: Option<PathBuf>,
}

/// Encrypt every source of `plan` into a new backup root.
pub fn backup(
    plan: &BackupPlan,
    passphrase: &SecretString,
    progress: Option<&ProgressFn>,
) -> BkResult<RunReport> {
    validate_source_dirs(&plan.sources)?;
    plan.kdf
        .check()
        .map_err(|e| BkError::Config(format!("crypto settings: {e}")))?;
    for src in &plan.sources {
        let meta = fs::metadata(src).map_err(|e| BkError::io(src, e))?;
        if !meta.is_dir() {
            return Err(BkError::Config(format!("not a directory: {}", src.display())));
        }
    }

    let root = if plan.timestamped {
        plan.destination.join(run_dir_name(chrono::Local::now()))
    } else {
        plan.destination.clone()
    };
    let names: Vec<String> = plan.sources.iter().map(|s| source_name(s)).collect();
    check_disjoint(&plan.sources, &names, &root)?;
    ensure_dir(&root)?;

    let start = Instant::now();
    let (key, salt) = derive_key(passphrase, None, KEY_SIZE, &plan.kdf)?;
    // A bad chunk size fails here, before the metadata is written
    build_cipher(&key, Mode::Encrypt, plan.chunk_size)?;

    BackupMetadata::new(&salt, plan.kdf, plan.chunk_size, names.clone()).write(&root)?;
    info!(root = %root.display(), sources = names.len(), "backup started");

    let jobs: Vec<Job> = names
        .into_iter()
        .zip(&plan.sources)
        .map(|(name, source)| Job {
            dest: Some(root.join(&name)),
            name,
            source: source.clone(),
        })
        .collect();
    let sources = run_jobs(&jobs, &key, Mode::Encrypt, plan.chunk_size, &plan.options, progress)?;

    let report = RunReport {
        root,
        sources,
        elapsed: start.elapsed(),
    };
    log_completed("backup", &report);
    Ok(report)
}

/// Decrypt a backup root into `plan.target/<source name>`.
pub fn restore(
    plan: &RestorePlan,
    passphrase: &SecretString,
    progress: Option<&ProgressFn>,
) -> BkResult<RunReport> {
    let meta = BackupMetadata::read(&plan.backup_root)?;
    let names = recorded_sources(&plan.backup_root, &meta)?;

    let start = Instant::now();
    let key = rederive_key(&meta, passphrase)?;
    ensure_dir(&plan.target)?;
    info!(
        backup = %plan.backup_root.display(),
        target = %plan.target.display(),
        sources = names.len(),
        "restore started"
    );

    let jobs: Vec<Job> = names
        .into_iter()
        .map(|name| Job {
            source: plan.backup_root.join(&name),
            dest: Some(plan.target.join(&name)),
            name,
        })
        .collect();
    let sources = run_jobs(
        &jobs,
        &key,
        Mode::Decrypt,
        meta.cipher.chunk_size,
        &plan.options,
        progress,
    )?;

    let report = RunReport {
        root: plan.backup_root.clone(),
        sources,
        elapsed: start.elapsed(),
    };
    log_completed("restore", &report);
    Ok(report)
}

/// Authenticate every encrypted file under a backup root; nothing is written.
pub fn verify(
    backup_root: &Path,
    passphrase: &SecretString,
    options: &RunOptions,
    progress: Option<&ProgressFn>,
) -> BkResult<RunReport> {
    let meta = BackupMetadata::read(backup_root)?;
    let names = recorded_sources(backup_root, &meta)?;

    let start = Instant::now();
    let key = rederive_key(&meta, passphrase)?;

    let jobs: Vec<Job> = names
        .into_iter()
        .map(|name| Job {
            source: backup_root.join(&name),
            dest: None,
            name,
        })
        .collect();
    let sources = run_jobs(&jobs, &key, Mode::Decrypt, meta.cipher.chunk_size, options, progress)?;

    let report = RunReport {
        root: backup_root.to_path_buf(),
        sources,
        elapsed: start.elapsed(),
    };
    log_completed("verify", &report);
    Ok(report)
}

/// Every replica `<root>/<name>` must lie outside its source and the source
/// outside its replica, or the walk would copy its own output.
fn check_disjoint(sources: &[PathBuf], names: &[String], root: &Path) -> BkResult<()> {
    let root = resolve_path(root)?;
    for (source, name) in sources.iter().zip(names) {
        let source = fs::canonicalize(source).map_err(|e| BkError::io(source, e))?;
        let replica = root.join(name);
        if replica.starts_with(&source) || source.starts_with(&replica) {
            return Err(BkError::Config(format!(
                "backup destination {} overlaps source {}",
                replica.display(),
                source.display()
            )));
        }
    }
    Ok(())
}

/// Canonical form of `path`, which need not exist yet: the deepest existing
/// ancestor is canonicalized and the missing components appended.
fn resolve_path(path: &Path) -> BkResult<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        match fs::canonicalize(existing) {
            Ok(mut resolved) => {
                resolved.extend(missing.iter().rev());
                return Ok(resolved);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(BkError::io(path, e));
                };
                missing.push(name);
                existing = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
            }
            Err(e) => return Err(BkError::io(existing, e)),
        }
    }
}

fn rederive_key(meta: &BackupMetadata, passphrase: &SecretString) -> BkResult<DerivedKey> {
    let salt = meta.salt()?;
    let (key, _) = derive_key(passphrase, Some(&salt), KEY_SIZE, &meta.kdf_params())?;
    Ok(key)
}

/// Source names to process: the ones recorded in the metadata, or every
/// directory of the backup root for records that carry none.
fn recorded_sources(root: &Path, meta: &BackupMetadata) -> BkResult<Vec<String>> {
    if !meta.sources.is_empty() {
        return Ok(meta.sources.clone());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| BkError::io(root, e))? {
        let entry = entry.map_err(|e| BkError::io(root, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| BkError::io(entry.path(), e))?
            .is_dir();
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_dir && name != METADATA_FILE {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn build_cipher(key: &DerivedKey, mode: Mode, chunk_size: u32) -> BkResult<StreamCipher> {
    let cipher = match mode {
        Mode::Encrypt => StreamCipher::new_for_encryption(key.clone())?,
        Mode::Decrypt => StreamCipher::new_for_decryption(key.clone())?,
    };
    cipher.with_chunk_size(chunk_size)
}

/// Run every job, sequentially or on a rayon pool, each with its own cipher.
/// Under `FailFast` the first failed source fails the run.
fn run_jobs(
    jobs: &[Job],
    key: &DerivedKey,
    mode: Mode,
    chunk_size: u32,
    options: &RunOptions,
    progress: Option<&ProgressFn>,
) -> BkResult<Vec<SourceReport>> {
    let run_one = |job: &Job| -> SourceReport {
        let outcome = build_cipher(key, mode, chunk_size)
            .and_then(|cipher| run_source(&cipher, job, options, progress));
        if let Err(e) = &outcome {
            warn!(source = %job.source.display(), kind = e.kind(), error = %e, "source failed");
        }
        SourceReport {
            name: job.name.clone(),
            source: job.source.clone(),
            dest: job.dest.clone().unwrap_or_else(|| job.source.clone()),
            outcome,
        }
    };

    let reports: Vec<SourceReport> = if options.workers == 1 || jobs.len() < 2 {
        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs {
            let report = run_one(job);
            let abort = report.outcome.is_err() && options.policy == FailurePolicy::FailFast;
            reports.push(report);
            if abort {
                break;
            }
        }
        reports
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("bktool-worker-{i}"))
            .build()
            .map_err(|e| BkError::Config(format!("building worker pool: {e}")))?;
        pool.install(|| jobs.par_iter().map(run_one).collect())
    };

    if options.policy == FailurePolicy::FailFast && reports.iter().any(|r| r.outcome.is_err()) {
        return Err(first_error(reports));
    }
    Ok(reports)
}

/// The first failed outcome in `reports`, as an entry error.
fn first_error(reports: Vec<SourceReport>) -> BkError {
    for report in reports {
        if let Err(err) = report.outcome {
            return match err {
                BkError::Entry { .. } => err,
                other => BkError::entry(&report.source, other),
            };
        }
    }
    BkError::Config("no failed source".into())
}

fn run_source(
    cipher: &StreamCipher,
    job: &Job,
    options: &RunOptions,
    progress: Option<&ProgressFn>,
) -> BkResult<ReplicateReport> {
    let replicator = Replicator::new(cipher)
        .with_policy(options.policy)
        .with_ownership(options.preserve_ownership)
        .with_progress(progress);

    let Some(dest) = &job.dest else {
        return replicator.verify(&job.source);
    };

    let mut report = replicator.replicate(&job.source, dest)?;
    // The source root's own attributes go on last, like every other directory
    let root_attrs = fs::metadata(&job.source)
        .map_err(|e| BkError::io(&job.source, e))
        .and_then(|meta| {
            attrs::apply(
                dest,
                &Attributes::of(&meta),
                EntryKind::Directory,
                options.preserve_ownership,
            )
        });
    if let Err(e) = root_attrs {
        if options.policy == FailurePolicy::FailFast {
            return Err(BkError::entry(dest, e));
        }
        warn!(path = %dest.display(), error = %e, "could not copy root attributes");
        report.failures.push(EntryFailure {
            path: job.source.clone(),
            kind: e.kind(),
            message: e.to_string(),
        });
    }
    Ok(report)
}

fn log_completed(op: &str, report: &RunReport) {
    info!(
        op,
        root = %report.root.display(),
        bytes = report.bytes(),
        files = report.files(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        partial = report.is_partial(),
        "run completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_dir_name_format() {
        let now = chrono::Local.with_ymd_and_hms(2026, 10, 18, 9, 30, 5).unwrap();
        let name = run_dir_name(now);
        let stamp = "backup-2026-10-18T09:30:05";
        assert!(name.starts_with(stamp), "{name}");
        // Numeric UTC offset, e.g. +0200
        let offset = &name[stamp.len()..];
        assert_eq!(offset.len(), 5);
        assert!(offset.starts_with('+') || offset.starts_with('-'));
    }

    #[test]
    fn test_source_name() {
        assert_eq!(source_name(Path::new("/home/me/docs")), "docs");
        assert_eq!(source_name(Path::new("/srv/data/")), "data");
    }

    #[test]
    fn test_resolve_path_missing_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let base = fs::canonicalize(tmp.path()).unwrap();
        fs::create_dir(base.join("real")).unwrap();
        std::os::unix::fs::symlink(base.join("real"), base.join("alias")).unwrap();

        let resolved = resolve_path(&base.join("alias/not/yet")).unwrap();
        assert_eq!(resolved, base.join("real/not/yet"));
        assert_eq!(resolve_path(&base.join("real")).unwrap(), base.join("real"));
    }

    #[test]
    fn test_check_disjoint() {
        let tmp = tempfile::tempdir().unwrap();
        let base = fs::canonicalize(tmp.path()).unwrap();
        let data = base.join("data");
        fs::create_dir(&data).unwrap();
        let names = vec!["data".to_string()];
        let sources = vec![data.clone()];

        // Destination inside the source, existing or not
        let inside = check_disjoint(&sources, &names, &data.join("zz-backups")).unwrap_err();
        assert_eq!(inside.kind(), "config");
        assert!(check_disjoint(&sources, &names, &data).is_err());
        // Replica would land on the source itself
        assert!(check_disjoint(&sources, &names, &base).is_err());

        assert!(check_disjoint(&sources, &names, &base.join("backups")).is_ok());
    }

    #[test]
    fn test_report_partial() {
        let ok = SourceReport {
            name: "a".into(),
            source: "/a".into(),
            dest: "/b/a".into(),
            outcome: Ok(ReplicateReport {
                bytes: 10,
                files: 1,
                ..Default::default()
            }),
        };
        let mut report = RunReport {
            root: "/b".into(),
            sources: vec![ok],
            elapsed: Duration::from_secs(2),
        };
        assert!(!report.is_partial());
        assert_eq!(report.bytes(), 10);
        assert_eq!(report.throughput(), 5.0);

        report.sources.push(SourceReport {
            name: "c".into(),
            source: "/c".into(),
            dest: "/b/c".into(),
            outcome: Err(BkError::NotFound("/c".into())),
        });
        assert!(report.is_partial());
        assert_eq!(report.failed_sources().count(), 1);
        assert_eq!(report.bytes(), 10);
    }

    #[test]
    fn test_recorded_sources_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("zeta")).unwrap();
        fs::create_dir(root.join("alpha")).unwrap();
        fs::write(root.join("stray.txt"), b"x").unwrap();

        let mut meta = BackupMetadata::new(&[7u8; 16], KdfParams::default(), 65536, Vec::new());
        assert_eq!(recorded_sources(root, &meta).unwrap(), vec!["alpha", "zeta"]);

        meta.sources = vec!["zeta".into()];
        assert_eq!(recorded_sources(root, &meta).unwrap(), vec!["zeta"]);
    }
}
