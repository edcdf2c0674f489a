//! Preflight: environment gates run before anything is locked or written.
//!
//! Checks, in order, each stopping the run on failure:
//! 1. repository root exists, has `.git`, and matches `expected_repo_root`
//! 2. uncommitted changes (warning only)
//! 3. orchestrator version against `min_version`
//! 4. universe manifest and policy document load
//! 5. free disk bytes and inodes against the configured floors
//! 6. credential present and accepted by one real provider probe
//!
//! The evidence file is written whatever the outcome.

use crate::config::{OvernightConfig, RunPaths};
use crate::error::{ErrorCode, RunError};
use chrono::{DateTime, Utc};
use overnight_core::atomic::atomic_write_json;
use overnight_core::data::{BarProvider, ProbeOutcome, Universe};
use overnight_core::policy::PolicyDocument;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Symbols sampled into the evidence file.
const UNIVERSE_SAMPLE: usize = 5;

pub const WARN_GIT_DIRTY: &str = "GIT_DIRTY";
pub const WARN_GIT_UNAVAILABLE: &str = "GIT_STATUS_UNAVAILABLE";
pub const WARN_DISK_STAT_UNAVAILABLE: &str = "DISK_STAT_UNAVAILABLE";
pub const WARN_UNIVERSE_REJECTED: &str = "UNIVERSE_ENTRIES_REJECTED";

/// Everything preflight observed, for offline diagnosis.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightEvidence {
    pub run_id: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub ok: bool,
    pub repo_root: String,
    pub head_sha: Option<String>,
    pub git_dirty: Option<bool>,
    pub version: String,
    pub min_version: String,
    pub universe_path: String,
    pub universe_count: usize,
    pub universe_sample: Vec<String>,
    pub universe_rejected: usize,
    pub policy_hash: Option<String>,
    pub disk_free_bytes: Option<u64>,
    pub inodes_free: Option<u64>,
    pub min_free_bytes: u64,
    pub min_free_inodes: u64,
    pub credential_present: bool,
    pub credential_valid: Option<bool>,
    pub probe_status: Option<u16>,
    pub probe_error: Option<String>,
    pub rate_limit_headers: BTreeMap<String, String>,
    pub warnings: Vec<String>,
    pub error: Option<RunError>,
}

/// What a passing preflight hands to the run.
#[derive(Debug)]
pub struct PreflightOutcome {
    pub universe: Universe,
    pub policy: PolicyDocument,
    pub head_sha: String,
    pub warnings: Vec<String>,
    pub probe: ProbeOutcome,
}

/// Run checks 1–6 and write the evidence file.
pub async fn run_preflight(
    config: &OvernightConfig,
    paths: &RunPaths,
    provider: &dyn BarProvider,
    run_id: &str,
) -> Result<PreflightOutcome, RunError> {
    let mut evidence = PreflightEvidence {
        run_id: run_id.to_string(),
        checked_at: Some(Utc::now()),
        repo_root: paths.repo_root.display().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        min_version: config.preflight.min_version.clone(),
        universe_path: paths.universe.display().to_string(),
        min_free_bytes: config.preflight.min_free_bytes,
        min_free_inodes: config.preflight.min_free_inodes,
        credential_present: provider.has_credential(),
        ..Default::default()
    };

    let result = checks(config, paths, provider, &mut evidence).await;
    evidence.ok = result.is_ok();
    evidence.error = result.as_ref().err().cloned();

    if let Err(e) = atomic_write_json(&paths.evidence, &evidence) {
        tracing::error!(path = %paths.evidence.display(), error = %e, "could not write preflight evidence");
    }
    match &result {
        Ok(_) => tracing::info!(warnings = ?evidence.warnings, "preflight passed"),
        Err(e) => tracing::error!(code = %e.code, message = %e.message, "preflight failed"),
    }
    result
}

async fn checks(
    config: &OvernightConfig,
    paths: &RunPaths,
    provider: &dyn BarProvider,
    evidence: &mut PreflightEvidence,
) -> Result<PreflightOutcome, RunError> {
    let pf = &config.preflight;

    // 1. Repository root
    let head_sha = check_repo_root(&paths.repo_root, pf.expected_repo_root.as_deref())?;
    evidence.head_sha = Some(head_sha.clone());

    // 2. Uncommitted changes
    match git_dirty(&paths.repo_root, Duration::from_secs(pf.git_status_timeout_secs)).await {
        Some(dirty) => {
            evidence.git_dirty = Some(dirty);
            if dirty {
                evidence.warnings.push(WARN_GIT_DIRTY.into());
            }
        }
        None => evidence.warnings.push(WARN_GIT_UNAVAILABLE.into()),
    }

    // 3. Version
    check_version(env!("CARGO_PKG_VERSION"), &pf.min_version)?;

    // 4. Universe and policy
    let universe = Universe::from_file(&paths.universe).map_err(|e| {
        RunError::new(ErrorCode::UniverseInvalid, e.to_string())
            .with_details(serde_json::json!({ "path": paths.universe.display().to_string() }))
    })?;
    evidence.universe_count = universe.len();
    evidence.universe_sample = universe.sample(UNIVERSE_SAMPLE);
    evidence.universe_rejected = universe.rejected().len();
    if !universe.rejected().is_empty() {
        evidence.warnings.push(WARN_UNIVERSE_REJECTED.into());
    }

    let policy = PolicyDocument::from_file(&paths.policy).map_err(|e| {
        RunError::new(ErrorCode::PolicyInvalid, e.to_string())
            .with_details(serde_json::json!({ "path": paths.policy.display().to_string() }))
    })?;
    evidence.policy_hash = Some(policy.hash.to_string());

    // 5. Disk and inodes
    match disk_free(&paths.repo_root) {
        Ok(free) => {
            evidence.disk_free_bytes = Some(free.bytes);
            evidence.inodes_free = Some(free.inodes);
            if free.bytes < pf.min_free_bytes || free.inodes < pf.min_free_inodes {
                return Err(RunError::new(
                    ErrorCode::DiskLow,
                    format!(
                        "free space {} bytes / {} inodes is below the floor of {} bytes / {} inodes",
                        free.bytes, free.inodes, pf.min_free_bytes, pf.min_free_inodes
                    ),
                ));
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "filesystem stat unavailable");
            evidence.warnings.push(WARN_DISK_STAT_UNAVAILABLE.into());
        }
    }

    // 6. Credential
    if !provider.has_credential() {
        return Err(RunError::new(
            ErrorCode::CredentialMissing,
            format!("no API key in ${}", pf.api_key_env),
        ));
    }
    let probe = provider.probe().await;
    evidence.probe_status = probe.status;
    evidence.probe_error = probe.error.clone();
    evidence.rate_limit_headers = probe.rate_limit_headers.clone();
    let verdict = judge_probe(&probe);
    evidence.credential_valid = match &verdict {
        Ok(()) => Some(true),
        Err(e) if e.code == ErrorCode::InvalidApiKey => Some(false),
        Err(_) => None,
    };
    verdict?;

    Ok(PreflightOutcome {
        universe,
        policy,
        head_sha,
        warnings: evidence.warnings.clone(),
        probe,
    })
}

/// Map the probe response onto pass or a distinct preflight error.
pub fn judge_probe(probe: &ProbeOutcome) -> Result<(), RunError> {
    match probe.status {
        Some(s) if (200..300).contains(&s) => Ok(()),
        Some(s @ (401 | 403)) => Err(RunError::new(
            ErrorCode::InvalidApiKey,
            format!("provider rejected the API key (HTTP {s})"),
        )),
        Some(429) => Err(RunError::new(
            ErrorCode::RateLimitAlreadyHit,
            "provider is already rate-limiting this key",
        )
        .with_details(serde_json::json!({ "retry_after_secs": probe.retry_after_secs }))),
        Some(s) => Err(RunError::new(
            ErrorCode::ProviderProbeFailed,
            format!("probe returned HTTP {s}"),
        )),
        None => Err(RunError::new(
            ErrorCode::ProviderProbeFailed,
            probe.error.clone().unwrap_or_else(|| "probe failed".into()),
        )),
    }
}

// ── Repository ───────────────────────────────────────────────────────

fn check_repo_root(root: &Path, expected: Option<&Path>) -> Result<String, RunError> {
    let fail = |msg: String| {
        RunError::new(ErrorCode::RepoCheckFailed, msg)
            .with_details(serde_json::json!({ "repo_root": root.display().to_string() }))
    };
    if !root.is_dir() {
        return Err(fail(format!("repository root {} does not exist", root.display())));
    }
    if let Some(expected) = expected {
        let actual = fs::canonicalize(root).map_err(|e| fail(e.to_string()))?;
        let wanted = fs::canonicalize(expected).unwrap_or_else(|_| expected.to_path_buf());
        if actual != wanted {
            return Err(fail(format!(
                "repository root {} is not the expected {}",
                actual.display(),
                wanted.display()
            )));
        }
    }
    let git_dir = resolve_git_dir(root).ok_or_else(|| fail(format!("{} is not a git checkout", root.display())))?;
    read_head_sha(&git_dir).map_err(|e| fail(format!("cannot resolve HEAD: {e}")))
}

/// `.git` directory, following a `gitdir:` file for worktrees.
fn resolve_git_dir(root: &Path) -> Option<PathBuf> {
    let dot_git = root.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    let content = fs::read_to_string(&dot_git).ok()?;
    let target = content.trim().strip_prefix("gitdir:")?.trim();
    let path = Path::new(target);
    Some(if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    })
}

/// Resolve HEAD to a commit id without invoking git.
pub fn read_head_sha(git_dir: &Path) -> io::Result<String> {
    let head = fs::read_to_string(git_dir.join("HEAD"))?;
    let head = head.trim();
    let Some(reference) = head.strip_prefix("ref:").map(str::trim) else {
        return Ok(head.to_string());
    };

    match fs::read_to_string(git_dir.join(reference)) {
        Ok(sha) => return Ok(sha.trim().to_string()),
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        Err(_) => {}
    }

    let packed = fs::read_to_string(git_dir.join("packed-refs")).unwrap_or_default();
    packed
        .lines()
        .filter(|l| !l.starts_with('#') && !l.starts_with('^'))
        .find_map(|l| {
            let (sha, name) = l.split_once(' ')?;
            (name.trim() == reference).then(|| sha.to_string())
        })
        .ok_or_else(|| {
            // Unborn branch: a fresh repository with no commits.
            io::Error::new(io::ErrorKind::NotFound, format!("{reference} has no commit"))
        })
}

/// `Some(dirty)` from `git status --porcelain`, `None` if git is unavailable.
async fn git_dirty(root: &Path, timeout: Duration) -> Option<bool> {
    let output = tokio::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(root)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(out)) if out.status.success() => Some(!out.stdout.iter().all(u8::is_ascii_whitespace)),
        _ => None,
    }
}

// ── Version ──────────────────────────────────────────────────────────

fn parse_version(v: &str) -> Option<(u64, u64, u64)> {
    let core = v.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    Some((major, minor, patch))
}

pub fn check_version(current: &str, minimum: &str) -> Result<(), RunError> {
    let err = |msg: String| {
        RunError::new(ErrorCode::VersionTooOld, msg)
            .with_details(serde_json::json!({ "current": current, "minimum": minimum }))
    };
    let cur = parse_version(current).ok_or_else(|| err(format!("unparseable version '{current}'")))?;
    let min = parse_version(minimum).ok_or_else(|| err(format!("unparseable minimum version '{minimum}'")))?;
    if cur < min {
        return Err(err(format!("version {current} is older than required {minimum}")));
    }
    Ok(())
}

// ── Filesystem ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskFree {
    pub bytes: u64,
    pub inodes: u64,
}

/// Free bytes and inodes available to unprivileged users on `path`'s filesystem.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
pub fn disk_free(path: &Path) -> io::Result<DiskFree> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: `statvfs` is plain old data; zeroed is a valid initial value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is NUL-terminated and `stat` is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(DiskFree {
        bytes: (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64),
        inodes: stat.f_favail as u64,
    })
}

#[cfg(not(unix))]
pub fn disk_free(_path: &Path) -> io::Result<DiskFree> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "statvfs is unix-only"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_numerically() {
        assert!(check_version("0.10.0", "0.9.5").is_ok());
        assert!(check_version("1.2.3", "1.2.3").is_ok());
        assert!(check_version("1.2", "1.2.1").is_err());
        assert_eq!(check_version("0.1.0", "0.2.0").unwrap_err().code, ErrorCode::VersionTooOld);
        assert!(check_version("0.1.0", "banana").is_err());
        assert_eq!(parse_version("v2.0.1-rc1"), Some((2, 0, 1)));
    }

    #[test]
    fn probe_statuses_map_to_distinct_codes() {
        let probe = |status| ProbeOutcome {
            status: Some(status),
            ..Default::default()
        };
        assert!(judge_probe(&probe(200)).is_ok());
        assert_eq!(judge_probe(&probe(401)).unwrap_err().code, ErrorCode::InvalidApiKey);
        assert_eq!(judge_probe(&probe(403)).unwrap_err().code, ErrorCode::InvalidApiKey);
        assert_eq!(judge_probe(&probe(429)).unwrap_err().code, ErrorCode::RateLimitAlreadyHit);
        assert_eq!(judge_probe(&probe(500)).unwrap_err().code, ErrorCode::ProviderProbeFailed);
        assert_eq!(
            judge_probe(&ProbeOutcome::default()).unwrap_err().code,
            ErrorCode::ProviderProbeFailed
        );
    }

    #[test]
    fn head_sha_from_loose_and_packed_refs() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        fs::create_dir_all(git.join("refs/heads")).unwrap();

        fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(git.join("refs/heads/main"), "1111111111111111111111111111111111111111\n").unwrap();
        assert_eq!(read_head_sha(&git).unwrap(), "1111111111111111111111111111111111111111");

        fs::remove_file(git.join("refs/heads/main")).unwrap();
        fs::write(
            git.join("packed-refs"),
            "# pack-refs with: peeled\n2222222222222222222222222222222222222222 refs/heads/main\n",
        )
        .unwrap();
        assert_eq!(read_head_sha(&git).unwrap(), "2222222222222222222222222222222222222222");

        fs::write(git.join("HEAD"), "3333333333333333333333333333333333333333\n").unwrap();
        assert_eq!(read_head_sha(&git).unwrap(), "3333333333333333333333333333333333333333");
    }

    #[test]
    fn repo_root_requires_git() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_repo_root(dir.path(), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::RepoCheckFailed);
        assert!(check_repo_root(&dir.path().join("missing"), None).is_err());
    }

    #[test]
    fn repo_root_must_match_expected() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "abc\n").unwrap();

        assert_eq!(check_repo_root(dir.path(), Some(dir.path())).unwrap(), "abc");
        assert!(check_repo_root(dir.path(), Some(other.path())).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn statvfs_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        let free = disk_free(dir.path()).unwrap();
        assert!(free.bytes > 0);
    }
}
