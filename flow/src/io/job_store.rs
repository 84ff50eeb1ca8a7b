//! Job files on disk.
//!
//! All writes are whole-file rewrites through a temp file and a rename. A
//! rename touches several files; [`JobStore::commit_rename`] applies them as
//! one unit and restores the originals if any step fails.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::core::job::{Job, JobError};
use crate::core::rename::StagedRename;
use crate::io::process::pid_alive;

/// State of a job's `.lock` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Missing,
    Held { pid: u32, alive: bool },
}

#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Every `*.md` file in the plan directory, sorted.
    pub fn markdown_files(&self) -> Result<Vec<String>> {
        let entries =
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".md") && !name.starts_with('.') && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load every job in filename order. Notes without a `type` are skipped.
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub fn load_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut seen: HashMap<String, String> = HashMap::new();
        for name in self.markdown_files()? {
            let path = self.path(&name);
            let text =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let Some(job) = Job::parse(&name, &text)? else {
                debug!(file = %name, "skipping non-job markdown");
                continue;
            };
            if let Some(first) = seen.insert(job.id.clone(), name.clone()) {
                return Err(JobError::DuplicateId {
                    id: job.id,
                    first,
                    second: name,
                }
                .into());
            }
            jobs.push(job);
        }
        debug!(count = jobs.len(), "loaded jobs");
        Ok(jobs)
    }

    /// Load one job by filename or id.
    pub fn load_job(&self, reference: &str) -> Result<Job> {
        let jobs = self.load_jobs()?;
        resolve(&jobs, reference)
            .cloned()
            .ok_or_else(|| JobError::NotFound(reference.to_string()).into())
    }

    /// Stamp `updated_at` and rewrite the job file.
    pub fn save(&self, job: &mut Job, now: DateTime<Utc>) -> Result<()> {
        job.touch(now);
        self.write(job)
    }

    /// Rewrite the job file as is.
    pub fn write(&self, job: &Job) -> Result<()> {
        let text = job
            .to_text()
            .with_context(|| format!("render {}", job.filename))?;
        write_atomic(&self.path(&job.filename), &text)
    }

    /// Write a new job, refusing to overwrite an existing file.
    pub fn create(&self, job: &mut Job, now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.path(&job.filename);
        if path.exists() {
            return Err(anyhow!("{} already exists", path.display()));
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        self.save(job, now)?;
        Ok(path)
    }

    /// Apply a staged rename as a unit.
    #[instrument(skip_all, fields(from = %staged.old_filename, to = %staged.new_filename))]
    pub fn commit_rename(&self, staged: &StagedRename, now: DateTime<Utc>) -> Result<()> {
        let mut writes = Vec::with_capacity(staged.updated.len() + 1);
        for job in &staged.updated {
            let mut job = job.clone();
            job.touch(now);
            writes.push((job.filename.clone(), job.to_text()?));
        }
        let mut renamed = staged.renamed.clone();
        renamed.touch(now);
        writes.push((renamed.filename.clone(), renamed.to_text()?));
        self.commit_writes(&writes, Some(&staged.old_filename))
    }

    /// Write every `(filename, text)` pair, then remove `remove`.
    ///
    /// Temp files are written first; nothing is replaced until all of them
    /// exist. If a replacement fails, files already replaced get their
    /// previous contents back and newly created files are deleted.
    pub fn commit_writes(&self, writes: &[(String, String)], remove: Option<&str>) -> Result<()> {
        let mut temps = Vec::with_capacity(writes.len());
        for (filename, text) in writes {
            let tmp = self.dir.join(format!(".{filename}.tmp"));
            if let Err(err) =
                fs::write(&tmp, text).with_context(|| format!("write {}", tmp.display()))
            {
                discard(&temps);
                return Err(err);
            }
            temps.push(tmp);
        }

        let mut applied: Vec<(PathBuf, Option<String>)> = Vec::new();
        for ((filename, _), tmp) in writes.iter().zip(&temps) {
            let target = self.path(filename);
            let previous = fs::read_to_string(&target).ok();
            if let Err(err) = fs::rename(tmp, &target)
                .with_context(|| format!("replace {}", target.display()))
            {
                warn!(file = %filename, "rolling back job writes");
                discard(&temps);
                rollback(&applied);
                return Err(err);
            }
            applied.push((target, previous));
        }

        if let Some(old) = remove {
            let old_path = self.path(old);
            if let Err(err) =
                fs::remove_file(&old_path).with_context(|| format!("remove {}", old_path.display()))
            {
                warn!(file = %old, "rolling back job writes");
                rollback(&applied);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn lock_path(&self, job: &Job) -> PathBuf {
        self.dir.join(format!("{}.lock", job.filename))
    }

    pub fn write_lock(&self, job: &Job, pid: u32) -> Result<()> {
        write_atomic(&self.lock_path(job), &format!("{pid}\n"))
    }

    pub fn remove_lock(&self, job: &Job) -> Result<()> {
        let path = self.lock_path(job);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    pub fn lock_state(&self, job: &Job) -> LockState {
        let Ok(text) = fs::read_to_string(self.lock_path(job)) else {
            return LockState::Missing;
        };
        match text.trim().parse::<u32>() {
            Ok(pid) => LockState::Held {
                pid,
                alive: pid_alive(pid),
            },
            Err(_) => LockState::Held {
                pid: 0,
                alive: false,
            },
        }
    }
}

/// Resolve a filename or id among loaded jobs.
pub fn resolve<'a>(jobs: &'a [Job], reference: &str) -> Option<&'a Job> {
    let reference = reference.rsplit('/').next().unwrap_or(reference);
    jobs.iter()
        .find(|job| job.filename == reference)
        .or_else(|| jobs.iter().find(|job| job.id == reference))
        .or_else(|| {
            let with_ext = format!("{reference}.md");
            jobs.iter().find(|job| job.filename == with_ext)
        })
}

/// Atomically write a file (temp file + rename), creating parent directories.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn discard(temps: &[PathBuf]) {
    for tmp in temps {
        let _ = fs::remove_file(tmp);
    }
}

fn rollback(applied: &[(PathBuf, Option<String>)]) {
    for (path, previous) in applied.iter().rev() {
        let restored = match previous {
            Some(text) => fs::write(path, text),
            None => fs::remove_file(path),
        };
        if let Err(err) = restored {
            warn!(path = %path.display(), err = %err, "failed to restore during rollback");
        }
    }
}
