use anyhow::Result;
use ignore::WalkBuilder;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{debug, warn};

use crate::error::WeaveError;
use crate::registry::Discovery;
use crate::weave::{WeaveOutcome, Weaver};

/// Lists every regular file below `base_path`, sorted so enumeration order
/// is stable across runs and platforms.
pub fn list_files(base_path: &Path) -> Result<Vec<PathBuf>> {
    if !base_path.exists() {
        return Ok(Vec::new());
    }

    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Some(path) = accept(entry) {
                let _ = tx.send(path);
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files: Vec<PathBuf> = rx.iter().collect();
    files.sort();
    Ok(files)
}

/// Path of a regular file. Walk errors (an unreadable subdirectory, a
/// vanished file) are logged and the walk goes on without them.
fn accept(entry: Result<ignore::DirEntry, ignore::Error>) -> Option<PathBuf> {
    match entry {
        Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => Some(entry.into_path()),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "skipping unreadable path");
            None
        }
    }
}

/// `/`-separated path of `path` relative to `base`.
pub fn relative_name(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether an entry is decoded at all. Resource classes, generated build
/// config and platform packages are passed through untouched.
pub fn is_candidate(entry_name: &str, excluded_prefixes: &[String]) -> bool {
    if !entry_name.ends_with(".class") {
        return false;
    }
    let dotted = entry_name.replace(['/', '\\'], ".");
    if excluded_prefixes.iter().any(|p| dotted.starts_with(p.as_str())) {
        return false;
    }
    let simple = entry_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(entry_name);
    !(simple == "R.class" || simple.starts_with("R$") || simple == "BuildConfig.class")
}

/// Per-entry counters folded into the pipeline report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub entries: usize,
    pub classes: usize,
    pub rewritten: usize,
    pub malformed: usize,
    pub modules: usize,
    pub hosts: usize,
}

impl ScanStats {
    pub fn merge(&mut self, other: &ScanStats) {
        self.entries += other.entries;
        self.classes += other.classes;
        self.rewritten += other.rewritten;
        self.malformed += other.malformed;
        self.modules += other.modules;
        self.hosts += other.hosts;
    }
}

/// Runs one entry through the weaver. Returns the bytes to write, which are
/// the original bytes unless the entry was rewritten. A malformed class is
/// logged and passed through.
pub fn transform_entry(
    weaver: &Weaver,
    excluded_prefixes: &[String],
    entry_name: &str,
    data: Vec<u8>,
    discovery: Discovery,
    origin: &str,
) -> (Vec<u8>, ScanStats) {
    let mut stats = ScanStats {
        entries: 1,
        ..ScanStats::default()
    };
    if !is_candidate(entry_name, excluded_prefixes) {
        return (data, stats);
    }
    stats.classes = 1;

    match weaver.transform(&data, discovery, origin) {
        Ok(transformed) => {
            match transformed.outcome {
                WeaveOutcome::Module { .. } => stats.modules = 1,
                WeaveOutcome::Host { .. } => stats.hosts = 1,
                WeaveOutcome::Untouched => {}
            }
            match transformed.bytes {
                Some(bytes) => {
                    debug!(entry = entry_name, origin, "rewrote class");
                    stats.rewritten = 1;
                    (bytes, stats)
                }
                None => (data, stats),
            }
        }
        Err(e) => {
            let error = WeaveError::format(entry_name, e);
            warn!(origin, error = %error, "passing class through unmodified");
            stats.malformed = 1;
            (data, stats)
        }
    }
}
