//! Drives one transform invocation end to end.
//!
//! `Start → (Clean) → Scan → Synthesize → Done`. Clean only runs for full
//! builds. Scan fans one task per archive and one per directory file out to
//! the worker pool and waits on an explicit barrier; synthesis runs once
//! after it, over the registry snapshot.

use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::WeaverConfig;
use crate::error::WeaveError;
use crate::invocation::{
    DirectoryInput, Format, JarInput, OutputProvider, Status, TransformInvocation,
};
use crate::provider;
use crate::registry::{Discovery, ModuleEntry, ModuleRegistry, Registered};
use crate::scan::{self, ScanStats};
use crate::state::RegistryState;
use crate::weave::Weaver;
use crate::worker::{TaskGroup, build_pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Clean,
    Scan,
    Synthesize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Clean => "clean",
            Phase::Scan => "scan",
            Phase::Synthesize => "synthesize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub enabled: bool,
    pub incremental: bool,
    pub archives: usize,
    pub directory_files: usize,
    pub removed: usize,
    pub skipped: usize,
    pub carried_forward: usize,
    pub stats: ScanStats,
    pub task_failures: Vec<String>,
    pub modules: Vec<ModuleEntry>,
    pub provider: Option<PathBuf>,
}

pub struct Pipeline {
    config: Arc<WeaverConfig>,
    outputs: Arc<dyn OutputProvider>,
    state: Option<RegistryState>,
}

impl Pipeline {
    pub fn new(config: WeaverConfig, outputs: Arc<dyn OutputProvider>) -> Self {
        Self {
            config: Arc::new(config),
            outputs,
            state: None,
        }
    }

    /// Reconciles module entries of untouched inputs through `state` on
    /// incremental builds.
    pub fn with_state(mut self, state: RegistryState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn run(&self, invocation: &TransformInvocation) -> Result<PipelineReport, WeaveError> {
        self.config.validate()?;
        let enabled = self.config.enable;
        if enabled && !invocation.has_plugin(&self.config.required_plugin) {
            return Err(WeaveError::Configuration(format!(
                "the weaver only applies to projects with the {} plugin",
                self.config.required_plugin
            )));
        }

        let pool = build_pool(self.config.worker_count())
            .map_err(|e| WeaveError::Configuration(format!("failed to start worker pool: {e:#}")))?;
        let registry = Arc::new(ModuleRegistry::new());
        registry.on_scan_start();

        let mut report = PipelineReport {
            enabled,
            incremental: invocation.incremental,
            ..PipelineReport::default()
        };

        if !invocation.incremental {
            self.clean(invocation, &pool)?;
        } else if enabled {
            report.carried_forward = self.carry_forward(invocation, &registry)?;
        }

        info!(phase = %Phase::Scan, enabled, incremental = invocation.incremental, "scanning inputs");
        let weaver = Weaver::new(Arc::clone(&self.config), Arc::clone(&registry));
        let stats = Arc::new(Mutex::new(ScanStats::default()));
        let group = TaskGroup::new(Phase::Scan);

        // Tasks spawned before an enumeration failure still run to completion
        // before the failure is returned.
        let scheduled = self.schedule(invocation, &pool, &group, &weaver, &stats, &mut report);
        let waited = group.wait(self.config.scan_timeout());
        if let Err(e) = scheduled {
            if let Err(pending) = &waited {
                warn!(error = %pending, "scan tasks still running after enumeration failed");
            }
            return Err(e);
        }
        let summary = waited?;
        report.task_failures = summary.failures;
        report.stats = stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if report.stats.hosts > 1 {
            warn!(hosts = report.stats.hosts, "more than one host type carries the host marker");
        }

        if enabled {
            info!(phase = %Phase::Synthesize, modules = registry.len(), "synthesizing provider");
            let modules = registry.snapshot();
            report.provider = Some(provider::write(&self.config, &modules, self.outputs.as_ref())?);
            report.modules = modules;

            if let Some(state) = &self.state {
                state
                    .replace(&registry.by_origin())
                    .map_err(WeaveError::State)?;
            }
        }

        info!(
            archives = report.archives,
            directory_files = report.directory_files,
            removed = report.removed,
            failures = report.task_failures.len(),
            "transform finished"
        );
        Ok(report)
    }

    /// Enumerates the inputs and spawns one scan task per archive and per
    /// directory file onto `group`. Outputs of removed inputs are deleted
    /// inline.
    fn schedule(
        &self,
        invocation: &TransformInvocation,
        pool: &rayon::ThreadPool,
        group: &TaskGroup,
        weaver: &Weaver,
        stats: &Arc<Mutex<ScanStats>>,
        report: &mut PipelineReport,
    ) -> Result<(), WeaveError> {
        for (index, input) in inputs_in_scan_order(invocation) {
            match input {
                Input::Jar(jar) => {
                    let dest = self.outputs.content_location(
                        &jar.file.to_string_lossy(),
                        &jar.content_types,
                        &jar.scopes,
                        Format::Jar,
                    );

                    if invocation.incremental {
                        if jar.status == Status::Removed {
                            remove_output(&dest)?;
                            report.removed += 1;
                            continue;
                        }
                        if !jar.status.needs_processing() {
                            report.skipped += 1;
                            continue;
                        }
                    }

                    report.archives += 1;
                    let source = jar.file.clone();
                    let label = format!("archive {}", source.display());
                    let weaver = weaver.clone();
                    let config = Arc::clone(&self.config);
                    let stats = Arc::clone(stats);
                    group.spawn(pool, label, move || {
                        if !config.enable {
                            return copy_file(&source, &dest);
                        }
                        let archive_stats = archive::transform_archive(
                            &weaver,
                            &config.excluded_prefixes,
                            index,
                            &source,
                            &dest,
                        )?;
                        merge_stats(&stats, &archive_stats);
                        Ok(())
                    });
                }
                Input::Directory(directory) => {
                    let dest_root = self.outputs.content_location(
                        &directory.name,
                        &directory.content_types,
                        &directory.scopes,
                        Format::Directory,
                    );
                    std::fs::create_dir_all(&dest_root).map_err(|e| WeaveError::io(&dest_root, e))?;

                    let files: Vec<PathBuf> = if invocation.incremental {
                        let mut files = Vec::new();
                        for (file, status) in &directory.changed_files {
                            if *status == Status::Removed {
                                let relative = scan::relative_name(&directory.file, file);
                                remove_output(&dest_root.join(relative))?;
                                report.removed += 1;
                            } else if status.needs_processing() {
                                files.push(file.clone());
                            } else {
                                report.skipped += 1;
                            }
                        }
                        files
                    } else {
                        scan::list_files(&directory.file).map_err(|e| {
                            WeaveError::io(&directory.file, std::io::Error::other(format!("{e:#}")))
                        })?
                    };

                    for file in files {
                        report.directory_files += 1;
                        let relative = scan::relative_name(&directory.file, &file);
                        let dest = dest_root.join(&relative);
                        let label = format!("file {}", file.display());
                        let weaver = weaver.clone();
                        let config = Arc::clone(&self.config);
                        let stats = Arc::clone(stats);
                        group.spawn(pool, label, move || {
                            if !config.enable {
                                return copy_file(&file, &dest);
                            }
                            let data = std::fs::read(&file)
                                .with_context(|| format!("Failed to read {}", file.display()))?;
                            let origin = file.to_string_lossy().to_string();
                            let (data, file_stats) = scan::transform_entry(
                                &weaver,
                                &config.excluded_prefixes,
                                &relative,
                                data,
                                Discovery::new(index, 0, relative.as_str()),
                                &origin,
                            );
                            write_file(&dest, &data)?;
                            merge_stats(&stats, &file_stats);
                            Ok(())
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Deletes dexer intermediates and every previous output in parallel.
    fn clean(
        &self,
        invocation: &TransformInvocation,
        pool: &rayon::ThreadPool,
    ) -> Result<(), WeaveError> {
        info!(phase = %Phase::Clean, "cleaning previous outputs");
        let group = TaskGroup::new(Phase::Clean);

        let dex_builder = invocation.dex_builder_dir();
        group.spawn(pool, format!("clean {}", dex_builder.display()), move || {
            clear_directory(&dex_builder)
        });
        let outputs = Arc::clone(&self.outputs);
        group.spawn(pool, "delete previous outputs", move || {
            outputs.delete_all().context("Failed to delete previous outputs")
        });

        let summary = group.wait(self.config.clean_timeout())?;
        if let Some(first) = summary.failures.first() {
            return Err(WeaveError::PhaseFailed {
                phase: Phase::Clean,
                failures: summary.failures.len(),
                first: first.clone(),
            });
        }

        if let Some(state) = &self.state {
            state.clear().map_err(WeaveError::State)?;
        }
        Ok(())
    }

    /// Re-registers entries persisted for origins this build does not
    /// rescan. Returns how many entries were carried forward.
    fn carry_forward(
        &self,
        invocation: &TransformInvocation,
        registry: &ModuleRegistry,
    ) -> Result<usize, WeaveError> {
        let Some(state) = &self.state else {
            return Ok(0);
        };
        let stored = state.load().map_err(WeaveError::State)?;
        let keep = carried_origins(invocation, &stored);

        let mut carried = 0;
        for (origin, entries) in stored {
            let Some(&input) = keep.get(&origin) else {
                debug!(origin = %origin, "dropping stored module entries");
                continue;
            };
            for Registered {
                entry,
                mut discovery,
                ..
            } in entries
            {
                // Inputs may have been reordered since the entry was stored.
                discovery.input = input;
                if registry.register(entry, discovery, &origin) {
                    carried += 1;
                }
            }
        }
        info!(carried, "carried module entries forward from previous build");
        Ok(carried)
    }
}

#[derive(Clone, Copy)]
enum Input<'a> {
    Jar(&'a JarInput),
    Directory(&'a DirectoryInput),
}

/// Every jar and directory input with its input index. Within each
/// `TransformInput`, jars come before directories.
fn inputs_in_scan_order(invocation: &TransformInvocation) -> impl Iterator<Item = (u32, Input<'_>)> {
    invocation
        .inputs
        .iter()
        .flat_map(|input| {
            input
                .jar_inputs
                .iter()
                .map(Input::Jar)
                .chain(input.directory_inputs.iter().map(Input::Directory))
        })
        .zip(0u32..)
        .map(|(input, index)| (index, input))
}

/// Origins whose stored entries are still valid, mapped to the index of the
/// input that holds them in this invocation. An origin is valid when it
/// belongs to an input of this invocation and is not rescanned or removed
/// by it.
fn carried_origins(
    invocation: &TransformInvocation,
    stored: &BTreeMap<String, Vec<Registered>>,
) -> BTreeMap<String, u32> {
    let touched = |status: Status| status.needs_processing() || status == Status::Removed;
    let mut rescanned = BTreeSet::new();
    let mut jars = BTreeMap::new();
    let mut roots = Vec::new();

    for (index, input) in inputs_in_scan_order(invocation) {
        match input {
            Input::Jar(jar) => {
                let origin = jar.file.to_string_lossy().to_string();
                if touched(jar.status) {
                    rescanned.insert(origin.clone());
                }
                jars.insert(origin, index);
            }
            Input::Directory(directory) => {
                roots.push((directory.file.as_path(), index));
                for (file, status) in &directory.changed_files {
                    if touched(*status) {
                        rescanned.insert(file.to_string_lossy().to_string());
                    }
                }
            }
        }
    }

    stored
        .keys()
        .filter(|origin| !rescanned.contains(*origin))
        .filter_map(|origin| {
            let index = jars.get(origin).copied().or_else(|| {
                roots
                    .iter()
                    .find(|(root, _)| Path::new(origin).starts_with(root))
                    .map(|(_, index)| *index)
            })?;
            Some((origin.clone(), index))
        })
        .collect()
}

fn merge_stats(total: &Mutex<ScanStats>, stats: &ScanStats) {
    total
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .merge(stats);
}

fn remove_output(path: &Path) -> Result<(), WeaveError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed output of deleted input");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WeaveError::io(path, e)),
    }
}

fn clear_directory(dir: &Path) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to delete: {}", path.display()))?;
    }
    Ok(())
}

fn copy_file(source: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::copy(source, dest).with_context(|| {
        format!("Failed to copy {} -> {}", source.display(), dest.display())
    })?;
    Ok(())
}

fn write_file(dest: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(dest, data).with_context(|| format!("Failed to write {}", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::TransformInput;

    fn registered(name: &str, origin: &str) -> Registered {
        Registered {
            entry: ModuleEntry {
                priority: 1,
                type_name: name.to_string(),
            },
            discovery: Discovery::new(0, 0, "x"),
            origin: origin.to_string(),
        }
    }

    #[test]
    fn phase_names_are_lowercase() {
        assert_eq!(Phase::Clean.to_string(), "clean");
        assert_eq!(Phase::Synthesize.to_string(), "synthesize");
    }

    #[test]
    fn carried_origins_exclude_rescanned_and_unknown_inputs() {
        let invocation = TransformInvocation {
            incremental: true,
            build_dir: PathBuf::from("/p/build"),
            applied_plugins: Vec::new(),
            inputs: vec![TransformInput {
                jar_inputs: vec![
                    JarInput {
                        name: "kept".to_string(),
                        file: PathBuf::from("/p/kept.jar"),
                        content_types: Vec::new(),
                        scopes: Vec::new(),
                        status: Status::NotChanged,
                    },
                    JarInput {
                        name: "changed".to_string(),
                        file: PathBuf::from("/p/changed.jar"),
                        content_types: Vec::new(),
                        scopes: Vec::new(),
                        status: Status::Changed,
                    },
                ],
                directory_inputs: vec![DirectoryInput {
                    name: "classes".to_string(),
                    file: PathBuf::from("/p/classes"),
                    content_types: Vec::new(),
                    scopes: Vec::new(),
                    changed_files: [(PathBuf::from("/p/classes/m/B.class"), Status::Removed)]
                        .into_iter()
                        .collect(),
                }],
            }],
        };

        let mut stored = BTreeMap::new();
        for origin in [
            "/p/kept.jar",
            "/p/changed.jar",
            "/p/gone.jar",
            "/p/classes/m/A.class",
            "/p/classes/m/B.class",
        ] {
            stored.insert(origin.to_string(), vec![registered("m/X", origin)]);
        }

        let keep = carried_origins(&invocation, &stored);
        assert_eq!(
            keep.into_iter().collect::<Vec<_>>(),
            vec![
                ("/p/classes/m/A.class".to_string(), 2),
                ("/p/kept.jar".to_string(), 0)
            ]
        );
    }

    #[test]
    fn carried_origins_follow_the_current_input_order() {
        let jar = |name: &str| JarInput {
            name: name.to_string(),
            file: PathBuf::from(format!("/p/{name}.jar")),
            content_types: Vec::new(),
            scopes: Vec::new(),
            status: Status::NotChanged,
        };
        let invocation = TransformInvocation {
            incremental: true,
            build_dir: PathBuf::from("/p/build"),
            applied_plugins: Vec::new(),
            inputs: vec![
                TransformInput {
                    jar_inputs: vec![jar("second")],
                    directory_inputs: vec![DirectoryInput {
                        name: "classes".to_string(),
                        file: PathBuf::from("/p/classes"),
                        content_types: Vec::new(),
                        scopes: Vec::new(),
                        changed_files: BTreeMap::new(),
                    }],
                },
                TransformInput {
                    jar_inputs: vec![jar("first")],
                    directory_inputs: Vec::new(),
                },
            ],
        };

        // Stored when "first" was scanned as input 0.
        let mut stored = BTreeMap::new();
        for origin in ["/p/first.jar", "/p/second.jar", "/p/classes/m/A.class"] {
            stored.insert(origin.to_string(), vec![registered("m/X", origin)]);
        }

        let keep = carried_origins(&invocation, &stored);
        assert_eq!(keep.get("/p/second.jar"), Some(&0));
        assert_eq!(keep.get("/p/classes/m/A.class"), Some(&1));
        assert_eq!(keep.get("/p/first.jar"), Some(&2));
    }
}
