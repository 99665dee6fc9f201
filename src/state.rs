//! Registry state persisted between builds.
//!
//! Incremental builds only rescan changed inputs, so module entries found in
//! untouched inputs during earlier builds are kept in an LMDB environment
//! (via heed), keyed by the origin they were discovered in.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::registry::Registered;

pub const STATE_FILE: &str = ".creation-state.lmdb";
const MODULES_DB: &str = "modules";
const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

#[derive(Debug)]
pub struct RegistryState {
    env: Env,
    modules: StrDb,
}

impl RegistryState {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }

        let env = open_env(&path)?;
        let mut wtxn = env.write_txn()?;
        let modules = env.create_database::<Str, Str>(&mut wtxn, Some(MODULES_DB))?;
        wtxn.commit()?;

        Ok(Self { env, modules })
    }

    /// Opens the state kept next to the outputs under `root`.
    pub fn open_in(root: &Path) -> Result<Self> {
        Self::open(root.join(STATE_FILE))
    }

    pub fn load(&self) -> Result<BTreeMap<String, Vec<Registered>>> {
        let rtxn = self.env.read_txn()?;
        let mut by_origin = BTreeMap::new();
        for item in self.modules.iter(&rtxn)? {
            let (origin, raw) = item?;
            let entries: Vec<Registered> = serde_json::from_str(raw)
                .with_context(|| format!("Failed to parse module entries for origin: {origin}"))?;
            by_origin.insert(origin.to_string(), entries);
        }
        Ok(by_origin)
    }

    pub fn clear(&self) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.modules.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Replaces the stored state with `by_origin` in one transaction.
    pub fn replace(&self, by_origin: &BTreeMap<String, Vec<Registered>>) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.modules.clear(&mut wtxn)?;
        for (origin, entries) in by_origin {
            let json = serde_json::to_string(entries)?;
            self.modules.put(&mut wtxn, origin.as_str(), json.as_str())?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

fn open_env(path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: default LMDB locking stays on; NO_SUB_DIR keeps the state a
    // single file (plus its lock file) next to the outputs.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(path)
            .with_context(|| format!("Failed to create/open state env: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Discovery, ModuleEntry};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "creation_state_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn registered(name: &str, origin: &str) -> Registered {
        Registered {
            entry: ModuleEntry {
                priority: 10,
                type_name: name.to_string(),
            },
            discovery: Discovery::new(0, 1, format!("{name}.class")),
            origin: origin.to_string(),
        }
    }

    #[test]
    fn replace_then_load_round_trips() -> Result<()> {
        let dir = temp_dir("round_trip");
        let state = RegistryState::open_in(&dir)?;
        assert!(state.load()?.is_empty());

        let mut by_origin = BTreeMap::new();
        by_origin.insert("a.jar".to_string(), vec![registered("m/A", "a.jar")]);
        by_origin.insert("b.jar".to_string(), vec![registered("m/B", "b.jar")]);
        state.replace(&by_origin)?;
        assert_eq!(state.load()?, by_origin);

        by_origin.remove("a.jar");
        state.replace(&by_origin)?;
        assert_eq!(state.load()?.keys().collect::<Vec<_>>(), vec!["b.jar"]);

        state.clear()?;
        assert!(state.load()?.is_empty());

        drop(state);
        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }
}
