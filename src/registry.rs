use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

/// A discovered module-entry type and the priority it declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub priority: i32,
    pub type_name: String,
}

/// Position of a compiled unit in the enumeration of the build's inputs.
/// Ordering is (input index, member index, relative path), so it does not
/// depend on which worker finished first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Discovery {
    pub input: u32,
    pub member: u32,
    pub path: String,
}

impl Discovery {
    pub fn new(input: u32, member: u32, path: impl Into<String>) -> Self {
        Self {
            input,
            member,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registered {
    pub entry: ModuleEntry,
    pub discovery: Discovery,
    /// Archive path or directory file path the entry was read from.
    pub origin: String,
}

/// Per-invocation accumulator of module entries.
///
/// Shared by reference with every scanning task. A type name is held at most
/// once; the occurrence with the lowest [`Discovery`] wins.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: Mutex<HashMap<String, Registered>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears everything registered so far. Safe to call repeatedly.
    pub fn on_scan_start(&self) {
        self.lock().clear();
    }

    /// Returns `false` when the type name was already held by an entry that
    /// was discovered earlier.
    pub fn register(&self, entry: ModuleEntry, discovery: Discovery, origin: &str) -> bool {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&entry.type_name) {
            if existing.discovery <= discovery {
                return false;
            }
        }
        entries.insert(
            entry.type_name.clone(),
            Registered {
                entry,
                discovery,
                origin: origin.to_string(),
            },
        );
        true
    }

    /// Entries sorted ascending by priority, ties kept in discovery order.
    pub fn snapshot(&self) -> Vec<ModuleEntry> {
        self.registered()
            .into_iter()
            .map(|r| r.entry)
            .collect()
    }

    /// Same order as [`snapshot`](Self::snapshot), with provenance.
    pub fn registered(&self) -> Vec<Registered> {
        let mut all: Vec<Registered> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| {
            a.entry
                .priority
                .cmp(&b.entry.priority)
                .then_with(|| a.discovery.cmp(&b.discovery))
        });
        all
    }

    /// Registered entries grouped by the origin they were discovered in.
    pub fn by_origin(&self) -> BTreeMap<String, Vec<Registered>> {
        let mut grouped: BTreeMap<String, Vec<Registered>> = BTreeMap::new();
        for registered in self.registered() {
            grouped
                .entry(registered.origin.clone())
                .or_default()
                .push(registered);
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Registered>> {
        // A panicking registrant cannot leave a half-inserted entry behind.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(priority: i32, name: &str) -> ModuleEntry {
        ModuleEntry {
            priority,
            type_name: name.to_string(),
        }
    }

    #[test]
    fn snapshot_sorts_by_priority_then_discovery() {
        let registry = ModuleRegistry::new();
        registry.register(entry(1000, "m/C"), Discovery::new(1, 0, "m/C.class"), "b.jar");
        registry.register(entry(5, "m/A"), Discovery::new(0, 3, "m/A.class"), "a.jar");
        registry.register(entry(1000, "m/B"), Discovery::new(0, 9, "m/B.class"), "a.jar");

        let names: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|e| e.type_name)
            .collect();
        assert_eq!(names, vec!["m/A", "m/B", "m/C"]);
    }

    #[test]
    fn earliest_discovery_wins_duplicates() {
        let registry = ModuleRegistry::new();
        assert!(registry.register(entry(7, "m/A"), Discovery::new(2, 0, "x"), "late.jar"));
        assert!(registry.register(entry(3, "m/A"), Discovery::new(0, 0, "x"), "early.jar"));
        assert!(!registry.register(entry(9, "m/A"), Discovery::new(1, 0, "x"), "mid.jar"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot, vec![entry(3, "m/A")]);
        assert_eq!(registry.by_origin().keys().collect::<Vec<_>>(), vec!["early.jar"]);
    }

    #[test]
    fn scan_start_clears_and_is_idempotent() {
        let registry = ModuleRegistry::new();
        registry.register(entry(1, "m/A"), Discovery::new(0, 0, "x"), "a.jar");
        registry.on_scan_start();
        registry.on_scan_start();
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_registration_is_order_independent() {
        let registry = Arc::new(ModuleRegistry::new());
        let handles: Vec<_> = (0..8u32)
            .rev()
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.register(
                        entry(100, &format!("m/T{i}")),
                        Discovery::new(i, 0, "x"),
                        "a.jar",
                    );
                    registry.register(entry(1, "m/Shared"), Discovery::new(i, 1, "y"), "a.jar");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let names: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|e| e.type_name)
            .collect();
        let mut expected = vec!["m/Shared".to_string()];
        expected.extend((0..8).map(|i| format!("m/T{i}")));
        assert_eq!(names, expected);
        assert_eq!(
            registry.registered()[0].discovery,
            Discovery::new(0, 1, "y")
        );
    }
}
