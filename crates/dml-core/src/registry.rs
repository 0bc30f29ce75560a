//! In-process caches. `ModuleRegistry` short-circuits repeat loads by name; `LoadedCode` holds
//! the live code units by entry-point path and can drop everything under a directory.
//! Neither is shared across processes; the lock covers the on-disk state.

use std::fmt;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::module::ModuleHandle;

/// Cache key: module name, optionally namespaced by scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub scope: Option<String>,
    pub name: String,
}

impl ModuleKey {
    pub fn new(name: impl Into<String>, scope: Option<String>) -> Self {
        Self {
            scope,
            name: name.into(),
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}", scope, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Module key -> absolute entry-point path.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: DashMap<ModuleKey, PathBuf>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ModuleKey) -> Option<PathBuf> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn insert(&self, key: ModuleKey, entry_point: PathBuf) -> Option<PathBuf> {
        self.entries.insert(key, entry_point)
    }

    pub fn remove(&self, key: &ModuleKey) -> Option<PathBuf> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entry-point path -> loaded code unit.
#[derive(Default)]
pub struct LoadedCode {
    units: DashMap<PathBuf, ModuleHandle>,
}

impl LoadedCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<ModuleHandle> {
        self.units.get(path).map(|e| e.value().clone())
    }

    pub fn insert(&self, path: PathBuf, handle: ModuleHandle) -> Option<ModuleHandle> {
        self.units.insert(path, handle)
    }

    pub fn remove(&self, path: &Path) -> Option<ModuleHandle> {
        self.units.remove(path).map(|(_, v)| v)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.units.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Drop every unit whose path lies under `prefix` (component-wise, so `/a/mod` does not
    /// match `/a/mod-ERROR`). Returns how many were dropped.
    pub fn invalidate_prefix(&self, prefix: &Path) -> usize {
        let before = self.units.len();
        self.units.retain(|path, _| !path.starts_with(prefix));
        before.saturating_sub(self.units.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::LoadedModule;
    use std::any::Any;
    use std::sync::Arc;

    struct Unit(PathBuf);

    impl LoadedModule for Unit {
        fn entry_point(&self) -> &Path {
            &self.0
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn unit(p: &str) -> (PathBuf, ModuleHandle) {
        let path = PathBuf::from(p);
        (path.clone(), Arc::new(Unit(path)))
    }

    #[test]
    fn scoped_keys_are_independent() {
        let reg = ModuleRegistry::new();
        reg.insert(ModuleKey::new("m", None), PathBuf::from("/root/m/lib/index.so"));
        reg.insert(
            ModuleKey::new("m", Some("team".to_string())),
            PathBuf::from("/root/team/m/lib/index.so"),
        );
        assert_eq!(reg.len(), 2);
        assert_eq!(
            reg.remove(&ModuleKey::new("m", None)),
            Some(PathBuf::from("/root/m/lib/index.so"))
        );
        assert!(reg.contains(&ModuleKey::new("m", Some("team".to_string()))));
        assert_eq!(ModuleKey::new("m", Some("team".to_string())).to_string(), "team/m");
    }

    #[test]
    fn invalidate_prefix_is_component_wise() {
        let code = LoadedCode::new();
        for p in [
            "/inst/mod/lib/index.so",
            "/inst/mod/node_modules/dep/index.so",
            "/inst/mod-ERROR/lib/index.so",
            "/inst/other/lib/index.so",
        ] {
            let (path, handle) = unit(p);
            code.insert(path, handle);
        }

        assert_eq!(code.invalidate_prefix(Path::new("/inst/mod")), 2);
        assert!(code.contains(Path::new("/inst/mod-ERROR/lib/index.so")));
        assert!(code.contains(Path::new("/inst/other/lib/index.so")));
        assert_eq!(code.len(), 2);
    }
}
