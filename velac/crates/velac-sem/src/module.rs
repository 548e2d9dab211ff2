//! Module registry.
//!
//! Modules are compiled once, in dependency order, into the shared code
//! buffer. Sources come either from disk (driver-provided) or from the
//! in-memory registry fed through the embedding API's `add_module`, which
//! is how the standard library is bundled.

use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashSet;

/// A registered module.
pub struct Module {
    /// Qualified-access name (the file stem).
    pub name: String,
    pub path: String,
    /// Modules this one has imported.
    pub imports: FxHashSet<usize>,
    pub is_compiled: bool,
}

/// The module registry of one compiler instance.
pub struct Modules {
    modules: Vec<Module>,
    /// In-memory sources keyed by path, in registration order.
    sources: IndexMap<String, Rc<str>>,
}

impl Modules {
    /// Creates the registry with the `__universe` pseudo-module that holds
    /// all built-in identifiers. It is index 0 and visible everywhere.
    pub fn new() -> Self {
        Self {
            modules: vec![Module {
                name: "__universe".to_string(),
                path: "__universe".to_string(),
                imports: FxHashSet::default(),
                is_compiled: true,
            }],
            sources: IndexMap::new(),
        }
    }

    /// The module name for a path: the file stem.
    pub fn name_from_path(path: &str) -> &str {
        let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
        base.rsplit_once('.').map_or(base, |(stem, _)| stem)
    }

    pub fn find(&self, path: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.path == path)
    }

    /// Registers a module, failing on a duplicate path.
    pub fn add(&mut self, path: &str) -> Result<usize, String> {
        if self.find(path).is_some() {
            return Err(format!("Duplicate module {path}"));
        }
        let name = Self::name_from_path(path).to_string();
        if name.is_empty() {
            return Err(format!("Illegal module path {path}"));
        }
        self.modules.push(Module {
            name,
            path: path.to_string(),
            imports: FxHashSet::default(),
            is_compiled: false,
        });
        Ok(self.modules.len() - 1)
    }

    pub fn get(&self, index: usize) -> &Module {
        &self.modules[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Module {
        &mut self.modules[index]
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Records that `importer` has imported `imported`.
    pub fn add_import(&mut self, importer: usize, imported: usize) {
        self.modules[importer].imports.insert(imported);
    }

    /// Whether identifiers of `target` are visible from `from` (requires an
    /// import, except for the universe and the module itself).
    pub fn visible(&self, from: usize, target: usize) -> bool {
        target == 0 || target == from || self.modules[from].imports.contains(&target)
    }

    /// Registers an in-memory source for a module path.
    pub fn add_source(&mut self, path: &str, source: &str) {
        self.sources.insert(path.to_string(), Rc::from(source));
    }

    pub fn find_source(&self, path: &str) -> Option<Rc<str>> {
        self.sources.get(path).cloned()
    }
}

impl Default for Modules {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_path() {
        assert_eq!(Modules::name_from_path("lib/math.vl"), "math");
        assert_eq!(Modules::name_from_path("main.vl"), "main");
        assert_eq!(Modules::name_from_path("noext"), "noext");
    }

    #[test]
    fn test_add_and_find() {
        let mut modules = Modules::new();
        let idx = modules.add("main.vl").unwrap();
        assert_eq!(modules.find("main.vl"), Some(idx));
        assert!(modules.add("main.vl").is_err());
    }

    #[test]
    fn test_visibility() {
        let mut modules = Modules::new();
        let a = modules.add("a.vl").unwrap();
        let b = modules.add("b.vl").unwrap();

        // The universe is visible from everywhere; a module sees itself.
        assert!(modules.visible(a, 0));
        assert!(modules.visible(a, a));
        assert!(!modules.visible(a, b));

        modules.add_import(a, b);
        assert!(modules.visible(a, b));
        assert!(!modules.visible(b, a));
    }

    #[test]
    fn test_sources() {
        let mut modules = Modules::new();
        modules.add_source("std.vl", "fn id(x: int): int { return x }");
        assert!(modules.find_source("std.vl").is_some());
        assert!(modules.find_source("other.vl").is_none());
    }
}
