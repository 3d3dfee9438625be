//! Module sources for `Import`.
//!
//! The interpreter asks `get` first and falls back to the asynchronous `load`
//! only when the module is not already in memory.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::bytecode::ModuleObject;
use crate::error::{RuntimeError, VmError};
use crate::value::AsyncResult;

pub trait ModuleLoader {
    /// A module that is available right away.
    fn get(&self, name: &str) -> Option<Rc<ModuleObject>>;

    /// Fetch a module that `get` did not have.
    fn load(&self, name: &str) -> AsyncResult<Rc<ModuleObject>>;
}

fn not_found(name: &str) -> VmError {
    VmError::from(RuntimeError::new(format!("Module '{}' not found", name)))
}

/// Modules held in memory; `load` fails for anything not inserted.
#[derive(Default)]
pub struct MemoryLoader {
    modules: RefCell<HashMap<String, Rc<ModuleObject>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, module: ModuleObject) -> Rc<ModuleObject> {
        let module = Rc::new(module);
        self.modules
            .borrow_mut()
            .insert(module.name.clone(), module.clone());
        module
    }

    pub fn len(&self) -> usize {
        self.modules.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.borrow().is_empty()
    }
}

impl ModuleLoader for MemoryLoader {
    fn get(&self, name: &str) -> Option<Rc<ModuleObject>> {
        self.modules.borrow().get(name).cloned()
    }

    fn load(&self, name: &str) -> AsyncResult<Rc<ModuleObject>> {
        AsyncResult::rejected(not_found(name))
    }
}

/// JSON modules under a directory (`<root>/<name>.json`), cached after first read.
pub struct DirLoader {
    root: PathBuf,
    cache: MemoryLoader,
}

impl DirLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: MemoryLoader::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make `module` available without reading it from disk.
    pub fn insert(&self, module: ModuleObject) -> Rc<ModuleObject> {
        self.cache.insert(module)
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, RuntimeError> {
        if name.is_empty() || name.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(RuntimeError::new(format!("Invalid module name '{}'", name)));
        }
        Ok(self.root.join(format!("{}.json", name)))
    }

    fn read(&self, name: &str) -> Result<ModuleObject, RuntimeError> {
        let path = self.path_for(name)?;
        debug!(module = name, path = %path.display(), "reading module");
        let source = std::fs::read_to_string(&path)
            .map_err(|e| RuntimeError::new(format!("Cannot read {}: {}", path.display(), e)))?;
        let module = ModuleObject::from_json(&source)?;
        if module.name != name {
            return Err(RuntimeError::new(format!(
                "{} declares module '{}', expected '{}'",
                path.display(),
                module.name,
                name
            )));
        }
        Ok(module)
    }
}

impl ModuleLoader for DirLoader {
    fn get(&self, name: &str) -> Option<Rc<ModuleObject>> {
        self.cache.get(name)
    }

    fn load(&self, name: &str) -> AsyncResult<Rc<ModuleObject>> {
        match self.read(name) {
            Ok(module) => AsyncResult::resolved(self.cache.insert(module)),
            Err(e) => AsyncResult::rejected(VmError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeObject, Instruction, OpCode};
    use crate::value::AsyncState;

    fn module(name: &str) -> ModuleObject {
        let mut module = ModuleObject::new(name);
        module.add_code(CodeObject::new(
            "main",
            &[],
            vec![Instruction::bare(OpCode::LoadNull), Instruction::bare(OpCode::Return)],
        ));
        module.finish().unwrap()
    }

    #[test]
    fn test_memory_loader() {
        let loader = MemoryLoader::new();
        loader.insert(module("layout"));
        assert!(loader.get("layout").is_some());
        assert!(loader.get("other").is_none());
        assert_eq!(loader.load("other").state(), AsyncState::Error);
    }

    #[test]
    fn test_dir_loader_reads_and_caches() {
        let dir = std::env::temp_dir().join(format!("tplvm-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let json = serde_json::to_string(&module("page")).unwrap();
        std::fs::write(dir.join("page.json"), json).unwrap();

        let loader = DirLoader::new(&dir);
        assert!(loader.get("page").is_none());
        let loaded = loader.load("page");
        assert_eq!(loaded.state(), AsyncState::Success);
        assert!(loader.get("page").is_some());
        assert_eq!(loader.load("missing").state(), AsyncState::Error);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_dir_loader_rejects_traversal() {
        let loader = DirLoader::new("/tmp");
        assert_eq!(loader.load("../etc/passwd").state(), AsyncState::Error);
    }
}
