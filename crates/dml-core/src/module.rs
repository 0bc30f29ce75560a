//! Loaded code units and the loaders that produce them.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;
use crate::manifest::Manifest;
use crate::registry::LoadedCode;

/// A module's code after it has been loaded into the process.
#[async_trait]
pub trait LoadedModule: Send + Sync + 'static {
    /// Absolute path of the file this unit was loaded from.
    fn entry_point(&self) -> &Path;

    /// Display name the module exposes about itself, if any.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Whether `destroy` does anything. Eviction only calls it (and only reports
    /// `moduleDestroyed`) when this is true.
    fn supports_destroy(&self) -> bool {
        false
    }

    /// Release whatever the module holds. May take arbitrarily long; eviction waits for it.
    async fn destroy(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

pub type ModuleHandle = Arc<dyn LoadedModule>;

impl fmt::Debug for dyn LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("entry_point", &self.entry_point())
            .field("name", &self.name())
            .finish()
    }
}

/// What a code loader may look at while loading a module.
pub struct LoadContext<'a> {
    pub module: &'a str,
    pub manifest: &'a Manifest,
    pub module_dir: &'a Path,
    /// Already-loaded units, so a loader can reuse sub-units instead of loading them twice.
    pub loaded: &'a LoadedCode,
}

/// Turns an entry-point file into a live module.
#[async_trait]
pub trait CodeLoader: Send + Sync {
    async fn load(&self, entry_point: &Path, cx: &LoadContext<'_>) -> Result<ModuleHandle, BoxError>;
}

#[cfg(feature = "native")]
pub use native::{NativeLoader, NativeModule};

#[cfg(feature = "native")]
mod native {
    use std::ffi::{c_char, c_int, CStr};

    use libloading::Library;
    use tracing::debug;

    use super::*;

    const NAME_SYMBOL: &[u8] = b"dml_module_name\0";
    const DESTROY_SYMBOL: &[u8] = b"dml_module_destroy\0";

    type NameFn = unsafe extern "C" fn() -> *const c_char;
    type DestroyFn = unsafe extern "C" fn() -> c_int;

    /// Shared library opened with `libloading`. Both exported symbols are optional:
    ///
    /// - `dml_module_name() -> *const c_char`: NUL-terminated display name, read once at load.
    /// - `dml_module_destroy() -> c_int`: teardown hook; non-zero is a failure code.
    pub struct NativeModule {
        entry_point: PathBuf,
        name: Option<String>,
        destroy: Option<DestroyFn>,
        // Dropped last: the function pointers above point into it.
        _library: Library,
    }

    #[async_trait]
    impl LoadedModule for NativeModule {
        fn entry_point(&self) -> &Path {
            &self.entry_point
        }

        fn name(&self) -> Option<&str> {
            self.name.as_deref()
        }

        fn supports_destroy(&self) -> bool {
            self.destroy.is_some()
        }

        async fn destroy(&self) -> Result<(), BoxError> {
            let Some(f) = self.destroy else {
                return Ok(());
            };
            // SAFETY: the symbol was resolved from `_library`, which lives as long as `self`.
            let rc = unsafe { f() };
            if rc == 0 {
                Ok(())
            } else {
                Err(format!("dml_module_destroy returned {}", rc).into())
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct NativeLoader;

    impl NativeLoader {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl CodeLoader for NativeLoader {
        async fn load(&self, entry_point: &Path, cx: &LoadContext<'_>) -> Result<ModuleHandle, BoxError> {
            let path = entry_point.to_path_buf();
            debug!(module = cx.module, path = %path.display(), "opening shared library");
            let module = tokio::task::spawn_blocking(move || open(path)).await??;
            Ok(Arc::new(module))
        }
    }

    fn open(path: PathBuf) -> Result<NativeModule, BoxError> {
        // SAFETY: loading a library runs its initialisers; modules run with full host privileges.
        let library = unsafe { Library::new(&path) }
            .map_err(|e| format!("failed to load library '{}': {}", path.display(), e))?;

        // SAFETY: symbol types are part of the module ABI documented on NativeModule.
        let name = unsafe {
            library
                .get::<NameFn>(NAME_SYMBOL)
                .ok()
                .map(|sym| *sym)
                .and_then(|f| {
                    let p = f();
                    if p.is_null() {
                        None
                    } else {
                        Some(CStr::from_ptr(p).to_string_lossy().into_owned())
                    }
                })
        };
        let destroy = unsafe { library.get::<DestroyFn>(DESTROY_SYMBOL).ok().map(|sym| *sym) };

        Ok(NativeModule {
            entry_point: path,
            name,
            destroy,
            _library: library,
        })
    }

}
