//! Core library for dml: fetch, unpack, install, load and evict modules at runtime.
//! Used by the CLI binary; meant to be embedded in long-running host processes.

pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod installer;
pub mod loader;
pub mod lock;
pub mod manifest;
pub mod module;
pub mod registry;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main API for CLI
pub use archive::PackageFormat;
pub use config::{load_config, CleanupHook, Config};
pub use error::{BoxError, DmlError, Result, Stage};
pub use events::{EventBus, EventKind, EventObserver, ModuleEvent, SubscriptionId};
pub use installer::{DependencyInstaller, InstallStrategy};
pub use loader::{DynamicModuleLoader, LoadOptions};
pub use lock::{FileLockService, LockService};
pub use manifest::Manifest;
#[cfg(feature = "native")]
pub use module::{NativeLoader, NativeModule};
pub use module::{CodeLoader, LoadContext, LoadedModule, ModuleHandle};
pub use registry::{LoadedCode, ModuleKey, ModuleRegistry};
pub use transport::Transport;
