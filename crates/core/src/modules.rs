//! Dynamic module loading for plugins.
//!
//! A module is loaded from a filesystem path, its entry points are resolved
//! by exported name, and the underlying platform handle is released exactly
//! once when the [`SharedModule`] is dropped, regardless of how many
//! functions were resolved from it. The platform-specific loader calls are
//! confined to the `platform` module; everything above it (resolution,
//! diagnostics, ownership) is platform-independent.

use crate::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

#[cfg(unix)]
mod platform {
    use std::ffi::{CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    pub type Handle = *mut libc::c_void;

    fn last_error() -> String {
        // dlerror returns NULL when no diagnostic is pending.
        let message = unsafe { libc::dlerror() };
        if message.is_null() {
            "unknown loader error".to_owned()
        } else {
            unsafe { CStr::from_ptr(message) }
                .to_string_lossy()
                .into_owned()
        }
    }

    pub fn open(path: &Path) -> Result<Handle, String> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| "path contains an interior NUL byte".to_owned())?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            Err(last_error())
        } else {
            Ok(handle)
        }
    }

    pub fn symbol(handle: Handle, name: &str) -> Option<*mut libc::c_void> {
        let c_name = CString::new(name).ok()?;
        let pointer = unsafe { libc::dlsym(handle, c_name.as_ptr()) };
        if pointer.is_null() {
            None
        } else {
            Some(pointer)
        }
    }

    pub fn close(handle: Handle) {
        unsafe {
            libc::dlclose(handle);
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use std::path::Path;

    pub type Handle = *mut std::ffi::c_void;

    pub fn open(_path: &Path) -> Result<Handle, String> {
        Err("dynamic module loading is not supported on this platform".to_owned())
    }

    pub fn symbol(_handle: Handle, _name: &str) -> Option<*mut std::ffi::c_void> {
        None
    }

    pub fn close(_handle: Handle) {}
}

/// A resolved entry point of a loaded module.
///
/// The pointer stays valid as long as the [`SharedModule`] it was resolved
/// from is alive; casting it to a concrete function signature is up to the
/// plugin ABI layer.
#[derive(Debug, Clone, Copy)]
pub struct ModuleFunction {
    pointer: *mut std::ffi::c_void,
}

impl ModuleFunction {
    pub fn as_raw(&self) -> *mut std::ffi::c_void {
        self.pointer
    }
}

/// A loaded dynamic module owning exactly one platform handle.
pub struct SharedModule {
    path: PathBuf,
    handle: platform::Handle,
}

// The raw handle is only ever passed back to the platform loader, which is
// thread-safe for lookup and close.
unsafe impl Send for SharedModule {}
unsafe impl Sync for SharedModule {}

impl SharedModule {
    /// Loads the module at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ModuleLoad`] carrying the platform loader's
    /// diagnostic text if the path cannot be opened as a loadable module.
    pub fn load(path: &Path) -> CoreResult<Self> {
        match platform::open(path) {
            Ok(handle) => Ok(Self {
                path: path.to_path_buf(),
                handle,
            }),
            Err(detail) => {
                tracing::error!("failed to load module {}: {}", path.display(), detail);
                Err(CoreError::ModuleLoad {
                    path: path.to_path_buf(),
                    detail,
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves an exported entry point by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SymbolNotFound`] if the module does not export
    /// `name`.
    pub fn get_function(&self, name: &str) -> CoreResult<ModuleFunction> {
        match platform::symbol(self.handle, name) {
            Some(pointer) => Ok(ModuleFunction { pointer }),
            None => Err(CoreError::SymbolNotFound(name.to_owned())),
        }
    }

    /// Non-failing lookup for an exported entry point.
    pub fn has_function(&self, name: &str) -> bool {
        platform::symbol(self.handle, name).is_some()
    }
}

impl Drop for SharedModule {
    fn drop(&mut self) {
        platform::close(self.handle);
    }
}

impl std::fmt::Debug for SharedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedModule")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Owns the set of loaded modules and unloads them on teardown.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<SharedModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a module and takes ownership of it.
    pub fn load(&mut self, path: &Path) -> CoreResult<&SharedModule> {
        let module = SharedModule::load(path)?;
        self.modules.push(module);
        match self.modules.last() {
            Some(module) => Ok(module),
            None => Err(CoreError::Internal("module registry lost a loaded module".into())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedModule> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loading_missing_path_fails_with_diagnostic() {
        let err = SharedModule::load(Path::new("/nonexistent/libopal_plugin.so")).unwrap_err();
        match err {
            CoreError::ModuleLoad { path, detail } => {
                assert!(path.ends_with("libopal_plugin.so"));
                assert!(!detail.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_loading_non_module_file_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let bogus = temp.path().join("not_a_module.so");
        std::fs::write(&bogus, b"definitely not a shared object").unwrap();
        assert!(matches!(
            SharedModule::load(&bogus),
            Err(CoreError::ModuleLoad { .. })
        ));
    }

    #[test]
    fn test_registry_rejects_and_does_not_retain_failed_loads() {
        let mut registry = ModuleRegistry::new();
        assert!(registry.load(Path::new("/nonexistent/module.so")).is_err());
        assert!(registry.is_empty());
    }
}
