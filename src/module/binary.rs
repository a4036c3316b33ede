use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{HostError, Result};
use crate::manifest::Manifest;

use super::entry::Entry;

/// Symbol every module binary exports, see [`crate::export_entry`].
pub const MODHOST_ENTRY_SYMBOL: &[u8] = b"modhost_module_entry";

pub type EntryFn = fn() -> Arc<dyn Entry>;

/// An opened module binary together with its entry object.
pub struct LoadedBinary {
    path: PathBuf,
    // Dropped before `library` so no entry vtable outlives the mapping.
    entry: Arc<dyn Entry>,
    library: Option<libloading::Library>,
}

impl LoadedBinary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self) -> Arc<dyn Entry> {
        Arc::clone(&self.entry)
    }

    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }
}

impl Drop for LoadedBinary {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "Closing module binary");
    }
}

/// Opens module binaries.
pub trait BinaryLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<LoadedBinary>>;
}

/// Reads the manifest a binary's entry reports about itself.
pub fn read_manifest(loader: &dyn BinaryLoader, path: &Path) -> Result<Manifest> {
    let binary = loader.open(path)?;
    Ok(binary.entry().manifest())
}

/// Path-keyed handle table; a binary stays shared while any module holds it.
#[derive(Default)]
struct OpenBinaries {
    slots: Mutex<HashMap<PathBuf, Weak<LoadedBinary>>>,
}

impl OpenBinaries {
    fn get_or_open(
        &self,
        key: PathBuf,
        open: impl FnOnce(&Path) -> Result<LoadedBinary>,
    ) -> Result<Arc<LoadedBinary>> {
        // Held across `open` so two modules sharing a binary never open it twice.
        let mut slots = self.slots.lock().expect("OpenBinaries lock poisoned");

        if let Some(existing) = slots.get(&key).and_then(Weak::upgrade) {
            tracing::trace!(path = %key.display(), "Reusing open module binary");
            return Ok(existing);
        }

        let binary = Arc::new(open(&key)?);
        slots.retain(|_, slot| slot.strong_count() > 0);
        slots.insert(key, Arc::downgrade(&binary));
        Ok(binary)
    }
}

/// Loads module binaries as shared libraries.
#[derive(Default)]
pub struct BinaryCache {
    open: OpenBinaries,
}

impl BinaryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BinaryLoader for BinaryCache {
    fn open(&self, path: &Path) -> Result<Arc<LoadedBinary>> {
        let canonical = std::fs::canonicalize(path).map_err(|e| load_failed(path, e))?;
        self.open.get_or_open(canonical, open_shared_library)
    }
}

fn load_failed(path: &Path, reason: impl ToString) -> HostError {
    HostError::LoadFailed {
        module: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn open_shared_library(path: &Path) -> Result<LoadedBinary> {
    tracing::debug!(path = %path.display(), "Opening module binary");

    // SAFETY: module binaries are trusted host extensions; their initializers
    // run here and the entry symbol is declared by `export_entry!` with
    // exactly the `EntryFn` signature.
    let (library, entry) = unsafe {
        let library = dlopen(path).map_err(|e| load_failed(path, e))?;
        let entry = {
            let ctor = library
                .get::<EntryFn>(MODHOST_ENTRY_SYMBOL)
                .map_err(|e| load_failed(path, format!("entry point not found: {e}")))?;
            ctor()
        };
        (library, entry)
    };

    Ok(LoadedBinary {
        path: path.to_path_buf(),
        entry,
        library: Some(library),
    })
}

/// Binaries stay mapped after close: services and tasks they created may
/// still reference their code.
#[cfg(unix)]
unsafe fn dlopen(path: &Path) -> std::result::Result<libloading::Library, libloading::Error> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};
    Library::open(Some(path), RTLD_NOW | RTLD_LOCAL | libc::RTLD_NODELETE).map(Into::into)
}

#[cfg(not(unix))]
unsafe fn dlopen(path: &Path) -> std::result::Result<libloading::Library, libloading::Error> {
    libloading::Library::new(path)
}

type EntryFactory = Arc<dyn Fn() -> Arc<dyn Entry> + Send + Sync>;

/// In-process loader: binary file names map to entry constructors linked into
/// the host itself.
#[derive(Default)]
pub struct StaticLoader {
    factories: HashMap<String, EntryFactory>,
    open: OpenBinaries,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry<F>(mut self, binary: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Entry> + Send + Sync + 'static,
    {
        self.factories.insert(binary.into(), Arc::new(factory));
        self
    }
}

impl BinaryLoader for StaticLoader {
    fn open(&self, path: &Path) -> Result<Arc<LoadedBinary>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| load_failed(path, "no binary file name"))?;

        let factory = self
            .factories
            .get(file_name)
            .cloned()
            .ok_or_else(|| load_failed(path, "no such binary"))?;

        self.open.get_or_open(path.to_path_buf(), |path| {
            Ok(LoadedBinary {
                path: path.to_path_buf(),
                entry: factory(),
                library: None,
            })
        })
    }
}
