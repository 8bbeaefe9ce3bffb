//! Dynamic-library [`ModuleSource`]: runs a build command, then opens the
//! produced shared object and resolves its capability table.
//!
//! A loadable artifact exports one C symbol, `app_api`, returning a pointer to
//! this table (all slots must be non-null):
//!
//! ```c
//! typedef struct {
//!     uint64_t connection;
//!     const char *path;
//!     size_t path_len;
//! } HttpRequest;
//!
//! typedef struct {
//!     const char *(*handle_http)(HttpRequest *req);
//!     const char *(*get_time)(void);
//!     void (*on_reload)(void);
//! } AppAPI;
//!
//! AppAPI *app_api(void);
//! ```
//!
//! Returned strings may live in static buffers; they are copied before the
//! next call.

use crate::module::{BuildError, HttpRequest, LoadError, Module, ModuleSource};
use libloading::{Library, Symbol};
use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Name of the exported entry point.
pub const ENTRY_SYMBOL: &str = "app_api";

#[repr(C)]
pub struct RawHttpRequest {
    pub connection: u64,
    pub path: *const c_char,
    pub path_len: usize,
}

type HandleHttpFn = unsafe extern "C" fn(*const RawHttpRequest) -> *const c_char;
type GetPayloadFn = unsafe extern "C" fn() -> *const c_char;
type OnReloadFn = unsafe extern "C" fn();

#[repr(C)]
pub struct RawAppApi {
    pub handle_http: Option<HandleHttpFn>,
    pub get_time: Option<GetPayloadFn>,
    pub on_reload: Option<OnReloadFn>,
}

type EntryFn = unsafe extern "C" fn() -> *const RawAppApi;

/// Builds with a shell command and loads the resulting shared object.
pub struct DylibSource {
    build_command: Option<String>,
    artifact: PathBuf,
    shadow_dir: PathBuf,
    generation: u64,
}

impl DylibSource {
    /// An empty `build_command` means the artifact is prebuilt.
    pub fn new(build_command: Option<String>, artifact: impl Into<PathBuf>) -> std::io::Result<Self> {
        let shadow_dir = std::env::temp_dir().join(format!("hotswap-{}", std::process::id()));
        std::fs::create_dir_all(&shadow_dir)?;
        Ok(Self {
            build_command: build_command.filter(|c| !c.trim().is_empty()),
            artifact: artifact.into(),
            shadow_dir,
            generation: 0,
        })
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Where loaded copies of the artifact live; removed with the source
    /// once no copy is open.
    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    /// The platform loader caches libraries by path, so every load opens a
    /// fresh copy while the previous one may still be mapped.
    fn stage(&mut self) -> Result<PathBuf, LoadError> {
        if !self.artifact.is_file() {
            return Err(LoadError::ArtifactMissing(self.artifact.clone()));
        }
        self.generation += 1;
        let stem = self
            .artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let mut name = format!("{}-{}", stem, self.generation);
        if let Some(ext) = self.artifact.extension() {
            name.push('.');
            name.push_str(&ext.to_string_lossy());
        }
        let staged = self.shadow_dir.join(name);
        std::fs::copy(&self.artifact, &staged).map_err(|source| LoadError::Stage {
            path: staged.clone(),
            source,
        })?;
        Ok(staged)
    }
}

impl ModuleSource for DylibSource {
    fn build(&mut self) -> Result<(), BuildError> {
        let Some(command) = self.build_command.as_deref() else {
            debug!("No build command configured, using prebuilt artifact");
            return Ok(());
        };
        info!("Rebuilding {}: {}", self.artifact.display(), command);
        let status = shell(command)
            .status()
            .map_err(|source| BuildError::Spawn {
                command: command.to_string(),
                source,
            })?;
        if !status.success() {
            return Err(BuildError::Failed {
                command: command.to_string(),
                status,
            });
        }
        Ok(())
    }

    fn load(&mut self) -> Result<Box<dyn Module>, LoadError> {
        let staged = self.stage()?;
        match open_module(&staged) {
            Ok(module) => {
                debug!("Loaded {} from {}", self.artifact.display(), staged.display());
                Ok(Box::new(module))
            }
            Err(e) => {
                let _ = std::fs::remove_file(&staged);
                Err(e)
            }
        }
    }
}

impl Drop for DylibSource {
    fn drop(&mut self) {
        // Only succeeds once every staged copy has been released.
        let _ = std::fs::remove_dir(&self.shadow_dir);
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn open_module(path: &Path) -> Result<DylibModule, LoadError> {
    // SAFETY: loading runs the library's initialisers; the artifact is the
    // user's own build output, trusted the same way the build command is.
    unsafe {
        let library = Library::new(path).map_err(|e| LoadError::Open(e.to_string()))?;
        let table = {
            let entry: Symbol<EntryFn> = library
                .get(ENTRY_SYMBOL.as_bytes())
                .map_err(|_| LoadError::MissingEntry(ENTRY_SYMBOL.to_string()))?;
            let raw = entry();
            if raw.is_null() {
                return Err(LoadError::NullTable);
            }
            &*raw
        };
        let handle_http = table
            .handle_http
            .ok_or(LoadError::MissingCapability("handle_http"))?;
        let get_time = table
            .get_time
            .ok_or(LoadError::MissingCapability("get_time"))?;
        let on_reload = table
            .on_reload
            .ok_or(LoadError::MissingCapability("on_reload"))?;

        Ok(DylibModule {
            handle_http,
            get_time,
            on_reload,
            library: Some(library),
            staged: path.to_path_buf(),
        })
    }
}

/// A module backed by an open shared library.
///
/// The function pointers are only valid while `library` is open, which holds
/// for the whole lifetime of this value.
pub struct DylibModule {
    handle_http: HandleHttpFn,
    get_time: GetPayloadFn,
    on_reload: OnReloadFn,
    library: Option<Library>,
    staged: PathBuf,
}

unsafe fn copy_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

impl Module for DylibModule {
    fn handle_http(&self, request: &HttpRequest) -> Option<String> {
        let path = CString::new(request.path()).ok()?;
        let raw = RawHttpRequest {
            connection: request.connection().get(),
            path: path.as_ptr(),
            path_len: request.path_len(),
        };
        unsafe { copy_c_str((self.handle_http)(&raw)) }
    }

    fn push_payload(&self) -> Option<String> {
        unsafe { copy_c_str((self.get_time)()) }
    }

    fn on_swap(&self) {
        unsafe { (self.on_reload)() }
    }
}

impl Drop for DylibModule {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                warn!("Failed to close {}: {}", self.staged.display(), e);
            }
        }
        let _ = std::fs::remove_file(&self.staged);
    }
}
