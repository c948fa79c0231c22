//! # llama-ffi
//!
//! C ABI for llama-rag. Five calls make up the contract (see
//! `include/llama_rag.h`):
//!
//! ```c
//! int   init(const char* model_path);
//! void  add_knowledge(const char* doc);
//! void  load_knowledge_file(const char* filepath);
//! char* query(const char* prompt);
//! void  free_response(char* ptr);
//! ```
//!
//! plus `is_ready()`. All calls share one process-wide [`RagService`] created
//! on first use. With the `native` feature it loads GGUF models through
//! llama.cpp; without it, JSON model cards for the scripted backend. When the
//! `LLAMA_RAG_CONFIG` environment variable names a JSON file it is read as the
//! [`GenerationConfig`] at that point.
//!
//! Every buffer returned by [`query`] is owned by the caller until it is passed
//! back to [`free_response`].

use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use llama_runtime::{load_config, DefaultBackend, GenerationConfig, RagService};
use tracing_subscriber::EnvFilter;

/// Environment variable naming an optional JSON generation config.
pub const CONFIG_ENV: &str = "LLAMA_RAG_CONFIG";

/// Status returned by [`init`] on success (also when already initialized).
pub const STATUS_OK: c_int = 0;

/// Status returned by [`init`] when the path is null or not a file.
pub const STATUS_FILE_NOT_FOUND: c_int = 10;

static SERVICE: OnceLock<RagService<DefaultBackend>> = OnceLock::new();
static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);

fn service() -> &'static RagService<DefaultBackend> {
    SERVICE.get_or_init(|| RagService::with_config(DefaultBackend::default(), config_from_env()))
}

fn config_from_env() -> GenerationConfig {
    let Some(path) = std::env::var_os(CONFIG_ENV) else {
        return GenerationConfig::default();
    };
    match load_config(Path::new(&path)) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring {CONFIG_ENV}; using defaults");
            GenerationConfig::default()
        }
    }
}

fn install_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Borrow a C string, `None` for null.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// and unmodified for `'a`.
unsafe fn borrow_c_str<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr))
    }
}

/// Path named by a C string. Unix paths are raw bytes and pass through
/// unchanged; elsewhere the string must be UTF-8.
#[cfg(unix)]
fn c_str_path(s: &CStr) -> Option<&Path> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    Some(Path::new(OsStr::from_bytes(s.to_bytes())))
}

#[cfg(not(unix))]
fn c_str_path(s: &CStr) -> Option<&Path> {
    s.to_str().ok().map(Path::new)
}

/// Convert response text into a C string, dropping interior NULs.
fn response_c_string(text: String) -> CString {
    let bytes: Vec<u8> = text.into_bytes().into_iter().filter(|&b| b != 0).collect();
    CString::new(bytes).unwrap_or_default()
}

/// Number of [`query`] buffers not yet passed to [`free_response`].
pub fn outstanding_responses() -> usize {
    OUTSTANDING.load(Ordering::SeqCst)
}

/// Load the model at `model_path`.
///
/// Returns 0 on success or when a model is already loaded, 10 when the file
/// does not exist, 1 when the model cannot be loaded and 2 when no inference
/// context can be created for it.
///
/// # Safety
/// `model_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn init(model_path: *const c_char) -> c_int {
    install_tracing();

    let Some(path) = borrow_c_str(model_path).and_then(c_str_path) else {
        tracing::warn!("init called without a usable model path");
        return STATUS_FILE_NOT_FOUND;
    };

    match service().initialize(path) {
        Ok(()) => STATUS_OK,
        Err(err) => {
            tracing::error!(error = %err, "init failed");
            err.status_code()
        }
    }
}

/// Returns 1 when a model and context are loaded, 0 otherwise.
#[no_mangle]
pub extern "C" fn is_ready() -> c_int {
    c_int::from(service().is_ready())
}

/// Add one knowledge document. Null and empty strings are ignored.
///
/// # Safety
/// `doc` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn add_knowledge(doc: *const c_char) {
    match borrow_c_str(doc) {
        Some(doc) => {
            service().add_knowledge(doc.to_string_lossy());
        }
        None => tracing::warn!("add_knowledge called with null"),
    }
}

/// Add every non-empty line of a text file as a knowledge document.
/// Unreadable files and null paths are ignored.
///
/// # Safety
/// `filepath` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn load_knowledge_file(filepath: *const c_char) {
    match borrow_c_str(filepath).and_then(c_str_path) {
        Some(path) => {
            service().load_knowledge_file(path);
        }
        None => tracing::warn!("load_knowledge_file called without a usable path"),
    }
}

/// Answer `prompt`. Never returns null; a null prompt is treated as empty.
///
/// The returned buffer must be released with [`free_response`].
///
/// # Safety
/// `prompt` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn query(prompt: *const c_char) -> *mut c_char {
    let prompt = borrow_c_str(prompt)
        .map(CStr::to_string_lossy)
        .unwrap_or(Cow::Borrowed(""));

    let response = response_c_string(service().query(&prompt));
    OUTSTANDING.fetch_add(1, Ordering::SeqCst);
    response.into_raw()
}

/// Release a buffer returned by [`query`]. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a pointer obtained from [`query`] that has not been
/// freed yet. Passing any other pointer, or the same pointer twice, is
/// undefined behaviour.
#[no_mangle]
pub unsafe extern "C" fn free_response(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    drop(CString::from_raw(ptr));
    OUTSTANDING.fetch_sub(1, Ordering::SeqCst);
}
