//! The C ABI between the host and a compiled engine, and the dynamic-library
//! loader that binds it.
//!
//! An engine library exports one `extern "C"` function whose symbol name is
//! the engine name. It returns a pointer to a static [`EngineDescriptor`]:
//!
//! ```c
//! const binforge_engine_descriptor *cpu(void);
//! ```
//!
//! See `include/binforge_engine.h` for the C side.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char};
use std::path::Path;
use std::sync::Arc;

use binforge_types::ENGINE_ABI_VERSION;
use libloading::{Library, Symbol};
use tracing::debug;

use crate::capability::{LoadedModule, MultiChannelSensor, ScalarSensor};
use crate::error::{InvokeError, LinkError};
use crate::linker::ModuleLoader;

pub const KIND_SCALAR: u32 = 0;
pub const KIND_MULTI_CHANNEL: u32 = 1;

/// Bytes reserved for one channel label, including the terminating NUL.
pub const CHANNEL_LABEL_LEN: usize = 32;
/// Channel slots offered to one `read_channels` call.
pub const MAX_CHANNELS: usize = 64;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChannelValue {
    pub label: [c_char; CHANNEL_LABEL_LEN],
    pub value: f64,
}

impl ChannelValue {
    const EMPTY: Self = Self {
        label: [0; CHANNEL_LABEL_LEN],
        value: 0.0,
    };

    fn label(&self) -> String {
        let bytes: Vec<u8> = self
            .label
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// `0` on success, anything else is an engine-defined failure code.
pub type ReadScalarFn = unsafe extern "C" fn(out: *mut f64) -> i32;
pub type ReadChannelsFn =
    unsafe extern "C" fn(buf: *mut ChannelValue, capacity: usize, written: *mut usize) -> i32;
pub type EntryPointFn = unsafe extern "C" fn() -> *const EngineDescriptor;

#[repr(C)]
pub struct EngineDescriptor {
    pub abi_version: u32,
    pub name: *const c_char,
    pub kind: u32,
    pub read_scalar: Option<ReadScalarFn>,
    pub read_channels: Option<ReadChannelsFn>,
}

// Each sensor owns a reference to its library so the function pointers stay
// mapped for as long as the sensor lives.

struct NativeScalar {
    engine: String,
    read: ReadScalarFn,
    _library: Arc<Library>,
}

impl ScalarSensor for NativeScalar {
    fn read_scalar(&mut self) -> Result<f64, InvokeError> {
        let mut value = 0.0f64;
        // SAFETY: `read` came from a descriptor whose library `_library` keeps
        // mapped; `value` is a valid, writable f64.
        let status = unsafe { (self.read)(&mut value) };
        if status != 0 {
            return Err(InvokeError::Failed {
                engine: self.engine.clone(),
                status,
            });
        }
        Ok(value)
    }
}

struct NativeChannels {
    engine: String,
    read: ReadChannelsFn,
    _library: Arc<Library>,
}

impl MultiChannelSensor for NativeChannels {
    fn read_channels(&mut self) -> Result<BTreeMap<String, f64>, InvokeError> {
        let mut buf = vec![ChannelValue::EMPTY; MAX_CHANNELS];
        let mut written = 0usize;
        // SAFETY: the library stays mapped through `_library`; `buf` holds
        // exactly `buf.len()` initialised entries and `written` is writable.
        let status = unsafe { (self.read)(buf.as_mut_ptr(), buf.len(), &mut written) };
        if status != 0 {
            return Err(InvokeError::Failed {
                engine: self.engine.clone(),
                status,
            });
        }
        if written > buf.len() {
            return Err(InvokeError::Malformed {
                engine: self.engine.clone(),
                reason: format!("wrote {written} channels into {} slots", buf.len()),
            });
        }
        Ok(buf[..written]
            .iter()
            .map(|c| (c.label(), c.value))
            .collect())
    }
}

/// Loads engines from shared libraries with `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl NativeLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for NativeLoader {
    fn load(&self, engine: &str, path: &Path) -> Result<LoadedModule, LinkError> {
        let symbol = CString::new(engine)
            .map_err(|_| LinkError::Fatal(format!("engine name '{engine}' contains a NUL byte")))?;

        // SAFETY: loading runs the library's initialisers; engine binaries
        // come from our own build pipeline and export only the C entry point.
        let library = unsafe { Library::new(path) }
            .map_err(|e| LinkError::classify(format!("{}: {e}", path.display())))?;

        // SAFETY: the entry point has the `EntryPointFn` signature by the
        // engine ABI, and `library` outlives this call.
        let descriptor = unsafe {
            let entry: Symbol<EntryPointFn> = library
                .get(symbol.as_bytes_with_nul())
                .map_err(|e| LinkError::classify(format!("symbol not found: {engine}: {e}")))?;
            entry()
        };
        if descriptor.is_null() {
            return Err(LinkError::Fatal(format!(
                "entry point '{engine}' returned no descriptor"
            )));
        }
        // SAFETY: non-null, and the ABI requires a static descriptor that
        // lives as long as the library.
        let descriptor = unsafe { &*descriptor };

        if descriptor.abi_version != ENGINE_ABI_VERSION {
            return Err(LinkError::Recoverable(format!(
                "binary interface mismatch: '{engine}' has version {}, host expects {ENGINE_ABI_VERSION}",
                descriptor.abi_version
            )));
        }

        let reported = if descriptor.name.is_null() {
            String::new()
        } else {
            // SAFETY: non-null and NUL-terminated per the engine ABI.
            unsafe { CStr::from_ptr(descriptor.name) }
                .to_string_lossy()
                .into_owned()
        };
        if reported != engine {
            return Err(LinkError::Fatal(format!(
                "entry point '{engine}' reports name '{reported}'"
            )));
        }

        let kind = descriptor.kind;
        let read_scalar = descriptor.read_scalar;
        let read_channels = descriptor.read_channels;
        let library = Arc::new(library);
        debug!(engine, path = %path.display(), kind, "native engine bound");

        match (kind, read_scalar, read_channels) {
            (KIND_SCALAR, Some(read), _) => Ok(LoadedModule::scalar(
                engine,
                NativeScalar {
                    engine: engine.to_string(),
                    read,
                    _library: library,
                },
            )),
            (KIND_MULTI_CHANNEL, _, Some(read)) => Ok(LoadedModule::multi_channel(
                engine,
                NativeChannels {
                    engine: engine.to_string(),
                    read,
                    _library: library,
                },
            )),
            (KIND_SCALAR | KIND_MULTI_CHANNEL, _, _) => Err(LinkError::Fatal(format!(
                "'{engine}' declares kind {kind} without its read function"
            ))),
            _ => Err(LinkError::Fatal(format!("'{engine}' declares unknown kind {kind}"))),
        }
    }
}
