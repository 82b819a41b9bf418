//! The Windows side: the exported creation entry points, the hooks on the real driver's
//! dispatch tables and the system shader compiler.
//!
//! The service lives in the one global cell in the crate, which only the exported functions
//! and the dispatch table hooks read.

mod com;
mod exports;

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use once_cell::sync::OnceCell;
use winapi::shared::minwindef::UINT;
use winapi::shared::ntdef::HRESULT;
use winapi::shared::winerror::SUCCEEDED;
use winapi::um::d3dcommon::ID3DBlob;

use crate::driver::ShaderCompiler;
use crate::hook::Module;
use crate::input::Keyboard;
use crate::service::{Backend, Service};
use crate::settings::{self, Config};

pub use exports::{D3D11CreateDevice, D3D11CreateDeviceAndSwapChain};

static SERVICE: OnceCell<Arc<Service>> = OnceCell::new();
static GAME_DIR: OnceCell<PathBuf> = OnceCell::new();

/// The directory of the game executable, which is where the config, fixes and cache live.
fn game_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().wrap_err("unable to find the game executable")?;

    exe.parent()
        .map(|dir| dir.to_path_buf())
        .ok_or_else(|| eyre::format_err!("{} has no parent directory", exe.display()))
}

fn start() -> Arc<Service> {
    // Nothing can be logged until the config says where the log goes, so problems wait.
    let mut problems = vec![];

    let dir = match GAME_DIR.get() {
        Some(dir) => dir.clone(),
        None => game_dir().unwrap_or_else(|err| {
            problems.push(format!("{:?}", err));
            PathBuf::from(".")
        }),
    };

    let (config, problem) = Config::load(&dir.join(settings::FILE_NAME));
    let config = config.resolve(&dir);
    problems.extend(problem);

    if let Err(err) = crate::logging::init(&config.log_file, config.udp_log_address.as_deref()) {
        // Nowhere to log this to.
        eprintln!("shaderfix: {:?}", err);
    }

    log::info!("shaderfix {} loaded into {}", env!("CARGO_PKG_VERSION"), dir.display());

    for problem in problems {
        log::warn!("{}", problem);
    }

    let compiler = match SystemCompiler::load() {
        Ok(compiler) => Some(Arc::new(compiler) as Arc<dyn ShaderCompiler>),
        Err(err) => {
            log::warn!("{:?}", err);
            None
        }
    };

    Service::init(
        config,
        Backend {
            compiler,
            decompiler: None,
            input: Some(Box::new(Keyboard::new())),
        },
    )
}

/// The service, started by the first device creation.
pub fn service() -> &'static Arc<Service> {
    SERVICE.get_or_init(start)
}

/// Runs when the library is loaded, with the loader lock held. Loading libraries or starting
/// threads isn't allowed there, so this only records where the game lives; the service starts
/// when the game first asks for a device.
pub fn init() {
    if let Ok(dir) = game_dir() {
        let _ = GAME_DIR.set(dir);
    }
}

pub fn shutdown() {
    if let Some(service) = SERVICE.get() {
        service.teardown();
    }
}

type CompileFn = unsafe extern "system" fn(
    source: *const std::ffi::c_void,
    source_size: usize,
    source_name: *const i8,
    defines: *const std::ffi::c_void,
    include: *mut std::ffi::c_void,
    entry_point: *const i8,
    target: *const i8,
    flags1: UINT,
    flags2: UINT,
    code: *mut *mut ID3DBlob,
    errors: *mut *mut ID3DBlob,
) -> HRESULT;

/// Tells the compiler to resolve `#include` relative to the source file.
const STANDARD_FILE_INCLUDE: usize = 1;
const OPTIMIZATION_LEVEL3: UINT = 1 << 15;

/// `D3DCompile` from the system's compiler library.
struct SystemCompiler {
    // Keeps the library loaded for as long as `compile` may be called.
    _module: Module,
    compile: CompileFn,
}

impl SystemCompiler {
    fn load() -> Result<SystemCompiler> {
        let module = Module::open("d3dcompiler_47.dll").wrap_err("unable to load the shader compiler")?;
        let address = module
            .symbol_address("D3DCompile")
            .wrap_err("the shader compiler has no D3DCompile")?;

        Ok(SystemCompiler {
            _module: module,
            compile: unsafe { std::mem::transmute::<usize, CompileFn>(address) },
        })
    }
}

/// Copies a blob's contents out and releases it.
unsafe fn take_blob(blob: *mut ID3DBlob) -> Vec<u8> {
    if blob.is_null() {
        return vec![];
    }

    let data = std::slice::from_raw_parts((*blob).GetBufferPointer() as *const u8, (*blob).GetBufferSize()).to_vec();
    (*blob).Release();

    data
}

impl ShaderCompiler for SystemCompiler {
    fn compile(&self, source: &str, name: &str, profile: &str) -> Result<Vec<u8>, String> {
        let name = CString::new(name).map_err(|err| err.to_string())?;
        let profile = CString::new(profile).map_err(|err| err.to_string())?;
        let entry_point = CString::new("main").map_err(|err| err.to_string())?;

        let mut code = std::ptr::null_mut();
        let mut errors = std::ptr::null_mut();

        let result = unsafe {
            (self.compile)(
                source.as_ptr().cast(),
                source.len(),
                name.as_ptr(),
                std::ptr::null(),
                STANDARD_FILE_INCLUDE as *mut _,
                entry_point.as_ptr(),
                profile.as_ptr(),
                OPTIMIZATION_LEVEL3,
                0,
                &mut code,
                &mut errors,
            )
        };

        let code = unsafe { take_blob(code) };
        let messages = unsafe { take_blob(errors) };
        let messages = String::from_utf8_lossy(&messages).trim_end_matches('\0').trim().to_string();

        if !SUCCEEDED(result) || code.is_empty() {
            return Err(if messages.is_empty() {
                format!("compiler returned {:#010x}", result)
            } else {
                messages
            });
        }

        if !messages.is_empty() {
            log::warn!("Compiler warnings for {}:\n{}", name.to_string_lossy(), messages);
        }

        Ok(code)
    }
}
