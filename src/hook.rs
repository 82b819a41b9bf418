//! Redirects calls to functions that live outside this library.
//!
//! There are two ways in. This library is loaded in place of the system one, so every caller
//! of an export already reaches this library's function of the same name; a forwarding hook
//! only resolves the real function for it to call on. The real module is left untouched. A slot
//! hook overwrites an entry in a dispatch table (a COM vtable), which is the only place memory
//! is patched. Either way the original is captured once, at installation, and never re-read.

use std::fmt::{self, Display};
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    ModuleNotFound(String),
    EntryPointNotFound { module: String, name: String },
    AlreadyInstalled(&'static str),
    PatchFailed(String),
}

impl Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::ModuleNotFound(module) => write!(f, "module {} is not loaded", module),
            HookError::EntryPointNotFound { module, name } => {
                write!(f, "entry point not found: {} in {}", name, module)
            }
            HookError::AlreadyInstalled(name) => write!(f, "{} is already hooked", name),
            HookError::PatchFailed(reason) => write!(f, "unable to patch: {}", reason),
        }
    }
}

impl std::error::Error for HookError {}

/// A module that functions can be resolved in.
pub struct Module {
    path: String,
    library: dlopen::raw::Library,
}

impl Module {
    pub fn open(path: &str) -> Result<Module, HookError> {
        let library = dlopen::raw::Library::open(path).map_err(|err| {
            log::error!("Unable to open {}: {}", path, err);
            HookError::ModuleNotFound(path.to_string())
        })?;

        Ok(Module {
            path: path.to_string(),
            library,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn symbol_address(&self, name: &str) -> Result<usize, HookError> {
        let symbol = unsafe { self.library.symbol::<*const u8>(name) };

        symbol
            .map(|address| address as usize)
            .map_err(|_| HookError::EntryPointNotFound {
                module: self.path.clone(),
                name: name.to_string(),
            })
    }
}

/// Calls the original of a hooked function. Made once, when the hook is
/// installed, and never changed afterwards.
pub struct Trampoline<F> {
    address: usize,
    _marker: PhantomData<F>,
}

impl<F> Clone for Trampoline<F> {
    fn clone(&self) -> Self {
        Trampoline {
            address: self.address,
            _marker: PhantomData,
        }
    }
}

impl<F> Copy for Trampoline<F> {}

impl<F: Copy> Trampoline<F> {
    pub fn address(&self) -> usize {
        self.address
    }

    /// The original function.
    pub fn get(&self) -> F {
        // `F` is always a function pointer type; `fn_address` refuses anything else.
        unsafe { std::mem::transmute_copy(&self.address) }
    }
}

fn fn_address<F: Copy>(function: F) -> Result<usize, HookError> {
    if std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
        return Err(HookError::PatchFailed("hook type is not a function pointer".to_string()));
    }

    Ok(unsafe { std::mem::transmute_copy(&function) })
}

/// One hooked function. Intended to live in a `static`.
pub struct Hook<F> {
    name: &'static str,
    original: OnceCell<Trampoline<F>>,

    /// The replacement's address, or zero until the hook is installed.
    replacement: AtomicUsize,
}

impl<F> Hook<F> {
    pub const fn new(name: &'static str) -> Hook<F> {
        Hook {
            name,
            original: OnceCell::new(),
            replacement: AtomicUsize::new(0),
        }
    }
}

impl<F: Copy> Hook<F> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_installed(&self) -> bool {
        self.replacement.load(Ordering::Acquire) != 0
    }

    fn finish(&self, original: usize, replacement: usize) -> Result<Trampoline<F>, HookError> {
        let trampoline = Trampoline {
            address: original,
            _marker: PhantomData,
        };

        self.original
            .set(trampoline)
            .map_err(|_| HookError::AlreadyInstalled(self.name))?;

        self.replacement.store(replacement, Ordering::Release);
        Ok(trampoline)
    }

    /// Forwards the export named after this hook to its namesake in `module`. `replacement` is
    /// the function this library exports under that name, which callers linking against this
    /// library reach. From now on `target()` is `replacement`, and the returned trampoline
    /// reaches the function in `module`. Nothing in `module` is patched, so callers that
    /// resolved the real function themselves still reach it.
    pub fn forward(&self, module: &Module, replacement: F) -> Result<Trampoline<F>, HookError> {
        if self.original.get().is_some() {
            return Err(HookError::AlreadyInstalled(self.name));
        }

        let original = module.symbol_address(self.name).map_err(|err| {
            log::error!("Unable to hook {}: {}", self.name, err);
            err
        })?;

        let trampoline = self.finish(original, fn_address(replacement)?)?;
        log::info!("Forwarding {} to {} ({:#x})", self.name, module.path(), original);

        Ok(trampoline)
    }

    /// Hooks a dispatch table entry by writing `replacement` into `slot`.
    ///
    /// # Safety
    /// `slot` must point to a live function pointer entry of type `F`.
    pub unsafe fn install_slot(&self, slot: *mut usize, replacement: F) -> Result<Trampoline<F>, HookError> {
        if self.original.get().is_some() {
            return Err(HookError::AlreadyInstalled(self.name));
        }

        let replacement = fn_address(replacement)?;
        let original = std::ptr::read_volatile(slot);

        if original == replacement {
            return Err(HookError::AlreadyInstalled(self.name));
        }

        if let Err(err) = patch_slot(slot, replacement) {
            log::error!("Unable to hook {}: {}", self.name, err);
            return Err(err);
        }

        log::info!("Hooked {} through slot {:p}", self.name, slot);
        self.finish(original, replacement)
    }

    /// The original function, if the hook has been installed.
    pub fn original(&self) -> Option<F> {
        self.original.get().map(Trampoline::get)
    }

    /// Where a call should go: the replacement once installed, the original if it is known,
    /// and nowhere otherwise.
    pub fn target(&self) -> Option<F> {
        match self.replacement.load(Ordering::Acquire) {
            0 => self.original(),
            replacement => Some(unsafe { std::mem::transmute_copy(&replacement) }),
        }
    }
}

/// Runs the body of a hook. A panic must not unwind into the caller, which is foreign code, so
/// it is caught here and `fallback` does what the caller asked for instead. The panic hook has
/// logged the details by then.
pub fn guarded<T>(name: &str, body: impl FnOnce() -> T, fallback: impl FnOnce() -> T) -> T {
    match std::panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            log::error!("The {} hook panicked, so the call went to the original", name);
            fallback()
        }
    }
}

#[cfg(unix)]
#[cached::proc_macro::cached]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(unix)]
unsafe fn patch_slot(slot: *mut usize, value: usize) -> Result<(), HookError> {
    let page = page_size();
    let start = slot as usize & !(page - 1);
    let end = slot as usize + std::mem::size_of::<usize>();

    let result = libc::mprotect(
        start as *mut libc::c_void,
        end - start,
        libc::PROT_READ | libc::PROT_WRITE,
    );

    if result != 0 {
        return Err(HookError::PatchFailed(std::io::Error::last_os_error().to_string()));
    }

    std::ptr::write_volatile(slot, value);
    Ok(())
}

#[cfg(windows)]
unsafe fn patch_slot(slot: *mut usize, value: usize) -> Result<(), HookError> {
    use winapi::um::memoryapi::VirtualProtect;
    use winapi::um::winnt::PAGE_READWRITE;

    let size = std::mem::size_of::<usize>();
    let mut old = 0;

    if VirtualProtect(slot.cast(), size, PAGE_READWRITE, &mut old) == 0 {
        return Err(HookError::PatchFailed(std::io::Error::last_os_error().to_string()));
    }

    std::ptr::write_volatile(slot, value);

    let mut ignored = 0;
    VirtualProtect(slot.cast(), size, old, &mut ignored);

    Ok(())
}
