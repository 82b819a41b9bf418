//! The entry points the game links against. They forward to the system library and wrap what
//! it returns.

#![allow(non_snake_case)]

use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;

use once_cell::sync::OnceCell;
use winapi::shared::dxgi::{IDXGIAdapter, IDXGISwapChain, DXGI_SWAP_CHAIN_DESC};
use winapi::shared::minwindef::{HMODULE, UINT};
use winapi::shared::ntdef::HRESULT;
use winapi::shared::winerror::{E_FAIL, SUCCEEDED};
use winapi::um::d3d11::{ID3D11Device, ID3D11DeviceContext};
use winapi::um::d3dcommon::{D3D_DRIVER_TYPE, D3D_FEATURE_LEVEL};
use winapi::um::sysinfoapi::GetSystemDirectoryW;

use super::com;
use crate::hook::{guarded, Hook, Module};

type CreateDeviceFn = unsafe extern "system" fn(
    *mut IDXGIAdapter,
    D3D_DRIVER_TYPE,
    HMODULE,
    UINT,
    *const D3D_FEATURE_LEVEL,
    UINT,
    UINT,
    *mut *mut ID3D11Device,
    *mut D3D_FEATURE_LEVEL,
    *mut *mut ID3D11DeviceContext,
) -> HRESULT;

type CreateDeviceAndSwapChainFn = unsafe extern "system" fn(
    *mut IDXGIAdapter,
    D3D_DRIVER_TYPE,
    HMODULE,
    UINT,
    *const D3D_FEATURE_LEVEL,
    UINT,
    UINT,
    *const DXGI_SWAP_CHAIN_DESC,
    *mut *mut IDXGISwapChain,
    *mut *mut ID3D11Device,
    *mut D3D_FEATURE_LEVEL,
    *mut *mut ID3D11DeviceContext,
) -> HRESULT;

static CREATE_DEVICE: Hook<CreateDeviceFn> = Hook::new("D3D11CreateDevice");
static CREATE_DEVICE_AND_SWAP_CHAIN: Hook<CreateDeviceAndSwapChainFn> = Hook::new("D3D11CreateDeviceAndSwapChain");

static SYSTEM_LIBRARY: OnceCell<Option<Module>> = OnceCell::new();

fn system_library_path() -> PathBuf {
    let mut buffer = [0u16; 260];
    let length = unsafe { GetSystemDirectoryW(buffer.as_mut_ptr(), buffer.len() as UINT) } as usize;

    if length == 0 || length > buffer.len() {
        return PathBuf::from(r"C:\Windows\System32\d3d11.dll");
    }

    PathBuf::from(std::ffi::OsString::from_wide(&buffer[..length])).join("d3d11.dll")
}

/// Loads the real library and hooks its entry points, once.
fn install() {
    let module = SYSTEM_LIBRARY.get_or_init(|| {
        let path = system_library_path();

        match Module::open(&path.to_string_lossy()) {
            Ok(module) => Some(module),
            Err(err) => {
                log::error!("Unable to load the system Direct3D library: {}", err);
                None
            }
        }
    });

    let module = match module {
        Some(module) => module,
        None => return,
    };

    // Failures are logged by the hooks, and a hook that didn't go in just has no original.
    let _ = CREATE_DEVICE.forward(module, D3D11CreateDevice);
    let _ = CREATE_DEVICE_AND_SWAP_CHAIN.forward(module, D3D11CreateDeviceAndSwapChain);
}

/// The real entry point behind `hook`. The first call also starts the service, which can't
/// happen while the library is being loaded.
fn real<F: Copy>(hook: &Hook<F>) -> Option<F> {
    let forward = || {
        super::service();

        if !hook.is_installed() {
            install();
        }

        hook.original()
    };

    guarded(hook.name(), forward, || None)
}

/// Replaces `D3D11CreateDevice`.
///
/// # Safety
/// Same contract as the function it replaces.
#[no_mangle]
pub unsafe extern "system" fn D3D11CreateDevice(
    adapter: *mut IDXGIAdapter,
    driver_type: D3D_DRIVER_TYPE,
    software: HMODULE,
    flags: UINT,
    feature_levels: *const D3D_FEATURE_LEVEL,
    feature_level_count: UINT,
    sdk_version: UINT,
    device: *mut *mut ID3D11Device,
    feature_level: *mut D3D_FEATURE_LEVEL,
    context: *mut *mut ID3D11DeviceContext,
) -> HRESULT {
    let create = match real(&CREATE_DEVICE) {
        Some(create) => create,
        None => return E_FAIL,
    };

    let result = create(
        adapter,
        driver_type,
        software,
        flags,
        feature_levels,
        feature_level_count,
        sdk_version,
        device,
        feature_level,
        context,
    );

    // A null device pointer means the game only asked which feature level it would get.
    if SUCCEEDED(result) && !device.is_null() && !(*device).is_null() {
        let context = if context.is_null() { std::ptr::null_mut() } else { *context };
        guarded(CREATE_DEVICE.name(), || com::attach(*device, context, std::ptr::null_mut()), || ());
    }

    result
}

/// Replaces `D3D11CreateDeviceAndSwapChain`.
///
/// # Safety
/// Same contract as the function it replaces.
#[no_mangle]
pub unsafe extern "system" fn D3D11CreateDeviceAndSwapChain(
    adapter: *mut IDXGIAdapter,
    driver_type: D3D_DRIVER_TYPE,
    software: HMODULE,
    flags: UINT,
    feature_levels: *const D3D_FEATURE_LEVEL,
    feature_level_count: UINT,
    sdk_version: UINT,
    swap_chain_desc: *const DXGI_SWAP_CHAIN_DESC,
    swap_chain: *mut *mut IDXGISwapChain,
    device: *mut *mut ID3D11Device,
    feature_level: *mut D3D_FEATURE_LEVEL,
    context: *mut *mut ID3D11DeviceContext,
) -> HRESULT {
    let create = match real(&CREATE_DEVICE_AND_SWAP_CHAIN) {
        Some(create) => create,
        None => return E_FAIL,
    };

    let result = create(
        adapter,
        driver_type,
        software,
        flags,
        feature_levels,
        feature_level_count,
        sdk_version,
        swap_chain_desc,
        swap_chain,
        device,
        feature_level,
        context,
    );

    if SUCCEEDED(result) && !device.is_null() && !(*device).is_null() {
        let context = if context.is_null() { std::ptr::null_mut() } else { *context };
        let swap_chain = if swap_chain.is_null() { std::ptr::null_mut() } else { *swap_chain };

        guarded(
            CREATE_DEVICE_AND_SWAP_CHAIN.name(),
            || com::attach(*device, context, swap_chain),
            || (),
        );
    }

    result
}
