//! Adapters from the real COM objects to the driver traits, and the dispatch table hooks that
//! route the game's calls into the wrappers.
//!
//! Objects nothing has wrapped (deferred contexts, shaders made with class linkage, anything
//! created before the hooks went in) are passed straight to the original functions.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use winapi::shared::dxgi::IDXGISwapChain;
use winapi::shared::dxgiformat::DXGI_FORMAT;
use winapi::shared::minwindef::{UINT, ULONG};
use winapi::shared::ntdef::HRESULT;
use winapi::shared::winerror::{E_FAIL, E_INVALIDARG, SUCCEEDED, S_OK};
use winapi::um::d3d11::{
    ID3D11Buffer, ID3D11ClassInstance, ID3D11ClassLinkage, ID3D11DepthStencilView, ID3D11Device,
    ID3D11DeviceChild, ID3D11DeviceContext, ID3D11RenderTargetView, ID3D11Resource, D3D11_MAP,
    D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ, D3D11_MAP_READ_WRITE, D3D11_MAP_WRITE,
    D3D11_MAP_WRITE_DISCARD, D3D11_MAP_WRITE_NO_OVERWRITE, D3D11_RENDER_TARGET_VIEW_DESC,
};
use winapi::um::unknwnbase::IUnknown;

use super::service;
use crate::driver::*;
use crate::hook::{guarded, Hook, HookError};
use crate::wrap::{WrappedContext, WrappedDevice, WrappedShader, WrappedSwapChain, WrappedView, Wrapper};

type CreateShaderFn = unsafe extern "system" fn(
    *mut ID3D11Device,
    *const c_void,
    usize,
    *mut ID3D11ClassLinkage,
    *mut *mut ID3D11DeviceChild,
) -> HRESULT;

type SetShaderFn =
    unsafe extern "system" fn(*mut ID3D11DeviceContext, *mut ID3D11DeviceChild, *const *mut ID3D11ClassInstance, UINT);

type RefCountFn = unsafe extern "system" fn(*mut IUnknown) -> ULONG;
type DrawFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, UINT, UINT);
type DrawIndexedFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, UINT, UINT, i32);
type DrawInstancedFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, UINT, UINT, UINT, UINT);
type DrawIndexedInstancedFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, UINT, UINT, UINT, i32, UINT);
type DispatchFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, UINT, UINT, UINT);

type MapFn = unsafe extern "system" fn(
    *mut ID3D11DeviceContext,
    *mut ID3D11Resource,
    UINT,
    D3D11_MAP,
    UINT,
    *mut D3D11_MAPPED_SUBRESOURCE,
) -> HRESULT;

type UnmapFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, *mut ID3D11Resource, UINT);

type SetVertexBuffersFn = unsafe extern "system" fn(
    *mut ID3D11DeviceContext,
    UINT,
    UINT,
    *const *mut ID3D11Buffer,
    *const UINT,
    *const UINT,
);

type SetIndexBufferFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, *mut ID3D11Buffer, DXGI_FORMAT, UINT);

type SetRenderTargetsFn = unsafe extern "system" fn(
    *mut ID3D11DeviceContext,
    UINT,
    *const *mut ID3D11RenderTargetView,
    *mut ID3D11DepthStencilView,
);

type PresentFn = unsafe extern "system" fn(*mut IDXGISwapChain, UINT, UINT) -> HRESULT;

type CreateRenderTargetViewFn = unsafe extern "system" fn(
    *mut ID3D11Device,
    *mut ID3D11Resource,
    *const D3D11_RENDER_TARGET_VIEW_DESC,
    *mut *mut ID3D11RenderTargetView,
) -> HRESULT;

// Dispatch table slots.
const ADD_REF_SLOT: usize = 1;
const RELEASE_SLOT: usize = 2;
const CREATE_RENDER_TARGET_VIEW_SLOT: usize = 9;
const DRAW_INDEXED_SLOT: usize = 12;
const DRAW_SLOT: usize = 13;
const MAP_SLOT: usize = 14;
const UNMAP_SLOT: usize = 15;
const SET_VERTEX_BUFFERS_SLOT: usize = 18;
const SET_INDEX_BUFFER_SLOT: usize = 19;
const DRAW_INDEXED_INSTANCED_SLOT: usize = 20;
const DRAW_INSTANCED_SLOT: usize = 21;
const SET_RENDER_TARGETS_SLOT: usize = 33;
const DISPATCH_SLOT: usize = 41;
const PRESENT_SLOT: usize = 8;

/// The hooks for one shader stage, indexed by program type in `STAGES`.
struct StageHooks {
    stage: Stage,
    create_slot: usize,
    set_slot: usize,
    create: Hook<CreateShaderFn>,
    set: Hook<SetShaderFn>,
    add_ref: Hook<RefCountFn>,
    release: Hook<RefCountFn>,
}

impl StageHooks {
    const fn new(stage: Stage, create: (&'static str, usize), set: (&'static str, usize)) -> StageHooks {
        StageHooks {
            stage,
            create_slot: create.1,
            set_slot: set.1,
            create: Hook::new(create.0),
            set: Hook::new(set.0),
            add_ref: Hook::new("AddRef"),
            release: Hook::new("Release"),
        }
    }
}

static STAGES: [StageHooks; 6] = [
    StageHooks::new(Stage::Pixel, ("CreatePixelShader", 15), ("PSSetShader", 9)),
    StageHooks::new(Stage::Vertex, ("CreateVertexShader", 12), ("VSSetShader", 11)),
    StageHooks::new(Stage::Geometry, ("CreateGeometryShader", 13), ("GSSetShader", 23)),
    StageHooks::new(Stage::Hull, ("CreateHullShader", 16), ("HSSetShader", 60)),
    StageHooks::new(Stage::Domain, ("CreateDomainShader", 17), ("DSSetShader", 64)),
    StageHooks::new(Stage::Compute, ("CreateComputeShader", 18), ("CSSetShader", 69)),
];

static DRAW: Hook<DrawFn> = Hook::new("Draw");
static DRAW_INDEXED: Hook<DrawIndexedFn> = Hook::new("DrawIndexed");
static DRAW_INSTANCED: Hook<DrawInstancedFn> = Hook::new("DrawInstanced");
static DRAW_INDEXED_INSTANCED: Hook<DrawIndexedInstancedFn> = Hook::new("DrawIndexedInstanced");
static DISPATCH: Hook<DispatchFn> = Hook::new("Dispatch");
static MAP: Hook<MapFn> = Hook::new("Map");
static UNMAP: Hook<UnmapFn> = Hook::new("Unmap");
static SET_VERTEX_BUFFERS: Hook<SetVertexBuffersFn> = Hook::new("IASetVertexBuffers");
static SET_INDEX_BUFFER: Hook<SetIndexBufferFn> = Hook::new("IASetIndexBuffer");
static SET_RENDER_TARGETS: Hook<SetRenderTargetsFn> = Hook::new("OMSetRenderTargets");
static PRESENT: Hook<PresentFn> = Hook::new("Present");
static CREATE_RENDER_TARGET_VIEW: Hook<CreateRenderTargetViewFn> = Hook::new("CreateRenderTargetView");
static VIEW_ADD_REF: Hook<RefCountFn> = Hook::new("AddRef");
static VIEW_RELEASE: Hook<RefCountFn> = Hook::new("Release");

/// Device-level wrappers live as long as the process. The driver keeps the real objects alive
/// for as long as the game uses them.
static LIVE: Lazy<Mutex<Vec<Arc<dyn Any + Send + Sync>>>> = Lazy::new(|| Mutex::new(vec![]));

fn keep(wrapper: Arc<dyn Any + Send + Sync>) {
    if let Ok(mut live) = LIVE.lock() {
        live.push(wrapper);
    }
}

/// Shader and view wrappers, by address, for as long as the game holds a reference to the
/// object. The identity table only has weak references.
static HELD: Lazy<Mutex<HashMap<usize, Arc<dyn Any + Send + Sync>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn hold(address: usize, wrapper: Arc<dyn Any + Send + Sync>) {
    let mut held = HELD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let previous = held.insert(address, wrapper);

    drop(held);
    drop(previous);
}

/// Called when the game's last reference to the object at `address` is gone.
fn let_go(address: usize) {
    let mut held = HELD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let wrapper = held.remove(&address);

    drop(held);
    drop(wrapper);
}

fn stage_hooks(stage: Stage) -> &'static StageHooks {
    &STAGES[stage.program_type() as usize]
}

unsafe fn slot(object: usize, index: usize) -> *mut usize {
    let table = *(object as *const *mut usize);
    table.add(index)
}

/// The original function behind `hook`, or the one currently in the table if the hook never
/// went in.
unsafe fn original<F: Copy>(hook: &Hook<F>, object: usize, index: usize) -> F {
    match hook.original() {
        Some(original) => original,
        None => std::mem::transmute_copy(&*slot(object, index)),
    }
}

unsafe fn install<F: Copy>(hook: &Hook<F>, object: usize, index: usize, replacement: F) {
    match hook.install_slot(slot(object, index), replacement) {
        Ok(_) | Err(HookError::AlreadyInstalled(_)) => {}
        Err(err) => log::error!("Unable to hook {}: {}", hook.name(), err),
    }
}

unsafe fn raw_add_ref(stage: Stage, object: usize) {
    let add_ref = original(&stage_hooks(stage).add_ref, object, ADD_REF_SLOT);
    add_ref(object as *mut IUnknown);
}

unsafe fn raw_release(stage: Stage, object: usize) {
    let release = original(&stage_hooks(stage).release, object, RELEASE_SLOT);
    release(object as *mut IUnknown);
}

fn status(result: HRESULT) -> Result<(), DriverError> {
    if SUCCEEDED(result) {
        Ok(())
    } else {
        Err(DriverError::Status(result))
    }
}

fn map_kind(map_type: D3D11_MAP) -> MapKind {
    match map_type {
        D3D11_MAP_READ => MapKind::Read,
        D3D11_MAP_WRITE => MapKind::Write,
        D3D11_MAP_READ_WRITE => MapKind::ReadWrite,
        D3D11_MAP_WRITE_DISCARD => MapKind::WriteDiscard,
        D3D11_MAP_WRITE_NO_OVERWRITE => MapKind::WriteNoOverwrite,
        _ => MapKind::ReadWrite,
    }
}

fn map_type(kind: MapKind) -> D3D11_MAP {
    match kind {
        MapKind::Read => D3D11_MAP_READ,
        MapKind::Write => D3D11_MAP_WRITE,
        MapKind::ReadWrite => D3D11_MAP_READ_WRITE,
        MapKind::WriteDiscard => D3D11_MAP_WRITE_DISCARD,
        MapKind::WriteNoOverwrite => D3D11_MAP_WRITE_NO_OVERWRITE,
    }
}

/// A shader object holding one reference of its own.
#[derive(Debug)]
pub struct ComShader {
    raw: usize,
    stage: Stage,
}

impl DriverObject for ComShader {
    fn address(&self) -> usize {
        self.raw
    }
}

impl DriverShader for ComShader {
    fn stage(&self) -> Stage {
        self.stage
    }
}

impl Drop for ComShader {
    fn drop(&mut self) {
        unsafe { raw_release(self.stage, self.raw) };
    }
}

pub struct ComDevice {
    raw: usize,
}

impl DriverObject for ComDevice {
    fn address(&self) -> usize {
        self.raw
    }
}

impl DriverDevice for ComDevice {
    fn create_shader(&self, stage: Stage, bytecode: &[u8]) -> Result<CompiledShader, DriverError> {
        let hooks = stage_hooks(stage);
        let mut shader = std::ptr::null_mut();

        let result = unsafe {
            let create = original(&hooks.create, self.raw, hooks.create_slot);

            create(
                self.raw as *mut ID3D11Device,
                bytecode.as_ptr().cast(),
                bytecode.len(),
                std::ptr::null_mut(),
                &mut shader,
            )
        };

        if result == E_INVALIDARG {
            return Err(DriverError::InvalidBytecode(format!("{:#010x}", result)));
        }

        status(result)?;

        if shader.is_null() {
            return Err(DriverError::Status(E_FAIL));
        }

        let raw = shader as usize;

        // Reference counts on this stage's objects are mirrored into their wrappers.
        unsafe {
            install(&hooks.add_ref, raw, ADD_REF_SLOT, add_ref_replacement(stage));
            install(&hooks.release, raw, RELEASE_SLOT, release_replacement(stage));
        }

        Ok(Arc::new(ComShader { raw, stage }))
    }
}

pub struct ComContext {
    raw: usize,
}

impl ComContext {
    fn this(&self) -> *mut ID3D11DeviceContext {
        self.raw as *mut ID3D11DeviceContext
    }
}

impl DriverObject for ComContext {
    fn address(&self) -> usize {
        self.raw
    }
}

impl DriverContext for ComContext {
    fn bind_shader(&self, stage: Stage, shader: Option<&CompiledShader>) {
        let hooks = stage_hooks(stage);
        let shader = shader.map_or(std::ptr::null_mut(), |shader| shader.address() as *mut ID3D11DeviceChild);

        unsafe {
            let set = original(&hooks.set, self.raw, hooks.set_slot);
            set(self.this(), shader, std::ptr::null(), 0);
        }
    }

    fn draw(&self, call: DrawCall) {
        unsafe {
            match call {
                DrawCall::Draw {
                    vertex_count,
                    start_vertex,
                } => original(&DRAW, self.raw, DRAW_SLOT)(self.this(), vertex_count, start_vertex),

                DrawCall::DrawIndexed {
                    index_count,
                    start_index,
                    base_vertex,
                } => original(&DRAW_INDEXED, self.raw, DRAW_INDEXED_SLOT)(
                    self.this(),
                    index_count,
                    start_index,
                    base_vertex,
                ),

                DrawCall::DrawInstanced {
                    vertex_count,
                    instance_count,
                    start_vertex,
                    start_instance,
                } => original(&DRAW_INSTANCED, self.raw, DRAW_INSTANCED_SLOT)(
                    self.this(),
                    vertex_count,
                    instance_count,
                    start_vertex,
                    start_instance,
                ),

                DrawCall::DrawIndexedInstanced {
                    index_count,
                    instance_count,
                    start_index,
                    base_vertex,
                    start_instance,
                } => original(&DRAW_INDEXED_INSTANCED, self.raw, DRAW_INDEXED_INSTANCED_SLOT)(
                    self.this(),
                    index_count,
                    instance_count,
                    start_index,
                    base_vertex,
                    start_instance,
                ),
            }
        }
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe { original(&DISPATCH, self.raw, DISPATCH_SLOT)(self.this(), x, y, z) }
    }

    fn map(&self, resource: ResourceId, subresource: u32, kind: MapKind) -> Result<MappedRegion, DriverError> {
        let mut mapped: D3D11_MAPPED_SUBRESOURCE = unsafe { std::mem::zeroed() };

        let result = unsafe {
            original(&MAP, self.raw, MAP_SLOT)(
                self.this(),
                resource as *mut ID3D11Resource,
                subresource,
                map_type(kind),
                0,
                &mut mapped,
            )
        };

        status(result)?;

        Ok(MappedRegion {
            data: mapped.pData.cast(),
            row_pitch: mapped.RowPitch,
            depth_pitch: mapped.DepthPitch,
        })
    }

    fn unmap(&self, resource: ResourceId, subresource: u32) {
        unsafe { original(&UNMAP, self.raw, UNMAP_SLOT)(self.this(), resource as *mut ID3D11Resource, subresource) }
    }
}

pub struct ComSwapChain {
    raw: usize,
}

impl DriverObject for ComSwapChain {
    fn address(&self) -> usize {
        self.raw
    }
}

impl DriverSwapChain for ComSwapChain {
    fn present(&self, sync_interval: u32, flags: u32) -> Result<(), DriverError> {
        let result = unsafe {
            original(&PRESENT, self.raw, PRESENT_SLOT)(self.raw as *mut IDXGISwapChain, sync_interval, flags)
        };

        status(result)
    }
}

/// A render target view holding one reference of its own. The resource is the one the view was
/// created on.
pub struct ComView {
    raw: usize,
    resource: ResourceId,
}

impl DriverObject for ComView {
    fn address(&self) -> usize {
        self.raw
    }
}

impl DriverView for ComView {
    fn resource(&self) -> ResourceId {
        self.resource
    }
}

impl Drop for ComView {
    fn drop(&mut self) {
        unsafe { original(&VIEW_RELEASE, self.raw, RELEASE_SLOT)(self.raw as *mut IUnknown) };
    }
}

fn wrapper<T: Wrapper>(object: usize) -> Option<Arc<T>> {
    service().registry().object::<T>(object)
}

/// Wraps a device the game just created, along with its immediate context and swap chain,
/// and hooks their dispatch tables.
///
/// # Safety
/// `device` must be a live device. `context` and `swap_chain` may be null.
pub unsafe fn attach(device: *mut ID3D11Device, context: *mut ID3D11DeviceContext, swap_chain: *mut IDXGISwapChain) {
    let service = service();

    for hooks in &STAGES {
        install(&hooks.create, device as usize, hooks.create_slot, create_replacement(hooks.stage));
    }

    install(
        &CREATE_RENDER_TARGET_VIEW,
        device as usize,
        CREATE_RENDER_TARGET_VIEW_SLOT,
        create_render_target_view_hook,
    );

    let wrapped = WrappedDevice::wrap(Arc::new(ComDevice { raw: device as usize }), service);
    keep(wrapped.clone());

    let mut context = context;
    let fetched = context.is_null();

    if fetched {
        (*device).GetImmediateContext(&mut context);
    }

    if !context.is_null() {
        hook_context(context as usize);
        keep(wrapped.wrap_context(Arc::new(ComContext { raw: context as usize })));

        if fetched {
            (*context).Release();
        }
    }

    if !swap_chain.is_null() {
        install(&PRESENT, swap_chain as usize, PRESENT_SLOT, present_hook);
        keep(wrapped.wrap_swap_chain(Arc::new(ComSwapChain {
            raw: swap_chain as usize,
        })));
    }

    log::info!("Attached to device {:#x}", device as usize);
}

unsafe fn hook_context(context: usize) {
    for hooks in &STAGES {
        install(&hooks.set, context, hooks.set_slot, set_replacement(hooks.stage));
    }

    install(&DRAW, context, DRAW_SLOT, draw_hook);
    install(&DRAW_INDEXED, context, DRAW_INDEXED_SLOT, draw_indexed_hook);
    install(&DRAW_INSTANCED, context, DRAW_INSTANCED_SLOT, draw_instanced_hook);
    install(&DRAW_INDEXED_INSTANCED, context, DRAW_INDEXED_INSTANCED_SLOT, draw_indexed_instanced_hook);
    install(&DISPATCH, context, DISPATCH_SLOT, dispatch_hook);
    install(&MAP, context, MAP_SLOT, map_hook);
    install(&UNMAP, context, UNMAP_SLOT, unmap_hook);
    install(&SET_VERTEX_BUFFERS, context, SET_VERTEX_BUFFERS_SLOT, set_vertex_buffers_hook);
    install(&SET_INDEX_BUFFER, context, SET_INDEX_BUFFER_SLOT, set_index_buffer_hook);
    install(&SET_RENDER_TARGETS, context, SET_RENDER_TARGETS_SLOT, set_render_targets_hook);
}

// Each stage needs its own function for every hook, so the stage is a const parameter (the
// program type).

fn stage_of(program_type: u32) -> Stage {
    STAGES[program_type as usize].stage
}

fn create_replacement(stage: Stage) -> CreateShaderFn {
    match stage {
        Stage::Pixel => create_hook::<0>,
        Stage::Vertex => create_hook::<1>,
        Stage::Geometry => create_hook::<2>,
        Stage::Hull => create_hook::<3>,
        Stage::Domain => create_hook::<4>,
        Stage::Compute => create_hook::<5>,
    }
}

fn set_replacement(stage: Stage) -> SetShaderFn {
    match stage {
        Stage::Pixel => set_hook::<0>,
        Stage::Vertex => set_hook::<1>,
        Stage::Geometry => set_hook::<2>,
        Stage::Hull => set_hook::<3>,
        Stage::Domain => set_hook::<4>,
        Stage::Compute => set_hook::<5>,
    }
}

fn add_ref_replacement(stage: Stage) -> RefCountFn {
    match stage {
        Stage::Pixel => add_ref_hook::<0>,
        Stage::Vertex => add_ref_hook::<1>,
        Stage::Geometry => add_ref_hook::<2>,
        Stage::Hull => add_ref_hook::<3>,
        Stage::Domain => add_ref_hook::<4>,
        Stage::Compute => add_ref_hook::<5>,
    }
}

fn release_replacement(stage: Stage) -> RefCountFn {
    match stage {
        Stage::Pixel => release_hook::<0>,
        Stage::Vertex => release_hook::<1>,
        Stage::Geometry => release_hook::<2>,
        Stage::Hull => release_hook::<3>,
        Stage::Domain => release_hook::<4>,
        Stage::Compute => release_hook::<5>,
    }
}

unsafe extern "system" fn create_hook<const PROGRAM: u32>(
    this: *mut ID3D11Device,
    bytecode: *const c_void,
    length: usize,
    linkage: *mut ID3D11ClassLinkage,
    out: *mut *mut ID3D11DeviceChild,
) -> HRESULT {
    let stage = stage_of(PROGRAM);
    let hooks = stage_hooks(stage);
    let real = original(&hooks.create, this as usize, hooks.create_slot);

    guarded(
        hooks.create.name(),
        || create_shader(stage, this, bytecode, length, linkage, out, real),
        || real(this, bytecode, length, linkage, out),
    )
}

unsafe fn create_shader(
    stage: Stage,
    this: *mut ID3D11Device,
    bytecode: *const c_void,
    length: usize,
    linkage: *mut ID3D11ClassLinkage,
    out: *mut *mut ID3D11DeviceChild,
    real: CreateShaderFn,
) -> HRESULT {
    let device = match wrapper::<WrappedDevice>(this as usize) {
        Some(device) if linkage.is_null() && !bytecode.is_null() => device,
        _ => return real(this, bytecode, length, linkage, out),
    };

    let bytecode = std::slice::from_raw_parts(bytecode.cast::<u8>(), length);

    let shader = match device.create_shader(stage, bytecode) {
        Ok(shader) => shader,
        Err(DriverError::Status(result)) => return result,
        Err(DriverError::InvalidBytecode(_)) => return E_INVALIDARG,
        Err(DriverError::Released) => return E_FAIL,
    };

    // The game holds the handle's own original. Binds are resolved to the replacement later.
    let own = match shader.own_original() {
        Some(own) => own,
        None => return E_FAIL,
    };

    if out.is_null() {
        // The game only wanted the bytecode checked.
        shader.release();
        return S_OK;
    }

    raw_add_ref(stage, own.address());
    hold(own.address(), shader);
    *out = own.address() as *mut ID3D11DeviceChild;

    S_OK
}

unsafe extern "system" fn set_hook<const PROGRAM: u32>(
    this: *mut ID3D11DeviceContext,
    shader: *mut ID3D11DeviceChild,
    instances: *const *mut ID3D11ClassInstance,
    instance_count: UINT,
) {
    let stage = stage_of(PROGRAM);
    let hooks = stage_hooks(stage);
    let real = original(&hooks.set, this as usize, hooks.set_slot);

    let bind = || {
        let context = match wrapper::<WrappedContext>(this as usize) {
            Some(context) => context,
            None => return real(this, shader, instances, instance_count),
        };

        if shader.is_null() {
            context.set_shader(stage, None);
            return;
        }

        match wrapper::<WrappedShader>(shader as usize) {
            Some(wrapped) if instance_count == 0 => context.set_shader(stage, Some(&wrapped)),
            _ => {
                context.forget_shader(stage);
                real(this, shader, instances, instance_count);
            }
        }
    };

    guarded(hooks.set.name(), bind, || real(this, shader, instances, instance_count))
}

unsafe extern "system" fn add_ref_hook<const PROGRAM: u32>(this: *mut IUnknown) -> ULONG {
    let hooks = stage_hooks(stage_of(PROGRAM));
    let count = original(&hooks.add_ref, this as usize, ADD_REF_SLOT)(this);

    let mirror = || {
        if let Some(shader) = wrapper::<WrappedShader>(this as usize) {
            shader.add_ref();
        }
    };

    guarded(hooks.add_ref.name(), mirror, || ());
    count
}

unsafe extern "system" fn release_hook<const PROGRAM: u32>(this: *mut IUnknown) -> ULONG {
    let hooks = stage_hooks(stage_of(PROGRAM));

    // Our own references keep the object alive through both calls.
    let shader = guarded(hooks.release.name(), || wrapper::<WrappedShader>(this as usize), || None);
    let count = original(&hooks.release, this as usize, RELEASE_SLOT)(this);

    if let Some(shader) = shader {
        let mirror = || {
            if shader.release() == 0 {
                let_go(this as usize);
            }
        };

        guarded(hooks.release.name(), mirror, || ());
    }

    count
}

unsafe extern "system" fn create_render_target_view_hook(
    this: *mut ID3D11Device,
    resource: *mut ID3D11Resource,
    desc: *const D3D11_RENDER_TARGET_VIEW_DESC,
    out: *mut *mut ID3D11RenderTargetView,
) -> HRESULT {
    let create = original(&CREATE_RENDER_TARGET_VIEW, this as usize, CREATE_RENDER_TARGET_VIEW_SLOT);
    let result = create(this, resource, desc, out);

    if SUCCEEDED(result) && !out.is_null() && !(*out).is_null() {
        let view = *out as usize;

        guarded(
            CREATE_RENDER_TARGET_VIEW.name(),
            || wrap_view(this as usize, view, resource as ResourceId),
            || (),
        );
    }

    result
}

/// Wraps a view the game just created on a wrapped device. The wrapper's count starts at the
/// game's one reference; the wrapper holds a second one of its own.
unsafe fn wrap_view(device: usize, view: usize, resource: ResourceId) {
    let device = match wrapper::<WrappedDevice>(device) {
        Some(device) => device,
        None => return,
    };

    install(&VIEW_ADD_REF, view, ADD_REF_SLOT, view_add_ref_hook);
    install(&VIEW_RELEASE, view, RELEASE_SLOT, view_release_hook);

    original(&VIEW_ADD_REF, view, ADD_REF_SLOT)(view as *mut IUnknown);
    hold(view, device.wrap_view(Arc::new(ComView { raw: view, resource })));
}

unsafe extern "system" fn view_add_ref_hook(this: *mut IUnknown) -> ULONG {
    let count = original(&VIEW_ADD_REF, this as usize, ADD_REF_SLOT)(this);

    let mirror = || {
        if let Some(view) = wrapper::<WrappedView>(this as usize) {
            view.add_ref();
        }
    };

    guarded(VIEW_ADD_REF.name(), mirror, || ());
    count
}

unsafe extern "system" fn view_release_hook(this: *mut IUnknown) -> ULONG {
    let view = guarded(VIEW_RELEASE.name(), || wrapper::<WrappedView>(this as usize), || None);
    let count = original(&VIEW_RELEASE, this as usize, RELEASE_SLOT)(this);

    if let Some(view) = view {
        let mirror = || {
            if view.release() == 0 {
                let_go(this as usize);
            }
        };

        guarded(VIEW_RELEASE.name(), mirror, || ());
    }

    count
}

unsafe extern "system" fn draw_hook(this: *mut ID3D11DeviceContext, vertex_count: UINT, start_vertex: UINT) {
    let real = original(&DRAW, this as usize, DRAW_SLOT);

    let draw = || match wrapper::<WrappedContext>(this as usize) {
        Some(context) => context.draw(DrawCall::Draw {
            vertex_count,
            start_vertex,
        }),

        None => real(this, vertex_count, start_vertex),
    };

    guarded(DRAW.name(), draw, || real(this, vertex_count, start_vertex))
}

unsafe extern "system" fn draw_indexed_hook(
    this: *mut ID3D11DeviceContext,
    index_count: UINT,
    start_index: UINT,
    base_vertex: i32,
) {
    let real = original(&DRAW_INDEXED, this as usize, DRAW_INDEXED_SLOT);

    let draw = || match wrapper::<WrappedContext>(this as usize) {
        Some(context) => context.draw(DrawCall::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
        }),

        None => real(this, index_count, start_index, base_vertex),
    };

    guarded(DRAW_INDEXED.name(), draw, || real(this, index_count, start_index, base_vertex))
}

unsafe extern "system" fn draw_instanced_hook(
    this: *mut ID3D11DeviceContext,
    vertex_count: UINT,
    instance_count: UINT,
    start_vertex: UINT,
    start_instance: UINT,
) {
    let real = original(&DRAW_INSTANCED, this as usize, DRAW_INSTANCED_SLOT);

    let draw = || match wrapper::<WrappedContext>(this as usize) {
        Some(context) => context.draw(DrawCall::DrawInstanced {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        }),

        None => real(this, vertex_count, instance_count, start_vertex, start_instance),
    };

    guarded(DRAW_INSTANCED.name(), draw, || {
        real(this, vertex_count, instance_count, start_vertex, start_instance)
    })
}

unsafe extern "system" fn draw_indexed_instanced_hook(
    this: *mut ID3D11DeviceContext,
    index_count: UINT,
    instance_count: UINT,
    start_index: UINT,
    base_vertex: i32,
    start_instance: UINT,
) {
    let real = original(&DRAW_INDEXED_INSTANCED, this as usize, DRAW_INDEXED_INSTANCED_SLOT);

    let draw = || match wrapper::<WrappedContext>(this as usize) {
        Some(context) => context.draw(DrawCall::DrawIndexedInstanced {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        }),

        None => real(this, index_count, instance_count, start_index, base_vertex, start_instance),
    };

    guarded(DRAW_INDEXED_INSTANCED.name(), draw, || {
        real(this, index_count, instance_count, start_index, base_vertex, start_instance)
    })
}

unsafe extern "system" fn dispatch_hook(this: *mut ID3D11DeviceContext, x: UINT, y: UINT, z: UINT) {
    let real = original(&DISPATCH, this as usize, DISPATCH_SLOT);

    let dispatch = || match wrapper::<WrappedContext>(this as usize) {
        Some(context) => context.dispatch(x, y, z),
        None => real(this, x, y, z),
    };

    guarded(DISPATCH.name(), dispatch, || real(this, x, y, z))
}

unsafe extern "system" fn map_hook(
    this: *mut ID3D11DeviceContext,
    resource: *mut ID3D11Resource,
    subresource: UINT,
    map_type: D3D11_MAP,
    flags: UINT,
    mapped: *mut D3D11_MAPPED_SUBRESOURCE,
) -> HRESULT {
    // Called directly so the game's flags (such as "don't wait") are kept.
    let result = original(&MAP, this as usize, MAP_SLOT)(this, resource, subresource, map_type, flags, mapped);

    if SUCCEEDED(result) {
        let note = || {
            if let Some(context) = wrapper::<WrappedContext>(this as usize) {
                context.note_map(resource as ResourceId, subresource, map_kind(map_type));
            }
        };

        guarded(MAP.name(), note, || ());
    }

    result
}

unsafe extern "system" fn unmap_hook(this: *mut ID3D11DeviceContext, resource: *mut ID3D11Resource, subresource: UINT) {
    let note = || {
        if let Some(context) = wrapper::<WrappedContext>(this as usize) {
            context.note_unmap(resource as ResourceId, subresource);
        }
    };

    guarded(UNMAP.name(), note, || ());
    original(&UNMAP, this as usize, UNMAP_SLOT)(this, resource, subresource);
}

/// The addresses in an array of interface pointers, `None` for null entries.
unsafe fn addresses<T>(pointers: *const *mut T, count: UINT) -> Vec<Option<usize>> {
    if pointers.is_null() {
        return vec![None; count as usize];
    }

    std::slice::from_raw_parts(pointers, count as usize)
        .iter()
        .map(|&pointer| (!pointer.is_null()).then(|| pointer as usize))
        .collect()
}

unsafe extern "system" fn set_vertex_buffers_hook(
    this: *mut ID3D11DeviceContext,
    start_slot: UINT,
    count: UINT,
    buffers: *const *mut ID3D11Buffer,
    strides: *const UINT,
    offsets: *const UINT,
) {
    original(&SET_VERTEX_BUFFERS, this as usize, SET_VERTEX_BUFFERS_SLOT)(this, start_slot, count, buffers, strides, offsets);

    let note = || {
        if let Some(context) = wrapper::<WrappedContext>(this as usize) {
            context.set_vertex_buffers(start_slot, &addresses(buffers, count));
        }
    };

    guarded(SET_VERTEX_BUFFERS.name(), note, || ());
}

unsafe extern "system" fn set_index_buffer_hook(
    this: *mut ID3D11DeviceContext,
    buffer: *mut ID3D11Buffer,
    format: DXGI_FORMAT,
    offset: UINT,
) {
    original(&SET_INDEX_BUFFER, this as usize, SET_INDEX_BUFFER_SLOT)(this, buffer, format, offset);

    let note = || {
        if let Some(context) = wrapper::<WrappedContext>(this as usize) {
            context.set_index_buffer((!buffer.is_null()).then(|| buffer as ResourceId));
        }
    };

    guarded(SET_INDEX_BUFFER.name(), note, || ());
}

unsafe extern "system" fn set_render_targets_hook(
    this: *mut ID3D11DeviceContext,
    count: UINT,
    views: *const *mut ID3D11RenderTargetView,
    depth_stencil: *mut ID3D11DepthStencilView,
) {
    original(&SET_RENDER_TARGETS, this as usize, SET_RENDER_TARGETS_SLOT)(this, count, views, depth_stencil);

    let note = || {
        let context = match wrapper::<WrappedContext>(this as usize) {
            Some(context) => context,
            None => return,
        };

        // Views made on a wrapped device were wrapped as they were created.
        let wrapped: Vec<Option<Arc<WrappedView>>> = addresses(views, count)
            .into_iter()
            .map(|view| view.and_then(wrapper::<WrappedView>))
            .collect();

        let targets: Vec<_> = wrapped.iter().map(Option::as_ref).collect();
        context.set_render_targets(&targets);
    };

    guarded(SET_RENDER_TARGETS.name(), note, || ());
}

unsafe extern "system" fn present_hook(this: *mut IDXGISwapChain, sync_interval: UINT, flags: UINT) -> HRESULT {
    let real = original(&PRESENT, this as usize, PRESENT_SLOT);

    let present = || {
        let swap_chain = match wrapper::<WrappedSwapChain>(this as usize) {
            Some(swap_chain) => swap_chain,
            None => return real(this, sync_interval, flags),
        };

        match swap_chain.present(sync_interval, flags) {
            Ok(()) => S_OK,
            Err(DriverError::Status(result)) => result,
            Err(_) => E_FAIL,
        }
    };

    guarded(PRESENT.name(), present, || real(this, sync_interval, flags))
}
