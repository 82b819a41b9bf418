//! Stand-ins for the driver, the shader compiler and the keyboard.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::asm;
use crate::driver::*;
use crate::input::InputSource;
use crate::service::{Backend, Service};
use crate::settings::Config;

/// A service whose directories live under `dir`, with the mock compiler and decompiler.
pub fn service_in(dir: &Path, configure: impl FnOnce(&mut Config)) -> Arc<Service> {
    let mut config = Config::default().resolve(dir);
    configure(&mut config);

    Service::init(
        config,
        Backend {
            compiler: Some(Arc::new(MockCompiler::default())),
            decompiler: Some(Arc::new(MockDecompiler)),
            input: None,
        },
    )
}

/// Builds a pixel shader container whose output colour is `value`.
pub fn pixel_shader(value: &str) -> Vec<u8> {
    let source = format!(
        "ps_5_0
dcl_constantbuffer cb0[1].xyzw, immediateIndexed
dcl_output o0.xyzw
mov o0.xyzw, l({0}, {0}, {0}, 1.0)
ret
",
        value
    );

    asm::assemble(&source).unwrap()
}

pub fn vertex_shader() -> Vec<u8> {
    asm::assemble("vs_5_0\ndcl_output o0.xyzw\nmov o0.xyzw, l(0, 0, 0, 1.0)\nret\n").unwrap()
}

#[derive(Debug)]
pub struct MockShader {
    pub stage: Stage,
    pub bytecode: Vec<u8>,
    releases: Option<Arc<AtomicUsize>>,
}

impl MockShader {
    pub fn new(stage: Stage) -> Arc<MockShader> {
        Arc::new(MockShader {
            stage,
            bytecode: vec![],
            releases: None,
        })
    }
}

impl DriverObject for MockShader {
    fn address(&self) -> usize {
        self as *const MockShader as usize
    }
}

impl DriverShader for MockShader {
    fn stage(&self) -> Stage {
        self.stage
    }
}

impl Drop for MockShader {
    fn drop(&mut self) {
        if let Some(releases) = &self.releases {
            releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Creates shaders from valid containers and counts how many of them have been released.
#[derive(Default)]
pub struct MockDevice {
    pub created: AtomicUsize,
    pub released_shaders: Arc<AtomicUsize>,
    pub released: AtomicBool,
}

impl MockDevice {
    pub fn new() -> Arc<MockDevice> {
        Arc::new(MockDevice::default())
    }

    pub fn live_shaders(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.released_shaders.load(Ordering::SeqCst)
    }
}

impl DriverObject for MockDevice {
    fn address(&self) -> usize {
        self as *const MockDevice as usize
    }
}

impl DriverDevice for MockDevice {
    fn create_shader(&self, stage: Stage, bytecode: &[u8]) -> Result<CompiledShader, DriverError> {
        asm::validate(bytecode).map_err(|err| DriverError::InvalidBytecode(err.to_string()))?;

        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MockShader {
            stage,
            bytecode: bytecode.to_vec(),
            releases: Some(self.released_shaders.clone()),
        }))
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// A call that reached the real context.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Call {
    Bind(Stage, Option<usize>),
    Draw(DrawCall),
    Dispatch(u32, u32, u32),
    Map(ResourceId, u32),
    Unmap(ResourceId, u32),
}

#[derive(Default)]
pub struct MockContext {
    pub calls: Mutex<Vec<Call>>,
}

impl MockContext {
    pub fn new() -> Arc<MockContext> {
        Arc::new(MockContext::default())
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn draws(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, Call::Draw(_) | Call::Dispatch(..)))
            .count()
    }

    /// The address of the shader most recently bound at `stage`.
    pub fn bound(&self, stage: Stage) -> Option<usize> {
        self.calls.lock().unwrap().iter().rev().find_map(|call| match call {
            Call::Bind(bound_stage, address) if *bound_stage == stage => Some(*address),
            _ => None,
        })?
    }
}

impl DriverObject for MockContext {
    fn address(&self) -> usize {
        self as *const MockContext as usize
    }
}

impl DriverContext for MockContext {
    fn bind_shader(&self, stage: Stage, shader: Option<&CompiledShader>) {
        self.push(Call::Bind(stage, shader.map(|shader| shader.address())));
    }

    fn draw(&self, call: DrawCall) {
        self.push(Call::Draw(call));
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) {
        self.push(Call::Dispatch(x, y, z));
    }

    fn map(&self, resource: ResourceId, subresource: u32, _: MapKind) -> Result<MappedRegion, DriverError> {
        self.push(Call::Map(resource, subresource));

        Ok(MappedRegion {
            data: std::ptr::null_mut(),
            row_pitch: 0,
            depth_pitch: 0,
        })
    }

    fn unmap(&self, resource: ResourceId, subresource: u32) {
        self.push(Call::Unmap(resource, subresource));
    }
}

#[derive(Default)]
pub struct MockSwapChain {
    pub presents: AtomicU32,
}

impl DriverObject for MockSwapChain {
    fn address(&self) -> usize {
        self as *const MockSwapChain as usize
    }
}

impl DriverSwapChain for MockSwapChain {
    fn present(&self, _: u32, _: u32) -> Result<(), DriverError> {
        self.presents.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockView {
    pub resource: ResourceId,
}

impl DriverObject for MockView {
    fn address(&self) -> usize {
        self as *const MockView as usize
    }
}

impl DriverView for MockView {
    fn resource(&self) -> ResourceId {
        self.resource
    }
}

/// "Compiles" by emitting a shader whose output depends on the length of the source. Any
/// source containing the word `error` fails.
#[derive(Default)]
pub struct MockCompiler {
    pub compiles: AtomicUsize,
}

impl ShaderCompiler for MockCompiler {
    fn compile(&self, source: &str, name: &str, profile: &str) -> Result<Vec<u8>, String> {
        self.compiles.fetch_add(1, Ordering::SeqCst);

        if source.contains("error") {
            return Err(format!("{}(1,1): error X3000: syntax error", name));
        }

        let assembly = format!("{}\nmov o0.xyzw, l({})\nret\n", profile, source.len());
        asm::assemble(&assembly).map_err(|err| err.to_string())
    }
}

pub struct MockDecompiler;

impl Decompiler for MockDecompiler {
    fn decompile(&self, _: &[u8], _: &str) -> Result<String, String> {
        Ok("// decompiled\nfloat4 main() : SV_Target0 { return 0; }\n".to_string())
    }
}

#[derive(Default)]
pub struct MockInput {
    down: Mutex<HashSet<String>>,
}

impl MockInput {
    pub fn press(&self, key: &str) {
        self.down.lock().unwrap().insert(key.to_string());
    }

    pub fn release(&self, key: &str) {
        self.down.lock().unwrap().remove(key);
    }
}

impl InputSource for MockInput {
    fn is_down(&self, key: &str) -> bool {
        self.down.lock().unwrap().contains(key)
    }
}
