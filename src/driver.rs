//! The boundary between this crate and the real graphics driver.
//!
//! Everything the driver hands back is modelled as a small capability trait. The Windows
//! backend implements these over the real COM interfaces, and the test suite implements them
//! with mocks. Real objects are shared through `Arc`, and dropping the last `Arc` releases the
//! driver's reference exactly once.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoStaticStr};

/// The pipeline stage a shader runs at.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
pub enum Stage {
    Vertex,
    Pixel,
    Geometry,
    Hull,
    Domain,
    Compute,
}

impl Stage {
    /// The two-letter abbreviation used in file names and shader profiles ("ps", "vs", ...).
    pub fn abbrev(self) -> &'static str {
        match self {
            Stage::Vertex => "vs",
            Stage::Pixel => "ps",
            Stage::Geometry => "gs",
            Stage::Hull => "hs",
            Stage::Domain => "ds",
            Stage::Compute => "cs",
        }
    }

    pub fn from_abbrev(abbrev: &str) -> Option<Stage> {
        Some(match abbrev.to_ascii_lowercase().as_str() {
            "vs" => Stage::Vertex,
            "ps" => Stage::Pixel,
            "gs" => Stage::Geometry,
            "hs" => Stage::Hull,
            "ds" => Stage::Domain,
            "cs" => Stage::Compute,
            _ => return None,
        })
    }

    /// Maps the program type stored in the top half of a code chunk's version token.
    pub fn from_program_type(program_type: u32) -> Option<Stage> {
        Some(match program_type {
            0 => Stage::Pixel,
            1 => Stage::Vertex,
            2 => Stage::Geometry,
            3 => Stage::Hull,
            4 => Stage::Domain,
            5 => Stage::Compute,
            _ => return None,
        })
    }

    pub fn program_type(self) -> u32 {
        match self {
            Stage::Pixel => 0,
            Stage::Vertex => 1,
            Stage::Geometry => 2,
            Stage::Hull => 3,
            Stage::Domain => 4,
            Stage::Compute => 5,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbrev())
    }
}

/// An error reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The driver returned a failing status code.
    Status(i32),

    /// The driver refused the bytecode it was given.
    InvalidBytecode(String),

    /// The object has already been released through its wrapper.
    Released,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Status(code) => write!(f, "driver returned {:#010x}", code),
            DriverError::InvalidBytecode(reason) => write!(f, "driver rejected bytecode: {}", reason),
            DriverError::Released => f.write_str("object was already released"),
        }
    }
}

impl std::error::Error for DriverError {}

/// Identifies a driver resource (buffer or texture) by its address.
pub type ResourceId = usize;

/// Anything the driver hands out.
pub trait DriverObject: Send + Sync {
    /// The address of the real object. Used as the identity key for wrappers.
    fn address(&self) -> usize;
}

/// A compiled shader object living inside the driver.
pub trait DriverShader: DriverObject + Debug {
    fn stage(&self) -> Stage;
}

pub type CompiledShader = Arc<dyn DriverShader>;

/// Returns true if both handles refer to the same driver object.
pub fn same_shader(a: &CompiledShader, b: &CompiledShader) -> bool {
    a.address() == b.address()
}

/// The shader-creation surface of a device.
pub trait DriverDevice: DriverObject {
    fn create_shader(&self, stage: Stage, bytecode: &[u8]) -> Result<CompiledShader, DriverError>;
}

/// How a resource is mapped for CPU access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapKind {
    Read,
    Write,
    ReadWrite,
    WriteDiscard,
    WriteNoOverwrite,
}

impl MapKind {
    pub fn writes(self) -> bool {
        !matches!(self, MapKind::Read)
    }
}

/// A CPU-visible view of a mapped subresource.
#[derive(Clone, Copy, Debug)]
pub struct MappedRegion {
    pub data: *mut u8,
    pub row_pitch: u32,
    pub depth_pitch: u32,
}

/// Parameters of a draw call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DrawCall {
    Draw { vertex_count: u32, start_vertex: u32 },
    DrawIndexed { index_count: u32, start_index: u32, base_vertex: i32 },
    DrawInstanced { vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32 },
    DrawIndexedInstanced { index_count: u32, instance_count: u32, start_index: u32, base_vertex: i32, start_instance: u32 },
}

/// The command-context surface that this crate intercepts. Every other context method is a
/// pure pass-through and stays on the real object. Buffer and render target bindings are only
/// observed, so they don't appear here.
pub trait DriverContext: DriverObject {
    fn bind_shader(&self, stage: Stage, shader: Option<&CompiledShader>);
    fn draw(&self, call: DrawCall);
    fn dispatch(&self, x: u32, y: u32, z: u32);
    fn map(&self, resource: ResourceId, subresource: u32, kind: MapKind) -> Result<MappedRegion, DriverError>;
    fn unmap(&self, resource: ResourceId, subresource: u32);
}

/// The presentation surface.
pub trait DriverSwapChain: DriverObject {
    fn present(&self, sync_interval: u32, flags: u32) -> Result<(), DriverError>;
}

/// A view onto a resource (render target, shader resource, ...).
pub trait DriverView: DriverObject {
    fn resource(&self) -> ResourceId;
}

/// Compiles high-level shader source into bytecode (the platform's HLSL compiler).
pub trait ShaderCompiler: Send + Sync {
    /// Compiles `source` with the given profile (e.g. `ps_5_0`). `name` is only used in
    /// diagnostics. The error string is the compiler's own message.
    fn compile(&self, source: &str, name: &str, profile: &str) -> Result<Vec<u8>, String>;
}

/// Turns bytecode back into high-level source.
pub trait Decompiler: Send + Sync {
    fn decompile(&self, bytecode: &[u8], assembly: &str) -> Result<String, String>;
}
