use std::sync::{Arc, Mutex, Weak};

use super::{Wrapped, Wrapper};
use crate::driver::{CompiledShader, DriverShader, Stage};
use crate::registry::Registry;
use crate::shaders::ShaderHash;

/// The game's handle to a shader. The real object is the shader built from the game's own
/// bytecode for this handle, which is unique per creation, so two creations from the same
/// bytecode stay separate handles even when both were given the same replacement.
///
/// The object handed out at creation (possibly a replacement) is only held weakly. The record
/// owns replacements, and a reverted one goes away with it.
pub struct WrappedShader {
    base: Wrapped<dyn DriverShader>,
    hash: ShaderHash,
    stage: Stage,
    handed_out: Mutex<Option<Weak<dyn DriverShader>>>,
}

impl WrappedShader {
    pub fn new(
        handed_out: CompiledShader,
        own_original: CompiledShader,
        hash: ShaderHash,
        registry: Arc<Registry>,
    ) -> WrappedShader {
        WrappedShader {
            stage: own_original.stage(),
            handed_out: Mutex::new(Some(Arc::downgrade(&handed_out))),
            base: Wrapped::new(own_original, registry),
            hash,
        }
    }

    pub fn hash(&self) -> ShaderHash {
        self.hash
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The shader built from the game's bytecode. `None` once the handle is released.
    pub fn own_original(&self) -> Option<CompiledShader> {
        self.original()
    }

    /// What the game was given at creation, while that object is still alive.
    pub fn handed_out(&self) -> Option<CompiledShader> {
        self.handed_out.lock().ok()?.as_ref()?.upgrade()
    }
}

impl Wrapper for WrappedShader {
    type Real = dyn DriverShader;

    fn base(&self) -> &Wrapped<dyn DriverShader> {
        &self.base
    }

    fn on_final_release(&self) {
        self.base.registry.forget_handle(self.base.address);

        if let Ok(mut handed_out) = self.handed_out.lock() {
            *handed_out = None;
        }
    }
}
