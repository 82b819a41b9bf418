//! Wrappers around the objects the driver hands out.
//!
//! Each wrapper owns one reference to its real object and keeps its own count of external
//! references. When that count reaches zero the real reference is released, once, and the wrapper
//! leaves the identity table. Anything a wrapper doesn't intercept goes straight to `original()`.

pub mod context;
pub mod device;
pub mod shader;
pub mod swap_chain;
pub mod view;

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::DriverObject;
use crate::registry::Registry;

pub use context::WrappedContext;
pub use device::WrappedDevice;
pub use shader::WrappedShader;
pub use swap_chain::WrappedSwapChain;
pub use view::WrappedView;

/// The state every wrapper shares.
pub struct Wrapped<R: ?Sized> {
    address: usize,
    real: Mutex<Option<Arc<R>>>,
    refs: AtomicU32,
    registry: Arc<Registry>,
}

impl<R: ?Sized + DriverObject> Wrapped<R> {
    pub fn new(real: Arc<R>, registry: Arc<Registry>) -> Wrapped<R> {
        let address = real.address();
        Wrapped::with_address(real, address, registry)
    }

    /// Wraps `real` under an identity other than its own address.
    pub fn with_address(real: Arc<R>, address: usize, registry: Arc<Registry>) -> Wrapped<R> {
        Wrapped {
            address,
            real: Mutex::new(Some(real)),
            refs: AtomicU32::new(1),
            registry,
        }
    }

    /// The wrapper's identity, usually the address of the real object.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn real(&self) -> Option<Arc<R>> {
        self.real.lock().ok()?.clone()
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one external reference and returns how many are left. The real object is released
    /// when the last one goes. `None` means the wrapper was released too many times.
    pub fn release(&self) -> Option<u32> {
        let previous = match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
        {
            Ok(previous) => previous,
            Err(_) => {
                log::warn!("Release of {:#x} after its last reference was gone", self.address);
                return None;
            }
        };

        if previous == 1 {
            self.registry.remove_object(self.address);

            let real = self.real.lock().ok().and_then(|mut real| real.take());
            drop(real);

            log::trace!("Released {:#x}", self.address);
        }

        Some(previous - 1)
    }
}

/// Implemented by every wrapper type.
pub trait Wrapper: Any + Send + Sync {
    type Real: ?Sized + DriverObject;

    fn base(&self) -> &Wrapped<Self::Real>;

    /// Called once, after the last external reference is released.
    fn on_final_release(&self) {}

    /// The real object, for calls that aren't intercepted. `None` once released.
    fn original(&self) -> Option<Arc<Self::Real>> {
        self.base().real()
    }

    fn address(&self) -> usize {
        self.base().address()
    }

    fn add_ref(&self) -> u32 {
        self.base().add_ref()
    }

    fn release(&self) -> u32 {
        match self.base().release() {
            Some(0) => {
                self.on_final_release();
                0
            }

            Some(remaining) => remaining,
            None => 0,
        }
    }
}

/// Returns the wrapper for the real object at `address`, building it with `make` if there is
/// none. An existing wrapper gains a reference, matching the one the driver just handed out.
///
/// `make` runs with the registry locked, so it must not call back into the registry.
pub fn get_or_wrap<T: Wrapper>(registry: &Registry, address: usize, make: impl FnOnce() -> T) -> Arc<T> {
    let (wrapper, existed) = registry.get_or_insert(address, || Arc::new(make()));

    if existed {
        wrapper.add_ref();
    }

    wrapper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Stage;
    use crate::shaders::ShaderHash;
    use crate::testing::MockShader;

    #[test]
    fn releases_real_object_once() {
        let registry = Arc::new(Registry::new());
        let real = MockShader::new(Stage::Pixel);
        let address = real.address();

        let make = || WrappedShader::new(real.clone(), real.clone(), ShaderHash(1), registry.clone());
        let wrapper = get_or_wrap(&registry, address, make);
        assert_eq!(wrapper.base().ref_count(), 1);

        // Handing out the same object again shares the wrapper.
        let again: Arc<WrappedShader> = get_or_wrap(&registry, address, || unreachable!());
        assert!(Arc::ptr_eq(&wrapper, &again));
        assert_eq!(wrapper.base().ref_count(), 2);

        assert_eq!(wrapper.release(), 1);
        assert!(wrapper.original().is_some());
        assert_eq!(Arc::strong_count(&real), 2);

        assert_eq!(wrapper.release(), 0);
        assert!(wrapper.original().is_none());
        assert!(registry.object::<WrappedShader>(address).is_none());
        assert_eq!(Arc::strong_count(&real), 1);

        // Over-releasing is logged, not fatal.
        assert_eq!(wrapper.release(), 0);
    }
}
