use std::sync::Arc;

use super::{get_or_wrap, Wrapped, Wrapper};
use crate::driver::{DriverView, ResourceId};
use crate::registry::Registry;

pub struct WrappedView {
    base: Wrapped<dyn DriverView>,
}

impl WrappedView {
    pub fn wrap(real: Arc<dyn DriverView>, registry: &Arc<Registry>) -> Arc<WrappedView> {
        get_or_wrap(registry, real.address(), || WrappedView {
            base: Wrapped::new(real, registry.clone()),
        })
    }

    /// The resource behind the view, or `None` once the view has been released.
    pub fn resource(&self) -> Option<ResourceId> {
        Some(self.original()?.resource())
    }
}

impl Wrapper for WrappedView {
    type Real = dyn DriverView;

    fn base(&self) -> &Wrapped<dyn DriverView> {
        &self.base
    }
}
