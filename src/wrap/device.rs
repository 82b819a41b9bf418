use std::sync::{Arc, Mutex, Weak};

use super::{get_or_wrap, Wrapped, WrappedContext, WrappedShader, WrappedSwapChain, WrappedView, Wrapper};
use crate::driver::{DriverContext, DriverDevice, DriverError, DriverObject, DriverSwapChain, DriverView, Stage};
use crate::reload::{ReloadError, ReloadReport};
use crate::service::Service;

pub struct WrappedDevice {
    base: Wrapped<dyn DriverDevice>,
    service: Arc<Service>,
    context: Mutex<Weak<WrappedContext>>,
}

impl WrappedDevice {
    pub fn wrap(real: Arc<dyn DriverDevice>, service: &Arc<Service>) -> Arc<WrappedDevice> {
        let registry = service.registry().clone();

        get_or_wrap(service.registry(), real.address(), || WrappedDevice {
            base: Wrapped::new(real, registry),
            service: service.clone(),
            context: Mutex::new(Weak::new()),
        })
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Creates a shader, routed through the registry. The game may get a replacement back.
    pub fn create_shader(&self, stage: Stage, bytecode: &[u8]) -> Result<Arc<WrappedShader>, DriverError> {
        let real = self.original().ok_or(DriverError::Released)?;
        let created = self.service.on_create(&*real, stage, bytecode)?;

        let registry = self.service.registry();
        let address = created.original.address();
        registry.bind_handle(address, created.hash);

        let wrapper_registry = registry.clone();

        Ok(get_or_wrap(registry, address, || {
            WrappedShader::new(created.handed_out, created.original, created.hash, wrapper_registry)
        }))
    }

    /// Wraps the device's immediate context, keeping a back-reference to this device.
    pub fn wrap_context(self: &Arc<Self>, real: Arc<dyn DriverContext>) -> Arc<WrappedContext> {
        let context = WrappedContext::wrap(real, &self.service, Arc::downgrade(self));

        if let Ok(mut slot) = self.context.lock() {
            *slot = Arc::downgrade(&context);
        }

        context
    }

    pub fn immediate_context(&self) -> Option<Arc<WrappedContext>> {
        self.context.lock().ok()?.upgrade()
    }

    pub fn wrap_swap_chain(self: &Arc<Self>, real: Arc<dyn DriverSwapChain>) -> Arc<WrappedSwapChain> {
        WrappedSwapChain::wrap(real, &self.service, Arc::downgrade(self))
    }

    pub fn wrap_view(&self, real: Arc<dyn DriverView>) -> Arc<WrappedView> {
        WrappedView::wrap(real, self.service.registry())
    }

    /// Runs a reload pass against this device.
    pub fn reload(&self) -> Result<ReloadReport, ReloadError> {
        match self.original() {
            Some(real) => self.service.reload(&*real),
            None => Err(ReloadError::Scan("the device has been released".to_string())),
        }
    }
}

impl Wrapper for WrappedDevice {
    type Real = dyn DriverDevice;

    fn base(&self) -> &Wrapped<dyn DriverDevice> {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::same_shader;
    use crate::hunting::Target;
    use crate::input::Action;
    use crate::service::Effective;
    use crate::shaders::ShaderHash;
    use crate::testing::{self, service_in, MockContext, MockDevice};

    #[test]
    fn one_wrapper_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let real = MockDevice::new();

        let first = WrappedDevice::wrap(real.clone(), &service);
        let second = WrappedDevice::wrap(real.clone(), &service);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.base().ref_count(), 2);

        first.release();
        assert_eq!(Arc::strong_count(&real), 2);

        second.release();
        assert!(first.original().is_none());
        assert_eq!(Arc::strong_count(&real), 1);

        assert!(matches!(first.create_shader(Stage::Pixel, &testing::pixel_shader("1.0")), Err(DriverError::Released)));
    }

    #[test]
    fn invalid_bytecode_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = WrappedDevice::wrap(MockDevice::new(), &service);

        assert!(matches!(device.create_shader(Stage::Pixel, b"nope"), Err(DriverError::InvalidBytecode(_))));
        assert_eq!(service.registry().record_count(), 0);
    }

    /// Two handles made from identical bytecode share a record, and hunting treats them alike.
    #[test]
    fn scenario_e() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |config| config.hunting.enabled = true);
        let device = WrappedDevice::wrap(MockDevice::new(), &service);
        let real_context = MockContext::new();
        let context = device.wrap_context(real_context.clone());
        let bytecode = testing::pixel_shader("0.5");

        let first = device.create_shader(Stage::Pixel, &bytecode).unwrap();
        let second = device.create_shader(Stage::Pixel, &bytecode).unwrap();

        assert_ne!(first.address(), second.address());
        assert_eq!(first.hash(), second.hash());
        assert_eq!(service.registry().record_count(), 1);
        assert_eq!(service.registry().with_record(first.hash(), |record| record.creations), Some(2));
        assert_eq!(service.registry().hash_of(second.address()), Some(second.hash()));

        context.set_shader(Stage::Pixel, Some(&first));
        context.draw(crate::driver::DrawCall::Draw { vertex_count: 3, start_vertex: 0 });
        device.service().on_present(None);
        service.perform(Action::NextPixelShader, None);

        assert_eq!(service.hunting().selected(Target::PixelShader), Some(first.hash().0));

        for shader in [&first, &second] {
            let own = shader.own_original().unwrap();
            assert!(matches!(service.on_bind(Stage::Pixel, shader.hash(), &own), Effective::Disabled));
        }

        real_context.take_calls();

        for shader in [&first, &second] {
            context.set_shader(Stage::Pixel, Some(shader));
            context.draw(crate::driver::DrawCall::Draw { vertex_count: 3, start_vertex: 0 });
        }

        assert_eq!(real_context.draws(), 0);

        // Turning hunting off brings both back.
        service.perform(Action::ToggleHunting, None);

        for shader in [&first, &second] {
            context.set_shader(Stage::Pixel, Some(shader));
            context.draw(crate::driver::DrawCall::Draw { vertex_count: 3, start_vertex: 0 });

            let own = shader.own_original().unwrap();
            assert_eq!(real_context.bound(Stage::Pixel), Some(own.address()));
        }

        assert_eq!(real_context.draws(), 2);
    }

    #[test]
    fn replacements_are_handed_out() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = WrappedDevice::wrap(MockDevice::new(), &service);
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        let before = device.create_shader(Stage::Pixel, &bytecode).unwrap();

        let fixes = &service.config().fixes_dir;
        std::fs::create_dir_all(fixes).unwrap();
        std::fs::write(fixes.join(format!("{}-ps_replace.txt", hash)), "float4 main() : SV_Target0 { return 1; }").unwrap();
        device.reload().unwrap();

        let after = device.create_shader(Stage::Pixel, &bytecode).unwrap();
        let replacement = service.registry().replacement(hash).unwrap();

        assert!(same_shader(&after.handed_out().unwrap(), &replacement));
        assert!(!same_shader(&before.handed_out().unwrap(), &replacement));
        assert!(!same_shader(&after.own_original().unwrap(), &replacement));
        assert_eq!(after.hash(), before.hash());
    }

    #[test]
    fn reverted_replacements_are_not_kept_by_handles() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let real = MockDevice::new();
        let device = WrappedDevice::wrap(real.clone(), &service);
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        let fixes = service.config().fixes_dir.clone();
        let path = fixes.join(format!("{}-ps_replace.txt", hash));
        std::fs::create_dir_all(&fixes).unwrap();
        std::fs::write(&path, "float4 main() : SV_Target0 { return 1; }").unwrap();

        let shader = device.create_shader(Stage::Pixel, &bytecode).unwrap();
        let replacement = Arc::downgrade(&service.registry().replacement(hash).unwrap());
        assert!(shader.handed_out().is_some());

        std::fs::remove_file(&path).unwrap();
        device.reload().unwrap();

        // The handle still works, but the reverted replacement is gone.
        assert!(replacement.upgrade().is_none());
        assert!(shader.handed_out().is_none());
        assert!(shader.own_original().is_some());
    }
}
