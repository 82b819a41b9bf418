use std::sync::{Arc, Weak};

use super::{get_or_wrap, Wrapped, WrappedDevice, Wrapper};
use crate::driver::{DriverError, DriverSwapChain};
use crate::service::Service;

pub struct WrappedSwapChain {
    base: Wrapped<dyn DriverSwapChain>,
    service: Arc<Service>,
    device: Weak<WrappedDevice>,
}

impl WrappedSwapChain {
    pub fn wrap(
        real: Arc<dyn DriverSwapChain>,
        service: &Arc<Service>,
        device: Weak<WrappedDevice>,
    ) -> Arc<WrappedSwapChain> {
        let registry = service.registry().clone();

        get_or_wrap(service.registry(), real.address(), || WrappedSwapChain {
            base: Wrapped::new(real, registry),
            service: service.clone(),
            device,
        })
    }

    /// Runs the per-frame work (hunting frame boundary, key polling and any actions they
    /// trigger), then presents.
    pub fn present(&self, sync_interval: u32, flags: u32) -> Result<(), DriverError> {
        let real = self.original().ok_or(DriverError::Released)?;

        let device = self.device.upgrade().and_then(|device| device.original());
        self.service.on_present(device.as_deref());

        real.present(sync_interval, flags)
    }
}

impl Wrapper for WrappedSwapChain {
    type Real = dyn DriverSwapChain;

    fn base(&self) -> &Wrapped<dyn DriverSwapChain> {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::driver::Stage;
    use crate::testing::{self, service_in, MockDevice, MockInput, MockSwapChain};

    #[test]
    fn present_polls_actions() {
        let dir = tempfile::tempdir().unwrap();
        let input = Arc::new(MockInput::default());

        struct Shared(Arc<MockInput>);

        impl crate::input::InputSource for Shared {
            fn is_down(&self, key: &str) -> bool {
                self.0.is_down(key)
            }
        }

        let mut config = crate::settings::Config::default().resolve(dir.path());
        config.keys.insert("reload".to_string(), "F10".to_string());

        let service = Service::init(
            config,
            crate::service::Backend {
                compiler: Some(Arc::new(testing::MockCompiler::default())),
                input: Some(Box::new(Shared(input.clone()))),
                ..Default::default()
            },
        );

        let device = WrappedDevice::wrap(MockDevice::new(), &service);
        let real = Arc::new(MockSwapChain::default());
        let swap_chain = device.wrap_swap_chain(real.clone());

        let shader = device.create_shader(Stage::Pixel, &testing::pixel_shader("0.5")).unwrap();
        let path = service.config().fixes_dir.join(format!("{}-ps_replace.txt", shader.hash()));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "float4 main() : SV_Target0 { return 1; }").unwrap();

        swap_chain.present(0, 0).unwrap();
        assert!(service.registry().replacement(shader.hash()).is_none());

        input.press("F10");
        swap_chain.present(1, 0).unwrap();
        assert!(service.registry().replacement(shader.hash()).is_some());
        assert_eq!(real.presents.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn present_without_device() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let real = Arc::new(MockSwapChain::default());
        let swap_chain = WrappedSwapChain::wrap(real.clone(), &service, Weak::new());

        swap_chain.present(0, 0).unwrap();
        assert_eq!(real.presents.load(Ordering::SeqCst), 1);

        swap_chain.release();
        assert_eq!(swap_chain.present(0, 0), Err(DriverError::Released));
    }
}
