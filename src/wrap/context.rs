use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::{get_or_wrap, Wrapped, WrappedDevice, WrappedShader, WrappedView, Wrapper};
use crate::driver::{CompiledShader, DrawCall, DriverContext, DriverError, MapKind, MappedRegion, ResourceId, Stage};
use crate::service::{Effective, Service};
use crate::shaders::ShaderHash;

struct BoundShader {
    hash: ShaderHash,
    own_original: CompiledShader,
    effective: Effective,
}

impl BoundShader {
    /// The object the real context should have bound. Disabled shaders keep their original
    /// bound, since their draws are skipped anyway.
    fn object(&self) -> &CompiledShader {
        match &self.effective {
            Effective::Active(shader) => shader,
            Effective::Disabled => &self.own_original,
        }
    }
}

#[derive(Default)]
struct PipelineState {
    shaders: HashMap<Stage, BoundShader>,
    vertex_buffers: Vec<Option<ResourceId>>,
    index_buffer: Option<ResourceId>,
    render_targets: Vec<Option<ResourceId>>,

    /// The service generation the bound shaders were resolved against.
    generation: u64,
}

pub struct WrappedContext {
    base: Wrapped<dyn DriverContext>,
    service: Arc<Service>,
    device: Weak<WrappedDevice>,
    state: Mutex<PipelineState>,
    maps: Mutex<HashMap<(ResourceId, u32), MapKind>>,
    write_maps: AtomicU64,
}

impl WrappedContext {
    pub fn wrap(real: Arc<dyn DriverContext>, service: &Arc<Service>, device: Weak<WrappedDevice>) -> Arc<WrappedContext> {
        let registry = service.registry().clone();

        get_or_wrap(service.registry(), real.address(), || WrappedContext {
            base: Wrapped::new(real, registry),
            service: service.clone(),
            device,
            state: Mutex::new(PipelineState {
                generation: service.generation(),
                ..PipelineState::default()
            }),
            maps: Mutex::new(HashMap::new()),
            write_maps: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> Option<Arc<WrappedDevice>> {
        self.device.upgrade()
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Binds `shader` at `stage`, resolving it through the service first.
    pub fn set_shader(&self, stage: Stage, shader: Option<&Arc<WrappedShader>>) {
        let real = match self.original() {
            Some(real) => real,
            None => return,
        };

        let bound = shader.and_then(|shader| match shader.own_original() {
            Some(own_original) => {
                let hash = shader.hash();

                Some(BoundShader {
                    hash,
                    effective: self.service.on_bind(stage, hash, &own_original),
                    own_original,
                })
            }

            None => {
                log::warn!("Bind of released shader {:#x} at {}", shader.address(), stage);
                None
            }
        });

        // The driver may call back into this context, so the state lock is never held across a
        // call to the real object.
        let object = {
            let mut state = self.state();

            match bound {
                Some(bound) => {
                    let object = bound.object().clone();
                    state.shaders.insert(stage, bound);
                    Some(object)
                }

                None => {
                    state.shaders.remove(&stage);
                    None
                }
            }
        };

        real.bind_shader(stage, object.as_ref());
    }

    /// Stops tracking `stage` after the game bound something this crate doesn't know about
    /// directly on the real context.
    pub fn forget_shader(&self, stage: Stage) {
        self.state().shaders.remove(&stage);
    }

    /// Records the vertex buffers the game bound, for hunting.
    pub fn set_vertex_buffers(&self, start_slot: u32, buffers: &[Option<ResourceId>]) {
        let mut state = self.state();
        let start = start_slot as usize;
        let end = start + buffers.len();

        if state.vertex_buffers.len() < end {
            state.vertex_buffers.resize(end, None);
        }

        state.vertex_buffers[start..end].copy_from_slice(buffers);
    }

    pub fn set_index_buffer(&self, buffer: Option<ResourceId>) {
        self.state().index_buffer = buffer;
    }

    /// Records the bound render targets. Hunting identifies each one by the resource behind
    /// its view.
    pub fn set_render_targets(&self, views: &[Option<&Arc<WrappedView>>]) {
        let resources = views.iter().map(|view| view.and_then(|view| view.resource())).collect();
        self.state().render_targets = resources;
    }

    /// Re-resolves every bound shader if anything has changed since they were bound. Returns
    /// the stages whose effective object moved, for the caller to rebind once the lock is gone.
    fn refresh(&self, state: &mut PipelineState) -> Vec<(Stage, CompiledShader)> {
        let generation = self.service.generation();

        if generation == state.generation {
            return Vec::new();
        }

        state.generation = generation;

        let mut rebinds = Vec::new();

        for (&stage, bound) in state.shaders.iter_mut() {
            let effective = self.service.on_bind(stage, bound.hash, &bound.own_original);

            if effective.same_as(&bound.effective) {
                continue;
            }

            bound.effective = effective;
            rebinds.push((stage, bound.object().clone()));
        }

        rebinds
    }

    fn rebind(real: &dyn DriverContext, rebinds: Vec<(Stage, CompiledShader)>) {
        for (stage, shader) in rebinds {
            real.bind_shader(stage, Some(&shader));
        }
    }

    /// Forwards a draw unless one of the bound shaders is disabled or hunting wants it hidden.
    pub fn draw(&self, call: DrawCall) {
        let real = match self.original() {
            Some(real) => real,
            None => return,
        };

        let (rebinds, skip) = {
            let mut state = self.state();
            let rebinds = self.refresh(&mut state);

            let shaders: Vec<_> = state
                .shaders
                .iter()
                .filter(|&(&stage, _)| stage != Stage::Compute)
                .map(|(&stage, bound)| (stage, bound.hash))
                .collect();

            let allowed = self.service.on_draw(
                &shaders,
                &state.vertex_buffers,
                state.index_buffer,
                &state.render_targets,
            );

            let disabled = state
                .shaders
                .iter()
                .any(|(&stage, bound)| stage != Stage::Compute && matches!(bound.effective, Effective::Disabled));

            (rebinds, disabled || !allowed)
        };

        Self::rebind(&*real, rebinds);

        if skip {
            self.service.count_skipped_draw();
            return;
        }

        real.draw(call);
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        let real = match self.original() {
            Some(real) => real,
            None => return,
        };

        let (rebinds, disabled) = {
            let mut state = self.state();
            let rebinds = self.refresh(&mut state);

            let disabled = matches!(
                state.shaders.get(&Stage::Compute),
                Some(BoundShader {
                    effective: Effective::Disabled,
                    ..
                })
            );

            (rebinds, disabled)
        };

        Self::rebind(&*real, rebinds);

        if disabled {
            self.service.count_skipped_draw();
            return;
        }

        real.dispatch(x, y, z);
    }

    pub fn map(&self, resource: ResourceId, subresource: u32, kind: MapKind) -> Result<MappedRegion, DriverError> {
        let real = self.original().ok_or(DriverError::Released)?;
        let region = real.map(resource, subresource, kind)?;

        self.note_map(resource, subresource, kind);
        Ok(region)
    }

    /// Records a successful map made directly on the real context.
    pub fn note_map(&self, resource: ResourceId, subresource: u32, kind: MapKind) {
        if kind.writes() {
            self.write_maps.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut maps) = self.maps.lock() {
            if maps.insert((resource, subresource), kind).is_some() {
                log::debug!("{:#x}:{} mapped again before being unmapped", resource, subresource);
            }
        }
    }

    pub fn unmap(&self, resource: ResourceId, subresource: u32) {
        if let Some(real) = self.original() {
            self.note_unmap(resource, subresource);
            real.unmap(resource, subresource);
        }
    }

    pub fn note_unmap(&self, resource: ResourceId, subresource: u32) {
        let known = match self.maps.lock() {
            Ok(mut maps) => maps.remove(&(resource, subresource)).is_some(),
            Err(_) => true,
        };

        if !known {
            log::warn!("Unmap of {:#x}:{}, which was never mapped", resource, subresource);
        }
    }

    /// How many subresources are mapped right now.
    pub fn outstanding_maps(&self) -> usize {
        self.maps.lock().map(|maps| maps.len()).unwrap_or(0)
    }

    pub fn write_maps(&self) -> u64 {
        self.write_maps.load(Ordering::Relaxed)
    }
}

impl Wrapper for WrappedContext {
    type Real = dyn DriverContext;

    fn base(&self) -> &Wrapped<dyn DriverContext> {
        &self.base
    }

    fn on_final_release(&self) {
        let shaders = std::mem::take(&mut self.state().shaders);
        drop(shaders);
    }
}
