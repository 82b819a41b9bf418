//! The one object that owns all shader state. Wrappers hold an `Arc` to it, and it is created
//! when the game first asks for a device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::driver::{same_shader, CompiledShader, Decompiler, DriverDevice, DriverError, ResourceId, ShaderCompiler, Stage};
use crate::hunting::{Hunting, MarkingMode, Target};
use crate::input::{Action, ActionTrigger, HuntStep, InputSource};
use crate::notice::{Level, Notices};
use crate::registry::Registry;
use crate::reload::{self, ReloadError, ReloadReport};
use crate::settings::{Config, Handling};
use crate::shaders::export::{self, ExportOptions};
use crate::shaders::{files, ShaderHash};

/// The external helpers a service can use. All of them are optional.
#[derive(Default)]
pub struct Backend {
    pub compiler: Option<Arc<dyn ShaderCompiler>>,
    pub decompiler: Option<Arc<dyn Decompiler>>,
    pub input: Option<Box<dyn InputSource>>,
}

/// What a bind actually binds.
#[derive(Clone, Debug)]
pub enum Effective {
    Active(CompiledShader),

    /// Draws with this shader are skipped.
    Disabled,
}

impl Effective {
    pub fn same_as(&self, other: &Effective) -> bool {
        match (self, other) {
            (Effective::Active(a), Effective::Active(b)) => same_shader(a, b),
            (Effective::Disabled, Effective::Disabled) => true,
            _ => false,
        }
    }
}

/// The result of creating a shader through the service.
#[derive(Clone, Debug)]
pub struct Created {
    pub hash: ShaderHash,

    /// The object the game receives.
    pub handed_out: CompiledShader,

    /// The object created from the game's own bytecode.
    pub original: CompiledShader,
}

#[derive(Default, Debug)]
struct Stats {
    created: AtomicU64,
    skipped_draws: AtomicU64,
    collisions: AtomicU64,
}

pub struct Service {
    config: Config,
    registry: Arc<Registry>,
    hunting: Mutex<Hunting>,
    notices: Notices,
    compiler: Option<Arc<dyn ShaderCompiler>>,
    decompiler: Option<Arc<dyn Decompiler>>,
    input: Option<Box<dyn InputSource>>,
    trigger: Mutex<ActionTrigger>,
    reloading: AtomicBool,

    /// Bumped whenever what a bound shader resolves to may have changed.
    generation: AtomicU64,
    stats: Stats,
}

/// Clears the reload flag however the pass ends.
struct ReloadGuard<'a>(&'a AtomicBool);

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Service {
    pub fn init(config: Config, backend: Backend) -> Arc<Service> {
        log::info!("Fixes are read from {}", config.fixes_dir.display());
        log::info!("Exports are written to {}", config.cache_dir.display());

        if backend.compiler.is_none() {
            log::warn!("No shader compiler is available, so high-level source can't be loaded");
        }

        let service = Service {
            hunting: Mutex::new(Hunting::new(config.hunting)),
            notices: Notices::new(Duration::from_secs(config.notice_seconds)),
            trigger: Mutex::new(ActionTrigger::new(&config.keys)),
            registry: Arc::new(Registry::new()),
            compiler: backend.compiler,
            decompiler: backend.decompiler,
            input: backend.input,
            reloading: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            stats: Stats::default(),
            config,
        };

        Arc::new(service)
    }

    /// Logs statistics and drops every replacement shader.
    pub fn teardown(&self) {
        log::info!(
            "Shutting down: {} records, {} shaders created, {} hash collisions, {} draws skipped",
            self.registry.record_count(),
            self.stats.created.load(Ordering::Relaxed),
            self.stats.collisions.load(Ordering::Relaxed),
            self.stats.skipped_draws.load(Ordering::Relaxed)
        );

        let replacements = self.registry.revert_all();
        log::info!("Released {} replacement shaders", replacements.len());
        drop(replacements);

        self.notices.clear();
        self.bump_generation();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn notices(&self) -> &Notices {
        &self.notices
    }

    pub fn compiler(&self) -> Option<&dyn ShaderCompiler> {
        self.compiler.as_deref()
    }

    pub fn hunting(&self) -> MutexGuard<'_, Hunting> {
        self.hunting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn export_options(&self) -> ExportOptions {
        ExportOptions {
            hlsl: self.config.export_hlsl,
            consts: self.config.export_consts,
        }
    }

    /// Creates a shader for the game. The original is always created, so it can be returned to
    /// later; the game gets the active replacement if there is one.
    pub fn on_create(&self, device: &dyn DriverDevice, stage: Stage, bytecode: &[u8]) -> Result<Created, DriverError> {
        let hash = ShaderHash::of(bytecode);
        let original = device.create_shader(stage, bytecode)?;

        self.stats.created.fetch_add(1, Ordering::Relaxed);

        let creation = self.registry.register_original(hash, stage, bytecode, original.clone());

        if creation.collision {
            self.stats.collisions.fetch_add(1, Ordering::Relaxed);

            self.notices.post(
                Level::Warning,
                format!("Hash collision on {}: different bytecode shares its record", hash),
            );
        }

        if !creation.first {
            return Ok(Created {
                hash,
                handed_out: creation.active,
                original,
            });
        }

        log::debug!("New {} shader {}", stage, hash);

        if self.config.export_on_create {
            self.export(hash, stage, bytecode);
        }

        // An override that is already on disk is used straight away.
        if let Some(file) = files::find(&self.config.fixes_dir, hash, stage) {
            reload::load_file(self, device, &file);
        }

        let handed_out = self.registry.replacement(hash).unwrap_or_else(|| original.clone());

        Ok(Created {
            hash,
            handed_out,
            original,
        })
    }

    fn export(&self, hash: ShaderHash, stage: Stage, bytecode: &[u8]) {
        let result = export::export(
            &self.config.cache_dir,
            hash,
            stage,
            bytecode,
            self.decompiler.as_deref(),
            self.export_options(),
        );

        match result {
            Ok(_) => {
                self.registry.with_record(hash, |record| record.exported = true);
            }

            Err(err) => log::error!("Unable to export {}: {:?}", hash, err),
        }
    }

    /// Decides what a bind of `hash` should bind. `own` is the original the game's handle was
    /// created with.
    pub fn on_bind(&self, stage: Stage, hash: ShaderHash, own: &CompiledShader) -> Effective {
        if self.config.handling(hash) == Handling::Skip {
            return Effective::Disabled;
        }

        {
            let hunting = self.hunting();

            if hunting.is_shader_selected(stage, hash) {
                return match hunting.mode() {
                    MarkingMode::Skip => Effective::Disabled,
                    MarkingMode::Original => Effective::Active(own.clone()),
                };
            }
        }

        Effective::Active(self.registry.replacement(hash).unwrap_or_else(|| own.clone()))
    }

    /// Records what a draw uses for hunting. Returns false if the draw should be skipped
    /// because it uses a selected buffer or render target.
    pub fn on_draw(
        &self,
        shaders: &[(Stage, ShaderHash)],
        vertex_buffers: &[Option<ResourceId>],
        index_buffer: Option<ResourceId>,
        render_targets: &[Option<ResourceId>],
    ) -> bool {
        let mut hunting = self.hunting();

        if !hunting.enabled() {
            return true;
        }

        for &(stage, hash) in shaders {
            hunting.visit_shader(stage, hash);
        }

        let resources = vertex_buffers
            .iter()
            .flatten()
            .map(|&id| (Target::VertexBuffer, id))
            .chain(index_buffer.map(|id| (Target::IndexBuffer, id)))
            .chain(render_targets.iter().flatten().map(|&id| (Target::RenderTarget, id)));

        let mut selected = false;

        for (target, id) in resources {
            hunting.visit(target, id as u64);
            selected |= hunting.is_selected(target, id as u64);
        }

        !(selected && hunting.mode() == MarkingMode::Skip)
    }

    pub fn count_skipped_draw(&self) {
        self.stats.skipped_draws.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs a reload pass. Only one pass runs at a time; asking for another while one is running
    /// is refused.
    pub fn reload(&self, device: &dyn DriverDevice) -> Result<ReloadReport, ReloadError> {
        if self
            .reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.notices.post(Level::Warning, "A reload is already running");
            return Err(ReloadError::Busy);
        }

        let _guard = ReloadGuard(&self.reloading);
        let result = reload::run(self, device);
        self.bump_generation();

        match &result {
            Ok(report) => self.notices.post(Level::Info, report.summary()),
            Err(err) => self.notices.post(Level::Error, format!("Reload failed: {}", err)),
        }

        result
    }

    /// Called once per frame, before the real present.
    pub fn on_present(&self, device: Option<&dyn DriverDevice>) {
        self.hunting().end_frame();

        let actions = match &self.input {
            Some(input) => self
                .trigger
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .poll(input.as_ref()),

            None => return,
        };

        for action in actions {
            self.perform(action, device);
        }
    }

    /// Carries out a user action.
    pub fn perform(&self, action: Action, device: Option<&dyn DriverDevice>) {
        log::debug!("Action: {}", action.name());

        match action {
            Action::Reload => match device {
                Some(device) => {
                    // Failures have already been reported as notices.
                    let _ = self.reload(device);
                }

                None => log::warn!("Reload requested without a device"),
            },

            Action::ToggleHunting => {
                let enabled = self.hunting().toggle();
                self.bump_generation();

                let state = if enabled { "on" } else { "off" };
                self.notices.post(Level::Info, format!("Hunting {}", state));
            }

            action => {
                if let Some((target, step)) = action.hunt() {
                    self.hunt(target, step);
                }
            }
        }
    }

    fn describe(target: Target, value: u64) -> String {
        let name: &'static str = target.into();

        match target.stage() {
            Some(_) => format!("{} {}", name, ShaderHash(value)),
            None => format!("{} {:#x}", name, value),
        }
    }

    fn hunt(&self, target: Target, step: HuntStep) {
        if step != HuntStep::Mark {
            let selected = self.hunting().step(target, step == HuntStep::Next);
            self.bump_generation();

            match selected {
                Some(value) => self.notices.post(Level::Info, Service::describe(target, value)),
                None => log::debug!("Nothing to select for {:?}", target),
            }

            return;
        }

        let selected = self.hunting().selected(target);

        let value = match selected {
            Some(value) => value,
            None => {
                self.notices.post(Level::Warning, "Nothing is selected");
                return;
            }
        };

        log::info!("Marked {}", Service::describe(target, value));

        let stage = match target.stage() {
            Some(stage) => stage,
            None => return,
        };

        let hash = ShaderHash(value);

        let bytecode = match self.registry.original_bytecode(hash) {
            Some(bytecode) => bytecode,
            None => {
                log::warn!("{} has no original bytecode to export", hash);
                return;
            }
        };

        let result = export::copy_to_fixes(
            &self.config.cache_dir,
            &self.config.fixes_dir,
            hash,
            stage,
            &bytecode,
            self.decompiler.as_deref(),
            self.export_options(),
        );

        match result {
            Ok(copied) => self.notices.post(
                Level::Info,
                format!("Marked {}: {} files copied to the fixes directory", hash, copied.len()),
            ),

            Err(err) => self.notices.post(Level::Error, format!("Unable to mark {}: {:#}", hash, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::SystemTime;

    use super::*;
    use crate::reload::FileOutcome;
    use crate::settings::ShaderOverride;
    use crate::testing::{self, service_in, MockDevice, MockInput};

    fn fix_path(service: &Service, hash: ShaderHash, suffix: &str) -> std::path::PathBuf {
        service.config().fixes_dir.join(format!("{}-ps{}", hash, suffix))
    }

    /// Writes a file and moves its modification time forward by `seconds`, so that rewrites
    /// within one test are always seen as changes.
    fn write_fix(path: &Path, contents: &str, seconds: u64) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();

        let time = SystemTime::now() + Duration::from_secs(seconds);
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    fn has_error_notice(service: &Service) -> bool {
        service.notices().current().iter().any(|notice| notice.level == Level::Error)
    }

    #[test]
    fn scenarios_a_to_d() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = MockDevice::new();
        let bytecode = testing::pixel_shader("0.5");

        // A: the record holds the freshly created original.
        let created = service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();
        assert_eq!(created.hash, ShaderHash::of(&bytecode));
        assert!(same_shader(&created.handed_out, &created.original));
        assert!(same_shader(&service.registry().active(created.hash).unwrap(), &created.original));

        // B: a high-level replacement is compiled and becomes active.
        let path = fix_path(&service, created.hash, "_replace.txt");
        write_fix(&path, "float4 main() : SV_Target0 { return float4(1, 0, 0, 1); }", 1);

        let report = service.reload(&*device).unwrap();
        assert_eq!(report.outcome(created.hash), Some(&FileOutcome::Recompiled));

        let replaced = service.registry().active(created.hash).unwrap();
        assert!(!same_shader(&replaced, &created.original));

        let timestamp = service.registry().with_record(created.hash, |record| record.source_timestamp).flatten();
        assert_eq!(timestamp, Some(std::fs::metadata(&path).unwrap().modified().unwrap()));

        // C: a broken edit keeps the previous replacement and posts a notice.
        write_fix(&path, "float4 main() : SV_Target0 { error }", 2);

        let report = service.reload(&*device).unwrap();
        assert!(matches!(report.outcome(created.hash), Some(FileOutcome::Failed(_))));
        assert!(same_shader(&service.registry().active(created.hash).unwrap(), &replaced));
        assert!(has_error_notice(&service));

        let still = service.registry().with_record(created.hash, |record| record.source_timestamp).flatten();
        assert_eq!(still, timestamp);

        // D: deleting the file reverts to the original.
        std::fs::remove_file(&path).unwrap();

        let report = service.reload(&*device).unwrap();
        assert_eq!(report.reverted, vec![created.hash]);
        assert!(same_shader(&service.registry().active(created.hash).unwrap(), &created.original));

        // The stale replacement has been released.
        drop(replaced);
        assert_eq!(device.live_shaders(), 1);
    }

    #[test]
    fn reload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = MockDevice::new();
        let bytecode = testing::pixel_shader("0.25");

        let created = service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();
        let assembly = crate::asm::disassemble(&bytecode).unwrap().replace("0.25", "0.75");
        write_fix(&fix_path(&service, created.hash, ".txt"), &assembly, 1);

        let first = service.reload(&*device).unwrap();
        assert_eq!(first.outcome(created.hash), Some(&FileOutcome::Recompiled));
        let active = service.registry().active(created.hash).unwrap();

        let second = service.reload(&*device).unwrap();
        assert_eq!(second.outcome(created.hash), Some(&FileOutcome::Unchanged));
        assert!(second.reverted.is_empty());
        assert!(same_shader(&service.registry().active(created.hash).unwrap(), &active));
    }

    #[test]
    fn unknown_hashes_get_records() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = MockDevice::new();

        let bytecode = testing::pixel_shader("0.125");
        let hash = ShaderHash::of(&bytecode);
        write_fix(&fix_path(&service, hash, "_replace.txt"), "float4 main() : SV_Target0 { return 1; }", 1);

        let report = service.reload(&*device).unwrap();
        assert_eq!(report.outcome(hash), Some(&FileOutcome::Recompiled));
        assert!(service.registry().contains(hash));
        assert!(service.registry().original(hash).is_none());

        // When the game catches up it gets the replacement, and the record gains its original.
        let created = service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();
        assert!(!same_shader(&created.handed_out, &created.original));
        assert!(same_shader(&service.registry().original(hash).unwrap(), &created.original));
    }

    #[test]
    fn overrides_on_disk_are_used_at_creation() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |config| config.export_on_create = true);
        let device = MockDevice::new();
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        std::fs::create_dir_all(&service.config().fixes_dir).unwrap();
        std::fs::write(fix_path(&service, hash, ".bin"), testing::pixel_shader("1.0")).unwrap();

        let created = service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();
        assert!(!same_shader(&created.handed_out, &created.original));

        let exported = service.config().cache_dir.join(format!("{}-ps.txt", hash));
        assert!(exported.exists());
        assert_eq!(service.registry().with_record(hash, |record| record.exported), Some(true));
    }

    #[test]
    fn mismatched_stage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = MockDevice::new();
        let bytecode = testing::pixel_shader("0.5");

        let created = service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();
        std::fs::create_dir_all(&service.config().fixes_dir).unwrap();
        std::fs::write(fix_path(&service, created.hash, ".bin"), testing::vertex_shader()).unwrap();

        let report = service.reload(&*device).unwrap();
        assert!(matches!(report.outcome(created.hash), Some(FileOutcome::Failed(_))));
        assert!(same_shader(&service.registry().active(created.hash).unwrap(), &created.original));
    }

    #[test]
    fn file_for_another_stage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = MockDevice::new();

        let created = service.on_create(&*device, Stage::Pixel, &testing::pixel_shader("0.5")).unwrap();
        let path = service.config().fixes_dir.join(format!("{}-vs.bin", created.hash));
        std::fs::create_dir_all(&service.config().fixes_dir).unwrap();
        std::fs::write(&path, testing::vertex_shader()).unwrap();

        // The file is a valid vertex shader, but the hash belongs to a pixel shader.
        let report = service.reload(&*device).unwrap();
        assert!(matches!(report.outcome(created.hash), Some(FileOutcome::Failed(_))));
        assert!(service.registry().replacement(created.hash).is_none());
        assert!(has_error_notice(&service));
    }

    #[test]
    fn bind_respects_hunting_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        let service = service_in(dir.path(), |config| {
            config.hunting.enabled = true;
            config.shader_overrides.insert(ShaderHash(99), ShaderOverride { handling: Handling::Skip });
        });

        let device = MockDevice::new();
        let created = service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();

        assert!(matches!(service.on_bind(Stage::Pixel, ShaderHash(99), &created.original), Effective::Disabled));
        assert!(service.on_bind(Stage::Pixel, hash, &created.original).same_as(&Effective::Active(created.original.clone())));

        assert!(service.on_draw(&[(Stage::Pixel, hash)], &[], None, &[]));
        service.on_present(None);
        service.perform(Action::NextPixelShader, None);

        assert!(matches!(service.on_bind(Stage::Pixel, hash, &created.original), Effective::Disabled));
    }

    #[test]
    fn actions_come_from_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = Arc::new(MockInput::default());

        struct Shared(Arc<MockInput>);

        impl InputSource for Shared {
            fn is_down(&self, key: &str) -> bool {
                self.0.is_down(key)
            }
        }

        let mut config = Config::default().resolve(dir.path());
        config.keys.insert("toggle_hunting".to_string(), "T".to_string());

        let service = Service::init(
            config,
            Backend {
                input: Some(Box::new(Shared(input.clone()))),
                ..Backend::default()
            },
        );

        let before = service.generation();
        input.press("T");
        service.on_present(None);
        assert!(service.hunting().enabled());
        assert!(service.generation() > before);

        // Held keys don't repeat.
        service.on_present(None);
        assert!(service.hunting().enabled());

        // A panic while the trigger was locked doesn't turn input off for good.
        let panicked = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _trigger = service.trigger.lock().unwrap();
                    panic!("panicked while polling");
                })
                .join()
        });

        assert!(panicked.is_err());
        assert!(service.trigger.is_poisoned());

        input.release("T");
        service.on_present(None);
        input.press("T");
        service.on_present(None);
        assert!(!service.hunting().enabled());
    }

    #[test]
    fn marking_copies_into_fixes() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |config| config.hunting.enabled = true);
        let device = MockDevice::new();
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();
        service.on_draw(&[(Stage::Pixel, hash)], &[], None, &[]);
        service.on_present(None);

        service.perform(Action::MarkPixelShader, None);
        assert!(!fix_path(&service, hash, "_replace.txt").exists());

        service.perform(Action::NextPixelShader, None);
        service.perform(Action::MarkPixelShader, None);
        assert!(fix_path(&service, hash, "_replace.txt").exists());
        assert!(fix_path(&service, hash, ".txt").exists());
    }

    #[test]
    fn selected_buffers_skip_draws() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |config| config.hunting.enabled = true);

        assert!(service.on_draw(&[], &[Some(0x100), None], Some(0x200), &[Some(0x300)]));
        service.on_present(None);

        service.perform(Action::NextIndexBuffer, None);
        assert!(!service.on_draw(&[], &[], Some(0x200), &[]));
        assert!(service.on_draw(&[], &[], Some(0x201), &[]));
    }

    #[test]
    fn busy_reload_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = MockDevice::new();

        service.reloading.store(true, Ordering::SeqCst);
        assert_eq!(service.reload(&*device).err(), Some(ReloadError::Busy));

        // The refused call must not clear the running pass's flag.
        assert!(service.reloading.load(Ordering::SeqCst));
    }

    #[test]
    fn teardown_drops_replacements() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), |_| {});
        let device = MockDevice::new();
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        let created = service.on_create(&*device, Stage::Pixel, &bytecode).unwrap();
        write_fix(&fix_path(&service, hash, "_replace.txt"), "float4 main() : SV_Target0 { return 1; }", 1);
        service.reload(&*device).unwrap();

        service.teardown();
        assert!(same_shader(&service.registry().active(hash).unwrap(), &created.original));
    }
}
