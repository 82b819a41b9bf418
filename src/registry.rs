//! The process-wide tables: shader records by hash, shader handles by address, and wrappers by
//! the address of the real object they wrap.
//!
//! One lock covers all three. It is only held for single lookups and updates, never while
//! touching the disk or compiling, and strong references to wrappers are never dropped while
//! it is held (a wrapper's last release comes back here to remove itself).

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use crate::driver::{CompiledShader, Stage};
use crate::shaders::{Original, Replacement, ShaderHash, ShaderRecord};

type Object = dyn Any + Send + Sync;

#[derive(Default)]
struct Tables {
    records: HashMap<ShaderHash, ShaderRecord>,
    handles: HashMap<usize, ShaderHash>,
    objects: HashMap<usize, Weak<Object>>,
}

/// What happened when the game created a shader.
#[derive(Clone, Debug)]
pub struct Creation {
    /// This is the first time the hash has been seen.
    pub first: bool,

    /// Different bytecode was already stored under the hash.
    pub collision: bool,

    /// The object to hand to the game: the replacement if one is active, otherwise the shader
    /// that was just created.
    pub active: CompiledShader,
}

#[derive(Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while the lock was held leaves the tables in a usable state, since every
        // update is a single insert or swap.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a freshly created original. The first bytecode stored under a hash is kept; later
    /// bytecode with the same hash but different content is counted as a collision and shares
    /// the record.
    pub fn register_original(
        &self,
        hash: ShaderHash,
        stage: Stage,
        bytecode: &[u8],
        shader: CompiledShader,
    ) -> Creation {
        let mut tables = self.lock();

        let first = !tables.records.contains_key(&hash);
        let record = tables
            .records
            .entry(hash)
            .or_insert_with(|| ShaderRecord::new(hash, stage));

        record.creations += 1;

        let collision = match &record.original {
            Some(original) => {
                let collision = &*original.bytecode != bytecode;

                if collision {
                    record.collisions += 1;
                }

                collision
            }

            None => {
                // Either a brand new record, or one created earlier from an override file.
                record.stage = stage;
                record.original = Some(Original {
                    bytecode: Arc::from(bytecode),
                    shader: shader.clone(),
                });

                false
            }
        };

        let active = record
            .replacement
            .as_ref()
            .map(|replacement| replacement.shader.clone())
            .unwrap_or(shader);

        Creation {
            first,
            collision,
            active,
        }
    }

    /// Returns the record for `hash`, creating an empty one if none exists yet.
    pub fn ensure_record(&self, hash: ShaderHash, stage: Stage) -> bool {
        let mut tables = self.lock();

        if tables.records.contains_key(&hash) {
            return false;
        }

        log::debug!("Created record for {} ahead of the game", hash);
        tables.records.insert(hash, ShaderRecord::new(hash, stage));
        true
    }

    /// Runs `f` on the record for `hash`, if there is one.
    pub fn with_record<T>(&self, hash: ShaderHash, f: impl FnOnce(&mut ShaderRecord) -> T) -> Option<T> {
        self.lock().records.get_mut(&hash).map(f)
    }

    pub fn contains(&self, hash: ShaderHash) -> bool {
        self.lock().records.contains_key(&hash)
    }

    pub fn hashes(&self) -> Vec<ShaderHash> {
        let mut hashes: Vec<ShaderHash> = self.lock().records.keys().copied().collect();
        hashes.sort();
        hashes
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn active(&self, hash: ShaderHash) -> Option<CompiledShader> {
        self.with_record(hash, |record| record.active().cloned()).flatten()
    }

    pub fn replacement(&self, hash: ShaderHash) -> Option<CompiledShader> {
        self.with_record(hash, |record| record.replacement.as_ref().map(|replacement| replacement.shader.clone()))
            .flatten()
    }

    pub fn original(&self, hash: ShaderHash) -> Option<CompiledShader> {
        self.with_record(hash, |record| record.original_shader().cloned())
            .flatten()
    }

    pub fn original_bytecode(&self, hash: ShaderHash) -> Option<Arc<[u8]>> {
        self.with_record(hash, |record| record.original.as_ref().map(|original| original.bytecode.clone()))
            .flatten()
    }

    /// Swaps in a replacement. The displaced replacement is handed back so it can be released
    /// after the lock is gone.
    pub fn install(&self, hash: ShaderHash, replacement: Replacement, timestamp: SystemTime) -> Option<Replacement> {
        self.with_record(hash, |record| {
            record.found_on_disk = true;
            record.replace(replacement, timestamp)
        })
        .flatten()
    }

    pub fn clear_found(&self) {
        for record in self.lock().records.values_mut() {
            record.found_on_disk = false;
        }
    }

    pub fn mark_found(&self, hash: ShaderHash) {
        self.with_record(hash, |record| record.found_on_disk = true);
    }

    /// Reverts every record whose file was not seen by the last scan. Returns the stale
    /// replacements, paired with their hashes.
    pub fn revert_unfound(&self) -> Vec<(ShaderHash, Replacement)> {
        let mut reverted: Vec<(ShaderHash, Replacement)> = self
            .lock()
            .records
            .values_mut()
            .filter(|record| !record.found_on_disk)
            .filter_map(|record| Some((record.hash, record.revert()?)))
            .collect();

        reverted.sort_by_key(|(hash, _)| *hash);
        reverted
    }

    /// Drops every replacement. Used at teardown.
    pub fn revert_all(&self) -> Vec<Replacement> {
        self.lock()
            .records
            .values_mut()
            .filter_map(|record| record.revert())
            .collect()
    }

    /// Remembers which hash the shader handle at `address` stands for.
    pub fn bind_handle(&self, address: usize, hash: ShaderHash) {
        self.lock().handles.insert(address, hash);
    }

    pub fn forget_handle(&self, address: usize) {
        self.lock().handles.remove(&address);
    }

    pub fn hash_of(&self, address: usize) -> Option<ShaderHash> {
        self.lock().handles.get(&address).copied()
    }

    /// Returns the wrapper registered for `address`, or registers the one `make` builds. The
    /// second value is true if the wrapper already existed.
    pub fn get_or_insert<T>(&self, address: usize, make: impl FnOnce() -> Arc<T>) -> (Arc<T>, bool)
    where
        T: Any + Send + Sync,
    {
        let mut tables = self.lock();

        if let Some(existing) = tables.objects.get(&address).and_then(Weak::upgrade) {
            match existing.downcast::<T>() {
                Ok(existing) => return (existing, true),

                // The address was reused by a different kind of object. Returning `existing`
                // here would drop it under the lock, so it leaves with the guard instead.
                Err(other) => {
                    log::warn!("Wrapper at {:#x} has an unexpected type, replacing it", address);
                    drop(tables);
                    drop(other);
                    tables = self.lock();
                }
            }
        }

        // Wrappers that went away without `remove_object` leave dead entries behind.
        tables.objects.retain(|_, object| object.strong_count() > 0);

        let object = make();
        let object_any: Arc<Object> = object.clone();
        tables.objects.insert(address, Arc::downgrade(&object_any));

        (object, false)
    }

    /// Looks up the wrapper for `address`. A miss means the real object should be used as is.
    pub fn object<T>(&self, address: usize) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let existing = self.lock().objects.get(&address).and_then(Weak::upgrade)?;
        existing.downcast::<T>().ok()
    }

    pub fn remove_object(&self, address: usize) {
        self.lock().objects.remove(&address);
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.values().filter(|object| object.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::same_shader;
    use crate::shaders::SourceKind;
    use crate::testing::MockShader;

    #[test]
    fn first_original_is_kept() {
        let registry = Registry::new();
        let a: CompiledShader = MockShader::new(Stage::Pixel);
        let b: CompiledShader = MockShader::new(Stage::Pixel);
        let hash = ShaderHash(42);

        let first = registry.register_original(hash, Stage::Pixel, b"one", a.clone());
        assert!(first.first && !first.collision);
        assert!(same_shader(&first.active, &a));

        // Same bytecode again: no collision. The new object is handed out, but the record keeps
        // the first one.
        let again = registry.register_original(hash, Stage::Pixel, b"one", b.clone());
        assert!(!again.first && !again.collision);
        assert!(same_shader(&again.active, &b));
        assert!(same_shader(&registry.active(hash).unwrap(), &a));

        let collided = registry.register_original(hash, Stage::Pixel, b"two", b);
        assert!(collided.collision);
        assert_eq!(&*registry.original_bytecode(hash).unwrap(), b"one");
        assert_eq!(registry.with_record(hash, |record| (record.collisions, record.creations)), Some((1, 3)));
    }

    #[test]
    fn lazy_records_take_the_original_later() {
        let registry = Registry::new();
        let hash = ShaderHash(7);

        assert!(registry.ensure_record(hash, Stage::Vertex));
        assert!(!registry.ensure_record(hash, Stage::Vertex));
        assert!(registry.active(hash).is_none());

        let shader: CompiledShader = MockShader::new(Stage::Vertex);
        let creation = registry.register_original(hash, Stage::Vertex, b"code", shader.clone());
        assert!(!creation.first);
        assert!(same_shader(&registry.original(hash).unwrap(), &shader));
    }

    #[test]
    fn reverts_what_was_not_found() {
        let registry = Registry::new();
        let original: CompiledShader = MockShader::new(Stage::Pixel);
        let replacement: CompiledShader = MockShader::new(Stage::Pixel);

        registry.register_original(ShaderHash(1), Stage::Pixel, b"a", original.clone());
        registry.register_original(ShaderHash(2), Stage::Pixel, b"b", MockShader::new(Stage::Pixel));

        let stale = registry.install(
            ShaderHash(1),
            Replacement {
                shader: replacement.clone(),
                bytecode: Arc::from(&b"c"[..]),
                kind: SourceKind::Assembly,
                path: "x".into(),
            },
            SystemTime::now(),
        );

        assert!(stale.is_none());
        assert!(same_shader(&registry.active(ShaderHash(1)).unwrap(), &replacement));
        assert!(same_shader(&registry.replacement(ShaderHash(1)).unwrap(), &replacement));
        assert!(registry.replacement(ShaderHash(2)).is_none());

        registry.clear_found();
        registry.mark_found(ShaderHash(2));

        let reverted = registry.revert_unfound();
        assert_eq!(reverted.len(), 1);
        assert_eq!(reverted[0].0, ShaderHash(1));
        assert!(same_shader(&registry.active(ShaderHash(1)).unwrap(), &original));

        // Records are kept after reverting.
        assert_eq!(registry.hashes(), vec![ShaderHash(1), ShaderHash(2)]);
    }

    #[test]
    fn one_wrapper_per_address() {
        let registry = Registry::new();

        let (first, existed) = registry.get_or_insert(0x1000, || Arc::new(5u32));
        assert!(!existed);

        let (second, existed) = registry.get_or_insert(0x1000, || Arc::new(6u32));
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.object::<u32>(0x1000).as_deref(), Some(&5));
        assert!(registry.object::<String>(0x1000).is_none());

        drop(first);
        drop(second);
        assert!(registry.object::<u32>(0x1000).is_none());
        assert_eq!(registry.object_count(), 0);

        let (third, existed) = registry.get_or_insert(0x1000, || Arc::new(7u32));
        assert!(!existed);
        assert_eq!(*third, 7);

        registry.remove_object(0x1000);
        assert!(registry.object::<u32>(0x1000).is_none());
    }

    #[test]
    fn dead_wrappers_are_pruned() {
        let registry = Registry::new();

        for address in 0..100 {
            let (object, _) = registry.get_or_insert(address, || Arc::new(address));
            drop(object);
        }

        let (_kept, _) = registry.get_or_insert(0x5000, || Arc::new(1usize));
        assert_eq!(registry.lock().objects.len(), 1);
    }

    #[test]
    fn handles_map_to_hashes() {
        let registry = Registry::new();
        registry.bind_handle(0x10, ShaderHash(3));
        assert_eq!(registry.hash_of(0x10), Some(ShaderHash(3)));

        registry.forget_handle(0x10);
        assert_eq!(registry.hash_of(0x10), None);
    }
}
