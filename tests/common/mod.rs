#![allow(dead_code)]

use async_trait::async_trait;
use bucketmove::{
    CheckpointRecord, CheckpointStore, ConfigAspect, CopyMode, FnAction, MigrateError,
    MigrationPlan, ObjectEntry, Payload, StorageClient, StorageError, StorageResult,
    TargetConfig,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

// ============================================================================
// In-memory object storage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    BucketExists,
    CreateBucket,
    DeleteBucket,
    Copy,
    GetConfig,
    SetConfig,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeObject {
    pub name: String,
    pub generation: u64,
    pub live: bool,
    pub content: String,
}

impl FakeObject {
    fn entry(&self) -> ObjectEntry {
        let mut hasher = DefaultHasher::new();
        self.content.hash(&mut hasher);
        ObjectEntry::with_generation(self.name.clone(), self.generation)
            .size(self.content.len() as u64)
            .crc32c(format!("{:016x}", hasher.finish()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeBucket {
    pub target: TargetConfig,
    pub config: BTreeMap<ConfigAspect, Payload>,
    pub objects: Vec<FakeObject>,
    /// (source bucket, source generation) pairs already copied in.
    copied_from: HashSet<(String, u64)>,
}

impl FakeBucket {
    pub fn versioned(&self) -> bool {
        matches!(self.config.get(&ConfigAspect::Versioning), Some(Payload::Bool(true)))
    }

    pub fn live_names(&self) -> Vec<String> {
        let mut names = self
            .objects
            .iter()
            .filter(|object| object.live)
            .map(|object| object.name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn live_content(&self, name: &str) -> Option<&str> {
        self.live(name).map(|object| object.content.as_str())
    }

    fn live(&self, name: &str) -> Option<&FakeObject> {
        self.objects
            .iter()
            .find(|object| object.live && object.name == name)
    }

    fn write(&mut self, name: &str, generation: u64, content: &str) {
        if self.versioned() {
            for object in self.objects.iter_mut().filter(|o| o.name == name) {
                object.live = false;
            }
        } else {
            self.objects.retain(|object| object.name != name);
        }
        self.objects.push(FakeObject {
            name: name.to_string(),
            generation,
            live: true,
            content: content.to_string(),
        });
    }
}

struct Fault {
    op: Op,
    bucket: String,
    error: StorageError,
    remaining: Option<u32>,
}

#[derive(Default)]
struct FakeState {
    buckets: BTreeMap<String, FakeBucket>,
    faults: Vec<Fault>,
    calls: HashMap<(Op, String), u32>,
    next_generation: u64,
}

impl FakeState {
    fn enter(&mut self, op: Op, bucket: &str) -> StorageResult<()> {
        *self.calls.entry((op, bucket.to_string())).or_default() += 1;
        let Some(index) = self
            .faults
            .iter()
            .position(|fault| fault.op == op && fault.bucket == bucket)
        else {
            return Ok(());
        };
        let fault = &mut self.faults[index];
        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(index);
        }
        Err(error)
    }

    fn bucket(&self, bucket: &str) -> StorageResult<&FakeBucket> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| StorageError::NotFound(bucket.to_string()))
    }

    fn bucket_mut(&mut self, bucket: &str) -> StorageResult<&mut FakeBucket> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NotFound(bucket.to_string()))
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Object storage held in memory, with scripted failures.
#[derive(Default)]
pub struct FakeStorage {
    state: Mutex<FakeState>,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bucket(&self, bucket: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .insert(bucket.to_string(), FakeBucket::default());
    }

    pub fn put_object(&self, bucket: &str, name: &str) {
        self.put_object_with(bucket, name, &format!("{} original", name));
    }

    pub fn put_object_with(&self, bucket: &str, name: &str, content: &str) {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation();
        state
            .buckets
            .get_mut(bucket)
            .expect("bucket seeded")
            .write(name, generation, content);
    }

    pub fn set_aspect(&self, bucket: &str, aspect: ConfigAspect, payload: Payload) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get_mut(bucket)
            .expect("bucket seeded")
            .config
            .insert(aspect, payload);
    }

    /// Drops every generation of `name`, as if it was lost in transit.
    pub fn remove_object(&self, bucket: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get_mut(bucket)
            .expect("bucket seeded")
            .objects
            .retain(|object| object.name != name);
    }

    pub fn bucket(&self, bucket: &str) -> Option<FakeBucket> {
        self.state.lock().unwrap().buckets.get(bucket).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.state.lock().unwrap().buckets.keys().cloned().collect()
    }

    /// Fails `op` on `bucket` with `error`, `times` times or forever when `None`.
    pub fn fail(&self, op: Op, bucket: &str, error: StorageError, times: Option<u32>) {
        self.state.lock().unwrap().faults.push(Fault {
            op,
            bucket: bucket.to_string(),
            error,
            remaining: times,
        });
    }

    pub fn calls(&self, op: Op, bucket: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&(op, bucket.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn bucket_exists(&self, bucket: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.enter(Op::BucketExists, bucket)?;
        Ok(state.buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str, config: &TargetConfig) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.enter(Op::CreateBucket, bucket)?;
        if state.buckets.contains_key(bucket) {
            return Err(StorageError::AlreadyExists(bucket.to_string()));
        }
        state.buckets.insert(
            bucket.to_string(),
            FakeBucket {
                target: config.clone(),
                ..FakeBucket::default()
            },
        );
        Ok(())
    }

    async fn delete_bucket_recursive(&self, bucket: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.enter(Op::DeleteBucket, bucket)?;
        state
            .buckets
            .remove(bucket)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(bucket.to_string()))
    }

    async fn copy_all_objects(&self, src: &str, dst: &str, mode: CopyMode) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.enter(Op::Copy, src)?;
        state.bucket(dst)?;
        let mut source = state.bucket(src)?.objects.clone();
        source.sort_by_key(|object| object.generation);

        for object in source {
            let copy = match mode {
                CopyMode::LatestOnly => object.live,
                CopyMode::NoClobber => object.live && state.bucket(dst)?.live(&object.name).is_none(),
                CopyMode::Sync => {
                    object.live
                        && state
                            .bucket(dst)?
                            .live(&object.name)
                            .is_none_or(|existing| !object.entry().matches(&existing.entry()))
                }
                CopyMode::AllVersions => !state
                    .bucket(dst)?
                    .copied_from
                    .contains(&(src.to_string(), object.generation)),
            };
            if !copy {
                continue;
            }
            let generation = state.generation();
            let target = state.bucket_mut(dst)?;
            target.write(&object.name, generation, &object.content);
            target
                .copied_from
                .insert((src.to_string(), object.generation));
        }
        Ok(())
    }

    async fn get_config(&self, bucket: &str, aspect: ConfigAspect) -> StorageResult<Payload> {
        let mut state = self.state.lock().unwrap();
        state.enter(Op::GetConfig, bucket)?;
        Ok(state
            .bucket(bucket)?
            .config
            .get(&aspect)
            .cloned()
            .unwrap_or(Payload::Null))
    }

    async fn set_config(
        &self,
        bucket: &str,
        aspect: ConfigAspect,
        payload: &Payload,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.enter(Op::SetConfig, bucket)?;
        state
            .bucket_mut(bucket)?
            .config
            .insert(aspect, payload.clone());
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        include_versions: bool,
    ) -> StorageResult<Vec<ObjectEntry>> {
        let mut state = self.state.lock().unwrap();
        state.enter(Op::List, bucket)?;
        Ok(state
            .bucket(bucket)?
            .objects
            .iter()
            .filter(|object| include_versions || object.live)
            .map(FakeObject::entry)
            .collect())
    }
}

// ============================================================================
// Scripted step actions
// ============================================================================

/// Builds plans whose steps log `(unit, step)` and fail where scripted.
#[derive(Default)]
pub struct StepRecorder {
    calls: Mutex<Vec<(String, String)>>,
    faults: Mutex<HashMap<(String, String), (StorageError, Option<u32>)>>,
}

impl StepRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, unit: &str, step: &str, error: StorageError, times: Option<u32>) {
        self.faults
            .lock()
            .unwrap()
            .insert((unit.to_string(), step.to_string()), (error, times));
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, unit: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == unit)
            .map(|(_, step)| step.clone())
            .collect()
    }

    fn invoke(&self, unit: &str, step: &str) -> bucketmove::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((unit.to_string(), step.to_string()));
        let key = (unit.to_string(), step.to_string());
        let mut faults = self.faults.lock().unwrap();
        let Some((error, remaining)) = faults.get_mut(&key) else {
            return Ok(());
        };
        let error = error.clone();
        let exhausted = match remaining {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            faults.remove(&key);
        }
        Err(MigrateError::Storage(error))
    }

    /// `layout` lists stages in order with their step names.
    pub fn plan(self: &Arc<Self>, layout: &[(&str, &[&str])]) -> MigrationPlan {
        let mut builder = MigrationPlan::builder();
        for (stage, steps) in layout {
            builder = builder.stage(*stage);
            for step in *steps {
                let recorder = self.clone();
                let step_name = step.to_string();
                builder = builder.step(
                    *step,
                    FnAction::new(move |ctx| {
                        let recorder = recorder.clone();
                        let step_name = step_name.clone();
                        Box::pin(async move { recorder.invoke(ctx.unit_id(), &step_name) })
                    }),
                );
            }
        }
        builder.build().expect("valid test plan")
    }
}

// ============================================================================
// Checkpoint store with a failing write
// ============================================================================

/// Delegates to `inner` but fails chosen `record_completed` and `archive`
/// calls once each.
pub struct FlakyCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    fail_once: Mutex<HashSet<(String, u32)>>,
    fail_archive: Mutex<HashSet<String>>,
}

impl FlakyCheckpointStore {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_once: Mutex::new(HashSet::new()),
            fail_archive: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_record_once(&self, unit_id: &str, ordinal: u32) {
        self.fail_once
            .lock()
            .unwrap()
            .insert((unit_id.to_string(), ordinal));
    }

    pub fn fail_archive_once(&self, unit_id: &str) {
        self.fail_archive.lock().unwrap().insert(unit_id.to_string());
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn get_last_completed(&self, unit_id: &str) -> bucketmove::Result<u32> {
        self.inner.get_last_completed(unit_id).await
    }

    async fn record_completed(&self, unit_id: &str, ordinal: u32) -> bucketmove::Result<()> {
        let armed = self
            .fail_once
            .lock()
            .unwrap()
            .remove(&(unit_id.to_string(), ordinal));
        if armed {
            return Err(MigrateError::Persistence(format!(
                "disk full while recording {} for '{}'",
                ordinal, unit_id
            )));
        }
        self.inner.record_completed(unit_id, ordinal).await
    }

    async fn save_snapshot(
        &self,
        unit_id: &str,
        key: &str,
        payload: &Payload,
    ) -> bucketmove::Result<()> {
        self.inner.save_snapshot(unit_id, key, payload).await
    }

    async fn load_snapshot(&self, unit_id: &str, key: &str) -> bucketmove::Result<Payload> {
        self.inner.load_snapshot(unit_id, key).await
    }

    async fn archive(&self, unit_id: &str) -> bucketmove::Result<()> {
        if self.fail_archive.lock().unwrap().remove(unit_id) {
            return Err(MigrateError::Persistence(format!(
                "archive directory unavailable for '{}'",
                unit_id
            )));
        }
        self.inner.archive(unit_id).await
    }

    async fn load_record(&self, unit_id: &str) -> bucketmove::Result<Option<CheckpointRecord>> {
        self.inner.load_record(unit_id).await
    }

    async fn list_active(&self) -> bucketmove::Result<Vec<String>> {
        self.inner.list_active().await
    }
}
