use crate::core::{Payload, StorageError, TargetConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Bucket-level configuration that a migration backs up and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAspect {
    Acl,
    DefaultObjectAcl,
    Logging,
    Cors,
    Versioning,
    Lifecycle,
    Website,
}

impl ConfigAspect {
    pub const ALL: [ConfigAspect; 7] = [
        ConfigAspect::Acl,
        ConfigAspect::DefaultObjectAcl,
        ConfigAspect::Logging,
        ConfigAspect::Cors,
        ConfigAspect::Versioning,
        ConfigAspect::Lifecycle,
        ConfigAspect::Website,
    ];

    /// Key used when the aspect is stored as a checkpoint snapshot.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acl => "acl",
            Self::DefaultObjectAcl => "default_object_acl",
            Self::Logging => "logging",
            Self::Cors => "cors",
            Self::Versioning => "versioning",
            Self::Lifecycle => "lifecycle",
            Self::Website => "website",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|aspect| aspect.as_str() == value)
    }
}

impl std::fmt::Display for ConfigAspect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `copy_all_objects` treats versions and existing destination objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
    /// Copy only the live generation of each object, overwriting the destination.
    LatestOnly,
    /// Copy every noncurrent and live generation, oldest first. Generations
    /// already copied by an earlier call for the same pair are skipped.
    AllVersions,
    /// Copy live objects that do not yet exist at the destination.
    NoClobber,
    /// Copy live objects that are missing at the destination or whose live
    /// destination copy does not [match](ObjectEntry::matches).
    Sync,
}

/// One object (or object generation) in a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Base64 CRC32C as reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32c: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl ObjectEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: None,
            size: None,
            crc32c: None,
            md5: None,
        }
    }

    pub fn with_generation(name: impl Into<String>, generation: u64) -> Self {
        Self {
            generation: Some(generation),
            ..Self::new(name)
        }
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn crc32c(mut self, crc32c: impl Into<String>) -> Self {
        self.crc32c = Some(crc32c.into());
        self
    }

    pub fn md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }

    /// Whether `other` holds the same content, judged by size and then by the
    /// strongest checksum both sides report. Generations are not compared.
    ///
    /// Entries without any checksum fall back to the size comparison alone.
    pub fn matches(&self, other: &ObjectEntry) -> bool {
        if self.name != other.name {
            return false;
        }
        if let (Some(a), Some(b)) = (self.size, other.size) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.md5, &other.md5) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.crc32c, &other.crc32c) {
            return a == b;
        }
        true
    }
}

/// Remote storage capabilities the migration engine relies on.
///
/// Implementations wrap a real object-storage client. The engine only calls
/// these methods from step actions, one unit at a time per worker, so an
/// implementation need not serialize calls for a single bucket.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> StorageResult<bool>;

    /// Fails with `AlreadyExists`, `AccessDenied` or `Transient`.
    async fn create_bucket(&self, bucket: &str, config: &TargetConfig) -> StorageResult<()>;

    /// Deletes every object and then the bucket itself.
    ///
    /// `NotEmpty` is reported while deletes are still propagating.
    async fn delete_bucket_recursive(&self, bucket: &str) -> StorageResult<()>;

    async fn copy_all_objects(&self, src: &str, dst: &str, mode: CopyMode) -> StorageResult<()>;

    async fn get_config(&self, bucket: &str, aspect: ConfigAspect) -> StorageResult<Payload>;

    async fn set_config(
        &self,
        bucket: &str,
        aspect: ConfigAspect,
        payload: &Payload,
    ) -> StorageResult<()>;

    /// Lists objects, including noncurrent generations when `include_versions` is set.
    async fn list_objects(
        &self,
        bucket: &str,
        include_versions: bool,
    ) -> StorageResult<Vec<ObjectEntry>>;
}
