//! Dump providers, local data interfaces and the lifecycle-tracking report store.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spotcheck_core::{
    ContentKey, CoverageInterval, Dump, Keyed, Mismatch, MismatchStatus, MismatchType,
    Observation, ReferenceType, Report, ReportId, SortOrder, UpdateKind, UpdateToken,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spotcheck-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("dump {0} not found")]
    DumpNotFound(String),
    #[error("dump {dump_id} checksum mismatch: manifest {expected}, payload {actual}")]
    ChecksumMismatch {
        dump_id: String,
        expected: String,
        actual: String,
    },
    #[error("report not found: {0}")]
    ReportNotFound(ReportId),
    #[error("report already stored for {0}")]
    DuplicateReport(ReportId),
    #[error("report {report_id} is older than the latest stored report {latest}")]
    StaleReport { report_id: ReportId, latest: ReportId },
    #[error("{reference_type} {content_id} has no open {mismatch_type} in the latest report")]
    MismatchNotOpen {
        reference_type: ReferenceType,
        content_id: String,
        mismatch_type: MismatchType,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-item failure when loading a local entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityFetchError {
    #[error("not found")]
    NotFound,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Backend(String),
}

/// JSON documents written atomically under a root directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn read_bytes(&self, relative: &Path) -> Result<Vec<u8>, StorageError> {
        let path = self.root.join(relative);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(bytes)
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        relative: &Path,
    ) -> Result<Option<T>, StorageError> {
        let path = self.root.join(relative);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = self.read_bytes(relative).await?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    /// Replace the document at `relative` using a temp file in the same directory and a rename.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        relative: &Path,
        value: &T,
    ) -> Result<PathBuf, StorageError> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", relative.display()))?;
        let absolute_path = self.root.join(relative);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::new(err)
                .context(format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                ))
                .into());
        }
        Ok(absolute_path)
    }
}

#[async_trait]
pub trait DumpProvider: Send + Sync {
    /// Unprocessed dumps for the stream, oldest coverage end first.
    async fn list_pending(&self, reference_type: ReferenceType) -> Result<Vec<Dump>, StorageError>;

    async fn fetch(&self, dump: &Dump) -> Result<Vec<u8>, StorageError>;

    /// Returns `true` only for the call that flipped the flag.
    async fn mark_processed(&self, dump: &Dump) -> Result<bool, StorageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub complete: bool,
    #[serde(default)]
    pub processed: bool,
    pub payload: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

const MANIFEST_FILE: &str = "manifest.json";

/// Dumps laid out as `<root>/<TYPE>/<dir>/manifest.json` plus the payload file it names.
#[derive(Debug)]
pub struct FsDumpProvider {
    files: JsonFileStore,
    write_lock: Mutex<()>,
}

impl FsDumpProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            files: JsonFileStore::new(root),
            write_lock: Mutex::new(()),
        }
    }

    fn manifest_path(dump: &Dump) -> Result<PathBuf, StorageError> {
        let parent = Path::new(&dump.payload)
            .parent()
            .ok_or_else(|| StorageError::DumpNotFound(dump.id.clone()))?;
        Ok(parent.join(MANIFEST_FILE))
    }

    async fn read_manifest(&self, dump: &Dump) -> Result<DumpManifest, StorageError> {
        let path = Self::manifest_path(dump)?;
        self.files
            .read_json(&path)
            .await?
            .ok_or_else(|| StorageError::DumpNotFound(dump.id.clone()))
    }
}

#[async_trait]
impl DumpProvider for FsDumpProvider {
    async fn list_pending(&self, reference_type: ReferenceType) -> Result<Vec<Dump>, StorageError> {
        let type_dir = self.files.root().join(reference_type.as_str());
        if !fs::try_exists(&type_dir)
            .await
            .with_context(|| format!("checking {}", type_dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&type_dir)
            .await
            .with_context(|| format!("reading {}", type_dir.display()))?;
        let mut dumps = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", type_dir.display()))?
        {
            let is_dir = entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let relative_dir = PathBuf::from(reference_type.as_str()).join(&dir_name);
            let Some(manifest) = self
                .files
                .read_json::<DumpManifest>(&relative_dir.join(MANIFEST_FILE))
                .await?
            else {
                debug!(dir = %dir_name, "skipping dump directory without manifest");
                continue;
            };
            if manifest.processed {
                continue;
            }
            let coverage = CoverageInterval::new(manifest.from, manifest.to);
            dumps.push(Dump {
                id: manifest
                    .id
                    .clone()
                    .unwrap_or_else(|| Dump::default_id(reference_type, &coverage)),
                reference_type,
                coverage,
                complete: manifest.complete,
                payload: relative_dir
                    .join(&manifest.payload)
                    .to_string_lossy()
                    .to_string(),
                processed: false,
            });
        }
        dumps.sort_by_key(|d| (d.coverage.to, d.id.clone()));
        Ok(dumps)
    }

    async fn fetch(&self, dump: &Dump) -> Result<Vec<u8>, StorageError> {
        let manifest = self.read_manifest(dump).await?;
        let bytes = self.files.read_bytes(Path::new(&dump.payload)).await?;
        if let Some(expected) = manifest.sha256.as_deref() {
            let actual = JsonFileStore::sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(StorageError::ChecksumMismatch {
                    dump_id: dump.id.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    async fn mark_processed(&self, dump: &Dump) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut manifest = self.read_manifest(dump).await?;
        if manifest.processed {
            debug!(dump_id = %dump.id, "dump already marked processed");
            return Ok(false);
        }
        manifest.processed = true;
        self.files
            .write_json(&Self::manifest_path(dump)?, &manifest)
            .await?;
        info!(dump_id = %dump.id, reference_type = %dump.reference_type, "dump marked processed");
        Ok(true)
    }
}

/// In-process dump provider.
#[derive(Debug, Default)]
pub struct MemoryDumpProvider {
    dumps: Mutex<Vec<(Dump, Vec<u8>)>>,
}

impl MemoryDumpProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_dump(&self, dump: Dump, payload: Vec<u8>) {
        self.dumps.lock().await.push((dump, payload));
    }

    pub async fn dump(&self, dump_id: &str) -> Option<Dump> {
        self.dumps
            .lock()
            .await
            .iter()
            .find(|(d, _)| d.id == dump_id)
            .map(|(d, _)| d.clone())
    }
}

#[async_trait]
impl DumpProvider for MemoryDumpProvider {
    async fn list_pending(&self, reference_type: ReferenceType) -> Result<Vec<Dump>, StorageError> {
        let mut pending = self
            .dumps
            .lock()
            .await
            .iter()
            .filter(|(d, _)| d.reference_type == reference_type && !d.processed)
            .map(|(d, _)| d.clone())
            .collect::<Vec<_>>();
        pending.sort_by_key(|d| (d.coverage.to, d.id.clone()));
        Ok(pending)
    }

    async fn fetch(&self, dump: &Dump) -> Result<Vec<u8>, StorageError> {
        self.dumps
            .lock()
            .await
            .iter()
            .find(|(d, _)| d.id == dump.id)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| StorageError::DumpNotFound(dump.id.clone()))
    }

    async fn mark_processed(&self, dump: &Dump) -> Result<bool, StorageError> {
        let mut dumps = self.dumps.lock().await;
        let (stored, _) = dumps
            .iter_mut()
            .find(|(d, _)| d.id == dump.id)
            .ok_or_else(|| StorageError::DumpNotFound(dump.id.clone()))?;
        if stored.processed {
            return Ok(false);
        }
        stored.processed = true;
        Ok(true)
    }
}

#[async_trait]
pub trait UpdateIndex<K: ContentKey>: Send + Sync {
    /// Tokens whose `kind` timestamp is strictly after `after`, ascending by that timestamp.
    async fn list_update_tokens(
        &self,
        after: DateTime<Utc>,
        kind: UpdateKind,
    ) -> Result<Vec<UpdateToken<K>>, StorageError>;
}

#[async_trait]
pub trait EntityStore<K: ContentKey, E>: Send + Sync {
    async fn get_entity(&self, content_id: &K) -> Result<E, EntityFetchError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: ContentKey, E: DeserializeOwned"))]
pub struct LocalDataFile<K: ContentKey, E> {
    #[serde(default = "Vec::new")]
    pub entities: Vec<E>,
    #[serde(default = "Vec::new")]
    pub updates: Vec<UpdateToken<K>>,
}

/// Local system of record held in memory, optionally loaded from a JSON file.
#[derive(Debug)]
pub struct MemoryLocalData<K: ContentKey, E> {
    entities: RwLock<BTreeMap<K, E>>,
    updates: RwLock<Vec<UpdateToken<K>>>,
}

impl<K: ContentKey, E> Default for MemoryLocalData<K, E> {
    fn default() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            updates: RwLock::new(Vec::new()),
        }
    }
}

impl<K, E> MemoryLocalData<K, E>
where
    K: ContentKey,
    E: Keyed<K> + Clone + Send + Sync + DeserializeOwned + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: LocalDataFile<K, E> =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        let data = Self::new();
        for entity in file.entities {
            data.insert_entity(entity).await;
        }
        for token in file.updates {
            data.push_token(token).await;
        }
        Ok(data)
    }

    pub async fn insert_entity(&self, entity: E) {
        self.entities
            .write()
            .await
            .insert(entity.content_id(), entity);
    }

    /// Stores the entity and records an update token at `processed_at`.
    pub async fn record_update(&self, entity: E, processed_at: DateTime<Utc>) {
        let content_id = entity.content_id();
        self.insert_entity(entity).await;
        self.push_token(UpdateToken::new(content_id, processed_at)).await;
    }

    pub async fn push_token(&self, token: UpdateToken<K>) {
        self.updates.write().await.push(token);
    }

    pub async fn remove_entity(&self, content_id: &K) -> Option<E> {
        self.entities.write().await.remove(content_id)
    }
}

#[async_trait]
impl<K, E> UpdateIndex<K> for MemoryLocalData<K, E>
where
    K: ContentKey,
    E: Send + Sync,
{
    async fn list_update_tokens(
        &self,
        after: DateTime<Utc>,
        kind: UpdateKind,
    ) -> Result<Vec<UpdateToken<K>>, StorageError> {
        let mut tokens = self
            .updates
            .read()
            .await
            .iter()
            .filter(|t| t.timestamp(kind).is_some_and(|at| at > after))
            .cloned()
            .collect::<Vec<_>>();
        tokens.sort_by_key(|t| t.timestamp(kind));
        Ok(tokens)
    }
}

#[async_trait]
impl<K, E> EntityStore<K, E> for MemoryLocalData<K, E>
where
    K: ContentKey,
    E: Clone + Send + Sync,
{
    async fn get_entity(&self, content_id: &K) -> Result<E, EntityFetchError> {
        self.entities
            .read()
            .await
            .get(content_id)
            .cloned()
            .ok_or(EntityFetchError::NotFound)
    }
}

/// Persisted report history per reference type. Sole authority for mismatch lifecycle status.
#[async_trait]
pub trait ReportStore<K: ContentKey>: Send + Sync {
    /// Applies lifecycle statuses against the preceding report, persists, and returns what was stored.
    async fn save_report(&self, report: Report<K>) -> Result<Report<K>, StorageError>;

    async fn get_report(&self, report_id: &ReportId) -> Result<Report<K>, StorageError>;

    async fn latest_report(
        &self,
        reference_type: ReferenceType,
    ) -> Result<Option<Report<K>>, StorageError>;

    /// Reference time of the newest stored report, if any.
    async fn latest_reference_time(
        &self,
        reference_type: ReferenceType,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Ids with `from <= reference_time <= to`.
    async fn list_report_ids(
        &self,
        reference_type: ReferenceType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ReportId>, StorageError>;

    async fn open_mismatch_count(
        &self,
        report_id: &ReportId,
        include_ignored: bool,
    ) -> Result<usize, StorageError> {
        Ok(self
            .get_report(report_id)
            .await?
            .open_mismatch_count(include_ignored))
    }

    /// Marks a pair ignored from the next stored report until it stops recurring.
    /// The pair must be open in the latest stored report.
    async fn ignore_mismatch(
        &self,
        reference_type: ReferenceType,
        content_id: &K,
        mismatch_type: MismatchType,
    ) -> Result<(), StorageError>;

    async fn unignore_mismatch(
        &self,
        reference_type: ReferenceType,
        content_id: &K,
        mismatch_type: MismatchType,
    ) -> Result<bool, StorageError>;
}

pub type IgnoreSet<K> = BTreeSet<(K, MismatchType)>;

/// Assign NEW / EXISTING / IGNORED / RESOLVED statuses to `current` given the preceding report.
///
/// Pairs still open in `previous` but absent from `current` are carried into `current` as
/// RESOLVED. Markers survive only for pairs that are IGNORED in `current`.
pub fn apply_lifecycle<K: ContentKey>(
    previous: Option<&Report<K>>,
    mut current: Report<K>,
    ignored: &mut IgnoreSet<K>,
) -> Report<K> {
    let mut previously_open: BTreeMap<(K, MismatchType), Mismatch> = BTreeMap::new();
    if let Some(previous) = previous {
        for (content_id, mismatch) in previous.mismatches() {
            if mismatch.status != MismatchStatus::Resolved {
                previously_open.insert((content_id.clone(), mismatch.mismatch_type), mismatch.clone());
            }
        }
    }

    let reference_time = current.report_id.reference_time;
    for (content_id, observation) in current.observations.iter_mut() {
        for mismatch in observation.mismatches.iter_mut() {
            let key = (content_id.clone(), mismatch.mismatch_type);
            match previously_open.remove(&key) {
                Some(prior) => {
                    mismatch.status = MismatchStatus::Existing;
                    mismatch.first_seen = prior.first_seen.or(mismatch.first_seen);
                }
                None => {
                    mismatch.status = MismatchStatus::New;
                    mismatch.first_seen.get_or_insert(reference_time);
                }
            }
            if ignored.contains(&key) {
                mismatch.status = MismatchStatus::Ignored;
            }
        }
    }

    ignored.retain(|(content_id, mismatch_type)| {
        current
            .observation(content_id)
            .and_then(|o| o.mismatch(*mismatch_type))
            .is_some_and(|m| m.status == MismatchStatus::Ignored)
    });

    for ((content_id, mismatch_type), prior) in previously_open {
        let resolved = Mismatch {
            status: MismatchStatus::Resolved,
            ..prior
        };
        current
            .observations
            .entry(content_id.clone())
            .or_insert_with(|| Observation::new(content_id))
            .add_mismatch(resolved);
    }

    current
}

const INDEX_FILE: &str = "index.json";
const IGNORED_FILE: &str = "ignored.json";

/// Report history as JSON files: `<root>/<TYPE>/index.json`, one file per report, and ignore markers.
#[derive(Debug)]
pub struct FsReportStore<K: ContentKey> {
    files: JsonFileStore,
    write_lock: Mutex<()>,
    _key: PhantomData<fn() -> K>,
}

impl<K: ContentKey> FsReportStore<K> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            files: JsonFileStore::new(root),
            write_lock: Mutex::new(()),
            _key: PhantomData,
        }
    }

    fn type_dir(reference_type: ReferenceType) -> PathBuf {
        PathBuf::from(reference_type.as_str())
    }

    fn report_path(report_id: &ReportId) -> PathBuf {
        Self::type_dir(report_id.reference_type).join(format!(
            "{}.json",
            report_id.reference_time.format("%Y%m%dT%H%M%S%.9fZ")
        ))
    }

    async fn load_index(&self, reference_type: ReferenceType) -> Result<Vec<ReportId>, StorageError> {
        let mut index: Vec<ReportId> = self
            .files
            .read_json(&Self::type_dir(reference_type).join(INDEX_FILE))
            .await?
            .unwrap_or_default();
        index.sort();
        Ok(index)
    }

    async fn load_ignored(&self, reference_type: ReferenceType) -> Result<IgnoreSet<K>, StorageError> {
        Ok(self
            .files
            .read_json(&Self::type_dir(reference_type).join(IGNORED_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn write_ignored(
        &self,
        reference_type: ReferenceType,
        ignored: &IgnoreSet<K>,
    ) -> Result<(), StorageError> {
        self.files
            .write_json(&Self::type_dir(reference_type).join(IGNORED_FILE), ignored)
            .await?;
        Ok(())
    }

    async fn read_report(&self, report_id: &ReportId) -> Result<Report<K>, StorageError> {
        self.files
            .read_json(&Self::report_path(report_id))
            .await?
            .ok_or_else(|| StorageError::ReportNotFound(report_id.clone()))
    }
}

#[async_trait]
impl<K: ContentKey> ReportStore<K> for FsReportStore<K> {
    async fn save_report(&self, report: Report<K>) -> Result<Report<K>, StorageError> {
        let _guard = self.write_lock.lock().await;
        let reference_type = report.reference_type();
        let mut index = self.load_index(reference_type).await?;
        if let Some(existing) = index.iter().find(|id| id.same_report(&report.report_id)) {
            return Err(StorageError::DuplicateReport(existing.clone()));
        }
        if let Some(latest) = index.last() {
            if latest.reference_time > report.report_id.reference_time {
                return Err(StorageError::StaleReport {
                    report_id: report.report_id.clone(),
                    latest: latest.clone(),
                });
            }
        }

        let previous_id = index
            .iter()
            .filter(|id| id.reference_time < report.report_id.reference_time)
            .max()
            .cloned();
        let previous = match &previous_id {
            Some(id) => Some(self.read_report(id).await?),
            None => None,
        };

        let mut ignored = self.load_ignored(reference_type).await?;
        let ignored_before = ignored.len();
        let stored = apply_lifecycle(previous.as_ref(), report, &mut ignored);

        self.files
            .write_json(&Self::report_path(&stored.report_id), &stored)
            .await?;
        if ignored.len() != ignored_before {
            self.write_ignored(reference_type, &ignored).await?;
        }
        index.push(stored.report_id.clone());
        index.sort();
        self.files
            .write_json(&Self::type_dir(reference_type).join(INDEX_FILE), &index)
            .await?;

        info!(
            report_id = %stored.report_id,
            previous = previous_id.as_ref().map(|id| id.to_string()).unwrap_or_default(),
            open = stored.open_mismatch_count(false),
            resolved = stored.status_count(MismatchStatus::Resolved),
            "report stored"
        );
        Ok(stored)
    }

    async fn get_report(&self, report_id: &ReportId) -> Result<Report<K>, StorageError> {
        let index = self.load_index(report_id.reference_type).await?;
        let stored_id = index
            .into_iter()
            .find(|id| id.same_report(report_id))
            .ok_or_else(|| StorageError::ReportNotFound(report_id.clone()))?;
        self.read_report(&stored_id).await
    }

    async fn latest_report(
        &self,
        reference_type: ReferenceType,
    ) -> Result<Option<Report<K>>, StorageError> {
        match self.load_index(reference_type).await?.last() {
            Some(id) => Ok(Some(self.read_report(id).await?)),
            None => Ok(None),
        }
    }

    async fn latest_reference_time(
        &self,
        reference_type: ReferenceType,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .load_index(reference_type)
            .await?
            .last()
            .map(|id| id.reference_time))
    }

    async fn list_report_ids(
        &self,
        reference_type: ReferenceType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ReportId>, StorageError> {
        let mut ids = self
            .load_index(reference_type)
            .await?
            .into_iter()
            .filter(|id| id.reference_time >= from && id.reference_time <= to)
            .collect::<Vec<_>>();
        if order == SortOrder::Desc {
            ids.reverse();
        }
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }

    async fn ignore_mismatch(
        &self,
        reference_type: ReferenceType,
        content_id: &K,
        mismatch_type: MismatchType,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let open = match self.load_index(reference_type).await?.last() {
            Some(latest) => self
                .read_report(latest)
                .await?
                .observation(content_id)
                .and_then(|o| o.mismatch(mismatch_type))
                .is_some_and(|m| m.status.is_open(true)),
            None => false,
        };
        if !open {
            return Err(StorageError::MismatchNotOpen {
                reference_type,
                content_id: content_id.to_string(),
                mismatch_type,
            });
        }
        let mut ignored = self.load_ignored(reference_type).await?;
        if ignored.insert((content_id.clone(), mismatch_type)) {
            self.write_ignored(reference_type, &ignored).await?;
            info!(%reference_type, %content_id, %mismatch_type, "mismatch ignored");
        }
        Ok(())
    }

    async fn unignore_mismatch(
        &self,
        reference_type: ReferenceType,
        content_id: &K,
        mismatch_type: MismatchType,
    ) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut ignored = self.load_ignored(reference_type).await?;
        let removed = ignored.remove(&(content_id.clone(), mismatch_type));
        if removed {
            self.write_ignored(reference_type, &ignored).await?;
        } else {
            warn!(%reference_type, %content_id, %mismatch_type, "no ignore marker to remove");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spotcheck_core::{ParseIdError, ReportBuilder};
    use std::fmt;
    use std::str::FromStr;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    struct Key(String);

    impl fmt::Display for Key {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl FromStr for Key {
        type Err = ParseIdError;
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Ok(Key(s.to_string()))
        }
    }

    impl TryFrom<String> for Key {
        type Error = ParseIdError;
        fn try_from(value: String) -> Result<Self, Self::Error> {
            value.parse()
        }
    }

    impl From<Key> for String {
        fn from(value: Key) -> Self {
            value.0
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Entity {
        id: Key,
        value: String,
    }

    impl Keyed<Key> for Entity {
        fn content_id(&self) -> Key {
            self.id.clone()
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().unwrap()
    }

    fn key(s: &str) -> Key {
        Key(s.to_string())
    }

    fn report(day: u32, mismatches: &[(&str, MismatchType)]) -> Report<Key> {
        let mut builder = ReportBuilder::new(ReportId::new(
            ReferenceType::SenateSiteBills,
            ts(day),
            ts(day),
        ));
        for (id, mismatch_type) in mismatches {
            builder.add_observation(Observation::with_mismatch(
                key(id),
                Mismatch::new(*mismatch_type, "ref", "obs"),
            ));
        }
        builder.finish()
    }

    fn status_of(report: &Report<Key>, id: &str, mismatch_type: MismatchType) -> Option<MismatchStatus> {
        report
            .observation(&key(id))
            .and_then(|o| o.mismatch(mismatch_type))
            .map(|m| m.status)
    }

    #[test]
    fn payload_hashing_is_stable() {
        assert_eq!(
            JsonFileStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn lifecycle_marks_new_existing_and_resolved() {
        let previous = report(1, &[("X", MismatchType::StatusMismatch), ("Y", MismatchType::TitleMismatch)]);
        let current = report(8, &[("Y", MismatchType::TitleMismatch), ("Z", MismatchType::SponsorMismatch)]);
        let mut ignored = IgnoreSet::new();

        let stored = apply_lifecycle(Some(&previous), current, &mut ignored);

        assert_eq!(status_of(&stored, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Resolved));
        assert_eq!(status_of(&stored, "Y", MismatchType::TitleMismatch), Some(MismatchStatus::Existing));
        assert_eq!(status_of(&stored, "Z", MismatchType::SponsorMismatch), Some(MismatchStatus::New));
        let existing = stored
            .observation(&key("Y"))
            .and_then(|o| o.mismatch(MismatchType::TitleMismatch))
            .unwrap();
        assert_eq!(existing.first_seen, Some(ts(1)));
        assert_eq!(stored.open_mismatch_count(false), 2);
    }

    #[test]
    fn resolved_pairs_are_not_resolved_twice_and_recur_as_new() {
        let first = report(1, &[("X", MismatchType::StatusMismatch)]);
        let mut ignored = IgnoreSet::new();
        let first = apply_lifecycle(None, first, &mut ignored);
        let second = apply_lifecycle(Some(&first), report(2, &[]), &mut ignored);
        assert_eq!(status_of(&second, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Resolved));

        let third = apply_lifecycle(Some(&second), report(3, &[]), &mut ignored);
        assert!(third.observation(&key("X")).is_none());

        let fourth = apply_lifecycle(Some(&third), report(4, &[("X", MismatchType::StatusMismatch)]), &mut ignored);
        let recurred = fourth
            .observation(&key("X"))
            .and_then(|o| o.mismatch(MismatchType::StatusMismatch))
            .unwrap();
        assert_eq!(recurred.status, MismatchStatus::New);
        assert_eq!(recurred.first_seen, Some(ts(4)));
    }

    #[test]
    fn ignore_marker_holds_until_mismatch_stops_recurring() {
        let mut ignored = IgnoreSet::new();
        ignored.insert((key("X"), MismatchType::StatusMismatch));
        let first = apply_lifecycle(None, report(1, &[("X", MismatchType::StatusMismatch)]), &mut ignored);
        assert_eq!(status_of(&first, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Ignored));
        assert_eq!(first.open_mismatch_count(false), 0);
        assert_eq!(first.open_mismatch_count(true), 1);

        let second = apply_lifecycle(Some(&first), report(2, &[("X", MismatchType::StatusMismatch)]), &mut ignored);
        assert_eq!(status_of(&second, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Ignored));

        let third = apply_lifecycle(Some(&second), report(3, &[]), &mut ignored);
        assert_eq!(status_of(&third, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Resolved));
        assert!(ignored.is_empty());
    }

    #[tokio::test]
    async fn fs_report_store_persists_history_and_rejects_duplicates() {
        let dir = tempdir().expect("tempdir");
        let store: FsReportStore<Key> = FsReportStore::new(dir.path());

        store
            .save_report(report(1, &[("X", MismatchType::StatusMismatch)]))
            .await
            .expect("first save");
        let stored = store.save_report(report(8, &[])).await.expect("second save");
        assert_eq!(status_of(&stored, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Resolved));
        assert_eq!(store.open_mismatch_count(&stored.report_id, false).await.unwrap(), 0);

        let dup = store.save_report(report(8, &[])).await;
        assert!(matches!(dup, Err(StorageError::DuplicateReport(_))));

        let ids = store
            .list_report_ids(ReferenceType::SenateSiteBills, ts(1), ts(31), SortOrder::Desc, Some(1))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].reference_time, ts(8));

        let lookup = ReportId::new(ReferenceType::SenateSiteBills, ts(1), Utc::now());
        let fetched = store.get_report(&lookup).await.expect("lookup by reference time");
        assert_eq!(fetched.report_id.reference_time, ts(1));

        let missing = ReportId::new(ReferenceType::SenateSiteBills, ts(5), ts(5));
        match store.get_report(&missing).await {
            Err(StorageError::ReportNotFound(id)) => assert_eq!(id, missing),
            other => panic!("expected ReportNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fs_report_store_applies_ignore_markers_on_next_save() {
        let dir = tempdir().expect("tempdir");
        let store: FsReportStore<Key> = FsReportStore::new(dir.path());
        store
            .save_report(report(1, &[("X", MismatchType::StatusMismatch)]))
            .await
            .unwrap();
        store
            .ignore_mismatch(ReferenceType::SenateSiteBills, &key("X"), MismatchType::StatusMismatch)
            .await
            .unwrap();
        let stored = store
            .save_report(report(2, &[("X", MismatchType::StatusMismatch)]))
            .await
            .unwrap();
        assert_eq!(status_of(&stored, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Ignored));
        assert_eq!(store.open_mismatch_count(&stored.report_id, false).await.unwrap(), 0);
        assert_eq!(store.open_mismatch_count(&stored.report_id, true).await.unwrap(), 1);
        assert!(store
            .unignore_mismatch(ReferenceType::SenateSiteBills, &key("X"), MismatchType::StatusMismatch)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ignoring_a_pair_that_is_not_open_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store: FsReportStore<Key> = FsReportStore::new(dir.path());
        let before_any_report = store
            .ignore_mismatch(ReferenceType::SenateSiteBills, &key("X"), MismatchType::StatusMismatch)
            .await;
        assert!(matches!(before_any_report, Err(StorageError::MismatchNotOpen { .. })));

        store
            .save_report(report(1, &[("X", MismatchType::StatusMismatch)]))
            .await
            .unwrap();
        match store
            .ignore_mismatch(ReferenceType::SenateSiteBills, &key("Y"), MismatchType::TitleMismatch)
            .await
        {
            Err(StorageError::MismatchNotOpen {
                content_id,
                mismatch_type,
                ..
            }) => {
                assert_eq!(content_id, "Y");
                assert_eq!(mismatch_type, MismatchType::TitleMismatch);
            }
            other => panic!("expected MismatchNotOpen, got {other:?}"),
        }

        let later = store
            .save_report(report(8, &[("Y", MismatchType::TitleMismatch)]))
            .await
            .unwrap();
        assert_eq!(status_of(&later, "Y", MismatchType::TitleMismatch), Some(MismatchStatus::New));
        assert_eq!(later.open_mismatch_count(false), 1);
    }

    #[test]
    fn markers_for_pairs_absent_from_the_report_are_dropped() {
        let mut ignored = IgnoreSet::new();
        ignored.insert((key("X"), MismatchType::StatusMismatch));
        ignored.insert((key("Y"), MismatchType::TitleMismatch));
        let stored = apply_lifecycle(None, report(1, &[("X", MismatchType::StatusMismatch)]), &mut ignored);
        assert_eq!(status_of(&stored, "X", MismatchType::StatusMismatch), Some(MismatchStatus::Ignored));
        assert_eq!(
            ignored.into_iter().collect::<Vec<_>>(),
            vec![(key("X"), MismatchType::StatusMismatch)]
        );

        let mut ignored = IgnoreSet::new();
        ignored.insert((key("Y"), MismatchType::TitleMismatch));
        let first = apply_lifecycle(None, report(1, &[]), &mut ignored);
        assert!(ignored.is_empty());
        let second = apply_lifecycle(Some(&first), report(2, &[("Y", MismatchType::TitleMismatch)]), &mut ignored);
        assert_eq!(status_of(&second, "Y", MismatchType::TitleMismatch), Some(MismatchStatus::New));
    }

    #[tokio::test]
    async fn fs_report_store_rejects_reports_older_than_the_latest() {
        let dir = tempdir().expect("tempdir");
        let store: FsReportStore<Key> = FsReportStore::new(dir.path());
        assert_eq!(
            store.latest_reference_time(ReferenceType::SenateSiteBills).await.unwrap(),
            None
        );
        store.save_report(report(15, &[])).await.unwrap();

        let stale = store.save_report(report(8, &[])).await;
        assert!(matches!(stale, Err(StorageError::StaleReport { .. })));
        assert_eq!(
            store.latest_reference_time(ReferenceType::SenateSiteBills).await.unwrap(),
            Some(ts(15))
        );
    }

    #[tokio::test]
    async fn fs_dump_provider_lists_verifies_and_marks_once() {
        let dir = tempdir().expect("tempdir");
        let files = JsonFileStore::new(dir.path());
        let payload = br#"{"items": []}"#;
        let manifest = DumpManifest {
            id: Some("bills-week-1".into()),
            from: ts(1),
            to: ts(8),
            complete: true,
            processed: false,
            payload: "payload.json".into(),
            sha256: Some(JsonFileStore::sha256_hex(payload)),
        };
        let dump_dir = dir.path().join("SENATE_SITE_BILLS").join("week-1");
        std::fs::create_dir_all(&dump_dir).unwrap();
        std::fs::write(dump_dir.join("payload.json"), payload).unwrap();
        files
            .write_json(Path::new("SENATE_SITE_BILLS/week-1/manifest.json"), &manifest)
            .await
            .unwrap();

        let provider = FsDumpProvider::new(dir.path());
        let pending = provider.list_pending(ReferenceType::SenateSiteBills).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "bills-week-1");
        assert_eq!(provider.fetch(&pending[0]).await.unwrap(), payload.to_vec());

        assert!(provider.mark_processed(&pending[0]).await.unwrap());
        assert!(!provider.mark_processed(&pending[0]).await.unwrap());
        assert!(provider
            .list_pending(ReferenceType::SenateSiteBills)
            .await
            .unwrap()
            .is_empty());
        assert!(provider
            .list_pending(ReferenceType::SenateSiteCalendars)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn fs_dump_provider_rejects_tampered_payload() {
        let dir = tempdir().expect("tempdir");
        let files = JsonFileStore::new(dir.path());
        let manifest = DumpManifest {
            id: None,
            from: ts(1),
            to: ts(8),
            complete: true,
            processed: false,
            payload: "payload.json".into(),
            sha256: Some(JsonFileStore::sha256_hex(b"original")),
        };
        let dump_dir = dir.path().join("SENATE_SITE_BILLS").join("week-1");
        std::fs::create_dir_all(&dump_dir).unwrap();
        std::fs::write(dump_dir.join("payload.json"), b"tampered").unwrap();
        files
            .write_json(Path::new("SENATE_SITE_BILLS/week-1/manifest.json"), &manifest)
            .await
            .unwrap();

        let provider = FsDumpProvider::new(dir.path());
        let pending = provider.list_pending(ReferenceType::SenateSiteBills).await.unwrap();
        assert_eq!(pending[0].id, "SENATE_SITE_BILLS-20240101T000000-20240108T000000");
        assert!(matches!(
            provider.fetch(&pending[0]).await,
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn memory_local_data_filters_and_orders_tokens() {
        let data: MemoryLocalData<Key, Entity> = MemoryLocalData::new();
        data.record_update(Entity { id: key("B"), value: "b".into() }, ts(5)).await;
        data.record_update(Entity { id: key("A"), value: "a".into() }, ts(3)).await;
        data.push_token(UpdateToken::new(key("C"), ts(1))).await;

        let tokens = data
            .list_update_tokens(ts(1), UpdateKind::ProcessedDate)
            .await
            .unwrap();
        let ids = tokens.iter().map(|t| t.content_id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["A", "B"]);

        assert_eq!(data.get_entity(&key("A")).await.unwrap().value, "a");
        assert_eq!(data.get_entity(&key("C")).await.unwrap_err(), EntityFetchError::NotFound);
        assert!(data
            .list_update_tokens(ts(1), UpdateKind::PublishedDate)
            .await
            .unwrap()
            .is_empty());
    }
}
