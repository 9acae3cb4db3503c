use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};

use crate::eid::{Eid, ItemId, TenantId, ThreadId};
use crate::items::{Item, ItemRepository};
use crate::semantic::{EntityKind, EntityRef, SearchCorpus, SearchDocument};
use crate::threads::{NewThread, Provenance, RelationshipStore, Thread, ThreadRepository, CREATED_BY_CLUSTERING};

const ITEMS_FILE: &str = "items.csv";
const THREADS_FILE: &str = "threads.csv";

const ITEM_HEADERS: [&str; 8] = [
    "id",
    "tenant_id",
    "source_type",
    "title",
    "description",
    "embedding",
    "thread_id",
    "created_at",
];

const THREAD_HEADERS: [&str; 9] = [
    "id",
    "tenant_id",
    "title",
    "description",
    "embedding",
    "member_ids",
    "created_at",
    "created_by",
    "provenance",
];

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("item {0} not found")]
    UnknownItem(ItemId),

    #[error("thread {0} not found")]
    UnknownThread(ThreadId),

    #[error("item {item} does not belong to tenant {tenant}")]
    TenantMismatch { item: ItemId, tenant: TenantId },

    #[error("item {item} is already assigned to thread {thread}")]
    AlreadyAssigned { item: ItemId, thread: ThreadId },
}

#[derive(Debug, Default, Clone)]
struct State {
    items: Vec<Item>,
    threads: Vec<Thread>,
}

/// File-backed item and thread store.
///
/// Everything lives in memory; every mutation rewrites both CSV files through
/// temp files that are renamed into place.
#[derive(Debug, Clone)]
pub struct CsvStore {
    state: Arc<RwLock<State>>,
    items_path: PathBuf,
    threads_path: PathBuf,
}

impl CsvStore {
    pub fn load(base_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        let items_path = base_dir.join(ITEMS_FILE);
        let threads_path = base_dir.join(THREADS_FILE);

        ensure_file(&items_path, &ITEM_HEADERS)?;
        ensure_file(&threads_path, &THREAD_HEADERS)?;

        let now = Instant::now();
        let mut items = read_items(&items_path)?;
        let mut threads = read_threads(&threads_path)?;
        let repaired = reconcile_assignments(&mut items, &mut threads);
        if repaired > 0 {
            log::warn!("repaired {repaired} inconsistent thread assignments in {}", base_dir.display());
        }
        log::debug!(
            "took {}ms to read {} items and {} threads",
            now.elapsed().as_micros() as f64 / 1000.0,
            items.len(),
            threads.len()
        );

        Ok(CsvStore {
            state: Arc::new(RwLock::new(State { items, threads })),
            items_path,
            threads_path,
        })
    }

    /// Insert new items and refresh known ones. Existing thread assignments
    /// are kept. Returns `(added, updated)`.
    pub fn import_items(&self, incoming: Vec<Item>) -> anyhow::Result<(usize, usize)> {
        let mut state = self.write()?;
        let previous = state.clone();

        let mut added = 0;
        let mut updated = 0;
        for mut item in incoming {
            match state.items.iter_mut().find(|i| i.id == item.id) {
                Some(existing) => {
                    item.thread_id = existing.thread_id.take();
                    *existing = item;
                    updated += 1;
                }
                None => {
                    item.thread_id = None;
                    state.items.push(item);
                    added += 1;
                }
            }
        }

        self.commit(&mut state, previous)?;
        Ok((added, updated))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }

    /// Persist `state`, restoring `previous` in memory if that fails.
    fn commit(&self, state: &mut State, previous: State) -> Result<(), StoreError> {
        if let Err(e) = self.save(state) {
            log::error!("failed to save store, rolling back: {e}");
            *state = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Write both files to temp paths first and rename only once both are
    /// complete, so a failed write leaves the previous files untouched.
    ///
    /// Threads are renamed before items. If the second rename fails the disk
    /// holds a thread nobody points at, which [`reconcile_assignments`] prunes
    /// on the next load, never an item pointing at a missing thread.
    fn save(&self, state: &State) -> Result<(), StoreError> {
        let items_tmp = temp_path(&self.items_path);
        let threads_tmp = temp_path(&self.threads_path);

        let written = write_items(&items_tmp, &state.items)
            .and_then(|_| write_threads(&threads_tmp, &state.threads));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&items_tmp);
            let _ = std::fs::remove_file(&threads_tmp);
            return Err(e);
        }

        std::fs::rename(&threads_tmp, &self.threads_path)?;
        std::fs::rename(&items_tmp, &self.items_path)?;
        Ok(())
    }
}

/// Make item assignments and thread member lists agree after a load.
///
/// An item pointing at an unknown thread, or at a thread of another tenant,
/// loses its assignment. A thread keeps only the members that point back at
/// it. Returns the number of fixes applied.
fn reconcile_assignments(items: &mut [Item], threads: &mut [Thread]) -> usize {
    let mut fixed = 0;

    let known: HashMap<&ThreadId, &TenantId> = threads.iter().map(|t| (&t.id, &t.tenant_id)).collect();
    for item in items.iter_mut() {
        let dangling = item
            .thread_id
            .as_ref()
            .is_some_and(|t| known.get(t) != Some(&&item.tenant_id));
        if dangling {
            log::debug!(
                "item {} points at missing thread {:?}, clearing assignment",
                item.id,
                item.thread_id
            );
            item.thread_id = None;
            fixed += 1;
        }
    }

    let assigned: HashMap<&ItemId, &ThreadId> = items
        .iter()
        .filter_map(|i| i.thread_id.as_ref().map(|t| (&i.id, t)))
        .collect();
    for thread in threads.iter_mut() {
        let before = thread.member_ids.len();
        thread
            .member_ids
            .retain(|m| assigned.get(m).is_some_and(|t| *t == &thread.id));
        if thread.member_ids.len() != before {
            log::debug!(
                "thread {} listed {} members that do not point back at it",
                thread.id,
                before - thread.member_ids.len()
            );
            fixed += before - thread.member_ids.len();
        }
    }

    // members that point at a thread but are missing from its list
    for item in items.iter() {
        let Some(thread_id) = &item.thread_id else {
            continue;
        };
        if let Some(thread) = threads.iter_mut().find(|t| &t.id == thread_id) {
            if !thread.member_ids.contains(&item.id) {
                thread.member_ids.push(item.id.clone());
                fixed += 1;
            }
        }
    }

    fixed
}

impl ItemRepository for CsvStore {
    fn fetch_recent_items(
        &self,
        tenant_id: Option<&TenantId>,
        window_start: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Item>> {
        let state = self.read()?;
        let mut items: Vec<Item> = state
            .items
            .iter()
            .filter(|i| tenant_id.map_or(true, |t| &i.tenant_id == t))
            .filter(|i| i.created_at >= window_start)
            .cloned()
            .collect();

        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }

    fn set_thread_assignment(
        &self,
        item_ids: &[ItemId],
        thread_id: Option<&ThreadId>,
    ) -> anyhow::Result<()> {
        let mut state = self.write()?;

        for id in item_ids {
            if !state.items.iter().any(|i| &i.id == id) {
                return Err(StoreError::UnknownItem(id.clone()).into());
            }
        }
        if let Some(thread_id) = thread_id {
            if !state.threads.iter().any(|t| &t.id == thread_id) {
                return Err(StoreError::UnknownThread(thread_id.clone()).into());
            }
        }

        let previous = state.clone();
        assign(&mut state, item_ids, thread_id);
        self.commit(&mut state, previous)?;
        Ok(())
    }

    fn store_embeddings(&self, embeddings: &[(ItemId, Vec<f32>)]) -> anyhow::Result<()> {
        if embeddings.is_empty() {
            return Ok(());
        }

        let mut state = self.write()?;
        let previous = state.clone();

        for (id, embedding) in embeddings {
            match state.items.iter_mut().find(|i| &i.id == id) {
                Some(item) => item.embedding = Some(embedding.clone()),
                None => log::warn!("dropping embedding for unknown item {id}"),
            }
        }

        self.commit(&mut state, previous)?;
        Ok(())
    }
}

impl ThreadRepository for CsvStore {
    fn create_thread(
        &self,
        tenant_id: &TenantId,
        title: &str,
        description: &str,
        centroid: Option<&[f32]>,
    ) -> anyhow::Result<ThreadId> {
        let mut state = self.write()?;
        let previous = state.clone();

        let thread = new_thread(
            NewThread {
                tenant_id: tenant_id.clone(),
                title: title.to_string(),
                description: description.to_string(),
                centroid: centroid.map(|c| c.to_vec()),
                provenance: None,
            },
            vec![],
        );
        let id = thread.id.clone();
        state.threads.push(thread);

        self.commit(&mut state, previous)?;
        Ok(id)
    }

    fn find_thread_assignments_for(
        &self,
        item_ids: &[ItemId],
    ) -> anyhow::Result<HashMap<ItemId, Option<ThreadId>>> {
        let state = self.read()?;
        let wanted: HashSet<&ItemId> = item_ids.iter().collect();

        let mut out: HashMap<ItemId, Option<ThreadId>> =
            item_ids.iter().map(|id| (id.clone(), None)).collect();
        for item in state.items.iter().filter(|i| wanted.contains(&i.id)) {
            out.insert(item.id.clone(), item.thread_id.clone());
        }
        Ok(out)
    }

    fn list_threads(&self, tenant_id: &TenantId) -> anyhow::Result<Vec<Thread>> {
        let state = self.read()?;
        Ok(state
            .threads
            .iter()
            .filter(|t| &t.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

impl RelationshipStore for CsvStore {
    fn materialize_thread(
        &self,
        thread: NewThread,
        member_ids: &[ItemId],
    ) -> anyhow::Result<ThreadId> {
        let mut state = self.write()?;

        // Validate everything before touching state.
        for id in member_ids {
            let item = state
                .items
                .iter()
                .find(|i| &i.id == id)
                .ok_or_else(|| StoreError::UnknownItem(id.clone()))?;
            if item.tenant_id != thread.tenant_id {
                return Err(StoreError::TenantMismatch {
                    item: id.clone(),
                    tenant: thread.tenant_id.clone(),
                }
                .into());
            }
            if let Some(existing) = &item.thread_id {
                return Err(StoreError::AlreadyAssigned {
                    item: id.clone(),
                    thread: existing.clone(),
                }
                .into());
            }
        }

        let previous = state.clone();
        let thread = new_thread(thread, member_ids.to_vec());
        let thread_id = thread.id.clone();
        state.threads.push(thread);
        assign(&mut state, member_ids, Some(&thread_id));

        self.commit(&mut state, previous)?;
        Ok(thread_id)
    }
}

impl SearchCorpus for CsvStore {
    fn embedded_documents(
        &self,
        tenant_id: &TenantId,
        kinds: &[EntityKind],
    ) -> anyhow::Result<Vec<SearchDocument>> {
        Ok(self
            .text_documents(tenant_id, kinds)?
            .into_iter()
            .filter(|d| d.embedding.as_ref().is_some_and(|e| !e.is_empty()))
            .collect())
    }

    fn text_documents(
        &self,
        tenant_id: &TenantId,
        kinds: &[EntityKind],
    ) -> anyhow::Result<Vec<SearchDocument>> {
        let wants = |kind: EntityKind| kinds.is_empty() || kinds.contains(&kind);
        let state = self.read()?;
        let mut docs = vec![];

        if wants(EntityKind::Item) {
            docs.extend(state.items.iter().filter(|i| &i.tenant_id == tenant_id).map(|i| {
                SearchDocument {
                    entity: EntityRef::Item(i.id.clone()),
                    title: i.title.clone(),
                    description: i.description.clone(),
                    embedding: i.embedding.clone(),
                }
            }));
        }
        if wants(EntityKind::Thread) {
            docs.extend(state.threads.iter().filter(|t| &t.tenant_id == tenant_id).map(|t| {
                SearchDocument {
                    entity: EntityRef::Thread(t.id.clone()),
                    title: t.title.clone(),
                    description: t.description.clone(),
                    embedding: t.embedding.clone(),
                }
            }));
        }

        Ok(docs)
    }
}

fn new_thread(thread: NewThread, member_ids: Vec<ItemId>) -> Thread {
    Thread {
        id: Eid::new(),
        tenant_id: thread.tenant_id,
        title: thread.title,
        description: thread.description,
        embedding: thread.centroid,
        member_ids,
        created_at: Utc::now(),
        created_by: CREATED_BY_CLUSTERING.to_string(),
        provenance: thread.provenance,
    }
}

/// Point items at `thread_id`, keeping every thread's member list in step.
fn assign(state: &mut State, item_ids: &[ItemId], thread_id: Option<&ThreadId>) {
    let moved: HashSet<&ItemId> = item_ids.iter().collect();

    for thread in state.threads.iter_mut() {
        thread.member_ids.retain(|m| !moved.contains(m));
    }
    for item in state.items.iter_mut().filter(|i| moved.contains(&i.id)) {
        item.thread_id = thread_id.cloned();
    }
    if let Some(thread_id) = thread_id {
        if let Some(thread) = state.threads.iter_mut().find(|t| &t.id == thread_id) {
            for id in item_ids {
                if !thread.member_ids.contains(id) {
                    thread.member_ids.push(id.clone());
                }
            }
        }
    }
}

fn ensure_file(path: &Path, headers: &[&str]) -> Result<(), StoreError> {
    if let Err(err) = std::fs::metadata(path) {
        match err.kind() {
            ErrorKind::NotFound => {
                log::info!("Creating new database at {}", path.display());
                let mut csv_wrt = csv::Writer::from_path(path)?;
                csv_wrt.write_record(headers)?;
                csv_wrt.flush()?;
            }
            _ => Err(err)?,
        }
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-tmp");
    PathBuf::from(name)
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize, name: &str) -> Result<&'r str, StoreError> {
    record
        .get(idx)
        .ok_or_else(|| StoreError::Corrupt(format!("couldnt get record {name}")))
}

fn optional(value: &str) -> Option<Eid> {
    if value.is_empty() {
        None
    } else {
        Some(Eid::from(value))
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {value:?}: {e}")))
}

/// Little-endian f32 bytes, base64 encoded. Empty for no embedding.
pub fn encode_embedding(embedding: Option<&[f32]>) -> String {
    match embedding {
        Some(values) if !values.is_empty() => {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            STANDARD.encode(bytes)
        }
        _ => String::new(),
    }
}

pub fn decode_embedding(value: &str) -> Result<Option<Vec<f32>>, StoreError> {
    if value.is_empty() {
        return Ok(None);
    }
    let bytes = STANDARD.decode(value)?;
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding byte length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    ))
}

fn read_items(path: &Path) -> Result<Vec<Item>, StoreError> {
    let mut csv_reader = csv::Reader::from_path(path)?;
    let mut items = vec![];

    for record in csv_reader.records() {
        let record = record?;
        items.push(Item {
            id: Eid::from(field(&record, 0, "id")?),
            tenant_id: Eid::from(field(&record, 1, "tenant_id")?),
            source_type: field(&record, 2, "source_type")?.to_string(),
            title: field(&record, 3, "title")?.to_string(),
            description: field(&record, 4, "description")?.to_string(),
            embedding: decode_embedding(field(&record, 5, "embedding")?)?,
            thread_id: optional(field(&record, 6, "thread_id")?),
            created_at: parse_time(field(&record, 7, "created_at")?)?,
        });
    }

    Ok(items)
}

fn read_threads(path: &Path) -> Result<Vec<Thread>, StoreError> {
    let mut csv_reader = csv::Reader::from_path(path)?;
    let mut threads = vec![];

    for record in csv_reader.records() {
        let record = record?;
        let member_ids = field(&record, 5, "member_ids")?
            .split(',')
            .filter(|m| !m.is_empty())
            .map(Eid::from)
            .collect();
        let provenance = match field(&record, 8, "provenance")? {
            "" => None,
            raw => Some(serde_json::from_str::<Provenance>(raw)?),
        };

        threads.push(Thread {
            id: Eid::from(field(&record, 0, "id")?),
            tenant_id: Eid::from(field(&record, 1, "tenant_id")?),
            title: field(&record, 2, "title")?.to_string(),
            description: field(&record, 3, "description")?.to_string(),
            embedding: decode_embedding(field(&record, 4, "embedding")?)?,
            member_ids,
            created_at: parse_time(field(&record, 6, "created_at")?)?,
            created_by: field(&record, 7, "created_by")?.to_string(),
            provenance,
        });
    }

    Ok(threads)
}

fn write_items(path: &Path, items: &[Item]) -> Result<(), StoreError> {
    let mut csv_wrt = csv::Writer::from_path(path)?;
    csv_wrt.write_record(ITEM_HEADERS)?;
    for item in items {
        csv_wrt.write_record([
            item.id.as_str(),
            item.tenant_id.as_str(),
            item.source_type.as_str(),
            item.title.as_str(),
            item.description.as_str(),
            encode_embedding(item.embedding.as_deref()).as_str(),
            item.thread_id.as_ref().map(|t| t.as_str()).unwrap_or_default(),
            item.created_at.to_rfc3339().as_str(),
        ])?;
    }
    csv_wrt.flush()?;
    Ok(())
}

fn write_threads(path: &Path, threads: &[Thread]) -> Result<(), StoreError> {
    let mut csv_wrt = csv::Writer::from_path(path)?;
    csv_wrt.write_record(THREAD_HEADERS)?;
    for thread in threads {
        let members = thread
            .member_ids
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let provenance = match &thread.provenance {
            Some(p) => serde_json::to_string(p)?,
            None => String::new(),
        };

        csv_wrt.write_record([
            thread.id.as_str(),
            thread.tenant_id.as_str(),
            thread.title.as_str(),
            thread.description.as_str(),
            encode_embedding(thread.embedding.as_deref()).as_str(),
            members.as_str(),
            thread.created_at.to_rfc3339().as_str(),
            thread.created_by.as_str(),
            provenance.as_str(),
        ])?;
    }
    csv_wrt.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_encoding() {
        let values = vec![0.5f32, -1.25, 3.0];
        let encoded = encode_embedding(Some(values.as_slice()));
        assert_eq!(decode_embedding(&encoded).unwrap(), Some(values));
        assert_eq!(encode_embedding(None), "");
        assert_eq!(encode_embedding(Some(&[][..])), "");
        assert_eq!(decode_embedding("").unwrap(), None);
    }

    #[test]
    fn test_truncated_embedding_is_corrupt() {
        let encoded = STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(decode_embedding(&encoded), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let p = temp_path(Path::new("/data/items.csv"));
        assert_eq!(p, PathBuf::from("/data/items.csv-tmp"));
    }
}
