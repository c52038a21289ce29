//! Blob and document store contracts, with in-memory and filesystem
//! implementations.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::asset::{FontAsset, ObjectId, Patch};

/// An error reported by a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("document '{0}' already exists")]
    AlreadyExists(String),
    /// The call was abandoned, typically by a caller enforced timeout.
    #[error("store operation aborted")]
    Aborted,
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid document data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store backend failed: {0}")]
    Backend(String),
}

/// Opaque storage for uploaded and generated files.
///
/// Stores may be eventually consistent: an object is not guaranteed to be
/// fetchable immediately after `upload` returns.
pub trait BlobStore: Send + Sync {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<ObjectId, StoreError>;
    fn fetch(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError>;
    fn delete(&self, id: &ObjectId) -> Result<(), StoreError>;
}

/// Storage for [`FontAsset`] documents, edited with field level patches.
pub trait DocumentStore: Send + Sync {
    fn load(&self, id: &str) -> Result<FontAsset, StoreError>;
    fn create(&self, asset: &FontAsset) -> Result<(), StoreError>;
    /// Apply `patches` in order and return the updated document.
    fn patch(&self, id: &str, patches: &[Patch]) -> Result<FontAsset, StoreError>;
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<ObjectId, StoreError> {
        (**self).upload(bytes, name)
    }

    fn fetch(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        (**self).fetch(id)
    }

    fn delete(&self, id: &ObjectId) -> Result<(), StoreError> {
        (**self).delete(id)
    }
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn load(&self, id: &str) -> Result<FontAsset, StoreError> {
        (**self).load(id)
    }

    fn create(&self, asset: &FontAsset) -> Result<(), StoreError> {
        (**self).create(asset)
    }

    fn patch(&self, id: &str, patches: &[Patch]) -> Result<FontAsset, StoreError> {
        (**self).patch(id, patches)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn extension_of(name: &str) -> &str {
    name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("bin")
}

/// A failure to inject into a [`MemoryBlobStore`] operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Fail,
    Abort,
}

impl Fault {
    fn error(self) -> StoreError {
        match self {
            Fault::Fail => StoreError::Backend("injected failure".into()),
            Fault::Abort => StoreError::Aborted,
        }
    }
}

#[derive(Clone, Debug)]
struct StoredObject {
    name: String,
    bytes: Vec<u8>,
}

/// A blob store held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<ObjectId, StoredObject>>,
    upload_fault: Mutex<Option<Fault>>,
    delete_fault: Mutex<Option<Fault>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upload fail until reset with `None`.
    pub fn set_upload_fault(&self, fault: Option<Fault>) {
        *lock(&self.upload_fault) = fault;
    }

    pub fn set_delete_fault(&self, fault: Option<Fault>) {
        *lock(&self.delete_fault) = fault;
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        lock(&self.objects).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The name an object was uploaded under.
    pub fn name_of(&self, id: &ObjectId) -> Option<String> {
        lock(&self.objects).get(id).map(|obj| obj.name.clone())
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<ObjectId, StoreError> {
        if let Some(fault) = *lock(&self.upload_fault) {
            return Err(fault.error());
        }
        let id = ObjectId::generate(extension_of(name));
        let object = StoredObject {
            name: name.to_string(),
            bytes: bytes.to_vec(),
        };
        lock(&self.objects).insert(id.clone(), object);
        Ok(id)
    }

    fn fetch(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        lock(&self.objects)
            .get(id)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn delete(&self, id: &ObjectId) -> Result<(), StoreError> {
        if let Some(fault) = *lock(&self.delete_fault) {
            return Err(fault.error());
        }
        lock(&self.objects)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// A document store held in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<String, FontAsset>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn load(&self, id: &str) -> Result<FontAsset, StoreError> {
        lock(&self.documents)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn create(&self, asset: &FontAsset) -> Result<(), StoreError> {
        let mut documents = lock(&self.documents);
        if documents.contains_key(&asset.id) {
            return Err(StoreError::AlreadyExists(asset.id.clone()));
        }
        documents.insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    fn patch(&self, id: &str, patches: &[Patch]) -> Result<FontAsset, StoreError> {
        let mut documents = lock(&self.documents);
        let asset = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        for patch in patches {
            log::debug!("patching {id}: {}", patch.path());
            *asset = asset.apply(patch);
        }
        Ok(asset.clone())
    }
}

/// A blob store keeping one file per object in a directory.
#[derive(Debug)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    /// Use `root` as the store, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DirBlobStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

fn object_error(id: &ObjectId, e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
        _ => StoreError::Io(e),
    }
}

impl BlobStore for DirBlobStore {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<ObjectId, StoreError> {
        let id = ObjectId::generate(extension_of(name));
        fs::write(self.path_of(&id), bytes)?;
        log::debug!("stored '{name}' as {}", self.path_of(&id).display());
        Ok(id)
    }

    fn fetch(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        fs::read(self.path_of(id)).map_err(|e| object_error(id, e))
    }

    fn delete(&self, id: &ObjectId) -> Result<(), StoreError> {
        fs::remove_file(self.path_of(id)).map_err(|e| object_error(id, e))
    }
}

/// A document store backed by a single JSON file mapping ids to documents.
#[derive(Debug)]
pub struct JsonDocumentStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonDocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonDocumentStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<BTreeMap<String, FontAsset>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, documents: &BTreeMap<String, FontAsset>) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(documents)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DocumentStore for JsonDocumentStore {
    fn load(&self, id: &str) -> Result<FontAsset, StoreError> {
        let _guard = lock(&self.lock);
        self.read()?
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn create(&self, asset: &FontAsset) -> Result<(), StoreError> {
        let _guard = lock(&self.lock);
        let mut documents = self.read()?;
        if documents.contains_key(&asset.id) {
            return Err(StoreError::AlreadyExists(asset.id.clone()));
        }
        documents.insert(asset.id.clone(), asset.clone());
        self.write(&documents)
    }

    fn patch(&self, id: &str, patches: &[Patch]) -> Result<FontAsset, StoreError> {
        let _guard = lock(&self.lock);
        let mut documents = self.read()?;
        let asset = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        for patch in patches {
            *asset = asset.apply(patch);
        }
        let updated = asset.clone();
        self.write(&documents)?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{asset::SlotRef, format::FormatCode};

    fn set_ttf(id: &ObjectId) -> Patch {
        Patch::SetSlot {
            code: FormatCode::Ttf,
            slot: SlotRef::new(id.clone(), "acme.ttf"),
        }
    }

    #[test]
    fn memory_blobs() {
        let store = MemoryBlobStore::new();
        let id = store.upload(b"abc", "acme.ttf").unwrap();
        assert_eq!(id.parts().unwrap().1, "ttf");
        assert_eq!(store.fetch(&id).unwrap(), b"abc");
        assert_eq!(store.name_of(&id).as_deref(), Some("acme.ttf"));
        store.delete(&id).unwrap();
        assert!(matches!(store.fetch(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn injected_faults() {
        let store = MemoryBlobStore::new();
        store.set_upload_fault(Some(Fault::Abort));
        assert!(matches!(store.upload(b"", "a.css"), Err(StoreError::Aborted)));
        store.set_upload_fault(None);
        let id = store.upload(b"", "a.css").unwrap();
        store.set_delete_fault(Some(Fault::Fail));
        assert!(matches!(store.delete(&id), Err(StoreError::Backend(_))));
        assert!(store.contains(&id));
    }

    #[test]
    fn memory_documents() {
        let store = MemoryDocumentStore::new();
        let asset = FontAsset::new("doc", "Acme", "acme");
        store.create(&asset).unwrap();
        assert!(matches!(store.create(&asset), Err(StoreError::AlreadyExists(_))));
        let id = ObjectId::new("file-1-ttf");
        let patched = store.patch("doc", &[set_ttf(&id)]).unwrap();
        assert_eq!(store.load("doc").unwrap(), patched);
        assert!(matches!(store.patch("nope", &[]), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn directory_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::open(dir.path().join("blobs")).unwrap();
        let id = store.upload(b"wOF2", "acme.woff2").unwrap();
        assert!(store.path_of(&id).exists());
        assert_eq!(store.fetch(&id).unwrap(), b"wOF2");
        store.delete(&id).unwrap();
        assert!(matches!(store.fetch(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn json_documents_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fonts.json");
        let store = JsonDocumentStore::new(&path);
        store.create(&FontAsset::new("doc", "Acme", "acme")).unwrap();
        let id = ObjectId::new("file-1-ttf");
        store.patch("doc", &[set_ttf(&id)]).unwrap();

        let reopened = JsonDocumentStore::new(&path);
        let asset = reopened.load("doc").unwrap();
        assert_eq!(asset.slot(FormatCode::Ttf).occupied().unwrap().object_id, id);
    }
}
