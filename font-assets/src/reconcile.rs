//! Keeping the reference document and the blob store consistent.
//!
//! Each format slot moves through `Empty -> Uploading -> Occupied ->
//! Deleting -> Empty`. At most one transition per slot is in flight at a
//! time; a second request for a busy slot is rejected, not queued.
//!
//! Ordering rules:
//! - a replaced object is deleted only after its successor is uploaded and
//!   referenced;
//! - a cleared slot is patched before its object is deleted, so a failed
//!   delete can only leave an orphaned object, never a dangling reference.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    asset::{FontAsset, ObjectId, Patch, SlotRef},
    cancel::CancellationToken,
    convert::{ConversionJob, ConvertError, SourceFont},
    css::{self, CssError, ResolvedName, StylesheetOptions, UrlResolver},
    format::{Container, FormatCode},
    metadata::{self, ExtractError, FontDescriptor},
    store::{BlobStore, DocumentStore, StoreError},
};

/// An error uploading to a slot.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("the {0} slot already has an operation in flight")]
    SlotBusy(FormatCode),
    #[error("{found} data cannot be stored in the {slot} slot")]
    FormatMismatch { slot: FormatCode, found: Found },
    #[error("upload to the {slot} slot failed: {source}")]
    UploadFailed {
        slot: FormatCode,
        source: StoreError,
    },
    #[error("document update failed: {0}")]
    Document(StoreError),
}

/// A failed store write while committing a slot.
enum CommitError {
    Upload(StoreError),
    Document(StoreError),
}

impl CommitError {
    fn into_upload(self, slot: FormatCode) -> UploadError {
        match self {
            CommitError::Upload(source) => UploadError::UploadFailed { slot, source },
            CommitError::Document(e) => UploadError::Document(e),
        }
    }
}

impl From<CommitError> for CssError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::Upload(e) | CommitError::Document(e) => CssError::Store(e),
        }
    }
}

/// What an upload was sniffed as, for [`UploadError::FormatMismatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Found(pub Option<Container>);

impl Display for Found {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(container) => write!(f, "{container:?}"),
            None => f.write_str("unrecognized"),
        }
    }
}

/// An error clearing a slot.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("the {0} slot already has an operation in flight")]
    SlotBusy(FormatCode),
    #[error("document update failed: {0}")]
    Document(StoreError),
}

/// A failure that did not undo a committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The slot was cleared or replaced but its old object is still stored.
    DeleteFailed {
        slot: FormatCode,
        object: ObjectId,
        reason: String,
    },
}

impl Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::DeleteFailed {
                slot,
                object,
                reason,
            } => write!(f, "could not delete {object} ({slot}): {reason}"),
        }
    }
}

/// Why a derived slot was not updated.
#[derive(Debug, thiserror::Error)]
pub enum DerivedError {
    #[error(transparent)]
    Conversion(#[from] ConvertError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// The result of the pipeline that follows a woff2 upload.
#[derive(Debug)]
pub struct DerivedOutcome {
    /// The descriptor recorded on the document, if extraction succeeded.
    pub descriptor: Option<FontDescriptor>,
    /// One entry per pregenerated slot.
    pub slots: BTreeMap<FormatCode, Result<ObjectId, DerivedError>>,
    pub stylesheet: Result<ObjectId, CssError>,
}

impl DerivedOutcome {
    fn failed(error: CssError) -> Self {
        DerivedOutcome {
            descriptor: None,
            slots: BTreeMap::new(),
            stylesheet: Err(error),
        }
    }

    /// `true` if every derived slot and the stylesheet were committed.
    pub fn is_complete(&self) -> bool {
        self.stylesheet.is_ok() && self.slots.values().all(Result::is_ok)
    }
}

/// The outcome of a successful operation.
#[derive(Debug)]
pub struct Reconciled {
    /// The document after the operation.
    pub asset: FontAsset,
    pub warnings: Vec<Warning>,
    /// Present for woff2 uploads.
    pub derived: Option<DerivedOutcome>,
}

/// Options for a [`Reconciler`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcilerOptions {
    /// Slots generated from every woff2 upload.
    pub pregenerate: BTreeSet<FormatCode>,
    pub stylesheet: StylesheetOptions,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        ReconcilerOptions {
            pregenerate: [FormatCode::Ttf, FormatCode::Woff].into_iter().collect(),
            stylesheet: StylesheetOptions::default(),
        }
    }
}

/// Marks a slot as busy until dropped.
struct SlotGuard<'a> {
    busy: &'a Mutex<BTreeSet<FormatCode>>,
    code: FormatCode,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.code);
    }
}

/// Drives uploads, deletions and stylesheet generation for one document.
pub struct Reconciler<B, D> {
    blobs: B,
    documents: D,
    asset_id: String,
    options: ReconcilerOptions,
    resolver: Box<dyn UrlResolver + Send + Sync>,
    cancel: CancellationToken,
    busy: Mutex<BTreeSet<FormatCode>>,
}

impl<B: BlobStore, D: DocumentStore> Reconciler<B, D> {
    pub fn new(blobs: B, documents: D, asset_id: impl Into<String>) -> Self {
        Reconciler {
            blobs,
            documents,
            asset_id: asset_id.into(),
            options: ReconcilerOptions::default(),
            resolver: Box::new(ResolvedName::default()),
            cancel: CancellationToken::new(),
            busy: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_options(mut self, options: ReconcilerOptions) -> Self {
        self.options = options;
        self
    }

    /// Set how stylesheet `src` URLs are built.
    pub fn with_resolver(mut self, resolver: impl UrlResolver + Send + Sync + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Observe `cancel` during extraction and conversion.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn documents(&self) -> &D {
        &self.documents
    }

    /// The current document.
    pub fn asset(&self) -> Result<FontAsset, StoreError> {
        self.documents.load(&self.asset_id)
    }

    fn acquire(&self, code: FormatCode) -> Option<SlotGuard<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(code) {
            return None;
        }
        Some(SlotGuard {
            busy: &self.busy,
            code,
        })
    }

    /// Store `bytes` in the `code` slot.
    ///
    /// For woff2 uploads this also runs the derived pipeline (descriptor,
    /// pregenerated slots, stylesheet) before returning; failures there are
    /// reported in [`Reconciled::derived`] and do not undo the upload.
    pub fn upload_format(
        &self,
        code: FormatCode,
        bytes: &[u8],
        filename: &str,
    ) -> Result<Reconciled, UploadError> {
        if code.is_font() {
            let found = Container::sniff(bytes);
            if !found.is_some_and(|container| container.fits_slot(code)) {
                return Err(UploadError::FormatMismatch {
                    slot: code,
                    found: Found(found),
                });
            }
        }
        let _guard = self.acquire(code).ok_or(UploadError::SlotBusy(code))?;
        let mut warnings = Vec::new();
        let (mut asset, id) = self
            .commit(code, bytes, filename, &mut warnings)
            .map_err(|e| e.into_upload(code))?;
        let derived = (code == FormatCode::Woff2)
            .then(|| self.derive(bytes, &id, filename, &mut asset, &mut warnings));
        Ok(Reconciled {
            asset,
            warnings,
            derived,
        })
    }

    /// Clear the `code` slot, then delete the object it referenced.
    ///
    /// Clearing an already empty slot still writes the (no-op) patch.
    pub fn delete_format(&self, code: FormatCode) -> Result<Reconciled, DeleteError> {
        let _guard = self.acquire(code).ok_or(DeleteError::SlotBusy(code))?;
        let current = self
            .documents
            .load(&self.asset_id)
            .map_err(DeleteError::Document)?;
        let previous = current.slot(code).occupied().cloned();
        let asset = self
            .documents
            .patch(&self.asset_id, &[Patch::UnsetSlot(code)])
            .map_err(DeleteError::Document)?;
        log::info!("cleared the {code} slot of '{}'", self.asset_id);
        let mut warnings = Vec::new();
        if let Some(previous) = previous {
            self.release_object(code, &previous.object_id, &mut warnings);
        }
        Ok(Reconciled {
            asset,
            warnings,
            derived: None,
        })
    }

    /// Regenerate the stylesheet from the current woff2 slot.
    ///
    /// The recorded descriptor is reused only if it was extracted from the
    /// object now in the woff2 slot; otherwise that object is fetched and
    /// described again. `family_name` defaults to the document title, then
    /// to the family embedded in the font.
    pub fn regenerate_css(&self, family_name: Option<&str>) -> Result<Reconciled, CssError> {
        let mut asset = self.documents.load(&self.asset_id)?;
        let woff2 = asset
            .slot(FormatCode::Woff2)
            .occupied()
            .cloned()
            .ok_or(CssError::MissingSource)?;
        let descriptor = match asset.descriptor_of(&woff2.object_id).cloned() {
            Some(descriptor) => descriptor,
            None => {
                log::debug!("describing {} for '{}'", woff2.object_id, self.asset_id);
                let bytes = self.blobs.fetch(&woff2.object_id)?;
                let descriptor = metadata::extract_with(&bytes, &self.cancel)?;
                asset = self.documents.patch(
                    &self.asset_id,
                    &[Patch::SetDescriptor {
                        descriptor: descriptor.clone(),
                        source: woff2.object_id.clone(),
                    }],
                )?;
                descriptor
            }
        };
        let family = family_name.unwrap_or(asset.title.as_str()).to_string();
        let mut warnings = Vec::new();
        self.write_stylesheet(
            &mut asset,
            &descriptor,
            &family,
            &woff2.original_name,
            &mut warnings,
        )?;
        Ok(Reconciled {
            asset,
            warnings,
            derived: None,
        })
    }

    /// Clear every slot and delete every referenced object.
    pub fn release(&self) -> Result<Reconciled, DeleteError> {
        let _guards = FormatCode::ALL
            .into_iter()
            .map(|code| self.acquire(code).ok_or(DeleteError::SlotBusy(code)))
            .collect::<Result<Vec<_>, _>>()?;
        let current = self
            .documents
            .load(&self.asset_id)
            .map_err(DeleteError::Document)?;
        let occupied: Vec<(FormatCode, SlotRef)> = current
            .occupied()
            .map(|(code, slot)| (code, slot.clone()))
            .collect();
        let patches: Vec<_> = occupied
            .iter()
            .map(|(code, _)| Patch::UnsetSlot(*code))
            .collect();
        let asset = if patches.is_empty() {
            current
        } else {
            self.documents
                .patch(&self.asset_id, &patches)
                .map_err(DeleteError::Document)?
        };
        let mut warnings = Vec::new();
        for (code, slot) in &occupied {
            self.release_object(*code, &slot.object_id, &mut warnings);
        }
        log::info!(
            "released '{}' ({} objects, {} left behind)",
            self.asset_id,
            occupied.len(),
            warnings.len()
        );
        Ok(Reconciled {
            asset,
            warnings,
            derived: None,
        })
    }

    /// Upload and reference a new object for a slot the caller holds.
    fn commit(
        &self,
        code: FormatCode,
        bytes: &[u8],
        fallback_name: &str,
        warnings: &mut Vec<Warning>,
    ) -> Result<(FontAsset, ObjectId), CommitError> {
        let current = self
            .documents
            .load(&self.asset_id)
            .map_err(CommitError::Document)?;
        let name = current.object_name(code, fallback_name);
        log::debug!("uploading {} bytes to the {code} slot as '{name}'", bytes.len());
        let id = self
            .blobs
            .upload(bytes, &name)
            .map_err(CommitError::Upload)?;
        let patch = Patch::SetSlot {
            code,
            slot: SlotRef::new(id.clone(), name),
        };
        let asset = match self.documents.patch(&self.asset_id, &[patch]) {
            Ok(asset) => asset,
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete(&id) {
                    log::warn!("could not remove unreferenced upload {id}: {cleanup}");
                }
                return Err(CommitError::Document(e));
            }
        };
        log::info!("committed {id} to the {code} slot of '{}'", self.asset_id);
        if let Some(previous) = current.slot(code).occupied() {
            if previous.object_id != id {
                self.release_object(code, &previous.object_id, warnings);
            }
        }
        Ok((asset, id))
    }

    fn release_object(&self, code: FormatCode, id: &ObjectId, warnings: &mut Vec<Warning>) {
        match self.blobs.delete(id) {
            Ok(()) => log::debug!("deleted {id} ({code})"),
            Err(e) => {
                log::warn!("could not delete {id} from the {code} slot: {e}");
                warnings.push(Warning::DeleteFailed {
                    slot: code,
                    object: id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Describe the woff2 source, convert the pregenerated slots and write
    /// the stylesheet, updating `asset` as each step commits.
    fn derive(
        &self,
        bytes: &[u8],
        woff2: &ObjectId,
        filename: &str,
        asset: &mut FontAsset,
        warnings: &mut Vec<Warning>,
    ) -> DerivedOutcome {
        let loaded = SourceFont::load(bytes, &self.cancel)
            .map_err(ExtractError::from)
            .and_then(|source| {
                let descriptor = source.describe(&self.cancel)?;
                Ok((source, descriptor))
            });
        let (source, descriptor) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                log::warn!("woff2 committed, but its metadata could not be read: {e}");
                // a descriptor from a replaced woff2 no longer describes the slot
                if asset.descriptor.is_some() {
                    match self.documents.patch(&self.asset_id, &[Patch::UnsetDescriptor]) {
                        Ok(updated) => *asset = updated,
                        Err(e) => log::warn!("stale descriptor was not cleared: {e}"),
                    }
                }
                return DerivedOutcome::failed(e.into());
            }
        };
        let patch = Patch::SetDescriptor {
            descriptor: descriptor.clone(),
            source: woff2.clone(),
        };
        match self.documents.patch(&self.asset_id, &[patch]) {
            Ok(updated) => *asset = updated,
            Err(e) => {
                log::warn!("woff2 committed, but the descriptor was not recorded: {e}");
                return DerivedOutcome::failed(e.into());
            }
        }

        let job = ConversionJob {
            source_format: FormatCode::Woff2,
            source_bytes: bytes,
            target_formats: self
                .options
                .pregenerate
                .iter()
                .copied()
                .filter(|code| code.is_font() && *code != FormatCode::Woff2)
                .collect(),
            descriptor: &descriptor,
        };
        let mut slots = BTreeMap::new();
        for (code, converted) in job.run_with_source(&source, &self.cancel) {
            let fallback = sibling_name(filename, code);
            let result = converted.map_err(DerivedError::from).and_then(|out| {
                let _guard = self.acquire(code).ok_or(UploadError::SlotBusy(code))?;
                let (updated, id) = self
                    .commit(code, &out, &fallback, warnings)
                    .map_err(|e| e.into_upload(code))?;
                *asset = updated;
                Ok(id)
            });
            if let Err(e) = &result {
                log::warn!("derived {code} slot not updated: {e}");
            }
            slots.insert(code, result);
        }

        let family = asset.title.clone();
        let stylesheet = self.write_stylesheet(asset, &descriptor, &family, filename, warnings);
        if let Err(e) = &stylesheet {
            log::warn!("woff2 committed, but the stylesheet was not generated: {e}");
        }
        DerivedOutcome {
            descriptor: Some(descriptor),
            slots,
            stylesheet,
        }
    }

    fn write_stylesheet(
        &self,
        asset: &mut FontAsset,
        descriptor: &FontDescriptor,
        family: &str,
        source_name: &str,
        warnings: &mut Vec<Warning>,
    ) -> Result<ObjectId, CssError> {
        let text = css::generate_with(
            descriptor,
            asset.slots(),
            family,
            &*self.resolver,
            &self.options.stylesheet,
        )?;
        let _guard = self.acquire(FormatCode::Css).ok_or(CssError::SlotBusy)?;
        let fallback = sibling_name(source_name, FormatCode::Css);
        let (updated, id) = self.commit(FormatCode::Css, text.as_bytes(), &fallback, warnings)?;
        *asset = updated;
        log::info!("generated stylesheet {id} for '{}'", self.asset_id);
        Ok(id)
    }
}

/// `name` with its extension replaced by the one for `code`.
fn sibling_name(name: &str, code: FormatCode) -> String {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    let stem = if stem.is_empty() { "font" } else { stem };
    format!("{stem}.{}", code.extension())
}
