//! The reference document: which format slots hold which stored objects.
//!
//! Everything here is plain data. Updates return new values and never touch
//! a store; the [`Reconciler`](crate::Reconciler) is responsible for
//! persisting them as [`Patch`]es.

use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::{format::FormatCode, metadata::FontDescriptor};

const OBJECT_PREFIX: &str = "file-";

/// The identifier of an object in a [`BlobStore`](crate::BlobStore).
///
/// Generated identifiers have the form `file-<hash>-<ext>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjectId(id.into())
    }

    /// A fresh identifier for an object with the given extension.
    pub fn generate(extension: &str) -> Self {
        let hash = uuid::Uuid::new_v4().simple();
        ObjectId(format!("{OBJECT_PREFIX}{hash}-{}", extension.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `(hash, extension)` parts of a generated identifier.
    pub fn parts(&self) -> Option<(&str, &str)> {
        let rest = self.0.strip_prefix(OBJECT_PREFIX)?;
        let (hash, ext) = rest.rsplit_once('-')?;
        (!hash.is_empty() && !ext.is_empty()).then_some((hash, ext))
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference to a stored object, with the name it was uploaded under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRef {
    pub object_id: ObjectId,
    pub original_name: String,
}

impl SlotRef {
    pub fn new(object_id: ObjectId, original_name: impl Into<String>) -> Self {
        SlotRef {
            object_id,
            original_name: original_name.into(),
        }
    }
}

/// The state of a single format slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FormatSlot {
    #[default]
    Empty,
    Occupied(SlotRef),
}

impl FormatSlot {
    pub fn is_empty(&self) -> bool {
        matches!(self, FormatSlot::Empty)
    }

    pub fn occupied(&self) -> Option<&SlotRef> {
        match self {
            FormatSlot::Occupied(slot) => Some(slot),
            FormatSlot::Empty => None,
        }
    }
}

static EMPTY: FormatSlot = FormatSlot::Empty;

/// The document describing one font and its stored variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontAsset {
    pub id: String,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub descriptor: Option<FontDescriptor>,
    /// The woff2 object `descriptor` was extracted from.
    #[serde(default)]
    pub descriptor_source: Option<ObjectId>,
    #[serde(default)]
    slots: BTreeMap<FormatCode, FormatSlot>,
}

impl FontAsset {
    /// A new document with every slot empty.
    pub fn new(id: impl Into<String>, title: impl Into<String>, slug: impl Into<String>) -> Self {
        FontAsset {
            id: id.into(),
            title: title.into(),
            slug: slug.into(),
            descriptor: None,
            descriptor_source: None,
            slots: FormatCode::ALL
                .into_iter()
                .map(|code| (code, FormatSlot::Empty))
                .collect(),
        }
    }

    pub fn slot(&self, code: FormatCode) -> &FormatSlot {
        self.slots.get(&code).unwrap_or(&EMPTY)
    }

    pub fn slots(&self) -> &BTreeMap<FormatCode, FormatSlot> {
        &self.slots
    }

    /// Occupied slots in canonical order.
    pub fn occupied(&self) -> impl Iterator<Item = (FormatCode, &SlotRef)> + '_ {
        self.slots
            .iter()
            .filter_map(|(code, slot)| slot.occupied().map(|slot| (*code, slot)))
    }

    /// Returns a copy with exactly one slot replaced.
    pub fn with_slot(&self, code: FormatCode, slot: FormatSlot) -> FontAsset {
        let mut asset = self.clone();
        asset.slots.insert(code, slot);
        asset
    }

    /// Returns a copy with `code` emptied, along with what it held.
    pub fn without_slot(&self, code: FormatCode) -> (FontAsset, Option<SlotRef>) {
        let previous = self.slot(code).occupied().cloned();
        (self.with_slot(code, FormatSlot::Empty), previous)
    }

    pub fn with_descriptor(&self, descriptor: FontDescriptor, source: ObjectId) -> FontAsset {
        let mut asset = self.clone();
        asset.descriptor = Some(descriptor);
        asset.descriptor_source = Some(source);
        asset
    }

    pub fn without_descriptor(&self) -> FontAsset {
        let mut asset = self.clone();
        asset.descriptor = None;
        asset.descriptor_source = None;
        asset
    }

    /// The recorded descriptor, if it was extracted from `object`.
    pub fn descriptor_of(&self, object: &ObjectId) -> Option<&FontDescriptor> {
        self.descriptor
            .as_ref()
            .filter(|_| self.descriptor_source.as_ref() == Some(object))
    }

    pub fn apply(&self, patch: &Patch) -> FontAsset {
        match patch {
            Patch::SetSlot { code, slot } => {
                self.with_slot(*code, FormatSlot::Occupied(slot.clone()))
            }
            Patch::UnsetSlot(code) => self.with_slot(*code, FormatSlot::Empty),
            Patch::SetDescriptor { descriptor, source } => {
                self.with_descriptor(descriptor.clone(), source.clone())
            }
            Patch::UnsetDescriptor => self.without_descriptor(),
        }
    }

    /// Original names of the stored objects, in slot order.
    pub fn filenames(&self) -> Vec<&str> {
        self.occupied()
            .map(|(_, slot)| slot.original_name.as_str())
            .collect()
    }

    /// The name an object for `code` is stored under: `<slug>.<ext>`, or
    /// `fallback` when the document has no slug.
    pub fn object_name(&self, code: FormatCode, fallback: &str) -> String {
        let slug = self.slug.trim();
        if slug.is_empty() {
            fallback.to_string()
        } else {
            format!("{slug}.{}", code.extension())
        }
    }
}

/// A field level edit to a stored [`FontAsset`].
#[derive(Clone, Debug, PartialEq)]
pub enum Patch {
    SetSlot { code: FormatCode, slot: SlotRef },
    UnsetSlot(FormatCode),
    SetDescriptor {
        descriptor: FontDescriptor,
        source: ObjectId,
    },
    UnsetDescriptor,
}

impl Patch {
    /// The document path this patch writes.
    pub fn path(&self) -> String {
        match self {
            Patch::SetSlot { code, .. } | Patch::UnsetSlot(code) => format!("fileInput.{code}"),
            Patch::SetDescriptor { .. } | Patch::UnsetDescriptor => "descriptor".to_string(),
        }
    }
}
