//! Web font asset pipeline.
//!
//! Given one uploaded font binary this crate can
//! - [`extract`] a [`FontDescriptor`] (family, style, weight, axes),
//! - [`convert`] it to the sibling web formats (ttf, otf, woff, woff2, eot,
//!   svg),
//! - [`generate`](css::generate) an `@font-face` stylesheet for the stored
//!   variants,
//!
//! and, through the [`Reconciler`], keep a [`FontAsset`] reference document
//! consistent with a [`BlobStore`] as slots are uploaded, regenerated and
//! deleted.

#![forbid(unsafe_code)]

pub mod asset;
pub mod cancel;
pub mod container;
pub mod convert;
pub mod css;
pub mod format;
pub mod metadata;
pub mod reconcile;
pub mod store;

pub use asset::{FontAsset, FormatSlot, ObjectId, Patch, SlotRef};
pub use cancel::{CancellationToken, Cancelled};
pub use convert::{convert, convert_with, ConversionJob, ConvertError};
pub use css::{CdnUrlResolver, CssError, FontDisplay, ResolvedName, StylesheetOptions, UrlResolver};
pub use format::{Container, FormatCode, FormatInfo};
pub use metadata::{extract, extract_with, Axis, ExtractError, FontDescriptor, FontStyle};
pub use reconcile::{
    DeleteError, DerivedError, DerivedOutcome, Reconciled, Reconciler, ReconcilerOptions,
    UploadError, Warning,
};
pub use store::{
    BlobStore, DirBlobStore, DocumentStore, JsonDocumentStore, MemoryBlobStore,
    MemoryDocumentStore, StoreError,
};

/// Expose the parser crate our descriptors are built with.
pub extern crate read_fonts;
