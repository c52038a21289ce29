//! Transcoding between font containers.
//!
//! Conversion moves tables between containers byte for byte; only the SVG
//! target synthesizes new data (and drops hinting while doing so).

mod svg;

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use read_fonts::{types::Tag, FontRef, TableProvider};

use crate::{
    cancel::{CancellationToken, Cancelled},
    container::{self, ContainerError, EotNames, Sfnt, CFF, CFF2, GLYF, HMTX, LOCA},
    format::{Container, FormatCode, CFF_SIGNATURE, TRUETYPE_SIGNATURE},
    metadata::{self, ExtractError, FontDescriptor},
};

const CMAP: Tag = Tag::new(b"cmap");

/// An error converting a font to another container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    #[error("cannot convert {from:?} source to {to}: {reason}")]
    UnsupportedConversion {
        from: Container,
        to: FormatCode,
        reason: &'static str,
    },
    #[error("required table '{0}' is missing or corrupt")]
    CorruptTable(Tag),
    #[error("malformed font: {0}")]
    MalformedFont(String),
    #[error("conversion was cancelled")]
    Cancelled,
}

impl From<Cancelled> for ConvertError {
    fn from(_: Cancelled) -> Self {
        ConvertError::Cancelled
    }
}

impl ConvertError {
    fn from_container(error: &ContainerError, from: Option<Container>, to: FormatCode) -> Self {
        match error {
            ContainerError::Cancelled(_) => ConvertError::Cancelled,
            ContainerError::Unsupported { container, reason } => {
                ConvertError::UnsupportedConversion {
                    from: from.unwrap_or(*container),
                    to,
                    reason: *reason,
                }
            }
            other => ConvertError::MalformedFont(other.to_string()),
        }
    }
}

/// A decoded source font, ready to be written to any target.
pub(crate) struct SourceFont {
    container: Container,
    sfnt: Sfnt,
    /// The tables assembled as a bare sfnt, for parsing.
    assembled: Vec<u8>,
}

impl SourceFont {
    pub(crate) fn load(bytes: &[u8], cancel: &CancellationToken) -> Result<Self, ContainerError> {
        let container = Container::sniff(bytes).ok_or(ContainerError::UnknownSignature)?;
        let sfnt = container::decode(bytes, cancel)?;
        let assembled = sfnt.to_bytes();
        Ok(SourceFont {
            container,
            sfnt,
            assembled,
        })
    }

    pub(crate) fn describe(&self, cancel: &CancellationToken) -> Result<FontDescriptor, ExtractError> {
        let font = FontRef::new(&self.assembled)?;
        metadata::describe(&font, cancel)
    }

    fn unsupported(&self, to: FormatCode, reason: &'static str) -> ConvertError {
        ConvertError::UnsupportedConversion {
            from: self.container,
            to,
            reason,
        }
    }

    /// Check that the tables every target needs are present and parse.
    fn check_required_tables(&self, cancel: &CancellationToken) -> Result<(), ConvertError> {
        let font = FontRef::new(&self.assembled)
            .map_err(|e| ConvertError::MalformedFont(e.to_string()))?;
        cancel.check()?;
        font.cmap().map_err(|_| ConvertError::CorruptTable(CMAP))?;
        cancel.check()?;
        font.hmtx().map_err(|_| ConvertError::CorruptTable(HMTX))?;
        cancel.check()?;
        if self.sfnt.has_truetype_outlines() {
            font.glyf().map_err(|_| ConvertError::CorruptTable(GLYF))?;
            font.loca(None).map_err(|_| ConvertError::CorruptTable(LOCA))?;
        } else if self.sfnt.contains(CFF) {
            font.cff().map_err(|_| ConvertError::CorruptTable(CFF))?;
        } else if self.sfnt.contains(CFF2) {
            font.cff2().map_err(|_| ConvertError::CorruptTable(CFF2))?;
        } else {
            return Err(ConvertError::CorruptTable(GLYF));
        }
        Ok(())
    }

    /// The tables with the flavor a target expects.
    fn with_flavor(&self) -> Sfnt {
        let mut sfnt = self.sfnt.clone();
        let flavor = if sfnt.has_cff_outlines() {
            CFF_SIGNATURE
        } else {
            TRUETYPE_SIGNATURE
        };
        sfnt.set_flavor(flavor);
        sfnt
    }

    pub(crate) fn convert(
        &self,
        descriptor: &FontDescriptor,
        target: FormatCode,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ConvertError> {
        cancel.check()?;
        if matches!(target, FormatCode::Ttf | FormatCode::Eot) && !self.sfnt.has_truetype_outlines()
        {
            return Err(self.unsupported(target, "target requires TrueType (glyf) outlines"));
        }
        self.check_required_tables(cancel)?;

        let sfnt = self.with_flavor();
        let wrap = |e: ContainerError| ConvertError::from_container(&e, Some(self.container), target);
        let bytes = match target {
            FormatCode::Ttf | FormatCode::Otf => sfnt.to_bytes(),
            FormatCode::Woff => container::encode_woff(&sfnt, cancel).map_err(wrap)?,
            FormatCode::Woff2 => container::encode_woff2(&sfnt, cancel).map_err(wrap)?,
            FormatCode::Eot => {
                let names = EotNames {
                    family: descriptor.family.clone(),
                    style: descriptor.subfamily.clone(),
                    version: descriptor.version.clone(),
                    full_name: descriptor.full_name(),
                };
                container::encode_eot(&sfnt, &names, cancel).map_err(wrap)?
            }
            FormatCode::Svg => svg::render(&self.assembled, descriptor, cancel)?,
            FormatCode::Css => {
                return Err(self.unsupported(target, "stylesheets are generated, not converted"))
            }
        };
        log::debug!(
            "converted {:?} to {target}: {} bytes",
            self.container,
            bytes.len()
        );
        Ok(bytes)
    }
}

/// Convert `bytes` (in any supported container) to `target`.
pub fn convert(
    descriptor: &FontDescriptor,
    bytes: &[u8],
    target: FormatCode,
) -> Result<Vec<u8>, ConvertError> {
    convert_with(descriptor, bytes, target, &CancellationToken::new())
}

/// As [`convert`], observing `cancel` between tables.
pub fn convert_with(
    descriptor: &FontDescriptor,
    bytes: &[u8],
    target: FormatCode,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ConvertError> {
    let source = SourceFont::load(bytes, cancel)
        .map_err(|e| ConvertError::from_container(&e, Container::sniff(bytes), target))?;
    source.convert(descriptor, target, cancel)
}

/// A request to produce several formats from one source.
///
/// Each target is converted independently and in parallel; one failing
/// target does not affect the others.
#[derive(Clone, Debug)]
pub struct ConversionJob<'a> {
    pub source_format: FormatCode,
    pub source_bytes: &'a [u8],
    pub target_formats: BTreeSet<FormatCode>,
    pub descriptor: &'a FontDescriptor,
}

impl ConversionJob<'_> {
    pub fn run(
        &self,
        cancel: &CancellationToken,
    ) -> BTreeMap<FormatCode, Result<Vec<u8>, ConvertError>> {
        let source = match SourceFont::load(self.source_bytes, cancel) {
            Ok(source) => source,
            Err(e) => {
                let from = Container::sniff(self.source_bytes);
                return self
                    .target_formats
                    .iter()
                    .map(|target| (*target, Err(ConvertError::from_container(&e, from, *target))))
                    .collect();
            }
        };
        self.run_with_source(&source, cancel)
    }

    pub(crate) fn run_with_source(
        &self,
        source: &SourceFont,
        cancel: &CancellationToken,
    ) -> BTreeMap<FormatCode, Result<Vec<u8>, ConvertError>> {
        log::debug!(
            "converting {} source to {:?}",
            self.source_format,
            self.target_formats
        );
        self.target_formats
            .par_iter()
            .map(|target| (*target, source.convert(self.descriptor, *target, cancel)))
            .collect()
    }
}
