//! Extracting a [`FontDescriptor`] from a font binary.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use read_fonts::{
    tables::{head::MacStyle, name::Name, os2::SelectionFlags},
    types::{NameId, Tag},
    FontRef, ReadError, TableProvider,
};
use serde::{Deserialize, Serialize};

use crate::{
    cancel::{CancellationToken, Cancelled},
    container::{self, ContainerError},
    format::Container,
};

const FVAR: Tag = Tag::new(b"fvar");
pub(crate) const WGHT: Tag = Tag::new(b"wght");
/// Seconds between the sfnt epoch (1904-01-01) and the Unix epoch.
const SFNT_EPOCH_OFFSET: i64 = 2_082_844_800;
const DEFAULT_WEIGHT: u16 = 400;

/// An error during metadata extraction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("malformed font: {0}")]
    MalformedFont(String),
    #[error("unsupported variable font: {0}")]
    UnsupportedVariant(String),
    #[error("extraction was cancelled")]
    Cancelled,
}

impl From<Cancelled> for ExtractError {
    fn from(_: Cancelled) -> Self {
        ExtractError::Cancelled
    }
}

impl From<ContainerError> for ExtractError {
    fn from(src: ContainerError) -> Self {
        match src {
            ContainerError::Cancelled(_) => ExtractError::Cancelled,
            other => ExtractError::MalformedFont(other.to_string()),
        }
    }
}

impl From<ReadError> for ExtractError {
    fn from(src: ReadError) -> Self {
        ExtractError::MalformedFont(src.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    #[default]
    Normal,
    Italic,
    Oblique,
}

impl FontStyle {
    /// The CSS `font-style` keyword.
    pub fn as_css(self) -> &'static str {
        match self {
            FontStyle::Normal => "normal",
            FontStyle::Italic => "italic",
            FontStyle::Oblique => "oblique",
        }
    }
}

impl Display for FontStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_css())
    }
}

/// A variation axis as declared in `fvar`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    #[serde(with = "tag_string")]
    pub tag: Tag,
    pub min: f64,
    pub default: f64,
    pub max: f64,
}

/// Canonical metadata for a font, independent of its container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontDescriptor {
    pub family: String,
    pub subfamily: String,
    /// `OS/2.usWeightClass`, clamped to `1..=1000`.
    ///
    /// Always present; for variable fonts the `wght` axis, if any, gives the
    /// supported range (see [`weight_range`](Self::weight_range)).
    pub weight: u16,
    pub style: FontStyle,
    /// Empty for static fonts.
    #[serde(default)]
    pub axes: Vec<Axis>,
    pub version: String,
    pub generated_at: DateTime<Utc>,
}

impl FontDescriptor {
    pub fn is_variable(&self) -> bool {
        !self.axes.is_empty()
    }

    pub fn axis(&self, tag: Tag) -> Option<&Axis> {
        self.axes.iter().find(|axis| axis.tag == tag)
    }

    /// The `(min, max)` of the `wght` axis of a variable font.
    pub fn weight_range(&self) -> Option<(f64, f64)> {
        self.axis(WGHT).map(|axis| (axis.min, axis.max))
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.family, self.subfamily)
    }

    /// An XML id derived from the family name, used for the SVG `<font>`
    /// element and the matching fragment in CSS.
    pub fn svg_font_id(&self) -> String {
        let id: String = self
            .family
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        match id.chars().next() {
            Some(c) if c.is_ascii_alphabetic() => id,
            _ => format!("font{id}"),
        }
    }
}

/// Extract a descriptor from any supported font container.
pub fn extract(bytes: &[u8]) -> Result<FontDescriptor, ExtractError> {
    extract_with(bytes, &CancellationToken::new())
}

/// As [`extract`], observing `cancel` between table reads.
pub fn extract_with(
    bytes: &[u8],
    cancel: &CancellationToken,
) -> Result<FontDescriptor, ExtractError> {
    match Container::sniff(bytes) {
        Some(Container::TrueType | Container::OpenTypeCff) => {
            let font = FontRef::new(bytes)?;
            describe(&font, cancel)
        }
        Some(Container::Woff | Container::Woff2 | Container::Eot) => {
            let sfnt = container::decode(bytes, cancel)?;
            let assembled = sfnt.to_bytes();
            let font = FontRef::new(&assembled)?;
            describe(&font, cancel)
        }
        Some(other) => Err(ExtractError::MalformedFont(format!(
            "{other:?} is not an sfnt based container"
        ))),
        None => Err(ExtractError::MalformedFont(
            "no recognised font signature".into(),
        )),
    }
}

/// Build a descriptor from a parsed sfnt.
pub fn describe(font: &FontRef, cancel: &CancellationToken) -> Result<FontDescriptor, ExtractError> {
    cancel.check()?;
    let name = font
        .name()
        .map_err(|e| ExtractError::MalformedFont(format!("name table: {e}")))?;
    let family = find_name(&name, NameId::TYPOGRAPHIC_FAMILY_NAME)
        .or_else(|| find_name(&name, NameId::FAMILY_NAME))
        .ok_or_else(|| ExtractError::MalformedFont("no family name (name ID 1 or 16)".into()))?;
    let subfamily = find_name(&name, NameId::TYPOGRAPHIC_SUBFAMILY_NAME)
        .or_else(|| find_name(&name, NameId::SUBFAMILY_NAME))
        .ok_or_else(|| {
            ExtractError::MalformedFont("no subfamily name (name ID 2 or 17)".into())
        })?;

    cancel.check()?;
    let head = font
        .head()
        .map_err(|e| ExtractError::MalformedFont(format!("head table: {e}")))?;
    let version = find_name(&name, NameId::VERSION_STRING)
        .unwrap_or_else(|| format!("Version {:.3}", head.font_revision().to_f64()));
    let generated_at = DateTime::from_timestamp(head.created().as_secs() - SFNT_EPOCH_OFFSET, 0)
        .unwrap_or_default();

    cancel.check()?;
    let axes = read_axes(font)?;

    cancel.check()?;
    let (weight, mut style) = match font.os2() {
        Ok(os2) => {
            let selection = os2.fs_selection();
            let style = if selection.contains(SelectionFlags::OBLIQUE) {
                FontStyle::Oblique
            } else if selection.contains(SelectionFlags::ITALIC) {
                FontStyle::Italic
            } else {
                FontStyle::Normal
            };
            (os2.us_weight_class().clamp(1, 1000), style)
        }
        Err(e) => {
            let weight = axes
                .iter()
                .find(|axis| axis.tag == WGHT)
                .map(|axis| axis.default.round().clamp(1.0, 1000.0) as u16)
                .unwrap_or(DEFAULT_WEIGHT);
            log::warn!("no usable OS/2 table ({e}), assuming weight {weight}");
            (weight, FontStyle::Normal)
        }
    };
    if style == FontStyle::Normal && head.mac_style().contains(MacStyle::ITALIC) {
        style = FontStyle::Italic;
    }

    let descriptor = FontDescriptor {
        family,
        subfamily,
        weight,
        style,
        axes,
        version,
        generated_at,
    };
    log::debug!(
        "described '{}' weight {} {} ({} axes)",
        descriptor.full_name(),
        descriptor.weight,
        descriptor.style,
        descriptor.axes.len()
    );
    Ok(descriptor)
}

fn read_axes(font: &FontRef) -> Result<Vec<Axis>, ExtractError> {
    let declared = font
        .table_directory
        .table_records()
        .iter()
        .any(|record| record.tag() == FVAR);
    if !declared {
        return Ok(Vec::new());
    }
    let unsupported = |e: ReadError| ExtractError::UnsupportedVariant(format!("fvar: {e}"));
    let fvar = font.fvar().map_err(unsupported)?;
    let records = fvar.axes().map_err(unsupported)?;

    let mut axes: Vec<Axis> = Vec::with_capacity(records.len());
    for record in records {
        let axis = Axis {
            tag: record.axis_tag(),
            min: record.min_value().to_f64(),
            default: record.default_value().to_f64(),
            max: record.max_value().to_f64(),
        };
        if !(axis.min <= axis.default && axis.default <= axis.max) {
            return Err(ExtractError::UnsupportedVariant(format!(
                "axis '{}' has min {} default {} max {}",
                axis.tag, axis.min, axis.default, axis.max
            )));
        }
        if axes.iter().any(|seen| seen.tag == axis.tag) {
            return Err(ExtractError::UnsupportedVariant(format!(
                "axis '{}' is declared more than once",
                axis.tag
            )));
        }
        axes.push(axis);
    }
    Ok(axes)
}

/// Platform preference for name records; lower is better.
fn platform_rank(platform: u16, encoding: u16, language: u16) -> Option<u8> {
    match (platform, encoding, language) {
        (3, 1 | 10, 0x409) => Some(0),
        (3, 0 | 1 | 10, _) => Some(1),
        (0, _, _) => Some(2),
        (1, 0, 0) => Some(3),
        (1, 0, _) => Some(4),
        _ => None,
    }
}

/// The best decodable, non-empty record for `id`.
fn find_name(name: &Name, id: NameId) -> Option<String> {
    let data = name.string_data();
    let mut candidates: Vec<_> = name
        .name_record()
        .iter()
        .filter(|record| record.name_id() == id)
        .filter_map(|record| {
            platform_rank(
                record.platform_id(),
                record.encoding_id(),
                record.language_id(),
            )
            .map(|rank| (rank, record))
        })
        .collect();
    candidates.sort_by_key(|(rank, _)| *rank);
    candidates.into_iter().find_map(|(_, record)| {
        let value = record.string(data).ok()?.to_string();
        let value = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        (!value.is_empty()).then(|| value.to_string())
    })
}

mod tag_string {
    use read_fonts::types::Tag;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tag: &Tag, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(tag)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Tag, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Tag::new_checked(raw.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use font_test_data::{AxisSpec, FontSpec};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::container::{encode_woff, encode_woff2, Sfnt};

    #[test]
    fn static_font() {
        let descriptor = extract(&FontSpec::default().build()).unwrap();
        assert_eq!(descriptor.family, "Acme Sans");
        assert_eq!(descriptor.subfamily, "Regular");
        assert_eq!(descriptor.weight, 400);
        assert_eq!(descriptor.style, FontStyle::Normal);
        assert!(!descriptor.is_variable());
        assert_eq!(descriptor.version, "Version 1.000");
        assert_eq!(
            descriptor.generated_at.to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn same_descriptor_from_web_containers() {
        let bytes = FontSpec::default().build();
        let cancel = CancellationToken::new();
        let sfnt = Sfnt::read(&bytes, &cancel).unwrap();
        let expected = extract(&bytes).unwrap();
        for encoded in [
            encode_woff(&sfnt, &cancel).unwrap(),
            encode_woff2(&sfnt, &cancel).unwrap(),
        ] {
            assert_eq!(extract(&encoded).unwrap(), expected);
        }
    }

    #[test]
    fn variable_weight_axis() {
        let descriptor = extract(&FontSpec::variable(100.0, 400.0, 900.0).build()).unwrap();
        assert!(descriptor.is_variable());
        assert_eq!(descriptor.weight_range(), Some((100.0, 900.0)));
        assert_eq!(descriptor.axes[0].tag, Tag::new(b"wght"));
    }

    #[test]
    fn fractional_axis_values() {
        let spec = FontSpec {
            axes: vec![AxisSpec::new(b"wdth", 62.5, 100.0, 100.0)],
            ..Default::default()
        };
        let descriptor = extract(&spec.build()).unwrap();
        assert_eq!(descriptor.axes[0].min, 62.5);
        assert_eq!(descriptor.weight_range(), None);
    }

    #[test]
    fn duplicate_weight_axis() {
        let spec = FontSpec {
            axes: vec![
                AxisSpec::new(b"wght", 100.0, 400.0, 900.0),
                AxisSpec::new(b"wght", 200.0, 400.0, 700.0),
            ],
            ..Default::default()
        };
        assert!(matches!(
            extract(&spec.build()),
            Err(ExtractError::UnsupportedVariant(_))
        ));
    }

    #[test]
    fn truncated_axis_records() {
        let bytes = FontSpec::variable(100.0, 400.0, 900.0).build();
        let mut sfnt = Sfnt::read(&bytes, &CancellationToken::new()).unwrap();
        let fvar = sfnt.remove(FVAR).unwrap();
        sfnt.insert(FVAR, fvar[..fvar.len() - 8].to_vec());
        assert!(matches!(
            extract(&sfnt.to_bytes()),
            Err(ExtractError::UnsupportedVariant(_))
        ));
    }

    #[test]
    fn typographic_names_win() {
        let spec = FontSpec {
            family: "Acme Sans Bold".into(),
            subfamily: "Regular".into(),
            typographic_family: Some("Acme Sans".into()),
            typographic_subfamily: Some("Bold".into()),
            weight: Some(700),
            ..Default::default()
        };
        let descriptor = extract(&spec.build()).unwrap();
        assert_eq!(descriptor.family, "Acme Sans");
        assert_eq!(descriptor.subfamily, "Bold");
        assert_eq!(descriptor.weight, 700);
    }

    #[test]
    fn windows_names_preferred_over_mac() {
        let spec = FontSpec {
            mac_family: Some("Acme Mac".into()),
            ..Default::default()
        };
        assert_eq!(extract(&spec.build()).unwrap().family, "Acme Sans");

        let mac_only = FontSpec {
            mac_family: Some("Acme Mac".into()),
            windows_names: false,
            ..Default::default()
        };
        assert_eq!(extract(&mac_only.build()).unwrap().family, "Acme Mac");
    }

    #[test]
    fn missing_names_are_malformed() {
        let spec = FontSpec {
            windows_names: false,
            ..Default::default()
        };
        assert!(matches!(
            extract(&spec.build()),
            Err(ExtractError::MalformedFont(_))
        ));
    }

    #[test]
    fn style_bits() {
        let italic = FontSpec {
            italic: true,
            ..Default::default()
        };
        assert_eq!(extract(&italic.build()).unwrap().style, FontStyle::Italic);
        let oblique = FontSpec {
            oblique: true,
            ..Default::default()
        };
        assert_eq!(extract(&oblique.build()).unwrap().style, FontStyle::Oblique);
    }

    #[test]
    fn missing_os2_defaults() {
        let spec = FontSpec {
            weight: None,
            ..Default::default()
        };
        assert_eq!(extract(&spec.build()).unwrap().weight, 400);
        let variable = FontSpec {
            weight: None,
            ..FontSpec::variable(100.0, 300.0, 900.0)
        };
        assert_eq!(extract(&variable.build()).unwrap().weight, 300);
    }

    #[test]
    fn weight_is_clamped() {
        let spec = FontSpec {
            weight: Some(1200),
            ..Default::default()
        };
        assert_eq!(extract(&spec.build()).unwrap().weight, 1000);
    }

    #[test]
    fn version_falls_back_to_revision() {
        let spec = FontSpec {
            version: None,
            font_revision: 2.5,
            ..Default::default()
        };
        assert_eq!(extract(&spec.build()).unwrap().version, "Version 2.500");
    }

    #[test]
    fn rejects_non_fonts() {
        for bytes in [&b"GIF89a..."[..], &b"<svg></svg>"[..], &b""[..]] {
            assert!(matches!(
                extract(bytes),
                Err(ExtractError::MalformedFont(_))
            ));
        }
    }

    #[test]
    fn observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            extract_with(&FontSpec::default().build(), &cancel),
            Err(ExtractError::Cancelled)
        );
    }

    #[test]
    fn svg_font_id() {
        let descriptor = extract(&FontSpec::default().build()).unwrap();
        assert_eq!(descriptor.svg_font_id(), "AcmeSans");
    }

    #[test]
    fn serde_round_trip() {
        let descriptor = extract(&FontSpec::variable(100.0, 400.0, 900.0).build()).unwrap();
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"tag\":\"wght\""), "{json}");
        assert!(json.contains("\"generatedAt\""), "{json}");
        let back: FontDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
