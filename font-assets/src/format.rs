//! Format codes and the per-format lookup table.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the format slots on a [`FontAsset`](crate::FontAsset).
///
/// The declaration order is the canonical slot order; it is not the order
/// used in generated `src` lists (see [`FormatCode::src_rank`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatCode {
    Ttf,
    Otf,
    Woff,
    Woff2,
    Eot,
    Svg,
    Css,
}

/// Static facts about a format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    pub code: FormatCode,
    pub extension: &'static str,
    pub mime_type: &'static str,
    /// The CSS `format()` hint, `None` for the stylesheet slot itself.
    pub css_format: Option<&'static str>,
    /// Position in a generated `src` list; lower is listed first.
    pub src_rank: u8,
}

static FORMATS: [FormatInfo; 7] = [
    FormatInfo {
        code: FormatCode::Ttf,
        extension: "ttf",
        mime_type: "font/ttf",
        css_format: Some("truetype"),
        src_rank: 2,
    },
    FormatInfo {
        code: FormatCode::Otf,
        extension: "otf",
        mime_type: "font/otf",
        css_format: Some("opentype"),
        src_rank: 3,
    },
    FormatInfo {
        code: FormatCode::Woff,
        extension: "woff",
        mime_type: "font/woff",
        css_format: Some("woff"),
        src_rank: 1,
    },
    FormatInfo {
        code: FormatCode::Woff2,
        extension: "woff2",
        mime_type: "font/woff2",
        css_format: Some("woff2"),
        src_rank: 0,
    },
    FormatInfo {
        code: FormatCode::Eot,
        extension: "eot",
        mime_type: "application/vnd.ms-fontobject",
        css_format: Some("embedded-opentype"),
        src_rank: 4,
    },
    FormatInfo {
        code: FormatCode::Svg,
        extension: "svg",
        mime_type: "image/svg+xml",
        css_format: Some("svg"),
        src_rank: 5,
    },
    FormatInfo {
        code: FormatCode::Css,
        extension: "css",
        mime_type: "text/css",
        css_format: None,
        src_rank: u8::MAX,
    },
];

impl FormatCode {
    /// Every slot, in canonical order.
    pub const ALL: [FormatCode; 7] = [
        FormatCode::Ttf,
        FormatCode::Otf,
        FormatCode::Woff,
        FormatCode::Woff2,
        FormatCode::Eot,
        FormatCode::Svg,
        FormatCode::Css,
    ];

    /// The slots that hold font binaries.
    pub const FONTS: [FormatCode; 6] = [
        FormatCode::Ttf,
        FormatCode::Otf,
        FormatCode::Woff,
        FormatCode::Woff2,
        FormatCode::Eot,
        FormatCode::Svg,
    ];

    pub fn info(self) -> &'static FormatInfo {
        &FORMATS[self as usize]
    }

    pub fn extension(self) -> &'static str {
        self.info().extension
    }

    pub fn mime_type(self) -> &'static str {
        self.info().mime_type
    }

    pub fn src_rank(self) -> u8 {
        self.info().src_rank
    }

    pub fn is_font(self) -> bool {
        self != FormatCode::Css
    }

    /// Guess the format of a file from its name.
    pub fn from_filename(name: &str) -> Option<FormatCode> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.parse().ok()
    }
}

impl Display for FormatCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// An error returned when parsing an unknown format name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown format '{0}'")]
pub struct UnknownFormat(pub String);

impl FromStr for FormatCode {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        FORMATS
            .iter()
            .find(|info| info.extension == lower)
            .map(|info| info.code)
            .ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

/// The container detected from the leading bytes of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Container {
    /// A bare sfnt with TrueType (or unspecified) outlines.
    TrueType,
    /// A bare sfnt with the `OTTO` signature.
    OpenTypeCff,
    Woff,
    Woff2,
    Eot,
    Svg,
    Collection,
}

pub(crate) const TRUETYPE_SIGNATURE: u32 = 0x0001_0000;
pub(crate) const APPLE_TRUE_SIGNATURE: u32 = u32::from_be_bytes(*b"true");
pub(crate) const CFF_SIGNATURE: u32 = u32::from_be_bytes(*b"OTTO");
pub(crate) const WOFF_SIGNATURE: u32 = u32::from_be_bytes(*b"wOFF");
pub(crate) const WOFF2_SIGNATURE: u32 = u32::from_be_bytes(*b"wOF2");
pub(crate) const COLLECTION_SIGNATURE: u32 = u32::from_be_bytes(*b"ttcf");
pub(crate) const EOT_MAGIC: u16 = 0x504C;

impl Container {
    /// Identify the container of `bytes`, if it is one we know.
    pub fn sniff(bytes: &[u8]) -> Option<Container> {
        let head = bytes.get(..4)?;
        let signature = u32::from_be_bytes(head.try_into().ok()?);
        match signature {
            TRUETYPE_SIGNATURE | APPLE_TRUE_SIGNATURE => return Some(Container::TrueType),
            CFF_SIGNATURE => return Some(Container::OpenTypeCff),
            WOFF_SIGNATURE => return Some(Container::Woff),
            WOFF2_SIGNATURE => return Some(Container::Woff2),
            COLLECTION_SIGNATURE => return Some(Container::Collection),
            _ => (),
        }
        // the EOT header is little endian, magic lives at offset 34
        if let Some(magic) = bytes.get(34..36) {
            if u16::from_le_bytes([magic[0], magic[1]]) == EOT_MAGIC {
                return Some(Container::Eot);
            }
        }
        let prefix = &bytes[..bytes.len().min(1024)];
        let text = match std::str::from_utf8(prefix) {
            Ok(text) => text,
            // the cut may land inside a multibyte char
            Err(e) => std::str::from_utf8(&prefix[..e.valid_up_to()]).ok()?,
        };
        let text = text.trim_start_matches('\u{feff}').trim_start();
        (text.starts_with('<') && text.contains("<svg")).then_some(Container::Svg)
    }

    /// Whether files in this container may be stored in the given slot.
    pub fn fits_slot(self, code: FormatCode) -> bool {
        match self {
            Container::TrueType | Container::OpenTypeCff => {
                matches!(code, FormatCode::Ttf | FormatCode::Otf)
            }
            Container::Woff => code == FormatCode::Woff,
            Container::Woff2 => code == FormatCode::Woff2,
            Container::Eot => code == FormatCode::Eot,
            Container::Svg => code == FormatCode::Svg,
            Container::Collection => false,
        }
    }

    /// The slot this container is most naturally stored in.
    pub fn format_code(self) -> Option<FormatCode> {
        match self {
            Container::TrueType => Some(FormatCode::Ttf),
            Container::OpenTypeCff => Some(FormatCode::Otf),
            Container::Woff => Some(FormatCode::Woff),
            Container::Woff2 => Some(FormatCode::Woff2),
            Container::Eot => Some(FormatCode::Eot),
            Container::Svg => Some(FormatCode::Svg),
            Container::Collection => None,
        }
    }
}
