//! Font containers.
//!
//! Every supported input container is decoded into an [`Sfnt`]: the flavor
//! and the raw bytes of each table. Encoders take an [`Sfnt`] back out to a
//! specific container. Tables are moved between containers byte for byte;
//! only the web containers apply (and remove) compression.

mod eot;
mod sfnt;
mod woff;
mod woff2;
mod woff2_glyf;

use read_fonts::{types::Tag, ReadError};

use crate::{
    cancel::{CancellationToken, Cancelled},
    format::Container,
};

pub(crate) use eot::EotNames;
pub use sfnt::Sfnt;

pub(crate) const HEAD: Tag = Tag::new(b"head");
pub(crate) const HHEA: Tag = Tag::new(b"hhea");
pub(crate) const HMTX: Tag = Tag::new(b"hmtx");
pub(crate) const MAXP: Tag = Tag::new(b"maxp");
pub(crate) const GLYF: Tag = Tag::new(b"glyf");
pub(crate) const LOCA: Tag = Tag::new(b"loca");
pub(crate) const CFF: Tag = Tag::new(b"CFF ");
pub(crate) const CFF2: Tag = Tag::new(b"CFF2");

/// Upper bound on the decoded table data of one font. Directories that
/// claim more are rejected before anything is allocated.
pub(crate) const MAX_DECODED_SIZE: u64 = 256 * 1024 * 1024;
/// Initial buffer size per compressed byte when inflating.
const INFLATE_RESERVE_RATIO: usize = 4;

/// The initial capacity of a buffer that will hold `expected` bytes
/// decompressed from `compressed_len` bytes.
pub(crate) fn inflate_capacity(expected: usize, compressed_len: usize) -> usize {
    expected.min(compressed_len.saturating_mul(INFLATE_RESERVE_RATIO))
}

/// Offset of `checkSumAdjustment` within the head table.
pub(crate) const HEAD_CHECKSUM_ADJUSTMENT: usize = 8;
/// Offset of `indexToLocFormat` within the head table.
pub(crate) const HEAD_INDEX_TO_LOC_FORMAT: usize = 50;

/// An error while decoding or encoding a container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("malformed {container:?} data: {reason}")]
    Malformed {
        container: Container,
        reason: String,
    },
    #[error("unsupported {container:?} data: {reason}")]
    Unsupported {
        container: Container,
        reason: &'static str,
    },
    #[error("unrecognized font signature")]
    UnknownSignature,
    #[error("failed to read sfnt: {0}")]
    Read(#[from] ReadError),
    #[error("compression stream failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ContainerError {
    pub(crate) fn malformed(container: Container, reason: impl Into<String>) -> Self {
        ContainerError::Malformed {
            container,
            reason: reason.into(),
        }
    }
}

/// Decode any supported container into sfnt tables.
pub fn decode(bytes: &[u8], cancel: &CancellationToken) -> Result<Sfnt, ContainerError> {
    let container = Container::sniff(bytes).ok_or(ContainerError::UnknownSignature)?;
    log::debug!("decoding {} bytes as {container:?}", bytes.len());
    match container {
        Container::TrueType | Container::OpenTypeCff => Sfnt::read(bytes, cancel),
        Container::Woff => woff::decode(bytes, cancel),
        Container::Woff2 => woff2::decode(bytes, cancel),
        Container::Eot => eot::decode(bytes, cancel),
        Container::Svg => Err(ContainerError::Unsupported {
            container,
            reason: "SVG fonts carry no sfnt tables",
        }),
        Container::Collection => Err(ContainerError::Unsupported {
            container,
            reason: "font collections are not supported",
        }),
    }
}

pub(crate) fn encode_woff(sfnt: &Sfnt, cancel: &CancellationToken) -> Result<Vec<u8>, ContainerError> {
    woff::encode(sfnt, cancel)
}

pub(crate) fn encode_woff2(sfnt: &Sfnt, cancel: &CancellationToken) -> Result<Vec<u8>, ContainerError> {
    woff2::encode(sfnt, cancel)
}

pub(crate) fn encode_eot(
    sfnt: &Sfnt,
    names: &EotNames,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ContainerError> {
    eot::encode(sfnt, names, cancel)
}

/// Big-endian writes onto a growable buffer.
pub(crate) trait WriteBe {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_i16(&mut self, value: i16);
    fn put_u32(&mut self, value: u32);
    fn put_tag(&mut self, tag: Tag);
    /// Zero pad to a multiple of four bytes.
    fn pad4(&mut self);
}

impl WriteBe for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_i16(&mut self, value: i16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_tag(&mut self, tag: Tag) {
        self.extend_from_slice(&tag.to_be_bytes());
    }

    fn pad4(&mut self) {
        self.resize(round4(self.len()), 0);
    }
}

/// <https://github.com/google/woff2/blob/a0d0ed7da27b708c0a4e96ad7a998bddc933c06e/src/round.h#L19>
pub(crate) fn round4(sz: usize) -> usize {
    (sz + 3) & !3
}

/// The OpenType table checksum: the wrapping sum of big-endian u32 words,
/// with the final word zero padded.
pub(crate) fn checksum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |sum, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum.wrapping_add(u32::from_be_bytes(word))
    })
}

/// The checksum of a table as recorded in a table directory.
///
/// For `head` this is computed with `checkSumAdjustment` treated as zero.
pub(crate) fn table_checksum(tag: Tag, data: &[u8]) -> u32 {
    if tag == HEAD && data.len() >= HEAD_CHECKSUM_ADJUSTMENT + 4 {
        let mut copy = data.to_vec();
        copy[HEAD_CHECKSUM_ADJUSTMENT..HEAD_CHECKSUM_ADJUSTMENT + 4].fill(0);
        checksum(&copy)
    } else {
        checksum(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_pads_final_word() {
        assert_eq!(checksum(&[0, 0, 0, 1, 0, 0, 0, 2]), 3);
        assert_eq!(checksum(&[1]), 0x0100_0000);
        assert_eq!(checksum(&[0xff; 8]), 0xffff_fffe);
    }

    #[test]
    fn head_checksum_ignores_adjustment() {
        let mut head = vec![0u8; 54];
        head[0] = 1;
        let expected = table_checksum(HEAD, &head);
        head[8..12].copy_from_slice(&0xdead_beef_u32.to_be_bytes());
        assert_eq!(table_checksum(HEAD, &head), expected);
        assert_ne!(checksum(&head), expected);
    }

    #[test]
    fn rejects_unknown_and_svg() {
        let cancel = CancellationToken::new();
        assert!(matches!(
            decode(b"not a font at all", &cancel),
            Err(ContainerError::UnknownSignature)
        ));
        assert!(matches!(
            decode(b"<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>", &cancel),
            Err(ContainerError::Unsupported {
                container: Container::Svg,
                ..
            })
        ));
    }
}
