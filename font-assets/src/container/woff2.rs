//! WOFF 2.0: <https://www.w3.org/TR/WOFF2/>
//!
//! Decoding handles the null transform for every table and the glyf/loca
//! and hmtx transforms. Encoding always uses null transforms; the brotli
//! stream does the heavy lifting.

use std::io::{Read, Write};

use brotlic::{CompressorWriter, DecompressorReader};
use read_fonts::types::Tag;

use super::{
    inflate_capacity, woff2_glyf, ContainerError, Sfnt, WriteBe, GLYF, HEAD,
    HEAD_INDEX_TO_LOC_FORMAT, HHEA, HMTX, LOCA, MAXP, MAX_DECODED_SIZE,
};
use crate::{
    cancel::CancellationToken,
    format::{Container, COLLECTION_SIGNATURE, WOFF2_SIGNATURE},
};

const HEADER_LEN: usize = 48;
const ARBITRARY_TAG_INDEX: u8 = 63;
/// glyf/loca transform version meaning "not transformed"
const NULL_GLYF_TRANSFORM: u8 = 3;

// ref: <https://www.w3.org/TR/WOFF2/#table_dir_format>
static KNOWN_TAGS: [Tag; 63] = [
    Tag::new(b"cmap"),
    Tag::new(b"head"),
    Tag::new(b"hhea"),
    Tag::new(b"hmtx"),
    Tag::new(b"maxp"),
    Tag::new(b"name"),
    Tag::new(b"OS/2"),
    Tag::new(b"post"),
    Tag::new(b"cvt "),
    Tag::new(b"fpgm"),
    Tag::new(b"glyf"),
    Tag::new(b"loca"),
    Tag::new(b"prep"),
    Tag::new(b"CFF "),
    Tag::new(b"VORG"),
    Tag::new(b"EBDT"),
    Tag::new(b"EBLC"),
    Tag::new(b"gasp"),
    Tag::new(b"hdmx"),
    Tag::new(b"kern"),
    Tag::new(b"LTSH"),
    Tag::new(b"PCLT"),
    Tag::new(b"VDMX"),
    Tag::new(b"vhea"),
    Tag::new(b"vmtx"),
    Tag::new(b"BASE"),
    Tag::new(b"GDEF"),
    Tag::new(b"GPOS"),
    Tag::new(b"GSUB"),
    Tag::new(b"EBSC"),
    Tag::new(b"JSTF"),
    Tag::new(b"MATH"),
    Tag::new(b"CBDT"),
    Tag::new(b"CBLC"),
    Tag::new(b"COLR"),
    Tag::new(b"CPAL"),
    Tag::new(b"SVG "),
    Tag::new(b"sbix"),
    Tag::new(b"acnt"),
    Tag::new(b"avar"),
    Tag::new(b"bdat"),
    Tag::new(b"bloc"),
    Tag::new(b"bsln"),
    Tag::new(b"cvar"),
    Tag::new(b"fdsc"),
    Tag::new(b"feat"),
    Tag::new(b"fmtx"),
    Tag::new(b"fvar"),
    Tag::new(b"gvar"),
    Tag::new(b"hsty"),
    Tag::new(b"just"),
    Tag::new(b"lcar"),
    Tag::new(b"mort"),
    Tag::new(b"morx"),
    Tag::new(b"opbd"),
    Tag::new(b"prop"),
    Tag::new(b"trak"),
    Tag::new(b"Zapf"),
    Tag::new(b"Silf"),
    Tag::new(b"Glat"),
    Tag::new(b"Gloc"),
    Tag::new(b"Feat"),
    Tag::new(b"Sill"),
];

/// A forward-only big-endian reader over one of the WOFF2 streams.
#[derive(Clone)]
pub(super) struct Stream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Stream<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Stream { data, pos: 0 }
    }

    fn malformed(&self, what: &str) -> ContainerError {
        ContainerError::malformed(
            Container::Woff2,
            format!("unexpected end of data reading {what} at {}", self.pos),
        )
    }

    pub(super) fn position(&self) -> usize {
        self.pos
    }

    pub(super) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ContainerError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.malformed("bytes"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(super) fn u8(&mut self) -> Result<u8, ContainerError> {
        Ok(self.bytes(1)?[0])
    }

    pub(super) fn u16(&mut self) -> Result<u16, ContainerError> {
        let raw = self.bytes(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub(super) fn i16(&mut self) -> Result<i16, ContainerError> {
        Ok(self.u16()? as i16)
    }

    pub(super) fn u32(&mut self) -> Result<u32, ContainerError> {
        let raw = self.bytes(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// <https://www.w3.org/TR/WOFF2/#UIntBase128>
    pub(super) fn base128(&mut self) -> Result<u32, ContainerError> {
        let mut accum = 0u32;
        for i in 0..5 {
            let byte = self.u8()?;
            // no leading zeros
            if i == 0 && byte == 0x80 {
                return Err(self.malformed("UIntBase128 with leading zero"));
            }
            if accum & 0xFE00_0000 != 0 {
                return Err(self.malformed("UIntBase128 overflow"));
            }
            accum = (accum << 7) | (byte & 0x7F) as u32;
            if byte & 0x80 == 0 {
                return Ok(accum);
            }
        }
        Err(self.malformed("UIntBase128 longer than five bytes"))
    }

    /// <https://www.w3.org/TR/WOFF2/#255UInt16>
    pub(super) fn u255(&mut self) -> Result<u16, ContainerError> {
        const WORD_CODE: u8 = 253;
        const ONE_MORE_BYTE_CODE2: u8 = 254;
        const ONE_MORE_BYTE_CODE1: u8 = 255;
        const LOWEST_U_CODE: u16 = 253;
        match self.u8()? {
            WORD_CODE => self.u16(),
            ONE_MORE_BYTE_CODE1 => Ok(self.u8()? as u16 + LOWEST_U_CODE),
            ONE_MORE_BYTE_CODE2 => Ok(self.u8()? as u16 + LOWEST_U_CODE * 2),
            code => Ok(code as u16),
        }
    }
}

pub(super) fn put_base128(out: &mut Vec<u8>, value: u32) {
    let mut size = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        size += 1;
        rest >>= 7;
    }
    for i in (0..size).rev() {
        let mut byte = ((value >> (7 * i)) & 0x7F) as u8;
        if i > 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
}

#[derive(Clone, Debug)]
struct Entry {
    tag: Tag,
    transform_version: u8,
    orig_length: u32,
    transform_length: Option<u32>,
}

impl Entry {
    fn stream_length(&self) -> usize {
        self.transform_length.unwrap_or(self.orig_length) as usize
    }

    fn read(stream: &mut Stream) -> Result<Self, ContainerError> {
        let flags = stream.u8()?;
        let tag_index = flags & 0x3F;
        let tag = if tag_index == ARBITRARY_TAG_INDEX {
            let raw = stream.bytes(4)?;
            Tag::new(&[raw[0], raw[1], raw[2], raw[3]])
        } else {
            KNOWN_TAGS[tag_index as usize]
        };
        let transform_version = flags >> 6;
        let orig_length = stream.base128()?;
        let has_transform_length = if tag == GLYF || tag == LOCA {
            transform_version == 0
        } else {
            transform_version != 0
        };
        let transform_length = if has_transform_length {
            Some(stream.base128()?)
        } else {
            None
        };
        Ok(Entry {
            tag,
            transform_version,
            orig_length,
            transform_length,
        })
    }
}

pub(super) fn decode(bytes: &[u8], cancel: &CancellationToken) -> Result<Sfnt, ContainerError> {
    let mut header = Stream::new(bytes);
    header.u32()?; // signature
    let flavor = header.u32()?;
    let length = header.u32()?;
    let num_tables = header.u16()?;
    header.u16()?; // reserved
    let total_sfnt_size = header.u32()?;
    let total_compressed_size = header.u32()?;
    header.bytes(HEADER_LEN - header.position())?;

    if flavor == COLLECTION_SIGNATURE {
        return Err(ContainerError::Unsupported {
            container: Container::Woff2,
            reason: "font collections are not supported",
        });
    }
    if length as usize > bytes.len() {
        return Err(ContainerError::malformed(
            Container::Woff2,
            format!("header length {length} exceeds file size {}", bytes.len()),
        ));
    }

    let entries = (0..num_tables)
        .map(|_| Entry::read(&mut header))
        .collect::<Result<Vec<_>, _>>()?;
    let compressed = header.bytes(total_compressed_size as usize)?;

    let expected: u64 = entries.iter().map(|e| e.stream_length() as u64).sum();
    if expected > MAX_DECODED_SIZE {
        return Err(ContainerError::malformed(
            Container::Woff2,
            format!("table directory claims {expected} bytes of table data"),
        ));
    }
    let expected = expected as usize;
    let mut stream = Vec::with_capacity(inflate_capacity(expected, compressed.len()));
    DecompressorReader::new(compressed)
        .take(expected as u64 + 1)
        .read_to_end(&mut stream)?;
    if stream.len() != expected {
        return Err(ContainerError::malformed(
            Container::Woff2,
            format!(
                "decompressed {} bytes, table directory expects {expected}",
                stream.len()
            ),
        ));
    }
    log::debug!(
        "woff2: {num_tables} tables, {total_compressed_size} compressed bytes, sfnt size {total_sfnt_size}"
    );

    let mut sfnt = Sfnt::new(flavor);
    let mut transformed_glyf = None;
    let mut transformed_loca = None;
    let mut transformed_hmtx = None;
    let mut offset = 0;
    for entry in &entries {
        cancel.check()?;
        let data = &stream[offset..offset + entry.stream_length()];
        offset += entry.stream_length();
        match entry.tag {
            _ if entry.transform_length.is_none() => sfnt.insert(entry.tag, data.to_vec()),
            tag if tag == GLYF => transformed_glyf = Some(data),
            tag if tag == LOCA => transformed_loca = Some(entry),
            tag if tag == HMTX && entry.transform_version == 1 => transformed_hmtx = Some(data),
            tag => {
                return Err(ContainerError::malformed(
                    Container::Woff2,
                    format!(
                        "unknown transform version {} for table '{tag}'",
                        entry.transform_version
                    ),
                ))
            }
        }
    }

    let x_mins = match (transformed_glyf, transformed_loca) {
        (Some(glyf), Some(loca)) => {
            cancel.check()?;
            let glyphs = woff2_glyf::reconstruct(glyf)?;
            if glyphs.loca.len() != loca.orig_length as usize {
                return Err(ContainerError::malformed(
                    Container::Woff2,
                    format!(
                        "reconstructed loca is {} bytes, directory says {}",
                        glyphs.loca.len(),
                        loca.orig_length
                    ),
                ));
            }
            if let Some(head) = sfnt.remove(HEAD) {
                sfnt.insert(HEAD, with_index_to_loc_format(head, glyphs.index_format)?);
            }
            sfnt.insert(GLYF, glyphs.glyf);
            sfnt.insert(LOCA, glyphs.loca);
            Some(glyphs.x_mins)
        }
        (None, None) => None,
        _ => {
            return Err(ContainerError::malformed(
                Container::Woff2,
                "glyf and loca must both be transformed or both untransformed",
            ))
        }
    };

    if let Some(hmtx) = transformed_hmtx {
        cancel.check()?;
        let x_mins = x_mins.as_deref().ok_or_else(|| {
            ContainerError::malformed(Container::Woff2, "transformed hmtx requires transformed glyf")
        })?;
        let num_hmetrics = read_u16_at(&sfnt, HHEA, 34)?;
        let num_glyphs = read_u16_at(&sfnt, MAXP, 4)?;
        let table = woff2_glyf::reconstruct_hmtx(hmtx, num_glyphs, num_hmetrics, x_mins)?;
        sfnt.insert(HMTX, table);
    }
    Ok(sfnt)
}

fn read_u16_at(sfnt: &Sfnt, tag: Tag, offset: usize) -> Result<u16, ContainerError> {
    sfnt.table(tag)
        .and_then(|table| table.get(offset..offset + 2))
        .map(|raw| u16::from_be_bytes([raw[0], raw[1]]))
        .ok_or_else(|| {
            ContainerError::malformed(Container::Woff2, format!("missing or short '{tag}' table"))
        })
}

fn with_index_to_loc_format(mut head: Vec<u8>, index_format: u16) -> Result<Vec<u8>, ContainerError> {
    let field = head
        .get_mut(HEAD_INDEX_TO_LOC_FORMAT..HEAD_INDEX_TO_LOC_FORMAT + 2)
        .ok_or_else(|| ContainerError::malformed(Container::Woff2, "head table is too short"))?;
    field.copy_from_slice(&index_format.to_be_bytes());
    Ok(head)
}

/// Tag order with `loca` immediately after `glyf`, as the format requires.
fn directory_order(sfnt: &Sfnt) -> Vec<Tag> {
    let mut tags: Vec<_> = sfnt
        .tables()
        .map(|(tag, _)| tag)
        .filter(|tag| *tag != LOCA || !sfnt.contains(GLYF))
        .collect();
    if sfnt.contains(GLYF) && sfnt.contains(LOCA) {
        if let Some(pos) = tags.iter().position(|tag| *tag == GLYF) {
            tags.insert(pos + 1, LOCA);
        }
    }
    tags
}

pub(super) fn encode(sfnt: &Sfnt, cancel: &CancellationToken) -> Result<Vec<u8>, ContainerError> {
    let order = directory_order(sfnt);
    let mut directory = Vec::new();
    let mut stream = Vec::new();
    for tag in &order {
        cancel.check()?;
        let Some(table) = sfnt.table(*tag) else {
            continue;
        };
        let transform = if *tag == GLYF || *tag == LOCA {
            NULL_GLYF_TRANSFORM << 6
        } else {
            0
        };
        match KNOWN_TAGS.iter().position(|known| known == tag) {
            Some(index) => directory.put_u8(index as u8 | transform),
            None => {
                directory.put_u8(ARBITRARY_TAG_INDEX | transform);
                directory.put_tag(*tag);
            }
        }
        put_base128(&mut directory, table.len() as u32);
        stream.extend_from_slice(table);
    }

    let mut compressor = CompressorWriter::new(Vec::new());
    compressor.write_all(&stream)?;
    let compressed = compressor
        .into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    log::debug!(
        "woff2: compressed {} table bytes to {}",
        stream.len(),
        compressed.len()
    );

    let mut out = Vec::with_capacity(HEADER_LEN + directory.len() + compressed.len() + 3);
    out.put_u32(WOFF2_SIGNATURE);
    out.put_u32(sfnt.flavor());
    out.put_u32(0); // length, patched below
    out.put_u16(order.len() as u16);
    out.put_u16(0); // reserved
    out.put_u32(sfnt.sfnt_size() as u32);
    out.put_u32(compressed.len() as u32);
    out.put_u16(1); // majorVersion
    out.put_u16(0); // minorVersion
    for _ in 0..5 {
        // metadata and private blocks
        out.put_u32(0);
    }
    out.extend_from_slice(&directory);
    out.extend_from_slice(&compressed);
    out.pad4();
    let total = out.len() as u32;
    out[8..12].copy_from_slice(&total.to_be_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use font_test_data::FontSpec;
    use rstest::rstest;

    use super::*;

    fn sample() -> Sfnt {
        Sfnt::read(&FontSpec::default().build(), &CancellationToken::new()).unwrap()
    }

    #[rstest]
    #[case(0, &[0x00])]
    #[case(127, &[0x7F])]
    #[case(128, &[0x81, 0x00])]
    #[case(16383, &[0xFF, 0x7F])]
    #[case(0x0FFF_FFFF, &[0xFF, 0xFF, 0xFF, 0x7F])]
    fn base128(#[case] value: u32, #[case] encoded: &[u8]) {
        let mut out = Vec::new();
        put_base128(&mut out, value);
        assert_eq!(out, encoded);
        assert_eq!(Stream::new(encoded).base128().unwrap(), value);
    }

    #[test]
    fn base128_rejects_leading_zero() {
        assert!(Stream::new(&[0x80, 0x01]).base128().is_err());
        assert!(Stream::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F])
            .base128()
            .is_err());
    }

    #[rstest]
    #[case(&[0x05], 5)]
    #[case(&[0xFF, 0x00], 253)]
    #[case(&[0xFF, 0x02], 255)]
    #[case(&[0xFE, 0x00], 506)]
    #[case(&[0xFD, 0x01, 0x00], 256)]
    fn u255(#[case] encoded: &[u8], #[case] value: u16) {
        assert_eq!(Stream::new(encoded).u255().unwrap(), value);
    }

    #[test]
    fn loca_follows_glyf() {
        let order = directory_order(&sample());
        let glyf = order.iter().position(|t| *t == GLYF).unwrap();
        assert_eq!(order[glyf + 1], LOCA);
        assert_eq!(order.len(), sample().num_tables());
    }

    #[test]
    fn null_transform_round_trip() {
        let sfnt = sample();
        let encoded = encode(&sfnt, &CancellationToken::new()).unwrap();
        assert_eq!(&encoded[..4], b"wOF2");
        assert_eq!(encoded.len() % 4, 0);
        assert_eq!(
            u32::from_be_bytes(encoded[8..12].try_into().unwrap()) as usize,
            encoded.len()
        );
        let decoded = decode(&encoded, &CancellationToken::new()).unwrap();
        assert_eq!(decoded, sfnt);
    }

    #[test]
    fn arbitrary_tags_survive() {
        let mut sfnt = sample();
        sfnt.insert(Tag::new(b"Zzzz"), vec![1, 2, 3]);
        let encoded = encode(&sfnt, &CancellationToken::new()).unwrap();
        let decoded = decode(&encoded, &CancellationToken::new()).unwrap();
        assert_eq!(decoded.table(Tag::new(b"Zzzz")), Some([1u8, 2, 3].as_slice()));
    }

    #[test]
    fn truncated_stream_is_malformed() {
        let encoded = encode(&sample(), &CancellationToken::new()).unwrap();
        assert!(decode(&encoded[..60], &CancellationToken::new()).is_err());
    }

    #[test]
    fn oversized_directory_is_malformed() {
        let num_tables = 300u16;
        let mut bytes = Vec::new();
        bytes.put_u32(WOFF2_SIGNATURE);
        bytes.put_u32(crate::format::TRUETYPE_SIGNATURE);
        bytes.put_u32(0); // length, patched below
        bytes.put_u16(num_tables);
        bytes.put_u16(0);
        bytes.put_u32(0); // totalSfntSize
        bytes.put_u32(0); // totalCompressedSize
        bytes.resize(HEADER_LEN, 0);
        for i in 0..num_tables {
            bytes.put_u8(ARBITRARY_TAG_INDEX);
            bytes.put_tag(Tag::new(&[b'X', b'X', (i >> 8) as u8, i as u8]));
            put_base128(&mut bytes, u32::MAX);
        }
        let len = bytes.len() as u32;
        bytes[8..12].copy_from_slice(&len.to_be_bytes());

        assert!(matches!(
            decode(&bytes, &CancellationToken::new()),
            Err(ContainerError::Malformed {
                container: Container::Woff2,
                ..
            })
        ));
    }
}
