//! WOFF 1.0: <https://www.w3.org/TR/WOFF/>

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use read_fonts::{types::Tag, FontData};

use super::{
    inflate_capacity, table_checksum, ContainerError, Sfnt, WriteBe, MAX_DECODED_SIZE,
};
use crate::{
    cancel::CancellationToken,
    format::{Container, WOFF_SIGNATURE},
};

const HEADER_LEN: usize = 44;
const ENTRY_LEN: usize = 20;

pub(super) fn decode(bytes: &[u8], cancel: &CancellationToken) -> Result<Sfnt, ContainerError> {
    let data = FontData::new(bytes);
    let flavor: u32 = data.read_at(4)?;
    let length: u32 = data.read_at(8)?;
    let num_tables: u16 = data.read_at(12)?;
    if length as usize > bytes.len() {
        return Err(ContainerError::malformed(
            Container::Woff,
            format!("header length {length} exceeds file size {}", bytes.len()),
        ));
    }

    let mut sfnt = Sfnt::new(flavor);
    let mut decoded_size = 0u64;
    for i in 0..num_tables as usize {
        cancel.check()?;
        let entry = HEADER_LEN + i * ENTRY_LEN;
        let tag: Tag = data.read_at(entry)?;
        let offset: u32 = data.read_at(entry + 4)?;
        let comp_length: u32 = data.read_at(entry + 8)?;
        let orig_length: u32 = data.read_at(entry + 12)?;
        decoded_size += orig_length as u64;
        if decoded_size > MAX_DECODED_SIZE {
            return Err(ContainerError::malformed(
                Container::Woff,
                format!("table directory claims more than {MAX_DECODED_SIZE} bytes"),
            ));
        }

        let start = offset as usize;
        let stored = start
            .checked_add(comp_length as usize)
            .and_then(|end| bytes.get(start..end))
            .ok_or_else(|| {
                ContainerError::malformed(Container::Woff, format!("table '{tag}' out of bounds"))
            })?;

        let table = match comp_length.cmp(&orig_length) {
            std::cmp::Ordering::Equal => stored.to_vec(),
            std::cmp::Ordering::Less => inflate(stored, orig_length as usize, tag)?,
            std::cmp::Ordering::Greater => {
                return Err(ContainerError::malformed(
                    Container::Woff,
                    format!("table '{tag}' compressed length exceeds original length"),
                ))
            }
        };
        log::trace!("woff table '{tag}': {comp_length} -> {orig_length} bytes");
        sfnt.insert(tag, table);
    }
    Ok(sfnt)
}

fn inflate(stored: &[u8], orig_length: usize, tag: Tag) -> Result<Vec<u8>, ContainerError> {
    let mut table = Vec::with_capacity(inflate_capacity(orig_length, stored.len()));
    ZlibDecoder::new(stored)
        .take(orig_length as u64 + 1)
        .read_to_end(&mut table)?;
    if table.len() != orig_length {
        return Err(ContainerError::malformed(
            Container::Woff,
            format!(
                "table '{tag}' inflated to {} bytes, expected {orig_length}",
                table.len()
            ),
        ));
    }
    Ok(table)
}

pub(super) fn encode(sfnt: &Sfnt, cancel: &CancellationToken) -> Result<Vec<u8>, ContainerError> {
    let num_tables = sfnt.num_tables();
    let data_start = HEADER_LEN + num_tables * ENTRY_LEN;
    let mut directory = Vec::with_capacity(num_tables * ENTRY_LEN);
    let mut body = Vec::new();

    for (tag, table) in sfnt.tables() {
        cancel.check()?;
        let compressed = deflate(table)?;
        // a table is only stored compressed when that actually saves space
        let stored = if compressed.len() < table.len() {
            compressed.as_slice()
        } else {
            table
        };
        directory.put_tag(tag);
        directory.put_u32((data_start + body.len()) as u32);
        directory.put_u32(stored.len() as u32);
        directory.put_u32(table.len() as u32);
        directory.put_u32(table_checksum(tag, table));
        body.extend_from_slice(stored);
        body.pad4();
    }

    let total_len = data_start + body.len();
    let mut out = Vec::with_capacity(total_len);
    out.put_u32(WOFF_SIGNATURE);
    out.put_u32(sfnt.flavor());
    out.put_u32(total_len as u32);
    out.put_u16(num_tables as u16);
    out.put_u16(0); // reserved
    out.put_u32(sfnt.sfnt_size() as u32);
    out.put_u16(1); // majorVersion
    out.put_u16(0); // minorVersion
    for _ in 0..5 {
        // metadata and private blocks: offset, length (, origLength)
        out.put_u32(0);
    }
    out.extend_from_slice(&directory);
    out.extend_from_slice(&body);
    Ok(out)
}

fn deflate(table: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(table)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use font_test_data::FontSpec;

    use super::*;
    use crate::container::GLYF;

    fn sample() -> Sfnt {
        Sfnt::read(&FontSpec::default().build(), &CancellationToken::new()).unwrap()
    }

    #[test]
    fn header_fields() {
        let sfnt = sample();
        let woff = encode(&sfnt, &CancellationToken::new()).unwrap();
        let data = FontData::new(&woff);
        assert_eq!(data.read_at::<u32>(0).unwrap(), WOFF_SIGNATURE);
        assert_eq!(data.read_at::<u32>(8).unwrap() as usize, woff.len());
        assert_eq!(
            data.read_at::<u16>(12).unwrap() as usize,
            sfnt.num_tables()
        );
        assert_eq!(
            data.read_at::<u32>(16).unwrap() as usize,
            sfnt.sfnt_size()
        );
        assert_eq!(woff.len() % 4, 0);
    }

    #[test]
    fn decode_restores_every_table() {
        let sfnt = sample();
        let woff = encode(&sfnt, &CancellationToken::new()).unwrap();
        let decoded = decode(&woff, &CancellationToken::new()).unwrap();
        assert_eq!(decoded, sfnt);
    }

    #[test]
    fn compresses_repetitive_tables() {
        let mut sfnt = Sfnt::new(crate::format::TRUETYPE_SIGNATURE);
        sfnt.insert(GLYF, vec![0u8; 4096]);
        let woff = encode(&sfnt, &CancellationToken::new()).unwrap();
        let data = FontData::new(&woff);
        let comp_length: u32 = data.read_at(HEADER_LEN + 8).unwrap();
        let orig_length: u32 = data.read_at(HEADER_LEN + 12).unwrap();
        assert_eq!(orig_length, 4096);
        assert!(comp_length < orig_length);
    }

    #[test]
    fn truncated_table_is_malformed() {
        let woff = encode(&sample(), &CancellationToken::new()).unwrap();
        let truncated = &woff[..woff.len() - 64];
        let mut patched = truncated.to_vec();
        // keep the header length consistent so we fail on the table itself
        patched[8..12].copy_from_slice(&(truncated.len() as u32).to_be_bytes());
        assert!(matches!(
            decode(&patched, &CancellationToken::new()),
            Err(ContainerError::Malformed {
                container: Container::Woff,
                ..
            })
        ));
    }

    #[test]
    fn oversized_table_is_malformed() {
        let data_start = HEADER_LEN + ENTRY_LEN;
        let mut woff = Vec::new();
        woff.put_u32(WOFF_SIGNATURE);
        woff.put_u32(crate::format::TRUETYPE_SIGNATURE);
        woff.put_u32((data_start + 4) as u32);
        woff.put_u16(1);
        woff.resize(HEADER_LEN, 0);
        woff.put_tag(GLYF);
        woff.put_u32(data_start as u32);
        woff.put_u32(4); // compLength
        woff.put_u32(0xFFFF_FFF0); // origLength
        woff.put_u32(0);
        woff.extend_from_slice(&[0x78, 0x9c, 0x03, 0x00]);

        assert!(matches!(
            decode(&woff, &CancellationToken::new()),
            Err(ContainerError::Malformed {
                container: Container::Woff,
                ..
            })
        ));
    }
}
