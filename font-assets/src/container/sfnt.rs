//! Bare sfnt (TTF/OTF) reading and writing.

use std::{borrow::Cow, collections::BTreeMap};

use read_fonts::{types::Tag, FontRef};
use write_fonts::FontBuilder;

use super::{
    checksum, round4, ContainerError, CFF, CFF2, GLYF, HEAD, HEAD_CHECKSUM_ADJUSTMENT,
};
use crate::{cancel::CancellationToken, format::CFF_SIGNATURE};

const TABLE_RECORD_LEN: usize = 16;
const SFNT_HEADER_LEN: usize = 12;
const CHECKSUM_MAGIC: u32 = 0xB1B0_AFBA;

/// The flavor and tables of a single font.
///
/// Table bytes are held exactly as they were found in the source container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sfnt {
    flavor: u32,
    tables: BTreeMap<Tag, Vec<u8>>,
}

impl Sfnt {
    pub fn new(flavor: u32) -> Self {
        Sfnt {
            flavor,
            tables: BTreeMap::new(),
        }
    }

    /// Read the tables of a bare sfnt.
    pub fn read(bytes: &[u8], cancel: &CancellationToken) -> Result<Self, ContainerError> {
        let font = FontRef::new(bytes)?;
        Self::from_font(&font, cancel)
    }

    pub fn from_font(font: &FontRef, cancel: &CancellationToken) -> Result<Self, ContainerError> {
        let mut sfnt = Sfnt::new(font.table_directory.sfnt_version());
        for record in font.table_directory.table_records() {
            cancel.check()?;
            let tag = record.tag();
            let data = font
                .table_data(tag)
                .ok_or(read_fonts::ReadError::TableIsMissing(tag))?;
            sfnt.insert(tag, data.as_bytes().to_vec());
        }
        Ok(sfnt)
    }

    pub fn flavor(&self) -> u32 {
        self.flavor
    }

    pub fn set_flavor(&mut self, flavor: u32) {
        self.flavor = flavor;
    }

    pub fn table(&self, tag: Tag) -> Option<&[u8]> {
        self.tables.get(&tag).map(Vec::as_slice)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.tables.contains_key(&tag)
    }

    pub fn insert(&mut self, tag: Tag, data: Vec<u8>) {
        self.tables.insert(tag, data);
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Vec<u8>> {
        self.tables.remove(&tag)
    }

    /// Tables in tag order.
    pub fn tables(&self) -> impl Iterator<Item = (Tag, &[u8])> + '_ {
        self.tables.iter().map(|(tag, data)| (*tag, data.as_slice()))
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn has_cff_outlines(&self) -> bool {
        self.contains(CFF) || self.contains(CFF2)
    }

    pub fn has_truetype_outlines(&self) -> bool {
        self.contains(GLYF)
    }

    /// The size of this font written as a bare sfnt.
    pub fn sfnt_size(&self) -> usize {
        SFNT_HEADER_LEN
            + self.tables.len() * TABLE_RECORD_LEN
            + self.tables.values().map(|t| round4(t.len())).sum::<usize>()
    }

    /// Assemble the tables into a bare sfnt, recomputing the table
    /// directory and `head.checkSumAdjustment`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut builder = FontBuilder::new();
        for (tag, data) in &self.tables {
            let data = if *tag == HEAD && data.len() >= HEAD_CHECKSUM_ADJUSTMENT + 4 {
                let mut head = data.clone();
                head[HEAD_CHECKSUM_ADJUSTMENT..HEAD_CHECKSUM_ADJUSTMENT + 4].fill(0);
                Cow::Owned(head)
            } else {
                Cow::Borrowed(data.as_slice())
            };
            builder.add_raw(write_fonts::types::Tag::new(&tag.to_be_bytes()), data);
        }
        let mut bytes = builder.build();
        // the builder always writes the TrueType version
        bytes[..4].copy_from_slice(&self.flavor.to_be_bytes());
        if let Some(head_offset) = table_offset(&bytes, HEAD) {
            let pos = head_offset + HEAD_CHECKSUM_ADJUSTMENT;
            if bytes.len() >= pos + 4 {
                // the builder has already written its own adjustment
                bytes[pos..pos + 4].fill(0);
                let adjustment = CHECKSUM_MAGIC.wrapping_sub(checksum(&bytes));
                bytes[pos..pos + 4].copy_from_slice(&adjustment.to_be_bytes());
            }
        }
        bytes
    }

    /// Whether this font would be written with the `OTTO` signature.
    pub fn is_cff_flavored(&self) -> bool {
        self.flavor == CFF_SIGNATURE
    }
}

/// Find the offset of a table in a freshly assembled sfnt.
fn table_offset(bytes: &[u8], tag: Tag) -> Option<usize> {
    let num_tables = u16::from_be_bytes(bytes.get(4..6)?.try_into().ok()?) as usize;
    (0..num_tables).find_map(|i| {
        let record = bytes.get(SFNT_HEADER_LEN + i * TABLE_RECORD_LEN..)?;
        let record_tag = Tag::new(record.get(..4)?.try_into().ok()?);
        if record_tag != tag {
            return None;
        }
        Some(u32::from_be_bytes(record.get(8..12)?.try_into().ok()?) as usize)
    })
}

#[cfg(test)]
mod tests {
    use font_test_data::FontSpec;
    use read_fonts::TableProvider;

    use super::*;
    use crate::{container::HMTX, format::TRUETYPE_SIGNATURE};

    #[test]
    fn read_then_write_preserves_tables() {
        let bytes = FontSpec::default().build();
        let sfnt = Sfnt::read(&bytes, &CancellationToken::new()).unwrap();
        assert_eq!(sfnt.flavor(), TRUETYPE_SIGNATURE);

        let written = sfnt.to_bytes();
        let font = FontRef::new(&written).unwrap();
        for tag in [GLYF, HMTX] {
            assert_eq!(
                font.table_data(tag).unwrap().as_bytes(),
                sfnt.table(tag).unwrap(),
                "{tag}"
            );
        }
        assert_eq!(written.len(), sfnt.sfnt_size());
    }

    #[test]
    fn whole_font_checksum_is_magic() {
        let bytes = FontSpec::default().build();
        let written = Sfnt::read(&bytes, &CancellationToken::new())
            .unwrap()
            .to_bytes();
        assert_eq!(checksum(&written), CHECKSUM_MAGIC);
        // and head still parses
        let font = FontRef::new(&written).unwrap();
        assert_eq!(font.head().unwrap().units_per_em(), 1000);
    }

    #[test]
    fn checksum_is_magic_after_flavor_change() {
        let bytes = FontSpec {
            cff: true,
            ..Default::default()
        }
        .build();
        let mut sfnt = Sfnt::read(&bytes, &CancellationToken::new()).unwrap();
        let cff = sfnt.to_bytes();
        assert_eq!(checksum(&cff), CHECKSUM_MAGIC);

        sfnt.set_flavor(TRUETYPE_SIGNATURE);
        let written = sfnt.to_bytes();
        assert_eq!(checksum(&written), CHECKSUM_MAGIC);
        // writing twice gives the same bytes
        let again = Sfnt::read(&written, &CancellationToken::new())
            .unwrap()
            .to_bytes();
        assert_eq!(again, written);
    }

    #[test]
    fn keeps_cff_flavor() {
        let bytes = FontSpec {
            cff: true,
            ..Default::default()
        }
        .build();
        let sfnt = Sfnt::read(&bytes, &CancellationToken::new()).unwrap();
        assert!(sfnt.has_cff_outlines());
        assert!(sfnt.is_cff_flavored());
        assert_eq!(&sfnt.to_bytes()[..4], b"OTTO");
    }

    #[test]
    fn cancelled_between_tables() {
        let bytes = FontSpec::default().build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            Sfnt::read(&bytes, &cancel),
            Err(ContainerError::Cancelled(_))
        ));
    }
}
