//! Embedded OpenType: <https://www.w3.org/submissions/EOT/>
//!
//! We write version 0x00020001 headers around an uncompressed sfnt. On
//! read, XOR obfuscated payloads are supported; MicroType Express
//! compressed payloads are not.

use read_fonts::{FontRef, TableProvider};

use super::{ContainerError, Sfnt};
use crate::{
    cancel::CancellationToken,
    format::{Container, EOT_MAGIC},
};

const VERSION: u32 = 0x0002_0001;
const DEFAULT_CHARSET: u8 = 1;
const TTEMBED_TTCOMPRESSED: u32 = 0x0000_0004;
const TTEMBED_XORENCRYPTDATA: u32 = 0x1000_0000;
const XOR_KEY: u8 = 0x50;
const MAGIC_OFFSET: usize = 34;
const MAX_NAME_UNITS: usize = u16::MAX as usize / 2;

/// The names written into the EOT header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct EotNames {
    pub family: String,
    pub style: String,
    pub version: String,
    pub full_name: String,
}

trait WriteLe {
    fn put_u16_le(&mut self, value: u16);
    fn put_u32_le(&mut self, value: u32);
    fn put_name(&mut self, name: &str);
}

impl WriteLe for Vec<u8> {
    fn put_u16_le(&mut self, value: u16) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32_le(&mut self, value: u32) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    /// Size-prefixed UTF-16LE, not NUL terminated. Names too long for the
    /// u16 byte count are cut at a character boundary.
    fn put_name(&mut self, name: &str) {
        let mut units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > MAX_NAME_UNITS {
            units.truncate(MAX_NAME_UNITS);
            if units.last().is_some_and(|u| (0xD800..0xDC00).contains(u)) {
                units.pop();
            }
        }
        self.put_u16_le((units.len() * 2) as u16);
        for unit in units {
            self.put_u16_le(unit);
        }
    }
}

/// The OS/2 derived header fields, with defaults for fonts without OS/2.
struct Os2Fields {
    panose: [u8; 10],
    italic: bool,
    weight: u16,
    fs_type: u16,
    unicode_range: [u32; 4],
    code_page_range: [u32; 2],
}

impl Os2Fields {
    fn new(font: &FontRef) -> Self {
        let Ok(os2) = font.os2() else {
            return Os2Fields {
                panose: [0; 10],
                italic: false,
                weight: 400,
                fs_type: 0,
                unicode_range: [0; 4],
                code_page_range: [0; 2],
            };
        };
        let mut panose = [0u8; 10];
        let raw = os2.panose_10();
        let len = raw.len().min(10);
        panose[..len].copy_from_slice(&raw[..len]);
        Os2Fields {
            panose,
            italic: os2
                .fs_selection()
                .contains(read_fonts::tables::os2::SelectionFlags::ITALIC),
            weight: os2.us_weight_class(),
            fs_type: os2.fs_type(),
            unicode_range: [
                os2.ul_unicode_range_1(),
                os2.ul_unicode_range_2(),
                os2.ul_unicode_range_3(),
                os2.ul_unicode_range_4(),
            ],
            code_page_range: [
                os2.ul_code_page_range_1().unwrap_or_default(),
                os2.ul_code_page_range_2().unwrap_or_default(),
            ],
        }
    }
}

pub(super) fn encode(
    sfnt: &Sfnt,
    names: &EotNames,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ContainerError> {
    cancel.check()?;
    let font_data = sfnt.to_bytes();
    let font = FontRef::new(&font_data)?;
    let os2 = Os2Fields::new(&font);
    let checksum_adjustment = font.head()?.checksum_adjustment();

    let mut out = Vec::with_capacity(font_data.len() + 256);
    out.put_u32_le(0); // EOTSize, patched below
    out.put_u32_le(font_data.len() as u32);
    out.put_u32_le(VERSION);
    out.put_u32_le(0); // Flags
    out.extend_from_slice(&os2.panose);
    out.push(DEFAULT_CHARSET);
    out.push(os2.italic as u8);
    out.put_u32_le(os2.weight as u32);
    out.put_u16_le(os2.fs_type);
    out.put_u16_le(EOT_MAGIC);
    for range in os2.unicode_range {
        out.put_u32_le(range);
    }
    for range in os2.code_page_range {
        out.put_u32_le(range);
    }
    out.put_u32_le(checksum_adjustment);
    for _ in 0..4 {
        out.put_u32_le(0); // Reserved1-4
    }
    for name in [
        names.family.as_str(),
        names.style.as_str(),
        names.version.as_str(),
        names.full_name.as_str(),
    ] {
        out.put_u16_le(0); // padding
        out.put_name(name);
    }
    out.put_u16_le(0); // padding
    out.put_name(""); // RootString
    out.extend_from_slice(&font_data);

    let total = out.len() as u32;
    out[..4].copy_from_slice(&total.to_le_bytes());
    Ok(out)
}

pub(super) fn decode(bytes: &[u8], cancel: &CancellationToken) -> Result<Sfnt, ContainerError> {
    let eot_size = read_u32_le(bytes, 0)? as usize;
    let font_data_size = read_u32_le(bytes, 4)? as usize;
    let version = read_u32_le(bytes, 8)?;
    let flags = read_u32_le(bytes, 12)?;
    log::debug!("eot: version {version:#010x}, flags {flags:#010x}");

    if eot_size > bytes.len() || font_data_size > eot_size {
        return Err(ContainerError::malformed(
            Container::Eot,
            format!(
                "sizes (eot {eot_size}, font data {font_data_size}) exceed file size {}",
                bytes.len()
            ),
        ));
    }
    if flags & TTEMBED_TTCOMPRESSED != 0 {
        return Err(ContainerError::Unsupported {
            container: Container::Eot,
            reason: "MicroType Express compressed font data",
        });
    }
    let start = eot_size - font_data_size;
    if start <= MAGIC_OFFSET {
        return Err(ContainerError::malformed(
            Container::Eot,
            "font data overlaps the header",
        ));
    }
    let mut payload = bytes[start..eot_size].to_vec();
    if flags & TTEMBED_XORENCRYPTDATA != 0 {
        payload.iter_mut().for_each(|byte| *byte ^= XOR_KEY);
    }
    Sfnt::read(&payload, cancel)
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32, ContainerError> {
    bytes
        .get(offset..offset + 4)
        .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .ok_or_else(|| ContainerError::malformed(Container::Eot, "truncated header"))
}

#[cfg(test)]
mod tests {
    use font_test_data::FontSpec;

    use super::*;
    use crate::container::GLYF;

    fn names() -> EotNames {
        EotNames {
            family: "Acme Sans".into(),
            style: "Regular".into(),
            version: "Version 1.000".into(),
            full_name: "Acme Sans Regular".into(),
        }
    }

    fn sample() -> Sfnt {
        Sfnt::read(&FontSpec::default().build(), &CancellationToken::new()).unwrap()
    }

    fn le32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn header_layout() {
        let sfnt = sample();
        let eot = encode(&sfnt, &names(), &CancellationToken::new()).unwrap();
        assert_eq!(Container::sniff(&eot), Some(Container::Eot));
        assert_eq!(le32(&eot, 0) as usize, eot.len());
        assert_eq!(le32(&eot, 4) as usize, sfnt.sfnt_size());
        assert_eq!(le32(&eot, 8), VERSION);
        // weight from OS/2
        assert_eq!(le32(&eot, 28), 400);
        // family name immediately after Padding1
        let family_len = u16::from_le_bytes([eot[82], eot[83]]) as usize;
        assert_eq!(family_len, "Acme Sans".len() * 2);
        let family: Vec<u16> = eot[84..84 + family_len]
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&family).unwrap(), "Acme Sans");
    }

    #[test]
    fn long_names_are_cut() {
        let mut out = Vec::new();
        out.put_name(&"a".repeat(40_000));
        let size = u16::from_le_bytes([out[0], out[1]]) as usize;
        assert_eq!(size, MAX_NAME_UNITS * 2);
        assert_eq!(out.len(), 2 + size);

        // a surrogate pair straddling the limit is dropped whole
        let mut out = Vec::new();
        let name = format!("{}\u{1F600}", "a".repeat(MAX_NAME_UNITS - 1));
        out.put_name(&name);
        let size = u16::from_le_bytes([out[0], out[1]]) as usize;
        assert_eq!(size, (MAX_NAME_UNITS - 1) * 2);
    }

    #[test]
    fn header_checksum_adjustment_matches_payload() {
        let sfnt = sample();
        let eot = encode(&sfnt, &names(), &CancellationToken::new()).unwrap();
        let payload = &eot[eot.len() - le32(&eot, 4) as usize..];
        assert_eq!(crate::container::checksum(payload), 0xB1B0_AFBA);
        let font = FontRef::new(payload).unwrap();
        assert_eq!(le32(&eot, 60), font.head().unwrap().checksum_adjustment());
    }

    #[test]
    fn decode_returns_payload_tables() {
        let sfnt = sample();
        let eot = encode(&sfnt, &names(), &CancellationToken::new()).unwrap();
        let decoded = decode(&eot, &CancellationToken::new()).unwrap();
        assert_eq!(decoded.table(GLYF), sfnt.table(GLYF));
        assert_eq!(decoded.flavor(), sfnt.flavor());
    }

    #[test]
    fn xor_obfuscated_payload() {
        let mut eot = encode(&sample(), &names(), &CancellationToken::new()).unwrap();
        let font_start = eot.len() - le32(&eot, 4) as usize;
        eot[12..16].copy_from_slice(&TTEMBED_XORENCRYPTDATA.to_le_bytes());
        eot[font_start..].iter_mut().for_each(|b| *b ^= XOR_KEY);
        let decoded = decode(&eot, &CancellationToken::new()).unwrap();
        assert_eq!(decoded.num_tables(), sample().num_tables());
    }

    #[test]
    fn mtx_is_unsupported() {
        let mut eot = encode(&sample(), &names(), &CancellationToken::new()).unwrap();
        eot[12..16].copy_from_slice(&TTEMBED_TTCOMPRESSED.to_le_bytes());
        assert!(matches!(
            decode(&eot, &CancellationToken::new()),
            Err(ContainerError::Unsupported {
                container: Container::Eot,
                ..
            })
        ));
    }
}
