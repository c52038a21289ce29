//! Fixture fonts for the font-assets tests.
//!
//! Fonts are assembled table by table from a [`FontSpec`], so a test can ask
//! for exactly the names, weights, axes and outline flavor it cares about.

mod bebuffer;

pub use bebuffer::BeBuffer;

/// `head.created` for every fixture: 2024-01-01T00:00:00Z in seconds since 1904.
pub const CREATED: i64 = 1_704_067_200 + 2_082_844_800;
pub const UNITS_PER_EM: u16 = 1000;
pub const ASCENDER: i16 = 800;
pub const DESCENDER: i16 = -200;

/// Code points mapped by every fixture, with their glyph ids.
pub const MAPPED: [(char, u16); 2] = [('A', 1), ('B', 2)];
/// Advance widths by glyph id.
pub const ADVANCES: [u16; 3] = [500, 600, 600];

const NOTDEF: &[(i16, i16)] = &[(50, 0), (50, 700), (450, 700), (450, 0)];
const SQUARE: &[(i16, i16)] = &[(0, 0), (0, 500), (500, 500), (500, 0)];
const TRIANGLE: &[(i16, i16)] = &[(0, 0), (250, 500), (500, 0)];

const FS_SELECTION_ITALIC: u16 = 1 << 0;
const FS_SELECTION_REGULAR: u16 = 1 << 6;
const FS_SELECTION_OBLIQUE: u16 = 1 << 9;
const MAC_STYLE_ITALIC: u16 = 1 << 1;

/// A variation axis in an `fvar` table.
#[derive(Clone, Debug, PartialEq)]
pub struct AxisSpec {
    pub tag: [u8; 4],
    pub min: f64,
    pub default: f64,
    pub max: f64,
}

impl AxisSpec {
    pub fn new(tag: &[u8; 4], min: f64, default: f64, max: f64) -> Self {
        AxisSpec {
            tag: *tag,
            min,
            default,
            max,
        }
    }
}

/// Describes a fixture font.
#[derive(Clone, Debug)]
pub struct FontSpec {
    pub family: String,
    pub subfamily: String,
    /// Name IDs 16 and 17.
    pub typographic_family: Option<String>,
    pub typographic_subfamily: Option<String>,
    /// Name ID 5.
    pub version: Option<String>,
    /// `head.fontRevision`.
    pub font_revision: f64,
    /// `OS/2.usWeightClass`; `None` omits the OS/2 table.
    pub weight: Option<u16>,
    pub italic: bool,
    pub oblique: bool,
    pub axes: Vec<AxisSpec>,
    /// Write an `OTTO` font with a `CFF ` table in place of glyf/loca.
    pub cff: bool,
    /// Write Windows (3, 1, 0x409) name records.
    pub windows_names: bool,
    /// Also write Macintosh (1, 0, 0) name records, using this family.
    pub mac_family: Option<String>,
    /// Tables left out of the font.
    pub omit: Vec<[u8; 4]>,
}

impl Default for FontSpec {
    fn default() -> Self {
        FontSpec {
            family: "Acme Sans".into(),
            subfamily: "Regular".into(),
            typographic_family: None,
            typographic_subfamily: None,
            version: Some("Version 1.000".into()),
            font_revision: 1.0,
            weight: Some(400),
            italic: false,
            oblique: false,
            axes: Vec::new(),
            cff: false,
            windows_names: true,
            mac_family: None,
            omit: Vec::new(),
        }
    }
}

impl FontSpec {
    /// A variable font with a single `wght` axis.
    pub fn variable(min: f64, default: f64, max: f64) -> Self {
        FontSpec {
            axes: vec![AxisSpec::new(b"wght", min, default, max)],
            ..Default::default()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut tables: Vec<([u8; 4], Vec<u8>)> = vec![
            (*b"cmap", cmap()),
            (*b"head", self.head()),
            (*b"hhea", hhea()),
            (*b"hmtx", hmtx()),
            (*b"maxp", self.maxp()),
            (*b"name", self.name()),
            (*b"post", post(self.italic)),
        ];
        if let Some(weight) = self.weight {
            tables.push((*b"OS/2", self.os2(weight)));
        }
        if !self.axes.is_empty() {
            tables.push((*b"fvar", self.fvar()));
        }
        if self.cff {
            tables.push((*b"CFF ", cff()));
        } else {
            let (glyf, loca) = glyf_and_loca();
            tables.push((*b"glyf", glyf));
            tables.push((*b"loca", loca));
        }
        tables.retain(|(tag, _)| !self.omit.contains(tag));
        tables.sort_by(|a, b| a.0.cmp(&b.0));
        let flavor = if self.cff {
            u32::from_be_bytes(*b"OTTO")
        } else {
            0x0001_0000
        };
        assemble(flavor, &tables)
    }

    fn head(&self) -> Vec<u8> {
        let mac_style = if self.italic { MAC_STYLE_ITALIC } else { 0 };
        BeBuffer::new()
            .u16(1)
            .u16(0)
            .fixed(self.font_revision)
            .u32(0) // checkSumAdjustment
            .u32(0x5F0F_3CF5)
            .u16(0x0003)
            .u16(UNITS_PER_EM)
            .i64(CREATED)
            .i64(CREATED)
            .i16s([0, 0, 500, 700])
            .u16(mac_style)
            .u16(8) // lowestRecPPEM
            .i16(2) // fontDirectionHint
            .i16(0) // indexToLocFormat
            .i16(0)
            .into_inner()
    }

    fn maxp(&self) -> Vec<u8> {
        let num_glyphs = ADVANCES.len() as u16;
        if self.cff {
            return BeBuffer::new().u32(0x0000_5000).u16(num_glyphs).into_inner();
        }
        BeBuffer::new()
            .u32(0x0001_0000)
            .u16(num_glyphs)
            .u16s([4, 1, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0])
            .into_inner()
    }

    fn os2(&self, weight: u16) -> Vec<u8> {
        let mut fs_selection = 0;
        if self.italic {
            fs_selection |= FS_SELECTION_ITALIC;
        }
        if self.oblique {
            fs_selection |= FS_SELECTION_OBLIQUE;
        }
        if fs_selection == 0 {
            fs_selection = FS_SELECTION_REGULAR;
        }
        BeBuffer::new()
            .u16(4) // version
            .i16(566) // xAvgCharWidth
            .u16(weight)
            .u16(5) // usWidthClass
            .u16(0) // fsType
            .i16s([650, 600, 0, 75, 650, 600, 0, 350, 50, 250])
            .i16(0) // sFamilyClass
            .bytes(&[2, 11, 5, 2, 2, 2, 2, 2, 2, 4]) // panose
            .u32(1) // ulUnicodeRange1: Basic Latin
            .u32(0)
            .u32(0)
            .u32(0)
            .bytes(b"ACME")
            .u16(fs_selection)
            .u16(0x41) // usFirstCharIndex
            .u16(0x42)
            .i16(ASCENDER)
            .i16(DESCENDER)
            .i16(0)
            .u16(ASCENDER as u16)
            .u16(DESCENDER.unsigned_abs())
            .u32(1) // ulCodePageRange1: Latin 1
            .u32(0)
            .i16(500) // sxHeight
            .i16(700) // sCapHeight
            .u16(0)
            .u16(0x20)
            .u16(1)
            .into_inner()
    }

    fn name(&self) -> Vec<u8> {
        let full_name = format!("{} {}", self.family, self.subfamily);
        let mut names: Vec<(u16, &str)> = vec![
            (1, self.family.as_str()),
            (2, self.subfamily.as_str()),
            (4, full_name.as_str()),
        ];
        if let Some(version) = &self.version {
            names.push((5, version.as_str()));
        }
        if let Some(family) = &self.typographic_family {
            names.push((16, family.as_str()));
        }
        if let Some(subfamily) = &self.typographic_subfamily {
            names.push((17, subfamily.as_str()));
        }

        // (platform, encoding, language, name id, encoded)
        let mut records: Vec<(u16, u16, u16, u16, Vec<u8>)> = Vec::new();
        if let Some(mac_family) = &self.mac_family {
            for (id, value) in &names {
                let value = if *id == 1 { mac_family.as_str() } else { *value };
                // fixtures stick to ASCII, which MacRoman shares
                records.push((1, 0, 0, *id, value.as_bytes().to_vec()));
            }
        }
        if self.windows_names {
            for (id, value) in &names {
                let utf16 = value.encode_utf16().flat_map(u16::to_be_bytes).collect();
                records.push((3, 1, 0x409, *id, utf16));
            }
        }

        let count = records.len() as u16;
        let mut buf = BeBuffer::new().u16(0).u16(count).u16(6 + 12 * count);
        let mut strings = Vec::new();
        for (platform, encoding, language, id, data) in &records {
            buf = buf
                .u16s([*platform, *encoding, *language, *id])
                .u16(data.len() as u16)
                .u16(strings.len() as u16);
            strings.extend_from_slice(data);
        }
        buf.bytes(&strings).into_inner()
    }

    fn fvar(&self) -> Vec<u8> {
        let axis_count = self.axes.len() as u16;
        let mut buf = BeBuffer::new()
            .u16(1)
            .u16(0)
            .u16(16) // axesArrayOffset
            .u16(2)
            .u16(axis_count)
            .u16(20) // axisSize
            .u16(0) // instanceCount
            .u16(4 + 4 * axis_count);
        for (i, axis) in self.axes.iter().enumerate() {
            buf = buf
                .bytes(&axis.tag)
                .fixed(axis.min)
                .fixed(axis.default)
                .fixed(axis.max)
                .u16(0)
                .u16(256 + i as u16);
        }
        buf.into_inner()
    }
}

fn hhea() -> Vec<u8> {
    BeBuffer::new()
        .u32(0x0001_0000)
        .i16(ASCENDER)
        .i16(DESCENDER)
        .i16(0) // lineGap
        .u16(600) // advanceWidthMax
        .i16s([0, 0, 500]) // minLsb, minRsb, xMaxExtent
        .i16s([1, 0, 0]) // caret
        .i16s([0, 0, 0, 0])
        .i16(0) // metricDataFormat
        .u16(ADVANCES.len() as u16)
        .into_inner()
}

fn hmtx() -> Vec<u8> {
    let lsbs = [NOTDEF, SQUARE, TRIANGLE].map(|points| points.iter().map(|p| p.0).min().unwrap_or(0));
    ADVANCES
        .iter()
        .zip(lsbs)
        .fold(BeBuffer::new(), |buf, (advance, lsb)| buf.u16(*advance).i16(lsb))
        .into_inner()
}

fn post(italic: bool) -> Vec<u8> {
    BeBuffer::new()
        .u32(0x0003_0000)
        .fixed(if italic { -12.0 } else { 0.0 })
        .i16(-75)
        .i16(50)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .into_inner()
}

/// A format 4 subtable mapping [`MAPPED`] in one segment.
fn cmap() -> Vec<u8> {
    let first = MAPPED[0].0 as u16;
    let last = MAPPED[MAPPED.len() - 1].0 as u16;
    let delta = MAPPED[0].1 as i16 - first as i16;
    let subtable = BeBuffer::new()
        .u16(4) // format
        .u16(32) // length
        .u16(0) // language
        .u16(4) // segCountX2
        .u16(4) // searchRange
        .u16(1) // entrySelector
        .u16(0) // rangeShift
        .u16s([last, 0xFFFF])
        .u16(0) // reservedPad
        .u16s([first, 0xFFFF])
        .i16s([delta, 1])
        .u16s([0, 0]);
    debug_assert_eq!(subtable.len(), 32);
    BeBuffer::new()
        .u16(0)
        .u16(1)
        .u16(3)
        .u16(1)
        .u32(12)
        .bytes(&subtable)
        .into_inner()
}

/// A CFF INDEX with one byte offsets.
fn cff_index(objects: &[&[u8]]) -> BeBuffer {
    let mut buf = BeBuffer::new().u16(objects.len() as u16).u8(1);
    let mut offset = 1;
    buf = buf.u8(offset);
    for object in objects {
        offset += object.len() as u8;
        buf = buf.u8(offset);
    }
    objects.iter().fold(buf, |buf, object| buf.bytes(object))
}

/// A one font CFF table whose glyphs are all `endchar`.
fn cff() -> Vec<u8> {
    const HEADER_SIZE: u8 = 4;
    const CHARSTRINGS_OP: u8 = 17;
    const ENDCHAR: &[u8] = &[14];
    const RETURN: &[u8] = &[11];

    let header = BeBuffer::new().bytes(&[1, 0, HEADER_SIZE, 1]);
    let names = cff_index(&[b"AcmeSans".as_slice()]);
    let strings = cff_index(&[b"Acme".as_slice()]);
    let global_subrs = cff_index(&[RETURN]);
    // the top dict holds a single five byte integer operand and operator
    let top_dict_len = cff_index(&[[0u8; 6].as_slice()]).len();
    let charstrings_offset =
        header.len() + names.len() + top_dict_len + strings.len() + global_subrs.len();
    let top_dict = BeBuffer::new()
        .u8(29)
        .u32(charstrings_offset as u32)
        .u8(CHARSTRINGS_OP)
        .into_inner();
    let charstrings = cff_index(&[ENDCHAR; ADVANCES.len()]);

    [header, names, cff_index(&[top_dict.as_slice()]), strings, global_subrs, charstrings]
        .iter()
        .fold(BeBuffer::new(), |buf, part| buf.bytes(part))
        .into_inner()
}

/// One contour, all points on curve, long coordinates.
fn simple_glyph(points: &[(i16, i16)]) -> Vec<u8> {
    let x_min = points.iter().map(|p| p.0).min().unwrap_or(0);
    let y_min = points.iter().map(|p| p.1).min().unwrap_or(0);
    let x_max = points.iter().map(|p| p.0).max().unwrap_or(0);
    let y_max = points.iter().map(|p| p.1).max().unwrap_or(0);
    let mut buf = BeBuffer::new()
        .i16(1)
        .i16s([x_min, y_min, x_max, y_max])
        .u16(points.len() as u16 - 1)
        .u16(0); // instructionLength
    for _ in points {
        buf = buf.u8(0x01);
    }
    let mut last = (0, 0);
    let mut dxs = Vec::new();
    let mut dys = Vec::new();
    for point in points {
        dxs.push(point.0 - last.0);
        dys.push(point.1 - last.1);
        last = *point;
    }
    let mut glyph = buf.i16s(dxs).i16s(dys).into_inner();
    glyph.resize((glyph.len() + 3) & !3, 0);
    glyph
}

fn glyf_and_loca() -> (Vec<u8>, Vec<u8>) {
    let mut glyf = Vec::new();
    let mut loca = BeBuffer::new();
    for points in [NOTDEF, SQUARE, TRIANGLE] {
        loca = loca.u16((glyf.len() / 2) as u16);
        glyf.extend(simple_glyph(points));
    }
    loca = loca.u16((glyf.len() / 2) as u16);
    (glyf, loca.into_inner())
}

fn checksum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |sum, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum.wrapping_add(u32::from_be_bytes(word))
    })
}

fn assemble(flavor: u32, tables: &[([u8; 4], Vec<u8>)]) -> Vec<u8> {
    let num_tables = tables.len() as u16;
    let entry_selector = (num_tables as f64).log2().floor() as u16;
    let search_range = (1u16 << entry_selector) * 16;
    let mut header = BeBuffer::new()
        .u32(flavor)
        .u16(num_tables)
        .u16(search_range)
        .u16(entry_selector)
        .u16(num_tables * 16 - search_range);

    let mut offset = 12 + 16 * tables.len();
    let mut body = Vec::new();
    for (tag, data) in tables {
        header = header
            .bytes(tag)
            .u32(checksum(data))
            .u32(offset as u32)
            .u32(data.len() as u32);
        body.extend_from_slice(data);
        body.resize((body.len() + 3) & !3, 0);
        offset = 12 + 16 * tables.len() + body.len();
    }
    let mut font = header.bytes(&body).into_inner();

    let head_offset = tables
        .iter()
        .take_while(|(tag, _)| tag != b"head")
        .map(|(_, data)| (data.len() + 3) & !3)
        .sum::<usize>()
        + 12
        + 16 * tables.len();
    if tables.iter().any(|(tag, _)| tag == b"head") {
        let adjustment = 0xB1B0_AFBAu32.wrapping_sub(checksum(&font));
        font[head_offset + 8..head_offset + 12].copy_from_slice(&adjustment.to_be_bytes());
    }
    font
}
