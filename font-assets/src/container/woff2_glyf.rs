//! Reconstruction of the WOFF2 glyf/loca and hmtx transforms.
//!
//! ref: <https://www.w3.org/TR/WOFF2/#glyf_table_format>

use super::{woff2::Stream, ContainerError, WriteBe};
use crate::format::Container;

const GLYF_HEADER_LEN: usize = 36;
const OVERLAP_SIMPLE_BITMAP: u16 = 1 << 0;

// simple glyph flags
const ON_CURVE_POINT: u8 = 0x01;
const X_SHORT_VECTOR: u8 = 0x02;
const Y_SHORT_VECTOR: u8 = 0x04;
const REPEAT_FLAG: u8 = 0x08;
const X_IS_SAME_OR_POSITIVE: u8 = 0x10;
const Y_IS_SAME_OR_POSITIVE: u8 = 0x20;
const OVERLAP_SIMPLE: u8 = 0x40;

// composite glyph flags
const ARG_1_AND_2_ARE_WORDS: u16 = 0x0001;
const WE_HAVE_A_SCALE: u16 = 0x0008;
const MORE_COMPONENTS: u16 = 0x0020;
const WE_HAVE_AN_X_AND_Y_SCALE: u16 = 0x0040;
const WE_HAVE_A_TWO_BY_TWO: u16 = 0x0080;
const WE_HAVE_INSTRUCTIONS: u16 = 0x0100;

pub(super) struct Glyphs {
    pub glyf: Vec<u8>,
    pub loca: Vec<u8>,
    pub index_format: u16,
    /// Per glyph, needed to restore left side bearings in hmtx.
    pub x_mins: Vec<i16>,
}

fn malformed(reason: impl Into<String>) -> ContainerError {
    ContainerError::malformed(Container::Woff2, reason)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Point {
    x: i32,
    y: i32,
    on_curve: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bbox {
    x_min: i16,
    y_min: i16,
    x_max: i16,
    y_max: i16,
}

impl Bbox {
    fn read(stream: &mut Stream) -> Result<Self, ContainerError> {
        Ok(Bbox {
            x_min: stream.i16()?,
            y_min: stream.i16()?,
            x_max: stream.i16()?,
            y_max: stream.i16()?,
        })
    }

    fn of(points: &[Point]) -> Result<Self, ContainerError> {
        let Some(first) = points.first() else {
            return Ok(Bbox {
                x_min: 0,
                y_min: 0,
                x_max: 0,
                y_max: 0,
            });
        };
        let (mut x_min, mut y_min, mut x_max, mut y_max) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            x_min = x_min.min(p.x);
            y_min = y_min.min(p.y);
            x_max = x_max.max(p.x);
            y_max = y_max.max(p.y);
        }
        Ok(Bbox {
            x_min: coord(x_min)?,
            y_min: coord(y_min)?,
            x_max: coord(x_max)?,
            y_max: coord(y_max)?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_i16(self.x_min);
        out.put_i16(self.y_min);
        out.put_i16(self.x_max);
        out.put_i16(self.y_max);
    }
}

fn coord(value: i32) -> Result<i16, ContainerError> {
    i16::try_from(value).map_err(|_| malformed(format!("coordinate {value} out of range")))
}

/// The substreams of a transformed glyf table.
struct Streams<'a> {
    n_contour: Stream<'a>,
    n_points: Stream<'a>,
    flag: Stream<'a>,
    glyph: Stream<'a>,
    composite: Stream<'a>,
    bbox_bitmap: &'a [u8],
    bbox: Stream<'a>,
    instruction: Stream<'a>,
    overlap_bitmap: Option<&'a [u8]>,
}

fn bit_is_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index >> 3)
        .is_some_and(|byte| byte & (0x80 >> (index & 7)) != 0)
}

pub(super) fn reconstruct(data: &[u8]) -> Result<Glyphs, ContainerError> {
    let mut header = Stream::new(data);
    header.u16()?; // reserved
    let option_flags = header.u16()?;
    let num_glyphs = header.u16()? as usize;
    let index_format = header.u16()?;
    if index_format > 1 {
        return Err(malformed(format!("bad indexFormat {index_format}")));
    }
    let mut sizes = [0usize; 7];
    for size in sizes.iter_mut() {
        *size = header.u32()? as usize;
    }
    debug_assert_eq!(header.position(), GLYF_HEADER_LEN);

    let [n_contour, n_points, flag, glyph, composite, bbox, instruction] =
        sizes.map(|size| header.bytes(size));
    let bbox = bbox?;
    let bitmap_len = 4 * num_glyphs.div_ceil(32);
    if bbox.len() < bitmap_len {
        return Err(malformed("bbox stream shorter than its bitmap"));
    }
    let overlap_bitmap = if option_flags & OVERLAP_SIMPLE_BITMAP != 0 {
        Some(header.bytes(num_glyphs.div_ceil(8))?)
    } else {
        None
    };
    let mut streams = Streams {
        n_contour: Stream::new(n_contour?),
        n_points: Stream::new(n_points?),
        flag: Stream::new(flag?),
        glyph: Stream::new(glyph?),
        composite: Stream::new(composite?),
        bbox_bitmap: &bbox[..bitmap_len],
        bbox: Stream::new(&bbox[bitmap_len..]),
        instruction: Stream::new(instruction?),
        overlap_bitmap,
    };

    let mut glyf = Vec::new();
    let mut offsets = Vec::with_capacity(num_glyphs + 1);
    let mut x_mins = Vec::with_capacity(num_glyphs);
    for gid in 0..num_glyphs {
        offsets.push(glyf.len());
        let x_min = streams.glyph(gid, &mut glyf)?;
        x_mins.push(x_min);
        glyf.pad4();
    }
    offsets.push(glyf.len());

    let mut loca = Vec::with_capacity(offsets.len() * if index_format == 0 { 2 } else { 4 });
    for offset in offsets {
        if index_format == 0 {
            let half = u16::try_from(offset / 2)
                .map_err(|_| malformed("glyf too large for short loca offsets"))?;
            loca.put_u16(half);
        } else {
            loca.put_u32(offset as u32);
        }
    }
    log::debug!(
        "woff2: reconstructed {num_glyphs} glyphs into {} glyf bytes",
        glyf.len()
    );
    Ok(Glyphs {
        glyf,
        loca,
        index_format,
        x_mins,
    })
}

impl Streams<'_> {
    /// Append one glyph to `out`, returning its xMin.
    fn glyph(&mut self, gid: usize, out: &mut Vec<u8>) -> Result<i16, ContainerError> {
        let num_contours = self.n_contour.i16()?;
        let has_bbox = bit_is_set(self.bbox_bitmap, gid);
        match num_contours {
            0 => {
                if has_bbox {
                    return Err(malformed(format!("empty glyph {gid} has a bbox")));
                }
                Ok(0)
            }
            -1 => {
                if !has_bbox {
                    return Err(malformed(format!("composite glyph {gid} has no bbox")));
                }
                let bbox = Bbox::read(&mut self.bbox)?;
                let (components, have_instructions) = self.components()?;
                out.put_i16(-1);
                bbox.write(out);
                out.extend_from_slice(components);
                if have_instructions {
                    let len = self.glyph.u255()?;
                    out.put_u16(len);
                    out.extend_from_slice(self.instruction.bytes(len as usize)?);
                }
                Ok(bbox.x_min)
            }
            n if n > 0 => self.simple_glyph(gid, n as usize, has_bbox, out),
            n => Err(malformed(format!("glyph {gid} has {n} contours"))),
        }
    }

    fn components(&mut self) -> Result<(&[u8], bool), ContainerError> {
        let mut records = self.composite.clone();
        let start = records.position();
        let mut have_instructions = false;
        loop {
            let flags = records.u16()?;
            let mut len = 2; // glyph index
            len += if flags & ARG_1_AND_2_ARE_WORDS != 0 { 4 } else { 2 };
            if flags & WE_HAVE_A_SCALE != 0 {
                len += 2;
            } else if flags & WE_HAVE_AN_X_AND_Y_SCALE != 0 {
                len += 4;
            } else if flags & WE_HAVE_A_TWO_BY_TWO != 0 {
                len += 8;
            }
            records.bytes(len)?;
            have_instructions |= flags & WE_HAVE_INSTRUCTIONS != 0;
            if flags & MORE_COMPONENTS == 0 {
                break;
            }
        }
        let len = records.position() - start;
        Ok((self.composite.bytes(len)?, have_instructions))
    }

    fn simple_glyph(
        &mut self,
        gid: usize,
        num_contours: usize,
        has_bbox: bool,
        out: &mut Vec<u8>,
    ) -> Result<i16, ContainerError> {
        let mut end_points = Vec::with_capacity(num_contours);
        let mut num_points = 0usize;
        for _ in 0..num_contours {
            num_points += self.n_points.u255()? as usize;
            let end = num_points
                .checked_sub(1)
                .and_then(|end| u16::try_from(end).ok())
                .ok_or_else(|| malformed(format!("bad contour in glyph {gid}")))?;
            end_points.push(end);
        }

        let flags = self.flag.bytes(num_points)?;
        let mut points = Vec::with_capacity(num_points);
        let (mut x, mut y) = (0i32, 0i32);
        for &flag in flags {
            let (dx, dy) = self.triplet(flag)?;
            x += dx;
            y += dy;
            points.push(Point {
                x,
                y,
                on_curve: flag >> 7 == 0,
            });
        }

        let instruction_len = self.glyph.u255()?;
        let instructions = self.instruction.bytes(instruction_len as usize)?;
        let bbox = if has_bbox {
            Bbox::read(&mut self.bbox)?
        } else {
            Bbox::of(&points)?
        };
        let overlap = self
            .overlap_bitmap
            .is_some_and(|bitmap| bit_is_set(bitmap, gid));

        out.put_i16(num_contours as i16);
        bbox.write(out);
        for end in end_points {
            out.put_u16(end);
        }
        out.put_u16(instruction_len);
        out.extend_from_slice(instructions);
        write_points(&points, overlap, out)?;
        Ok(bbox.x_min)
    }

    /// Decode one point delta.
    ///
    /// ref: <https://www.w3.org/TR/WOFF2/#triplet_decoding>
    fn triplet(&mut self, flag: u8) -> Result<(i32, i32), ContainerError> {
        fn with_sign(flag: u8, value: i32) -> i32 {
            if flag & 1 != 0 {
                value
            } else {
                -value
            }
        }

        let flag = flag & 0x7F;
        let n = match flag {
            0..=83 => 1,
            84..=119 => 2,
            120..=123 => 3,
            _ => 4,
        };
        let b = self.glyph.bytes(n)?;
        let b: Vec<i32> = b.iter().map(|byte| *byte as i32).collect();
        let f = flag as i32;
        let delta = if flag < 10 {
            (0, with_sign(flag, ((f & 14) << 7) + b[0]))
        } else if flag < 20 {
            (with_sign(flag, (((f - 10) & 14) << 7) + b[0]), 0)
        } else if flag < 84 {
            let b0 = f - 20;
            (
                with_sign(flag, 1 + (b0 & 0x30) + (b[0] >> 4)),
                with_sign(flag >> 1, 1 + ((b0 & 0x0C) << 2) + (b[0] & 0x0F)),
            )
        } else if flag < 120 {
            let b0 = f - 84;
            (
                with_sign(flag, 1 + ((b0 / 12) << 8) + b[0]),
                with_sign(flag >> 1, 1 + (((b0 % 12) >> 2) << 8) + b[1]),
            )
        } else if flag < 124 {
            (
                with_sign(flag, (b[0] << 4) + (b[1] >> 4)),
                with_sign(flag >> 1, ((b[1] & 0x0F) << 8) + b[2]),
            )
        } else {
            (
                with_sign(flag, (b[0] << 8) + b[1]),
                with_sign(flag >> 1, (b[2] << 8) + b[3]),
            )
        };
        Ok(delta)
    }
}

/// Write glyf flags and coordinates with the usual short-vector and
/// repeat packing.
fn write_points(points: &[Point], overlap: bool, out: &mut Vec<u8>) -> Result<(), ContainerError> {
    let mut flags = Vec::with_capacity(points.len());
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let (mut last_x, mut last_y) = (0, 0);
    for (i, point) in points.iter().enumerate() {
        let mut flag = if point.on_curve { ON_CURVE_POINT } else { 0 };
        if i == 0 && overlap {
            flag |= OVERLAP_SIMPLE;
        }
        let dx = point.x - last_x;
        let dy = point.y - last_y;
        flag |= pack_delta(dx, X_SHORT_VECTOR, X_IS_SAME_OR_POSITIVE, &mut xs)?;
        flag |= pack_delta(dy, Y_SHORT_VECTOR, Y_IS_SAME_OR_POSITIVE, &mut ys)?;
        flags.push(flag);
        last_x = point.x;
        last_y = point.y;
    }

    let mut i = 0;
    while i < flags.len() {
        let flag = flags[i];
        let run = flags[i + 1..]
            .iter()
            .take(255)
            .take_while(|next| **next == flag)
            .count();
        if run > 0 {
            out.put_u8(flag | REPEAT_FLAG);
            out.put_u8(run as u8);
        } else {
            out.put_u8(flag);
        }
        i += run + 1;
    }
    out.extend_from_slice(&xs);
    out.extend_from_slice(&ys);
    Ok(())
}

fn pack_delta(delta: i32, short: u8, same_or_positive: u8, out: &mut Vec<u8>) -> Result<u8, ContainerError> {
    if delta == 0 {
        Ok(same_or_positive)
    } else if (-255..=255).contains(&delta) {
        out.put_u8(delta.unsigned_abs() as u8);
        Ok(short | if delta > 0 { same_or_positive } else { 0 })
    } else {
        out.put_i16(coord(delta)?);
        Ok(0)
    }
}

/// Rebuild an hmtx table from its transformed form.
///
/// ref: <https://www.w3.org/TR/WOFF2/#hmtx_table_format>
pub(super) fn reconstruct_hmtx(
    data: &[u8],
    num_glyphs: u16,
    num_hmetrics: u16,
    x_mins: &[i16],
) -> Result<Vec<u8>, ContainerError> {
    let num_glyphs = num_glyphs as usize;
    let num_hmetrics = num_hmetrics as usize;
    if num_hmetrics > num_glyphs || x_mins.len() < num_glyphs {
        return Err(malformed("hmtx metrics disagree with glyph count"));
    }
    let mut stream = Stream::new(data);
    let flags = stream.u8()?;
    if flags & 0xFC != 0 {
        return Err(malformed(format!("reserved hmtx transform flags {flags:#04x}")));
    }
    let has_proportional_lsbs = flags & 0x01 == 0;
    let has_monospace_lsbs = flags & 0x02 == 0;

    let advances = (0..num_hmetrics)
        .map(|_| stream.u16())
        .collect::<Result<Vec<_>, _>>()?;
    let mut lsbs = Vec::with_capacity(num_glyphs);
    for (gid, x_min) in x_mins.iter().enumerate().take(num_glyphs) {
        let explicit = if gid < num_hmetrics {
            has_proportional_lsbs
        } else {
            has_monospace_lsbs
        };
        lsbs.push(if explicit { stream.i16()? } else { *x_min });
    }

    let mut out = Vec::with_capacity(num_hmetrics * 4 + (num_glyphs - num_hmetrics) * 2);
    for (advance, lsb) in advances.iter().zip(&lsbs) {
        out.put_u16(*advance);
        out.put_i16(*lsb);
    }
    for lsb in &lsbs[num_hmetrics..] {
        out.put_i16(*lsb);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A transformed glyf table with an empty glyph, a square and a
    /// composite referencing the square.
    fn transformed() -> Vec<u8> {
        let n_contour = [0x00, 0x00, 0x00, 0x01, 0xFF, 0xFF];
        let n_points = [4u8];
        // all on curve; flag 0 is dy only, 10..19 dx only
        let flags = [0x01, 0x0B, 0x00, 0x0A];
        // (0,100) (100,0) (0,-100) (-100,0) then instruction length 0
        let glyph = [100, 100, 100, 100, 0];
        // ARGS_ARE_XY_VALUES | MORE_COMPONENTS unset, glyph 1, args (10, 20)
        let composite = [0x00, 0x02, 0x00, 0x01, 10, 20];
        let mut bbox = vec![0x20, 0, 0, 0];
        for v in [0i16, 0, 110, 120] {
            bbox.extend_from_slice(&v.to_be_bytes());
        }
        let instruction: [u8; 0] = [];

        let mut out = Vec::new();
        out.put_u16(0);
        out.put_u16(0);
        out.put_u16(3);
        out.put_u16(0);
        for len in [
            n_contour.len(),
            n_points.len(),
            flags.len(),
            glyph.len(),
            composite.len(),
            bbox.len(),
            instruction.len(),
        ] {
            out.put_u32(len as u32);
        }
        out.extend_from_slice(&n_contour);
        out.extend_from_slice(&n_points);
        out.extend_from_slice(&flags);
        out.extend_from_slice(&glyph);
        out.extend_from_slice(&composite);
        out.extend_from_slice(&bbox);
        out
    }

    #[test]
    fn rebuilds_glyf_and_loca() {
        let glyphs = reconstruct(&transformed()).unwrap();
        assert_eq!(glyphs.index_format, 0);
        assert_eq!(glyphs.x_mins, vec![0, 0, 0]);

        let square: Vec<u8> = [
            vec![0x00, 0x01],                         // one contour
            vec![0, 0, 0, 0, 0, 100, 0, 100],         // bbox
            vec![0x00, 0x03],                         // end point
            vec![0x00, 0x00],                         // no instructions
            vec![0x35, 0x33, 0x15, 0x23],             // flags
            vec![100, 100],                           // x deltas
            vec![100, 100],                           // y deltas
            vec![0x00, 0x00],                         // padding
        ]
        .concat();
        let composite: Vec<u8> = [
            vec![0xFF, 0xFF],
            vec![0, 0, 0, 0, 0, 110, 0, 120],
            vec![0x00, 0x02, 0x00, 0x01, 10, 20],
        ]
        .concat();
        assert_eq!(glyphs.glyf, [square.clone(), composite].concat());
        // short offsets are halved
        let loca: Vec<u8> = [0u16, 0, 12, 20]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        assert_eq!(glyphs.loca, loca);
        assert_eq!(square.len(), 24);
    }

    #[test]
    fn composite_needs_bbox() {
        let mut data = transformed();
        let bitmap = data.len() - 12;
        data[bitmap] = 0;
        assert!(reconstruct(&data).is_err());
    }

    #[test]
    fn triplets() {
        let streams = |glyph: &'static [u8]| Streams {
            n_contour: Stream::new(&[]),
            n_points: Stream::new(&[]),
            flag: Stream::new(&[]),
            glyph: Stream::new(glyph),
            composite: Stream::new(&[]),
            bbox_bitmap: &[],
            bbox: Stream::new(&[]),
            instruction: Stream::new(&[]),
            overlap_bitmap: None,
        };
        assert_eq!(streams(&[5]).triplet(1).unwrap(), (0, 5));
        assert_eq!(streams(&[5]).triplet(0).unwrap(), (0, -5));
        assert_eq!(streams(&[5]).triplet(11).unwrap(), (5, 0));
        // flag 20: both negative, high nibbles from the data byte
        assert_eq!(streams(&[0x23]).triplet(20).unwrap(), (-3, -4));
        assert_eq!(streams(&[0x01, 0x00, 0x02, 0x00]).triplet(127).unwrap(), (256, 512));
    }

    #[test]
    fn hmtx_lsbs_from_x_min() {
        let data = [0x03, 0x01, 0xF4, 0x02, 0x58];
        let hmtx = reconstruct_hmtx(&data, 3, 2, &[5, -7, 9]).unwrap();
        let expected: Vec<u8> = [
            500u16.to_be_bytes(),
            5i16.to_be_bytes(),
            600u16.to_be_bytes(),
            (-7i16).to_be_bytes(),
            9i16.to_be_bytes(),
        ]
        .concat();
        assert_eq!(hmtx, expected);
    }

    #[test]
    fn hmtx_rejects_reserved_flags() {
        assert!(reconstruct_hmtx(&[0x04], 1, 1, &[0]).is_err());
    }
}
