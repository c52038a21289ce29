//! Rendering an SVG font document from glyph outlines.

use std::fmt::Write;

use kurbo::{BezPath, Point};
use skrifa::{
    instance::{LocationRef, Size},
    outline::OutlinePen,
    FontRef, GlyphId, MetadataProvider,
};

use super::ConvertError;
use crate::{cancel::CancellationToken, metadata::FontDescriptor};

/// Collects outline commands into a [`BezPath`].
#[derive(Default)]
struct BezPathPen {
    path: BezPath,
}

fn as_kurbo_point(x: f32, y: f32) -> Point {
    Point::new(x as f64, y as f64)
}

impl OutlinePen for BezPathPen {
    fn move_to(&mut self, x: f32, y: f32) {
        self.path.move_to(as_kurbo_point(x, y));
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.path.line_to(as_kurbo_point(x, y));
    }

    fn quad_to(&mut self, cx0: f32, cy0: f32, x: f32, y: f32) {
        self.path
            .quad_to(as_kurbo_point(cx0, cy0), as_kurbo_point(x, y));
    }

    fn curve_to(&mut self, cx0: f32, cy0: f32, cx1: f32, cy1: f32, x: f32, y: f32) {
        self.path.curve_to(
            as_kurbo_point(cx0, cy0),
            as_kurbo_point(cx1, cy1),
            as_kurbo_point(x, y),
        );
    }

    fn close(&mut self) {
        self.path.close_path();
    }
}

struct Glyph {
    advance: f32,
    path: String,
}

/// Render the font in `sfnt` (a bare sfnt) as an SVG font document.
pub(super) fn render(
    sfnt: &[u8],
    descriptor: &FontDescriptor,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ConvertError> {
    let font = FontRef::new(sfnt).map_err(|e| ConvertError::MalformedFont(e.to_string()))?;
    let outlines = font.outline_glyphs();
    let metrics = font.metrics(Size::unscaled(), LocationRef::default());
    let glyph_metrics = font.glyph_metrics(Size::unscaled(), LocationRef::default());

    let glyph = |gid: GlyphId| -> Result<Glyph, ConvertError> {
        let mut pen = BezPathPen::default();
        if let Some(outline) = outlines.get(gid) {
            outline
                .draw((Size::unscaled(), LocationRef::default()), &mut pen)
                .map_err(|e| ConvertError::MalformedFont(format!("glyph {gid}: {e}")))?;
        }
        Ok(Glyph {
            advance: glyph_metrics.advance_width(gid).unwrap_or_default(),
            path: pen.path.to_svg(),
        })
    };

    let missing = glyph(GlyphId::NOTDEF)?;
    let mut mapped = Vec::new();
    for (codepoint, gid) in font.charmap().mappings() {
        cancel.check()?;
        let Some(ch) = char::from_u32(codepoint) else {
            continue;
        };
        if ch.is_control() {
            continue;
        }
        mapped.push((ch, glyph(gid)?));
    }
    mapped.sort_by_key(|(ch, _)| *ch);
    mapped.dedup_by_key(|(ch, _)| *ch);

    let mut out = String::new();
    write_document(
        &mut out,
        descriptor,
        metrics.units_per_em,
        (metrics.ascent, metrics.descent),
        &missing,
        &mapped,
    )
    .map_err(|_| ConvertError::MalformedFont("failed to format SVG document".into()))?;
    Ok(out.into_bytes())
}

fn write_document(
    out: &mut String,
    descriptor: &FontDescriptor,
    units_per_em: u16,
    (ascent, descent): (f32, f32),
    missing: &Glyph,
    mapped: &[(char, Glyph)],
) -> std::fmt::Result {
    writeln!(out, r#"<?xml version="1.0" standalone="no"?>"#)?;
    writeln!(out, r#"<svg xmlns="http://www.w3.org/2000/svg">"#)?;
    writeln!(out, "<defs>")?;
    writeln!(
        out,
        r#"<font id="{}" horiz-adv-x="{}">"#,
        descriptor.svg_font_id(),
        missing.advance
    )?;
    writeln!(
        out,
        r#"<font-face font-family="{}" font-weight="{}" font-style="{}" units-per-em="{units_per_em}" ascent="{ascent}" descent="{descent}"/>"#,
        escape_xml(&descriptor.family),
        descriptor.weight,
        descriptor.style.as_css(),
    )?;
    write!(out, r#"<missing-glyph horiz-adv-x="{}""#, missing.advance)?;
    write_path(out, &missing.path)?;
    writeln!(out, "/>")?;
    for (ch, glyph) in mapped {
        let code = *ch as u32;
        write!(
            out,
            r#"<glyph unicode="&#x{code:X};" glyph-name="uni{code:04X}" horiz-adv-x="{}""#,
            glyph.advance
        )?;
        write_path(out, &glyph.path)?;
        writeln!(out, "/>")?;
    }
    writeln!(out, "</font>")?;
    writeln!(out, "</defs>")?;
    writeln!(out, "</svg>")
}

fn write_path(out: &mut String, path: &str) -> std::fmt::Result {
    if path.is_empty() {
        return Ok(());
    }
    write!(out, r#" d="{path}""#)
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use font_test_data::FontSpec;

    use super::*;
    use crate::metadata::extract;

    fn render_spec(spec: &FontSpec) -> String {
        let bytes = spec.build();
        let descriptor = extract(&bytes).unwrap();
        let svg = render(&bytes, &descriptor, &CancellationToken::new()).unwrap();
        String::from_utf8(svg).unwrap()
    }

    #[test]
    fn document_structure() {
        let svg = render_spec(&FontSpec::default());
        assert!(svg.starts_with("<?xml"));
        assert!(svg.contains(r#"<font id="AcmeSans" horiz-adv-x="500">"#));
        assert!(svg.contains(r#"font-family="Acme Sans" font-weight="400" font-style="normal""#));
        assert!(svg.contains(r#"units-per-em="1000" ascent="800" descent="-200""#));
        assert!(svg.trim_end().ends_with("</svg>"));
    }

    #[test]
    fn one_glyph_per_mapped_character() {
        let svg = render_spec(&FontSpec::default());
        assert_eq!(svg.matches("<glyph ").count(), font_test_data::MAPPED.len());
        let a = svg
            .lines()
            .find(|line| line.contains(r#"unicode="&#x41;""#))
            .unwrap();
        assert!(a.contains(r#"glyph-name="uni0041""#));
        assert!(a.contains(r#"horiz-adv-x="600""#));
        assert!(a.contains(r#"d="M0,0 "#));
        assert!(a.ends_with(r#"Z"/>"#));
    }

    #[test]
    fn glyphs_sorted_by_codepoint() {
        let svg = render_spec(&FontSpec::default());
        let a = svg.find("&#x41;").unwrap();
        let b = svg.find("&#x42;").unwrap();
        assert!(a < b);
    }

    #[test]
    fn family_is_escaped() {
        let svg = render_spec(&FontSpec {
            family: "Tom & Jerry".into(),
            ..Default::default()
        });
        assert!(svg.contains(r#"font-family="Tom &amp; Jerry""#));
        assert!(svg.contains(r#"<font id="TomJerry""#));
    }

    #[test]
    fn empty_path_omits_d() {
        let mut out = String::new();
        write_path(&mut out, "").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn cancelled_render() {
        let bytes = FontSpec::default().build();
        let descriptor = extract(&bytes).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            render(&bytes, &descriptor, &cancel),
            Err(ConvertError::Cancelled)
        );
    }
}
