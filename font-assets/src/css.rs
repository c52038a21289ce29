//! `@font-face` stylesheet generation.

use std::{collections::BTreeMap, fmt::Write, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    asset::{FormatSlot, SlotRef},
    format::FormatCode,
    metadata::{ExtractError, FontDescriptor, WGHT},
    store::StoreError,
};

/// An error generating a stylesheet.
#[derive(Debug, thiserror::Error)]
pub enum CssError {
    #[error("a stylesheet needs a woff2 source")]
    MissingSource,
    #[error("could not read the woff2 source: {0}")]
    Extraction(#[from] ExtractError),
    #[error("failed to format stylesheet: {0}")]
    Template(#[from] std::fmt::Error),
    #[error("the css slot is busy")]
    SlotBusy,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maps a stored object to the URL written in a `src` descriptor.
pub trait UrlResolver {
    fn url(&self, code: FormatCode, slot: &SlotRef) -> String;
}

impl<F> UrlResolver for F
where
    F: Fn(FormatCode, &SlotRef) -> String,
{
    fn url(&self, code: FormatCode, slot: &SlotRef) -> String {
        self(code, slot)
    }
}

/// Resolves generated object ids (`file-<hash>-<ext>`) to `<base>/<hash>.<ext>`.
#[derive(Clone, Debug)]
pub struct CdnUrlResolver {
    base: String,
}

impl CdnUrlResolver {
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        CdnUrlResolver { base }
    }
}

impl UrlResolver for CdnUrlResolver {
    fn url(&self, _code: FormatCode, slot: &SlotRef) -> String {
        match slot.object_id.parts() {
            Some((hash, ext)) => format!("{}/{hash}.{ext}", self.base),
            None => format!("{}/{}", self.base, slot.object_id),
        }
    }
}

/// Resolves to the name the object was uploaded under, optionally below a
/// directory prefix.
#[derive(Clone, Debug, Default)]
pub struct ResolvedName {
    prefix: String,
}

impl ResolvedName {
    pub fn new(prefix: impl Into<String>) -> Self {
        ResolvedName {
            prefix: prefix.into(),
        }
    }
}

impl UrlResolver for ResolvedName {
    fn url(&self, _code: FormatCode, slot: &SlotRef) -> String {
        if self.prefix.is_empty() || self.prefix.ends_with('/') {
            format!("{}{}", self.prefix, slot.original_name)
        } else {
            format!("{}/{}", self.prefix, slot.original_name)
        }
    }
}

/// The `font-display` descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontDisplay {
    Auto,
    Block,
    #[default]
    Swap,
    Fallback,
    Optional,
}

impl FontDisplay {
    pub fn as_css(self) -> &'static str {
        match self {
            FontDisplay::Auto => "auto",
            FontDisplay::Block => "block",
            FontDisplay::Swap => "swap",
            FontDisplay::Fallback => "fallback",
            FontDisplay::Optional => "optional",
        }
    }
}

impl std::fmt::Display for FontDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_css())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown font-display value '{0}'")]
pub struct UnknownFontDisplay(pub String);

impl FromStr for FontDisplay {
    type Err = UnknownFontDisplay;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            FontDisplay::Auto,
            FontDisplay::Block,
            FontDisplay::Swap,
            FontDisplay::Fallback,
            FontDisplay::Optional,
        ]
        .into_iter()
        .find(|value| value.as_css().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| UnknownFontDisplay(s.to_string()))
    }
}

/// Options controlling stylesheet output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StylesheetOptions {
    pub font_display: FontDisplay,
    /// Also list otf, eot and svg sources (and the old IE `src`) when present.
    pub legacy_formats: bool,
}

impl Default for StylesheetOptions {
    fn default() -> Self {
        StylesheetOptions {
            font_display: FontDisplay::Swap,
            legacy_formats: true,
        }
    }
}

/// Render an `@font-face` rule with default options.
///
/// `family_name` is the name the rule declares; pass an empty string to use
/// the family embedded in the font.
pub fn generate(
    descriptor: &FontDescriptor,
    slots: &BTreeMap<FormatCode, FormatSlot>,
    family_name: &str,
    resolver: &(impl UrlResolver + ?Sized),
) -> Result<String, CssError> {
    generate_with(
        descriptor,
        slots,
        family_name,
        resolver,
        &StylesheetOptions::default(),
    )
}

pub fn generate_with(
    descriptor: &FontDescriptor,
    slots: &BTreeMap<FormatCode, FormatSlot>,
    family_name: &str,
    resolver: &(impl UrlResolver + ?Sized),
    options: &StylesheetOptions,
) -> Result<String, CssError> {
    let occupied = |code: FormatCode| slots.get(&code).and_then(FormatSlot::occupied);
    if occupied(FormatCode::Woff2).is_none() {
        return Err(CssError::MissingSource);
    }

    let mut sources: Vec<(FormatCode, &SlotRef)> = slots
        .iter()
        .filter_map(|(code, slot)| Some((*code, slot.occupied()?)))
        .filter(|(code, _)| code.info().css_format.is_some())
        .filter(|(code, _)| options.legacy_formats || code.src_rank() <= FormatCode::Ttf.src_rank())
        .collect();
    sources.sort_by_key(|(code, _)| code.src_rank());

    let family = match family_name.trim() {
        "" => descriptor.family.as_str(),
        name => name,
    };

    let mut out = String::new();
    writeln!(
        out,
        "/* {}, {}, generated {} */",
        comment_text(&descriptor.full_name()),
        comment_text(&descriptor.version),
        descriptor.generated_at.format("%Y-%m-%d")
    )?;
    writeln!(out, "@font-face {{")?;
    writeln!(out, "  font-family: {};", quote(family))?;
    if options.legacy_formats {
        if let Some(eot) = occupied(FormatCode::Eot) {
            writeln!(out, "  src: url({});", quote(&resolver.url(FormatCode::Eot, eot)))?;
        }
    }
    write!(out, "  src: ")?;
    for (i, (code, slot)) in sources.iter().enumerate() {
        if i > 0 {
            write!(out, ",\n       ")?;
        }
        let mut url = resolver.url(*code, slot);
        match code {
            FormatCode::Eot => url.push_str("?#iefix"),
            FormatCode::Svg => {
                url.push('#');
                url.push_str(&descriptor.svg_font_id());
            }
            _ => (),
        }
        let format = code.info().css_format.unwrap_or_default();
        write!(out, "url({}) format({})", quote(&url), quote(format))?;
    }
    writeln!(out, ";")?;

    match descriptor.weight_range() {
        Some((min, max)) => writeln!(out, "  font-weight: {} {};", number(min), number(max))?,
        None => writeln!(out, "  font-weight: {};", descriptor.weight)?,
    }
    writeln!(out, "  font-style: {};", descriptor.style.as_css())?;
    writeln!(out, "  font-display: {};", options.font_display.as_css())?;
    // css has no descriptor for arbitrary axes
    for axis in descriptor.axes.iter().filter(|axis| axis.tag != WGHT) {
        writeln!(
            out,
            "  /* --axis-{}: {} {} {}; */",
            comment_text(&axis.tag.to_string()),
            number(axis.min),
            number(axis.default),
            number(axis.max)
        )?;
    }
    writeln!(out, "}}")?;
    log::debug!("generated stylesheet for '{family}' with {} sources", sources.len());
    Ok(out)
}

/// Format a number without a trailing `.0`, to at most three decimals.
fn number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let text = format!("{value:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// A double quoted css string.
fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(ch);
            }
            c if c.is_control() => {
                let _ = write!(quoted, "\\{:x} ", c as u32);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn comment_text(text: &str) -> String {
    text.replace("*/", "* /")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use read_fonts::types::Tag;
    use rstest::rstest;

    use super::*;
    use crate::{
        asset::ObjectId,
        metadata::{Axis, FontStyle},
    };

    fn descriptor() -> FontDescriptor {
        FontDescriptor {
            family: "Acme Sans".into(),
            subfamily: "Regular".into(),
            weight: 400,
            style: FontStyle::Normal,
            axes: Vec::new(),
            version: "Version 1.000".into(),
            generated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn variable() -> FontDescriptor {
        FontDescriptor {
            axes: vec![
                Axis {
                    tag: Tag::new(b"wght"),
                    min: 100.0,
                    default: 400.0,
                    max: 900.0,
                },
                Axis {
                    tag: Tag::new(b"wdth"),
                    min: 75.0,
                    default: 100.0,
                    max: 125.0,
                },
            ],
            ..descriptor()
        }
    }

    fn slots(codes: &[FormatCode]) -> BTreeMap<FormatCode, FormatSlot> {
        FormatCode::ALL
            .into_iter()
            .map(|code| {
                let slot = if codes.contains(&code) {
                    FormatSlot::Occupied(SlotRef::new(
                        ObjectId::new(format!("file-{code}hash-{code}")),
                        format!("acme.{code}"),
                    ))
                } else {
                    FormatSlot::Empty
                };
                (code, slot)
            })
            .collect()
    }

    fn names() -> ResolvedName {
        ResolvedName::default()
    }

    #[test]
    fn static_font() {
        let css = generate(&descriptor(), &slots(&[FormatCode::Woff2]), "Acme Sans", &names()).unwrap();
        assert_eq!(
            css,
            r#"/* Acme Sans Regular, Version 1.000, generated 2024-01-01 */
@font-face {
  font-family: "Acme Sans";
  src: url("acme.woff2") format("woff2");
  font-weight: 400;
  font-style: normal;
  font-display: swap;
}
"#
        );
    }

    #[test]
    fn src_order_is_most_compressed_first() {
        let css = generate(
            &descriptor(),
            &slots(&[FormatCode::Ttf, FormatCode::Woff, FormatCode::Woff2]),
            "Acme Sans",
            &names(),
        )
        .unwrap();
        let woff2 = css.find("acme.woff2").unwrap();
        let woff = css.find("acme.woff\"").unwrap();
        let ttf = css.find("acme.ttf").unwrap();
        assert!(woff2 < woff && woff < ttf);
        assert!(css.contains(r#"url("acme.ttf") format("truetype");"#));
    }

    #[test]
    fn legacy_formats() {
        let all = slots(&FormatCode::ALL);
        let css = generate(&descriptor(), &all, "Acme Sans", &names()).unwrap();
        assert!(css.contains("  src: url(\"acme.eot\");\n"));
        assert!(css.contains(r#"url("acme.eot?#iefix") format("embedded-opentype")"#));
        assert!(css.contains(r#"url("acme.svg#AcmeSans") format("svg")"#));
        assert!(css.contains(r#"format("opentype")"#));
        assert!(!css.contains("acme.css"));

        let modern = StylesheetOptions {
            legacy_formats: false,
            ..Default::default()
        };
        let css = generate_with(&descriptor(), &all, "Acme Sans", &names(), &modern).unwrap();
        assert!(!css.contains("eot"));
        assert!(!css.contains("svg"));
        assert!(!css.contains("otf"));
    }

    #[test]
    fn variable_font() {
        let css = generate(&variable(), &slots(&[FormatCode::Woff2]), "", &names()).unwrap();
        assert!(css.contains("  font-weight: 100 900;\n"));
        assert!(css.contains("  /* --axis-wdth: 75 100 125; */\n"));
        assert!(!css.contains("--axis-wght"));
    }

    #[test]
    fn display_name_overrides_embedded_family() {
        let css = generate(&descriptor(), &slots(&[FormatCode::Woff2]), "Brand \"Display\"", &names())
            .unwrap();
        assert!(css.contains(r#"font-family: "Brand \"Display\"";"#));
        let css = generate(&descriptor(), &slots(&[FormatCode::Woff2]), "  ", &names()).unwrap();
        assert!(css.contains(r#"font-family: "Acme Sans";"#));
    }

    #[test]
    fn missing_woff2() {
        assert!(matches!(
            generate(&descriptor(), &slots(&[FormatCode::Ttf]), "Acme", &names()),
            Err(CssError::MissingSource)
        ));
    }

    #[test]
    fn deterministic() {
        let slots = slots(&FormatCode::ALL);
        let first = generate(&variable(), &slots, "Acme", &names()).unwrap();
        let second = generate(&variable(), &slots, "Acme", &names()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn resolvers() {
        let slot = SlotRef::new(ObjectId::new("file-abc123-woff2"), "acme.woff2");
        let cdn = CdnUrlResolver::new("https://cdn.example.com/files/");
        assert_eq!(
            cdn.url(FormatCode::Woff2, &slot),
            "https://cdn.example.com/files/abc123.woff2"
        );
        assert_eq!(ResolvedName::new("fonts").url(FormatCode::Woff2, &slot), "fonts/acme.woff2");
        let closure = |code: FormatCode, slot: &SlotRef| format!("/{code}/{}", slot.object_id);
        assert_eq!(closure.url(FormatCode::Woff2, &slot), "/woff2/file-abc123-woff2");
    }

    #[rstest]
    #[case(400.0, "400")]
    #[case(87.5, "87.5")]
    #[case(-12.0, "-12")]
    #[case(0.33333, "0.333")]
    fn numbers(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(number(value), expected);
    }

    #[test]
    fn font_display_parses() {
        assert_eq!("Optional".parse::<FontDisplay>(), Ok(FontDisplay::Optional));
        assert!("fast".parse::<FontDisplay>().is_err());
    }
}
