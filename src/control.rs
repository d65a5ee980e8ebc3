// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian control file primitives.

See <https://www.debian.org/doc/debian-policy/ch-controlfields.html> for the
canonical description of the format: *paragraphs* of `Name: value` fields
separated by blank lines, with continuation lines indented by a space.
*/

use {
    crate::error::{DebmillError, Result},
    std::io::{BufRead, Write},
};

/// A field in a control paragraph.
///
/// The value is stored with its file formatting: a multiline value contains
/// embedded newlines, each continuation line prefixed with a space.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ControlField {
    name: String,
    value: String,
}

impl ControlField {
    /// Construct an instance from a field name and raw value.
    pub fn new(name: impl ToString, value: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// Construct a multiline field from an iterable of lines.
    ///
    /// The first line is emitted after the colon; subsequent lines become
    /// indented continuations. Pass an empty first line to produce the
    /// `Name:` + newline form used by checksum blocks in `Release` files.
    pub fn from_lines(name: impl ToString, lines: impl Iterator<Item = String>) -> Self {
        let value = lines
            .enumerate()
            .map(|(i, line)| if i == 0 { line } else { format!(" {}", line) })
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            name: name.to_string(),
            value,
        }
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw value, including any continuation formatting.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Iterate over whitespace-separated words in the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.split_ascii_whitespace()
    }

    /// Iterate over lines in the value, with leading whitespace stripped.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value.lines().map(|line| line.trim_start())
    }

    /// Write this field to a writer in its serialized form.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.name.as_bytes())?;
        if self.value.starts_with('\n') {
            // Block-style multiline value with an empty first line.
            writer.write_all(b":")?;
        } else {
            writer.write_all(b": ")?;
        }
        writer.write_all(self.value.as_bytes())?;
        writer.write_all(b"\n")
    }
}

/// An ordered series of control fields.
///
/// Field names are case insensitive on read and case preserving on set.
/// A paragraph holds at most one occurrence of a field; setting an existing
/// name replaces the prior value in place, preserving its position.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlParagraph {
    fields: Vec<ControlField>,
}

impl ControlParagraph {
    /// Whether the paragraph holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set the value of a field, replacing any existing value in place.
    pub fn set_field(&mut self, field: ControlField) {
        if let Some(existing) = self
            .fields
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(&field.name))
        {
            *existing = field;
        } else {
            self.fields.push(field);
        }
    }

    /// Set a field from name and value strings.
    pub fn set_field_str(&mut self, name: impl ToString, value: impl ToString) {
        self.set_field(ControlField::new(name, value));
    }

    /// Remove the named field, if present.
    pub fn remove_field(&mut self, name: &str) {
        self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
    }

    /// Whether a named field is present.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Obtain the field with a given name.
    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Obtain the raw string value of the named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value())
    }

    /// Obtain the named field's value or a [DebmillError::ControlRequiredFieldMissing].
    pub fn required_field_str(&self, name: &str) -> Result<&str> {
        self.field_str(name)
            .ok_or_else(|| DebmillError::ControlRequiredFieldMissing(name.to_string()))
    }

    /// Obtain the named field's value parsed as a u64.
    pub fn field_u64(&self, name: &str) -> Option<Result<u64>> {
        self.field_str(name)
            .map(|v| v.trim().parse::<u64>().map_err(DebmillError::ParseInt))
    }

    /// Iterate over fields in insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField> {
        self.fields.iter()
    }

    /// Serialize the paragraph, emitting fields in insertion order.
    ///
    /// A trailing newline terminates the final field but no blank separator
    /// line is written.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for field in &self.fields {
            field.write(writer)?;
        }

        Ok(())
    }

    /// Serialize the paragraph with fields in a canonical order.
    ///
    /// Fields named in `order` are emitted first, in that order; any remaining
    /// fields follow in insertion order. This is how `Packages`, `Sources`,
    /// and `Release` files keep byte-stable output across runs.
    pub fn write_canonical<W: Write>(&self, writer: &mut W, order: &[&str]) -> std::io::Result<()> {
        for name in order {
            if let Some(field) = self.field(name) {
                field.write(writer)?;
            }
        }

        for field in &self.fields {
            if !order.iter().any(|name| field.name.eq_ignore_ascii_case(name)) {
                field.write(writer)?;
            }
        }

        Ok(())
    }

    /// Serialize to a `String`, fields in insertion order.
    pub fn to_control_string(&self) -> String {
        let mut buf = vec![];
        self.write(&mut buf).expect("write to Vec cannot fail");
        String::from_utf8(buf).expect("control data is UTF-8")
    }
}

/// Incremental parser for control file paragraphs.
///
/// Fed lines of text; emits a [ControlParagraph] whenever a blank line
/// completes one.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph,
    field: Option<String>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// Returns a completed paragraph when the line terminates one.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph>> {
        let is_empty_line = line.trim().is_empty();
        let is_continuation = (line.starts_with(' ') || line.starts_with('\t')) && line.len() > 1;

        let current = self.field.take();

        if is_empty_line {
            if let Some(field) = current {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        match (current, is_continuation) {
            // New field begins; flush the one on the stack.
            (Some(pending), false) => {
                self.flush_field(pending)?;
                self.field = Some(line.trim_end_matches(['\r', '\n']).to_string());
            }
            // First field of a paragraph.
            (None, _) => {
                self.field = Some(line.trim_end_matches(['\r', '\n']).to_string());
            }
            // Continuation line extends the pending field.
            (Some(pending), true) => {
                self.field = Some(format!(
                    "{}\n{}",
                    pending,
                    line.trim_end_matches(['\r', '\n'])
                ));
            }
        }

        Ok(None)
    }

    /// Finish parsing, returning any unflushed paragraph.
    pub fn finish(mut self) -> Result<Option<ControlParagraph>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, raw: String) -> Result<()> {
        let (name, value) = raw.split_once(':').ok_or_else(|| {
            DebmillError::ControlParse(format!("error parsing line '{}': missing colon", raw))
        })?;

        // Continuation lines keep their leading space marker in the stored
        // value so round-trip emission reproduces the input.
        let value = value.strip_prefix(' ').unwrap_or(value);

        self.paragraph
            .set_field(ControlField::new(name.trim(), value));

        Ok(())
    }
}

/// A streaming reader of [ControlParagraph] from a buffered source.
///
/// Consume via the [Iterator] implementation; each item is one paragraph.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = self.parser.take().expect("parser present when iterating");

        loop {
            let mut line = String::new();
            let count = self.reader.read_line(&mut line)?;

            if count == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.parser.is_none() {
            return None;
        }

        match self.get_next() {
            Ok(Some(paragraph)) => Some(Ok(paragraph)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Parse a control source holding exactly one paragraph.
pub fn parse_single_paragraph(data: &[u8]) -> Result<ControlParagraph> {
    let mut reader = ControlParagraphReader::new(std::io::BufReader::new(data));

    let paragraph = reader
        .next()
        .transpose()?
        .ok_or(DebmillError::ControlNoParagraph)?;

    Ok(paragraph)
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "Package: vips\n\
        Version: 8.17.3-1\n\
        Architecture: amd64\n\
        Description: image processing library\n multi\n line\n\
        \n\
        Package: libvips42t64\n\
        Version: 8.17.3-1\n\
        Architecture: amd64\n";

    #[test]
    fn parses_paragraphs() -> Result<()> {
        let paragraphs = ControlParagraphReader::new(std::io::BufReader::new(SAMPLE.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[0].field_str("Package"), Some("vips"));
        assert_eq!(paragraphs[1].field_str("Package"), Some("libvips42t64"));

        let description = paragraphs[0].field("Description").unwrap();
        assert_eq!(
            description.iter_lines().collect::<Vec<_>>(),
            vec!["image processing library", "multi", "line"]
        );

        Ok(())
    }

    #[test]
    fn field_lookup_is_case_insensitive_and_replacing() {
        let mut p = ControlParagraph::default();

        p.set_field_str("Filename", "pool/main/v/vips/a.deb");
        p.set_field_str("FILENAME", "pool/main/v/vips/b.deb");

        assert_eq!(p.iter_fields().count(), 1);
        assert_eq!(p.field_str("filename"), Some("pool/main/v/vips/b.deb"));
    }

    #[test]
    fn replacement_preserves_field_position() {
        let mut p = ControlParagraph::default();
        p.set_field_str("Package", "vips");
        p.set_field_str("Version", "1.0");
        p.set_field_str("Package", "libvips");

        let names = p.iter_fields().map(|f| f.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Package", "Version"]);
    }

    #[test]
    fn round_trips_multiline_values() -> Result<()> {
        let paragraphs = ControlParagraphReader::new(std::io::BufReader::new(SAMPLE.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        let emitted = paragraphs[0].to_control_string();
        assert!(emitted.contains("Description: image processing library\n multi\n line\n"));

        Ok(())
    }

    #[test]
    fn canonical_order_emits_known_fields_first() {
        let mut p = ControlParagraph::default();
        p.set_field_str("Size", "123");
        p.set_field_str("Package", "vips");
        p.set_field_str("Homepage", "https://libvips.org");
        p.set_field_str("Version", "8.17.3-1");

        let mut buf = vec![];
        p.write_canonical(&mut buf, &["Package", "Version", "Size"])
            .unwrap();

        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "Package: vips\nVersion: 8.17.3-1\nSize: 123\nHomepage: https://libvips.org\n"
        );
    }

    #[test]
    fn block_multiline_field_formatting() {
        let field = ControlField::from_lines(
            "SHA256",
            [
                String::new(),
                "abc 1234 main/binary-amd64/Packages".to_string(),
            ]
            .into_iter(),
        );

        let mut buf = vec![];
        field.write(&mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "SHA256:\n abc 1234 main/binary-amd64/Packages\n"
        );
    }

    #[test]
    fn missing_colon_is_an_error() {
        let mut parser = ControlFileParser::default();
        parser.write_line("Package vips\n").unwrap();
        assert!(parser.finish().is_err());
    }
}
