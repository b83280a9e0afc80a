use crate::error::FormatError;
use crate::models::{RawRecord, SourceKind};
use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
use memchr::memchr2;
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const READ_BUFFER: usize = 256 * 1024;
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Plain,
    Gzip,
    Bzip2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// A single top-level array of objects.
    Array,
    /// One object per line.
    LineDelimited,
    /// Nothing but whitespace.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParseSummary {
    pub kind: SourceKind,
    pub layout: Layout,
    pub compression: Compression,
    pub records: u64,
    pub malformed: u64,
}

enum Scan {
    Element,
    End,
    Truncated,
    /// Non-whitespace bytes after the closing bracket of the array.
    TrailingData,
}

/// Lazily yields the JSON objects of one dump file.
///
/// The layout is detected from the first non-whitespace character and never
/// more than one record is buffered. Records that fail to decode, or decode to
/// something other than an object, are skipped and counted in
/// [`ParseSummary::malformed`]; a truncated final element is never yielded.
pub struct RecordStream {
    path: PathBuf,
    kind: SourceKind,
    compression: Compression,
    layout: Layout,
    reader: Box<dyn BufRead + Send>,
    buf: Vec<u8>,
    pending: Option<RawRecord>,
    records: u64,
    malformed: u64,
    finished: bool,
}

impl RecordStream {
    pub fn open(path: impl AsRef<Path>, kind: SourceKind) -> Result<Self, FormatError> {
        let path = path.as_ref().to_path_buf();
        let compression = sniff_compression(&path)?;
        let reader = open_reader(&path, compression)?;
        let mut stream = RecordStream {
            path,
            kind,
            compression,
            layout: Layout::Empty,
            reader,
            buf: Vec::with_capacity(8 * 1024),
            pending: None,
            records: 0,
            malformed: 0,
            finished: false,
        };
        stream.prime()?;
        Ok(stream)
    }

    /// Restarts the stream from the first record and resets the counters.
    pub fn rewind(&mut self) -> Result<(), FormatError> {
        self.reader = open_reader(&self.path, self.compression)?;
        self.buf.clear();
        self.pending = None;
        self.records = 0;
        self.malformed = 0;
        self.finished = false;
        self.prime()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn summary(&self) -> ParseSummary {
        ParseSummary {
            kind: self.kind,
            layout: self.layout,
            compression: self.compression,
            records: self.records,
            malformed: self.malformed,
        }
    }

    /// Detects the layout and decodes the first record, which must be an object.
    fn prime(&mut self) -> Result<(), FormatError> {
        let first = skip_preamble(&mut self.reader).map_err(|e| self.io_error(e))?;
        self.layout = match first {
            None => Layout::Empty,
            Some(b'[') => {
                self.reader.consume(1);
                Layout::Array
            }
            Some(b'{') => Layout::LineDelimited,
            Some(other) => {
                return Err(FormatError::UnrecognizedLayout {
                    path: self.path.clone(),
                    found: other as char,
                })
            }
        };
        debug!(
            path = %self.path.display(),
            layout = ?self.layout,
            compression = ?self.compression,
            "Detected source layout"
        );

        if self.layout == Layout::Empty {
            self.finished = true;
            return Ok(());
        }

        let scan = self.next_raw().map_err(|e| self.io_error(e))?;
        match scan {
            Scan::End => {
                self.finished = true;
                Ok(())
            }
            Scan::Truncated => Err(FormatError::FirstRecord {
                path: self.path.clone(),
                reason: "file ends inside the first record".to_string(),
            }),
            Scan::Element => match serde_json::from_slice::<Value>(&self.buf) {
                Ok(Value::Object(map)) => {
                    self.pending = Some(map);
                    Ok(())
                }
                Ok(other) => Err(FormatError::FirstRecord {
                    path: self.path.clone(),
                    reason: format!("found {}", json_type(&other)),
                }),
                Err(e) => Err(FormatError::FirstRecord {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }),
            },
        }
    }

    fn io_error(&self, source: io::Error) -> FormatError {
        FormatError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Fills `self.buf` with the bytes of the next record.
    fn next_raw(&mut self) -> io::Result<Scan> {
        match self.layout {
            Layout::Array => self.scan_array_element(),
            Layout::LineDelimited => self.read_line(),
            Layout::Empty => Ok(Scan::End),
        }
    }

    /// Drains what follows the closing bracket; true if any of it is not
    /// whitespace.
    fn skip_trailing(&mut self) -> io::Result<bool> {
        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Ok(false);
            }
            if available.iter().any(|b| !b.is_ascii_whitespace()) {
                return Ok(true);
            }
            let len = available.len();
            self.reader.consume(len);
        }
    }

    fn read_line(&mut self) -> io::Result<Scan> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                return Ok(Scan::End);
            }
            if self.buf.iter().any(|b| !b.is_ascii_whitespace()) {
                return Ok(Scan::Element);
            }
        }
    }

    /// Copies the next top-level array element into `self.buf`, tracking
    /// nesting depth and string/escape state so separators inside strings or
    /// nested values are ignored.
    fn scan_array_element(&mut self) -> io::Result<Scan> {
        self.buf.clear();

        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Ok(Scan::End);
            }
            let skip = available
                .iter()
                .take_while(|b| b.is_ascii_whitespace() || **b == b',')
                .count();
            if skip < available.len() {
                let next = available[skip];
                self.reader.consume(skip);
                if next == b']' {
                    self.reader.consume(1);
                    return if self.skip_trailing()? {
                        Ok(Scan::TrailingData)
                    } else {
                        Ok(Scan::End)
                    };
                }
                break;
            }
            let len = available.len();
            self.reader.consume(len);
        }

        let mut depth: u32 = 0;
        let mut in_string = false;
        let mut escaped = false;

        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Ok(Scan::Truncated);
            }

            let mut i = 0;
            let mut complete = false;
            while i < available.len() {
                if in_string {
                    if escaped {
                        escaped = false;
                        i += 1;
                        continue;
                    }
                    match memchr2(b'"', b'\\', &available[i..]) {
                        Some(offset) => {
                            i += offset;
                            if available[i] == b'\\' {
                                escaped = true;
                            } else {
                                in_string = false;
                            }
                            i += 1;
                        }
                        None => i = available.len(),
                    }
                    continue;
                }

                match available[i] {
                    b'"' => in_string = true,
                    b'{' | b'[' => depth += 1,
                    b'}' if depth == 0 && i == 0 && self.buf.is_empty() => {
                        // stray brace, taken as an element of its own
                        i += 1;
                        complete = true;
                        break;
                    }
                    b'}' | b']' if depth == 0 => {
                        // closing bracket of the outer array ends a scalar element
                        complete = true;
                        break;
                    }
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            i += 1;
                            complete = true;
                            break;
                        }
                    }
                    b',' if depth == 0 => {
                        complete = true;
                        break;
                    }
                    _ => {}
                }
                i += 1;
            }

            self.buf.extend_from_slice(&available[..i]);
            self.reader.consume(i);
            if complete {
                return Ok(Scan::Element);
            }
        }
    }
}

impl Iterator for RecordStream {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        if let Some(first) = self.pending.take() {
            self.records += 1;
            return Some(first);
        }

        while !self.finished {
            let scan = match self.next_raw() {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Read failed, ending stream");
                    self.malformed += 1;
                    self.finished = true;
                    return None;
                }
            };
            match scan {
                Scan::End => self.finished = true,
                Scan::Truncated => {
                    debug!(path = %self.path.display(), "Discarding truncated trailing element");
                    self.malformed += 1;
                    self.finished = true;
                }
                Scan::TrailingData => {
                    warn!(path = %self.path.display(), "Data after the closing bracket, ignoring the rest of the file");
                    self.malformed += 1;
                    self.finished = true;
                }
                Scan::Element => match serde_json::from_slice::<Value>(&self.buf) {
                    Ok(Value::Object(map)) => {
                        self.records += 1;
                        return Some(map);
                    }
                    Ok(_) | Err(_) => self.malformed += 1,
                },
            }
        }
        None
    }
}

fn sniff_compression(path: &Path) -> Result<Compression, FormatError> {
    let file = File::open(path).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut magic = Vec::with_capacity(3);
    file.take(3)
        .read_to_end(&mut magic)
        .map_err(|source| FormatError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(match magic.as_slice() {
        [0x1f, 0x8b, ..] => Compression::Gzip,
        [b'B', b'Z', b'h'] => Compression::Bzip2,
        _ => Compression::Plain,
    })
}

fn open_reader(path: &Path, compression: Compression) -> Result<Box<dyn BufRead + Send>, FormatError> {
    let file = File::open(path).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(match compression {
        Compression::Plain => Box::new(BufReader::with_capacity(READ_BUFFER, file)),
        Compression::Gzip => Box::new(BufReader::with_capacity(
            READ_BUFFER,
            MultiGzDecoder::new(file),
        )),
        Compression::Bzip2 => Box::new(BufReader::with_capacity(READ_BUFFER, BzDecoder::new(file))),
    })
}

/// Skips a leading byte-order mark and whitespace; returns the first
/// significant byte without consuming it.
fn skip_preamble(reader: &mut Box<dyn BufRead + Send>) -> io::Result<Option<u8>> {
    let available = reader.fill_buf()?;
    if available.starts_with(&UTF8_BOM) {
        reader.consume(UTF8_BOM.len());
    }

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(None);
        }
        match available.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(pos) => {
                let first = available[pos];
                reader.consume(pos);
                return Ok(Some(first));
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn ids(stream: RecordStream) -> Vec<i64> {
        stream
            .map(|r| r.get("id").and_then(Value::as_i64).unwrap())
            .collect()
    }

    #[test]
    fn array_layout() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.json", r#"[{"id": 1}, {"id": 2},{"id":3}]"#);
        let stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(stream.layout(), Layout::Array);
        assert_eq!(ids(stream), vec![1, 2, 3]);
    }

    #[test]
    fn line_delimited_layout() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "l.json", "{\"id\": 1}\n{\"id\": 2}\n\n{\"id\": 3}\n");
        let stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(stream.layout(), Layout::LineDelimited);
        assert_eq!(ids(stream), vec![1, 2, 3]);
    }

    #[test]
    fn nested_values_and_string_separators() {
        let dir = TempDir::new().unwrap();
        let content = r#"[
            {"id": 1, "title": "a, b ] } [ {", "nested": {"x": [1, 2, {"y": "}"}]}},
            {"id": 2, "quote": "say \"hi\", \\"}
        ]"#;
        let path = write_file(&dir, "n.json", content);
        let mut stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        let first = stream.next().unwrap();
        assert_eq!(first["title"], Value::from("a, b ] } [ {"));
        let second = stream.next().unwrap();
        assert_eq!(second["quote"], Value::from("say \"hi\", \\"));
        assert!(stream.next().is_none());
        assert_eq!(stream.summary().malformed, 0);
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let content = "{\"id\": 1}\nnot json\n{\"id\": 2}\n[1, 2]\n{\"id\": \n{\"id\": 3}\n";
        let path = write_file(&dir, "m.json", content);
        let mut stream = RecordStream::open(&path, SourceKind::Links).unwrap();
        let collected: Vec<_> = stream.by_ref().collect();
        assert_eq!(collected.len(), 3);
        let summary = stream.summary();
        assert_eq!(summary.records, 3);
        assert_eq!(summary.malformed, 3);
    }

    #[test]
    fn non_object_array_elements_are_malformed() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "s.json", r#"[{"id": 1}, 7, "x", null, {"id": 2}]"#);
        let mut stream = RecordStream::open(&path, SourceKind::Datasets).unwrap();
        assert_eq!(stream.by_ref().count(), 2);
        assert_eq!(stream.summary().malformed, 3);
    }

    #[test]
    fn stray_closing_brace_is_one_malformed_element() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "b.json", r#"[{"id": 1}}, {"id": 2}]"#);
        let mut stream = RecordStream::open(&path, SourceKind::Datasets).unwrap();
        let got: Vec<_> = stream
            .by_ref()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .collect();
        assert_eq!(got, vec![1, 2]);
        assert_eq!(stream.summary().malformed, 1);
    }

    #[test]
    fn malformed_object_element_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "m.json", r#"[{"id":1}, {bad}, {"id":2}]"#);
        let mut stream = RecordStream::open(&path, SourceKind::Datasets).unwrap();
        assert_eq!(stream.by_ref().count(), 2);
        assert_eq!(stream.summary().malformed, 1);
    }

    #[test]
    fn data_after_closing_bracket_is_counted() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "c.json", "[{\"id\": 1}]\n{\"id\": 2}\n]");
        let mut stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(stream.by_ref().count(), 1);
        assert_eq!(stream.summary().malformed, 1);

        let path = write_file(&dir, "d.json", "[{\"id\": 1}]\n\n");
        let mut stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(stream.by_ref().count(), 1);
        assert_eq!(stream.summary().malformed, 0);
    }

    #[test]
    fn truncated_trailing_element_is_never_yielded() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "t.json", r#"[{"id": 1}, {"id": 2}, {"id": 3, "title": "cut"#);
        let mut stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        let got: Vec<_> = stream.by_ref().collect();
        assert_eq!(got.len(), 2);
        assert_eq!(stream.summary().malformed, 1);
    }

    #[test]
    fn missing_closing_bracket_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "u.json", "[{\"id\": 1},\n{\"id\": 2}\n");
        let mut stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(stream.by_ref().count(), 2);
        assert_eq!(stream.summary().malformed, 0);
    }

    #[test]
    fn unrecognized_first_character() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "x.json", "  id,title\n1,foo\n");
        match RecordStream::open(&path, SourceKind::Papers) {
            Err(FormatError::UnrecognizedLayout { found, .. }) => assert_eq!(found, 'i'),
            other => panic!("expected layout error, got {:?}", other.map(|s| s.summary())),
        }
    }

    #[test]
    fn undecodable_first_record() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f.json", "{not json}\n{\"id\": 1}\n");
        assert!(matches!(
            RecordStream::open(&path, SourceKind::Papers),
            Err(FormatError::FirstRecord { .. })
        ));

        let path = write_file(&dir, "g.json", "[1, {\"id\": 1}]");
        assert!(matches!(
            RecordStream::open(&path, SourceKind::Papers),
            Err(FormatError::FirstRecord { .. })
        ));
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        let dir = TempDir::new().unwrap();
        for (name, content) in [("e1.json", ""), ("e2.json", "  \n\t "), ("e3.json", "[ ]")] {
            let path = write_file(&dir, name, content);
            let mut stream = RecordStream::open(&path, SourceKind::Methods).unwrap();
            assert!(stream.next().is_none(), "{name}");
            assert_eq!(stream.summary().malformed, 0);
        }
    }

    #[test]
    fn byte_order_mark_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bom.json");
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"[{\"id\": 9}]");
        std::fs::write(&path, bytes).unwrap();
        let stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(ids(stream), vec![9]);
    }

    #[test]
    fn gzip_is_detected_by_magic_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("papers.json.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        encoder.write_all(b"[{\"id\": 1}, {\"id\": 2}]").unwrap();
        encoder.finish().unwrap();

        let stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(stream.summary().compression, Compression::Gzip);
        assert_eq!(ids(stream), vec![1, 2]);
    }

    #[test]
    fn gzip_without_extension_still_decodes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("papers.json");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::fast());
        encoder.write_all(b"{\"id\": 5}\n").unwrap();
        encoder.finish().unwrap();

        let stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(ids(stream), vec![5]);
    }

    #[test]
    fn rewind_restarts_from_first_record() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "r.json", "{\"id\": 1}\nbad\n{\"id\": 2}\n");
        let mut stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        assert_eq!(stream.by_ref().count(), 2);
        assert_eq!(stream.summary().malformed, 1);

        stream.rewind().unwrap();
        assert_eq!(stream.summary().records, 0);
        assert_eq!(ids(stream), vec![1, 2]);
    }

    #[test]
    fn large_element_spanning_buffer_refills() {
        let dir = TempDir::new().unwrap();
        let long = "x".repeat(READ_BUFFER * 2 + 17);
        let content = format!("[{{\"id\": 1, \"abstract\": \"{long}\"}}, {{\"id\": 2}}]");
        let path = write_file(&dir, "big.json", &content);
        let mut stream = RecordStream::open(&path, SourceKind::Papers).unwrap();
        let first = stream.next().unwrap();
        assert_eq!(first["abstract"].as_str().unwrap().len(), long.len());
        assert_eq!(stream.next().unwrap()["id"], Value::from(2));
    }
}
