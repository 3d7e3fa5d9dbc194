//! Streaming dump decoder
//!
//! [`DumpDecoder`] walks a decompressed XML dump with a token reader and
//! materialises exactly one top-level record element at a time. A malformed
//! element is reported as an `Err` item and decoding resumes at the next
//! sibling, so one bad record never aborts a file.
//!
//! ```no_run
//! use discogs_ingest::decoder::open_dump;
//! use discogs_ingest::models::FileType;
//!
//! # fn main() -> discogs_ingest::error::Result<()> {
//! let mut dump = open_dump("/tmp/discogs-data/2024-01/artists.xml.gz", FileType::Artists, Some(100))?;
//! for item in dump.decoder.by_ref() {
//!     match item {
//!         Ok(record) => println!("{}", record.id()),
//!         Err(e) => eprintln!("{}", e),
//!     }
//! }
//! println!("{:?}", dump.decoder.stats());
//! # Ok(())
//! # }
//! ```

mod convert;
mod element;

use discogs_common::io::{open_gzip, ByteCounter, GzipReader};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::models::{CatalogRecord, FileType};
use element::{decode_cdata, decode_text, Element, OpenTag};

/// Failure to decode one record, or to keep reading the file at all
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The record was skipped; decoding continues with the next one
    #[error("record #{index}: {reason}")]
    Malformed { index: u64, reason: String },

    /// The underlying stream failed; no further records follow
    #[error("read failed: {0}")]
    Io(String),
}

impl From<DecodeError> for IngestError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Malformed { .. } => IngestError::Decode(err.to_string()),
            DecodeError::Io(msg) => IngestError::Io(std::io::Error::other(msg)),
        }
    }
}

/// Running decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeStats {
    pub decoded: u64,
    pub malformed: u64,
    /// Record elements left unread because of the record limit
    pub unprocessed: u64,
}

enum Token {
    Start(OpenTag),
    Empty(OpenTag),
    End(String),
    Text(std::result::Result<String, String>),
    Eof,
    Other,
    Error { message: String, stalled: bool },
    Io(String),
}

/// Lazy, non-restartable sequence of records from one dump
pub struct DumpDecoder<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    file_type: FileType,
    max_records: Option<u64>,
    /// Document depth outside materialised records
    depth: usize,
    /// Record start tag read while finishing a truncated predecessor
    pending: Option<OpenTag>,
    stats: DecodeStats,
    finished: bool,
    count_remainder: bool,
}

impl<R: BufRead> DumpDecoder<R> {
    pub fn new(inner: R, file_type: FileType, max_records: Option<u64>) -> Self {
        let mut reader = Reader::from_reader(inner);
        let config = reader.config_mut();
        config.trim_text(true);
        config.check_end_names = false;
        config.expand_empty_elements = false;

        Self {
            reader,
            buf: Vec::with_capacity(8 * 1024),
            file_type,
            max_records,
            depth: 0,
            pending: None,
            stats: DecodeStats::default(),
            finished: false,
            count_remainder: true,
        }
    }

    /// Whether hitting the record limit scans the rest of the file to count
    /// the records left behind
    ///
    /// On by default. The scan still decompresses and tokenises everything
    /// after the limit, so a limited run over a multi-gigabyte dump costs
    /// nearly as much I/O as a full one. When off, `unprocessed` only covers
    /// a record already started when the limit hit.
    pub fn count_remainder(mut self, enabled: bool) -> Self {
        self.count_remainder = enabled;
        self
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    fn limit_reached(&self) -> bool {
        self.max_records
            .is_some_and(|max| self.stats.decoded >= max)
    }

    fn next_token(&mut self, detail: bool) -> Token {
        self.buf.clear();
        let before = self.reader.buffer_position();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(e)) if detail => Token::Start(OpenTag::parse(&e)),
            Ok(Event::Start(e)) => Token::Start(OpenTag {
                name: OpenTag::name_of(&e),
                attrs: Vec::new(),
                problem: None,
            }),
            Ok(Event::Empty(e)) if detail => Token::Empty(OpenTag::parse(&e)),
            Ok(Event::Empty(e)) => Token::Empty(OpenTag {
                name: OpenTag::name_of(&e),
                attrs: Vec::new(),
                problem: None,
            }),
            Ok(Event::End(e)) => Token::End(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
            Ok(Event::Text(e)) if detail => Token::Text(decode_text(&e)),
            Ok(Event::CData(e)) if detail => Token::Text(decode_cdata(&e)),
            Ok(Event::Eof) => Token::Eof,
            Ok(_) => Token::Other,
            Err(quick_xml::Error::Io(e)) => Token::Io(e.to_string()),
            Err(e) => Token::Error {
                message: e.to_string(),
                stalled: self.reader.buffer_position() == before,
            },
        }
    }

    /// Read one record element whose start tag has been consumed
    fn materialize(&mut self, open: OpenTag) -> std::result::Result<CatalogRecord, DecodeError> {
        let index = self.stats.decoded + self.stats.malformed + 1;
        let record_name = self.file_type.record_element();

        let mut problems: Vec<String> = Vec::new();
        if let Some(problem) = open.problem.clone() {
            problems.push(problem);
        }
        let mut stack = vec![Element::from_tag(open)];
        let mut root: Option<Element> = None;

        while root.is_none() {
            match self.next_token(true) {
                Token::Start(mut tag) => {
                    if stack.len() == 1 && tag.name == record_name {
                        problems.push(format!("<{}> not closed before the next record", record_name));
                        self.pending = Some(tag);
                        break;
                    }
                    if let Some(problem) = tag.problem.take() {
                        problems.push(problem);
                    }
                    stack.push(Element::from_tag(tag));
                },
                Token::Empty(mut tag) => {
                    if let Some(problem) = tag.problem.take() {
                        problems.push(problem);
                    }
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Element::from_tag(tag));
                    }
                },
                Token::Text(Ok(text)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                },
                Token::Text(Err(problem)) => problems.push(problem),
                Token::End(name) => match stack.iter().rposition(|el| el.name == name) {
                    Some(pos) => {
                        if pos + 1 != stack.len() {
                            problems.push(format!("unclosed elements inside </{}>", name));
                        }
                        while stack.len() > pos + 1 {
                            if let Some(child) = stack.pop() {
                                if let Some(parent) = stack.last_mut() {
                                    parent.children.push(child);
                                }
                            }
                        }
                        if let Some(done) = stack.pop() {
                            match stack.last_mut() {
                                Some(parent) => parent.children.push(done),
                                None => root = Some(done),
                            }
                        }
                    },
                    None => problems.push(format!("unexpected </{}>", name)),
                },
                Token::Eof => {
                    problems.push("unexpected end of file inside record".to_string());
                    self.finished = true;
                    break;
                },
                Token::Error { message, stalled } => {
                    problems.push(message);
                    if stalled {
                        self.finished = true;
                        break;
                    }
                },
                Token::Io(message) => {
                    self.finished = true;
                    return Err(DecodeError::Io(message));
                },
                Token::Other => {},
            }
        }

        let root = match root {
            Some(root) => root,
            None => collapse(stack),
        };

        if !problems.is_empty() {
            return Err(self.malformed(index, &root, problems.join("; ")));
        }

        match convert::to_record(self.file_type, &root) {
            Ok(record) => {
                self.stats.decoded += 1;
                Ok(record)
            },
            Err(reason) => Err(self.malformed(index, &root, reason)),
        }
    }

    fn malformed(&mut self, index: u64, root: &Element, reason: String) -> DecodeError {
        self.stats.malformed += 1;
        let id = root
            .attr("id")
            .map(str::to_string)
            .or_else(|| root.child_text("id"));
        let reason = match id {
            Some(id) => format!("id {}: {}", id, reason),
            None => reason,
        };
        debug!(file_type = %self.file_type, record = index, error = %reason, "Skipping malformed record");
        DecodeError::Malformed { index, reason }
    }

    /// Count the record elements after the limit without materialising them
    ///
    /// Reads the dump to the end.
    fn count_remaining(&mut self) {
        let record_name = self.file_type.record_element();
        if self.pending.take().is_some() {
            self.stats.unprocessed += 1;
            self.depth += 1;
        }

        loop {
            match self.next_token(false) {
                Token::Start(tag) => {
                    if self.depth == 1 && tag.name == record_name {
                        self.stats.unprocessed += 1;
                    }
                    self.depth += 1;
                },
                Token::Empty(tag) => {
                    if self.depth == 1 && tag.name == record_name {
                        self.stats.unprocessed += 1;
                    }
                },
                Token::End(_) => self.depth = self.depth.saturating_sub(1),
                Token::Error { stalled: false, .. } | Token::Text(_) | Token::Other => {},
                Token::Error { stalled: true, .. } | Token::Eof | Token::Io(_) => break,
            }
        }
        self.finished = true;
    }
}

fn collapse(mut stack: Vec<Element>) -> Element {
    while stack.len() > 1 {
        if let Some(child) = stack.pop() {
            if let Some(parent) = stack.last_mut() {
                parent.children.push(child);
            }
        }
    }
    stack.pop().unwrap_or_default()
}

impl<R: BufRead> Iterator for DumpDecoder<R> {
    type Item = std::result::Result<CatalogRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.limit_reached() {
            if self.count_remainder {
                self.count_remaining();
            } else {
                if self.pending.take().is_some() {
                    self.stats.unprocessed += 1;
                }
                self.finished = true;
            }
            return None;
        }
        if let Some(open) = self.pending.take() {
            return Some(self.materialize(open));
        }

        let record_name = self.file_type.record_element();
        loop {
            match self.next_token(true) {
                Token::Start(tag) => {
                    if self.depth == 1 && tag.name == record_name {
                        return Some(self.materialize(tag));
                    }
                    if self.depth == 0 && tag.name != self.file_type.root_element() {
                        warn!(
                            file_type = %self.file_type,
                            root = %tag.name,
                            "Unexpected document element"
                        );
                    }
                    self.depth += 1;
                },
                Token::Empty(tag) => {
                    if self.depth == 1 && tag.name == record_name {
                        let index = self.stats.decoded + self.stats.malformed + 1;
                        let el = Element::from_tag(tag);
                        return Some(match convert::to_record(self.file_type, &el) {
                            Ok(record) => {
                                self.stats.decoded += 1;
                                Ok(record)
                            },
                            Err(reason) => Err(self.malformed(index, &el, reason)),
                        });
                    }
                },
                Token::End(_) => self.depth = self.depth.saturating_sub(1),
                Token::Eof => {
                    self.finished = true;
                    return None;
                },
                Token::Io(message) => {
                    self.finished = true;
                    return Some(Err(DecodeError::Io(message)));
                },
                Token::Error { message, stalled } => {
                    warn!(file_type = %self.file_type, error = %message, "XML error between records");
                    if stalled {
                        self.finished = true;
                        return None;
                    }
                },
                Token::Text(_) | Token::Other => {},
            }
        }
    }
}

/// A decoder over a gzip dump on disk plus its progress handles
pub struct OpenedDump {
    pub decoder: DumpDecoder<GzipReader>,
    /// Compressed bytes consumed so far
    pub progress: ByteCounter,
    pub compressed_size: u64,
}

/// Open a gzip-compressed dump for streaming decoding
pub fn open_dump(
    path: impl AsRef<Path>,
    file_type: FileType,
    max_records: Option<u64>,
) -> Result<OpenedDump> {
    let source = open_gzip(path.as_ref())?;
    Ok(OpenedDump {
        decoder: DumpDecoder::new(source.reader, file_type, max_records),
        progress: source.compressed_read,
        compressed_size: source.compressed_size,
    })
}
