//! Row-by-row CSV parsing into contact chunks.
//!
//! Runs on a blocking thread. Rows flow to the committer through a bounded
//! channel one chunk at a time, so at most a few chunks are ever in memory
//! whatever the file size.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{RowError, Variables};
use crate::phone;

/// Header names accepted for the phone column, in priority order.
const PHONE_HEADERS: &[&str] = &[
    "phone",
    "phone_number",
    "mobile",
    "msisdn",
    "number",
    "tel",
    "telephone",
];
const NAME_HEADERS: &[&str] = &["name", "full_name"];
const TAGS_HEADER: &str = "tags";
const DELIMITERS: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Bytes of the header line inspected when sniffing the delimiter.
const SNIFF_BYTES: u64 = 64 * 1024;

/// A validated row ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRow {
    /// 1-based position among non-blank data rows.
    pub row: u64,
    pub phone: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub variables: Variables,
}

/// One unit of work for the committer.
#[derive(Debug, Default)]
pub struct Chunk {
    pub rows: Vec<ContactRow>,
    /// Rows rejected during validation.
    pub errors: Vec<RowError>,
    /// Rows read for this chunk, accepted or not.
    pub seen: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub chunk_size: usize,
    pub max_rows: u64,
}

#[derive(Debug)]
struct Columns {
    phone: usize,
    name: Option<usize>,
    tags: Option<usize>,
    variables: Vec<(usize, String)>,
}

/// Lower-case, trim and strip a byte-order mark from a header cell.
fn header_name(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// Map a header to a template-safe variable name.
fn variable_key(header: &str) -> Option<String> {
    let key: String = header
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let key = key.trim_matches('_').to_string();
    (!key.is_empty()).then_some(key)
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self> {
        let names: Vec<String> = headers.iter().map(header_name).collect();
        let position = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|c| names.iter().position(|n| n == c))
        };

        let phone = position(PHONE_HEADERS).ok_or_else(|| {
            Error::validation(format!(
                "no phone column; expected one of: {}",
                PHONE_HEADERS.join(", ")
            ))
        })?;
        let name = position(NAME_HEADERS);
        let tags = names.iter().position(|n| n == TAGS_HEADER);

        let mut seen_keys = BTreeSet::new();
        let variables = names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != phone && Some(*i) != name && Some(*i) != tags)
            .filter_map(|(i, n)| variable_key(n).map(|k| (i, k)))
            .filter(|(_, k)| seen_keys.insert(k.clone()))
            .collect();

        Ok(Columns {
            phone,
            name,
            tags,
            variables,
        })
    }

    fn parse(&self, record: &StringRecord, row: u64) -> std::result::Result<ContactRow, RowError> {
        let cell = |i: usize| record.get(i).map(str::trim).unwrap_or("");

        let raw_phone = cell(self.phone);
        if raw_phone.is_empty() {
            return Err(RowError {
                row,
                column: Some("phone".to_string()),
                message: "phone is required".to_string(),
            });
        }
        let phone = phone::normalize(raw_phone).map_err(|e| RowError {
            row,
            column: Some("phone".to_string()),
            message: e.to_string(),
        })?;

        let name = self
            .name
            .map(cell)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let mut tags: Vec<String> = Vec::new();
        if let Some(i) = self.tags {
            for tag in cell(i).split(|c| c == ';' || c == '|') {
                let tag = tag.trim();
                if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                    tags.push(tag.to_string());
                }
            }
        }

        let variables = self
            .variables
            .iter()
            .filter_map(|(i, key)| {
                let value = cell(*i);
                (!value.is_empty()).then(|| (key.clone(), value.to_string()))
            })
            .collect();

        Ok(ContactRow {
            row,
            phone,
            name,
            tags,
            variables,
        })
    }
}

/// Pick the candidate delimiter that occurs most often in the header line.
pub fn sniff_delimiter(path: &Path) -> Result<u8> {
    let mut line = String::new();
    BufReader::new(File::open(path)?.take(SNIFF_BYTES)).read_line(&mut line)?;

    let delimiter = DELIMITERS
        .iter()
        .map(|d| (*d, line.bytes().filter(|b| b == d).count()))
        .filter(|(_, n)| *n > 0)
        .max_by_key(|(_, n)| *n)
        .map(|(d, _)| d)
        .unwrap_or(b',');
    Ok(delimiter)
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|f| f.trim().is_empty())
}

/// Parse `path` and send chunks to `out` until the file ends.
///
/// Returns the number of non-blank data rows read. Fails with
/// `ImportTooLarge` as soon as the row ceiling is crossed; the partial chunk
/// at that point is never sent. Fails with `Cancelled` when `cancel` fires or
/// the receiver goes away.
pub fn parse_file(
    path: &Path,
    limits: ParseLimits,
    out: &mpsc::Sender<Chunk>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let delimiter = sniff_delimiter(path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let columns = Columns::from_headers(reader.headers()?)?;
    debug!(
        delimiter = %char::from(delimiter),
        variables = columns.variables.len(),
        "import_headers_parsed"
    );

    let chunk_size = limits.chunk_size.max(1);
    let mut chunk = Chunk::default();
    let mut seen = 0u64;
    let mut record = StringRecord::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let parsed = match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) if is_blank(&record) => continue,
            Ok(true) => None,
            Err(e) if matches!(e.kind(), csv::ErrorKind::Utf8 { .. }) => Some(e.to_string()),
            Err(e) => return Err(e.into()),
        };

        seen += 1;
        if seen > limits.max_rows {
            return Err(Error::ImportTooLarge {
                limit: limits.max_rows,
            });
        }
        chunk.seen += 1;

        match parsed {
            Some(message) => chunk.errors.push(RowError {
                row: seen,
                column: None,
                message,
            }),
            None => match columns.parse(&record, seen) {
                Ok(row) => chunk.rows.push(row),
                Err(err) => chunk.errors.push(err),
            },
        }

        if chunk.seen as usize >= chunk_size {
            out.blocking_send(std::mem::take(&mut chunk))
                .map_err(|_| Error::Cancelled)?;
        }
    }

    if chunk.seen > 0 {
        out.blocking_send(chunk).map_err(|_| Error::Cancelled)?;
    }
    Ok(seen)
}
