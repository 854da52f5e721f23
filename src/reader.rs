// The portal never quotes or escapes values, so a delimiter is always a
// column boundary.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{ColumnMapping, LogicalField, RawRecord};
use crate::error::HarvestError;

pub const DEFAULT_DELIMITER: char = '\t';

#[derive(Debug, Clone)]
pub enum Layout {
    /// Caller-supplied positions; the header line is skipped unread.
    Fixed(ColumnMapping),
    Discovered {
        required: Vec<LogicalField>,
        min_columns: Option<usize>,
    },
}

impl Layout {
    pub fn discovered(required: &[LogicalField]) -> Self {
        Layout::Discovered {
            required: required.to_vec(),
            min_columns: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub delimiter: char,
    pub layout: Layout,
    pub omit: Vec<LogicalField>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            layout: Layout::discovered(&[LogicalField::Accession]),
            omit: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadStats {
    pub lines_read: usize,
    pub lines_dropped: usize,
}

impl ReadStats {
    pub fn absorb(&mut self, other: ReadStats) {
        self.lines_read += other.lines_read;
        self.lines_dropped += other.lines_dropped;
    }
}

#[derive(Debug, Clone)]
pub struct DelimitedReader {
    path: PathBuf,
    options: ReaderOptions,
}

impl DelimitedReader {
    pub fn new(path: impl Into<PathBuf>, options: ReaderOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> Result<Records<Box<dyn BufRead>>, HarvestError> {
        let input = open_input(&self.path)?;
        Records::new(
            input,
            self.path.display().to_string(),
            self.options.clone(),
        )
    }
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>, HarvestError> {
    let file = File::open(path)
        .map_err(|err| HarvestError::Filesystem(format!("open {}: {err}", path.display())))?;
    let is_gzip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if is_gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub struct Records<R: BufRead> {
    input: R,
    buffer: Vec<u8>,
    source: String,
    delimiter: char,
    mapping: Arc<ColumnMapping>,
    line_number: usize,
    stats: ReadStats,
}

impl<R: BufRead> Records<R> {
    /// Consumes the header line and builds the column mapping before any
    /// data row is touched.
    pub fn new(
        mut input: R,
        source: String,
        options: ReaderOptions,
    ) -> Result<Self, HarvestError> {
        let mut buffer = Vec::new();
        let read = read_line(&mut input, &mut buffer)
            .map_err(|err| HarvestError::Filesystem(format!("read header of {source}: {err}")))?;
        if read == 0 {
            return Err(HarvestError::EmptySource(source));
        }
        let header = String::from_utf8_lossy(&buffer).into_owned();
        let header = header.as_str();

        let mapping = match options.layout {
            Layout::Fixed(mapping) => mapping,
            Layout::Discovered {
                required,
                min_columns,
            } => {
                let columns = header.split(options.delimiter).collect::<Vec<_>>();
                let mapping = ColumnMapping::discover(&source, &columns, &required)?;
                match min_columns {
                    Some(min) => mapping.with_min_columns(min),
                    None => mapping,
                }
            }
        };
        let mapping = mapping.without(&options.omit);
        debug!(
            source = %source,
            columns = mapping.header().len(),
            min_columns = mapping.min_columns(),
            "column mapping built"
        );

        Ok(Self {
            input,
            buffer,
            source,
            delimiter: options.delimiter,
            mapping: Arc::new(mapping),
            line_number: 1,
            stats: ReadStats::default(),
        })
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<RawRecord, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match read_line(&mut self.input, &mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => {
                    return Some(Err(HarvestError::Filesystem(format!(
                        "read {} line {}: {err}",
                        self.source,
                        self.line_number + 1
                    ))));
                }
            }
            self.line_number += 1;
            if self.buffer.is_empty() {
                continue;
            }
            self.stats.lines_read += 1;

            let line = match std::str::from_utf8(&self.buffer) {
                Ok(line) => line,
                Err(err) => {
                    self.stats.lines_dropped += 1;
                    warn!(
                        source = %self.source,
                        line = self.line_number,
                        error = %err,
                        "dropping row that is not valid UTF-8"
                    );
                    continue;
                }
            };

            let values = line
                .split(self.delimiter)
                .map(str::to_string)
                .collect::<Vec<_>>();
            if values.len() < self.mapping.min_columns() {
                self.stats.lines_dropped += 1;
                warn!(
                    source = %self.source,
                    line = self.line_number,
                    found = values.len(),
                    expected = self.mapping.min_columns(),
                    "dropping row with too few columns"
                );
                continue;
            }

            return Some(Ok(RawRecord::new(
                self.line_number,
                values,
                Arc::clone(&self.mapping),
            )));
        }
    }
}

pub struct MergedRecords {
    pending: std::vec::IntoIter<DelimitedReader>,
    current: Option<Records<Box<dyn BufRead>>>,
    finished: ReadStats,
}

impl MergedRecords {
    pub fn new(readers: Vec<DelimitedReader>) -> Self {
        Self {
            pending: readers.into_iter(),
            current: None,
            finished: ReadStats::default(),
        }
    }

    pub fn stats(&self) -> ReadStats {
        let mut stats = self.finished;
        if let Some(current) = &self.current {
            stats.absorb(current.stats());
        }
        stats
    }
}

impl Iterator for MergedRecords {
    type Item = Result<RawRecord, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(item) = current.next() {
                    return Some(item);
                }
                self.finished.absorb(current.stats());
                self.current = None;
            }
            let reader = self.pending.next()?;
            debug!(source = %reader.path().display(), "reading source");
            match reader.records() {
                Ok(records) => self.current = Some(records),
                Err(err) => {
                    self.pending = Vec::new().into_iter();
                    return Some(Err(err));
                }
            }
        }
    }
}

fn read_line<R: BufRead>(input: &mut R, buffer: &mut Vec<u8>) -> io::Result<usize> {
    buffer.clear();
    let read = input.read_until(b'\n', buffer)?;
    if buffer.last() == Some(&b'\n') {
        buffer.pop();
        if buffer.last() == Some(&b'\r') {
            buffer.pop();
        }
    }
    Ok(read)
}
