use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::{Term, TransformedRecord};
use crate::error::HarvestError;
use crate::fs_util::{validate_zip, zip_dir};
use crate::workdir::{WorkDir, persist_over, temp_file_beside};

pub const METADATA_FILENAME: &str = "eml.xml";
pub const CORE_FILENAME: &str = "occurrence.txt";
pub const DESCRIPTOR_FILENAME: &str = "meta.xml";
pub const PUB_DATE_PLACEHOLDER: &str = "{{pubDate}}";

pub const OUTPUT_DELIMITER: char = '\t';
pub const LINE_TERMINATOR: char = '\n';
pub const ENCODING: &str = "UTF-8";
pub const HEADER_LINES: usize = 1;
pub const OCCURRENCE_ROW_TYPE: &str = "http://rs.tdwg.org/dwc/terms/Occurrence";
const DWC_TEXT_NS: &str = "http://rs.tdwg.org/dwc/text/";

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub path: Utf8PathBuf,
    pub records_written: usize,
    pub metadata_included: bool,
}

#[derive(Debug, Clone)]
pub struct ArchiveAssembler {
    workdir: WorkDir,
    publication_date: NaiveDate,
}

impl ArchiveAssembler {
    pub fn new(workdir: WorkDir) -> Self {
        Self {
            workdir,
            publication_date: Local::now().date_naive(),
        }
    }

    pub fn with_publication_date(mut self, date: NaiveDate) -> Self {
        self.publication_date = date;
        self
    }

    pub fn publication_date(&self) -> NaiveDate {
        self.publication_date
    }

    /// Builds the archive at `output`, overwriting any previous file there.
    ///
    /// The scratch directory is removed on every exit path. On failure no
    /// file is left at `output`.
    pub fn assemble<I>(
        &self,
        output: &Utf8Path,
        records: I,
        terms: &[Term],
        metadata_template: &Path,
    ) -> Result<ArchiveReport, HarvestError>
    where
        I: IntoIterator<Item = Result<TransformedRecord, HarvestError>>,
    {
        validate_terms(terms)?;
        info!(archive = %output, "start building the archive");

        let scratch = self.workdir.scratch_dir("temp_")?;
        let result = self.build(scratch.path(), output, records, terms, metadata_template);

        let scratch_path = scratch.path().to_path_buf();
        debug!(dir = %scratch_path.display(), "cleaning up archive directory");
        if let Err(err) = scratch.close() {
            warn!(dir = %scratch_path.display(), error = %err, "failed to remove archive directory");
        }

        match &result {
            Ok(report) => info!(
                archive = %report.path,
                records = report.records_written,
                "archive created"
            ),
            Err(err) => error!(archive = %output, error = %err, "error while building archive"),
        }
        result
    }

    fn build<I>(
        &self,
        dir: &Path,
        output: &Utf8Path,
        records: I,
        terms: &[Term],
        metadata_template: &Path,
    ) -> Result<ArchiveReport, HarvestError>
    where
        I: IntoIterator<Item = Result<TransformedRecord, HarvestError>>,
    {
        let metadata_included = self.write_metadata(dir, metadata_template)?;
        write_descriptor(dir, terms, metadata_included)?;
        let records_written = write_core_file(dir, records, terms)?;

        let mut temp = temp_file_beside(output)?;
        zip_dir(dir, temp.as_file_mut())?;
        validate_zip(temp.path())?;
        persist_over(temp, output)?;

        Ok(ArchiveReport {
            path: output.to_path_buf(),
            records_written,
            metadata_included,
        })
    }

    fn write_metadata(&self, dir: &Path, template: &Path) -> Result<bool, HarvestError> {
        if !template.is_file() {
            error!(
                template = %template.display(),
                "metadata file is not present, archive will lack {METADATA_FILENAME}"
            );
            return Ok(false);
        }
        debug!(template = %template.display(), "metadata file is present, copying");
        let content = fs::read_to_string(template).map_err(|err| {
            HarvestError::Filesystem(format!("read {}: {err}", template.display()))
        })?;
        let content = render_metadata(&content, self.publication_date);
        fs::write(dir.join(METADATA_FILENAME), content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(true)
    }
}

pub fn render_metadata(template: &str, publication_date: NaiveDate) -> String {
    template.replace(
        PUB_DATE_PLACEHOLDER,
        &publication_date.format("%Y-%m-%d").to_string(),
    )
}

fn validate_terms(terms: &[Term]) -> Result<(), HarvestError> {
    if !terms.contains(&Term::OccurrenceId) {
        return Err(HarvestError::Config(
            "archive columns must include the occurrenceID term".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    if let Some(term) = terms.iter().find(|term| !seen.insert(**term)) {
        return Err(HarvestError::Config(format!("term {term} listed twice")));
    }
    Ok(())
}

pub fn descriptor_xml(terms: &[Term], metadata_included: bool) -> String {
    let id_index = terms
        .iter()
        .position(|term| *term == Term::OccurrenceId)
        .unwrap_or(0);
    let metadata = if metadata_included {
        format!(" metadata=\"{METADATA_FILENAME}\"")
    } else {
        String::new()
    };

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!("<archive xmlns=\"{DWC_TEXT_NS}\"{metadata}>\n"));
    xml.push_str(&format!(
        "  <core encoding=\"{ENCODING}\" fieldsTerminatedBy=\"{}\" linesTerminatedBy=\"{}\" \
         fieldsEnclosedBy=\"\" ignoreHeaderLines=\"{HEADER_LINES}\" rowType=\"{OCCURRENCE_ROW_TYPE}\">\n",
        escape_control(OUTPUT_DELIMITER),
        escape_control(LINE_TERMINATOR)
    ));
    xml.push_str("    <files>\n");
    xml.push_str(&format!("      <location>{CORE_FILENAME}</location>\n"));
    xml.push_str("    </files>\n");
    xml.push_str(&format!("    <id index=\"{id_index}\"/>\n"));
    for (index, term) in terms.iter().enumerate() {
        xml.push_str(&format!(
            "    <field index=\"{index}\" term=\"{}\"/>\n",
            term.qualified_name()
        ));
    }
    xml.push_str("  </core>\n");
    xml.push_str("</archive>\n");
    xml
}

fn escape_control(ch: char) -> String {
    match ch {
        '\t' => "\\t".to_string(),
        '\n' => "\\n".to_string(),
        other => other.to_string(),
    }
}

fn write_descriptor(
    dir: &Path,
    terms: &[Term],
    metadata_included: bool,
) -> Result<(), HarvestError> {
    debug!(dir = %dir.display(), "creating archive descriptor {DESCRIPTOR_FILENAME}");
    fs::write(
        dir.join(DESCRIPTOR_FILENAME),
        descriptor_xml(terms, metadata_included),
    )
    .map_err(|err| HarvestError::Filesystem(err.to_string()))
}

fn write_core_file<I>(dir: &Path, records: I, terms: &[Term]) -> Result<usize, HarvestError>
where
    I: IntoIterator<Item = Result<TransformedRecord, HarvestError>>,
{
    debug!(dir = %dir.display(), "creating core file {CORE_FILENAME}");
    let file = File::create(dir.join(CORE_FILENAME))
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut writer = BufWriter::new(file);
    let io_err = |err: std::io::Error| HarvestError::Filesystem(err.to_string());

    let header = terms
        .iter()
        .map(|term| term.simple_name())
        .collect::<Vec<_>>()
        .join(&OUTPUT_DELIMITER.to_string());
    write!(writer, "{header}{LINE_TERMINATOR}").map_err(io_err)?;

    let mut written = 0;
    for record in records {
        let record = record?;
        let mut first = true;
        for value in record.ordered(terms) {
            if !first {
                write!(writer, "{OUTPUT_DELIMITER}").map_err(io_err)?;
            }
            first = false;
            writer
                .write_all(flatten_value(value).as_bytes())
                .map_err(io_err)?;
        }
        write!(writer, "{LINE_TERMINATOR}").map_err(io_err)?;
        written += 1;
    }
    writer.flush().map_err(io_err)?;
    Ok(written)
}

fn flatten_value(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains(['\t', '\n', '\r']) {
        std::borrow::Cow::Owned(value.replace(['\t', '\n', '\r'], " "))
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}
