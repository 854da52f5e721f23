use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalField {
    Accession,
    SampleAccession,
    Location,
    Country,
    IdentifiedBy,
    CollectedBy,
    CollectionDate,
    SpecimenVoucher,
    SequenceMd5,
    ScientificName,
    TaxId,
    Altitude,
    Sex,
    Description,
    Host,
}

impl LogicalField {
    pub const ALL: [LogicalField; 15] = [
        LogicalField::Accession,
        LogicalField::SampleAccession,
        LogicalField::Location,
        LogicalField::Country,
        LogicalField::IdentifiedBy,
        LogicalField::CollectedBy,
        LogicalField::CollectionDate,
        LogicalField::SpecimenVoucher,
        LogicalField::SequenceMd5,
        LogicalField::ScientificName,
        LogicalField::TaxId,
        LogicalField::Altitude,
        LogicalField::Sex,
        LogicalField::Description,
        LogicalField::Host,
    ];

    pub const LEGACY_LAYOUT: [LogicalField; 12] = [
        LogicalField::Accession,
        LogicalField::Location,
        LogicalField::Country,
        LogicalField::IdentifiedBy,
        LogicalField::CollectedBy,
        LogicalField::CollectionDate,
        LogicalField::SpecimenVoucher,
        LogicalField::SequenceMd5,
        LogicalField::ScientificName,
        LogicalField::TaxId,
        LogicalField::Altitude,
        LogicalField::Sex,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            LogicalField::Accession => "accession",
            LogicalField::SampleAccession => "sample_accession",
            LogicalField::Location => "location",
            LogicalField::Country => "country",
            LogicalField::IdentifiedBy => "identified_by",
            LogicalField::CollectedBy => "collected_by",
            LogicalField::CollectionDate => "collection_date",
            LogicalField::SpecimenVoucher => "specimen_voucher",
            LogicalField::SequenceMd5 => "sequence_md5",
            LogicalField::ScientificName => "scientific_name",
            LogicalField::TaxId => "tax_id",
            LogicalField::Altitude => "altitude",
            LogicalField::Sex => "sex",
            LogicalField::Description => "description",
            LogicalField::Host => "host",
        }
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.column_name())
    }
}

impl FromStr for LogicalField {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        LogicalField::ALL
            .into_iter()
            .find(|field| field.column_name() == normalized)
            .ok_or_else(|| HarvestError::UnknownField(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    header: Vec<String>,
    positions: HashMap<LogicalField, usize>,
    min_columns: usize,
}

impl ColumnMapping {
    pub fn discover(
        source: &str,
        header: &[&str],
        required: &[LogicalField],
    ) -> Result<Self, HarvestError> {
        let mut positions = HashMap::new();
        for (index, name) in header.iter().enumerate() {
            if let Ok(field) = name.parse::<LogicalField>() {
                positions.entry(field).or_insert(index);
            }
        }

        let missing = required
            .iter()
            .filter(|field| !positions.contains_key(field))
            .map(|field| field.column_name())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(HarvestError::MissingColumns {
                path: source.to_string(),
                missing: missing.join(", "),
            });
        }

        let min_columns = required
            .iter()
            .filter_map(|field| positions.get(field))
            .map(|index| index + 1)
            .max()
            .unwrap_or(1);

        Ok(Self {
            header: header.iter().map(|name| name.to_string()).collect(),
            positions,
            min_columns,
        })
    }

    pub fn fixed(layout: &[LogicalField]) -> Self {
        let positions = layout
            .iter()
            .enumerate()
            .map(|(index, field)| (*field, index))
            .collect();
        Self {
            header: layout
                .iter()
                .map(|field| field.column_name().to_string())
                .collect(),
            positions,
            min_columns: layout.len().max(1),
        }
    }

    pub fn with_min_columns(mut self, min_columns: usize) -> Self {
        self.min_columns = min_columns.max(1);
        self
    }

    pub fn without(mut self, omitted: &[LogicalField]) -> Self {
        for field in omitted {
            self.positions.remove(field);
        }
        self
    }

    pub fn position(&self, field: LogicalField) -> Option<usize> {
        self.positions.get(&field).copied()
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn min_columns(&self) -> usize {
        self.min_columns
    }
}

#[derive(Debug, Clone)]
pub struct RawRecord {
    line_number: usize,
    values: Vec<String>,
    mapping: Arc<ColumnMapping>,
}

impl RawRecord {
    pub fn new(line_number: usize, values: Vec<String>, mapping: Arc<ColumnMapping>) -> Self {
        Self {
            line_number,
            values,
            mapping,
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// `None` when the source does not carry the field at all, the empty
    /// string when it does but the row has no value there.
    pub fn field(&self, field: LogicalField) -> Option<&str> {
        let index = self.mapping.position(field)?;
        Some(self.values.get(index).map(String::as_str).unwrap_or(""))
    }

    pub fn field_or_empty(&self, field: LogicalField) -> &str {
        self.field(field).unwrap_or("")
    }

    pub fn column(&self, name: &str) -> Option<&str> {
        let index = self.mapping.header().iter().position(|col| col == name)?;
        self.values.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    #[serde(rename = "occurrenceID")]
    OccurrenceId,
    #[serde(rename = "associatedSequences")]
    AssociatedSequences,
    #[serde(rename = "references")]
    References,
    #[serde(rename = "decimalLatitude")]
    DecimalLatitude,
    #[serde(rename = "decimalLongitude")]
    DecimalLongitude,
    #[serde(rename = "country")]
    Country,
    #[serde(rename = "locality")]
    Locality,
    #[serde(rename = "identifiedBy")]
    IdentifiedBy,
    #[serde(rename = "recordedBy")]
    RecordedBy,
    #[serde(rename = "eventDate")]
    EventDate,
    #[serde(rename = "catalogNumber")]
    CatalogNumber,
    #[serde(rename = "basisOfRecord")]
    BasisOfRecord,
    #[serde(rename = "taxonID")]
    TaxonId,
    #[serde(rename = "scientificName")]
    ScientificName,
    #[serde(rename = "taxonConceptID")]
    TaxonConceptId,
    #[serde(rename = "minimumElevationInMeters")]
    MinimumElevationInMeters,
    #[serde(rename = "maximumElevationInMeters")]
    MaximumElevationInMeters,
    #[serde(rename = "sex")]
    Sex,
    #[serde(rename = "occurrenceRemarks")]
    OccurrenceRemarks,
    #[serde(rename = "associatedTaxa")]
    AssociatedTaxa,
    #[serde(rename = "kingdom")]
    Kingdom,
    #[serde(rename = "phylum")]
    Phylum,
    #[serde(rename = "class")]
    Class,
    #[serde(rename = "order")]
    Order,
    #[serde(rename = "family")]
    Family,
    #[serde(rename = "genus")]
    Genus,
}

const DWC_NS: &str = "http://rs.tdwg.org/dwc/terms/";
const DC_NS: &str = "http://purl.org/dc/terms/";

impl Term {
    pub const COUNT: usize = 26;

    pub const ALL: [Term; Term::COUNT] = [
        Term::OccurrenceId,
        Term::AssociatedSequences,
        Term::References,
        Term::DecimalLatitude,
        Term::DecimalLongitude,
        Term::Country,
        Term::Locality,
        Term::IdentifiedBy,
        Term::RecordedBy,
        Term::EventDate,
        Term::CatalogNumber,
        Term::BasisOfRecord,
        Term::TaxonId,
        Term::ScientificName,
        Term::TaxonConceptId,
        Term::MinimumElevationInMeters,
        Term::MaximumElevationInMeters,
        Term::Sex,
        Term::OccurrenceRemarks,
        Term::AssociatedTaxa,
        Term::Kingdom,
        Term::Phylum,
        Term::Class,
        Term::Order,
        Term::Family,
        Term::Genus,
    ];

    pub fn simple_name(self) -> &'static str {
        match self {
            Term::OccurrenceId => "occurrenceID",
            Term::AssociatedSequences => "associatedSequences",
            Term::References => "references",
            Term::DecimalLatitude => "decimalLatitude",
            Term::DecimalLongitude => "decimalLongitude",
            Term::Country => "country",
            Term::Locality => "locality",
            Term::IdentifiedBy => "identifiedBy",
            Term::RecordedBy => "recordedBy",
            Term::EventDate => "eventDate",
            Term::CatalogNumber => "catalogNumber",
            Term::BasisOfRecord => "basisOfRecord",
            Term::TaxonId => "taxonID",
            Term::ScientificName => "scientificName",
            Term::TaxonConceptId => "taxonConceptID",
            Term::MinimumElevationInMeters => "minimumElevationInMeters",
            Term::MaximumElevationInMeters => "maximumElevationInMeters",
            Term::Sex => "sex",
            Term::OccurrenceRemarks => "occurrenceRemarks",
            Term::AssociatedTaxa => "associatedTaxa",
            Term::Kingdom => "kingdom",
            Term::Phylum => "phylum",
            Term::Class => "class",
            Term::Order => "order",
            Term::Family => "family",
            Term::Genus => "genus",
        }
    }

    pub fn qualified_name(self) -> String {
        let namespace = match self {
            Term::References => DC_NS,
            _ => DWC_NS,
        };
        format!("{namespace}{}", self.simple_name())
    }

    fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.simple_name())
    }
}

impl FromStr for Term {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Term::ALL
            .into_iter()
            .find(|term| term.simple_name() == trimmed || term.qualified_name() == trimmed)
            .ok_or_else(|| HarvestError::UnknownTerm(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedRecord {
    values: [String; Term::COUNT],
}

impl Default for TransformedRecord {
    fn default() -> Self {
        Self {
            values: std::array::from_fn(|_| String::new()),
        }
    }
}

impl TransformedRecord {
    pub fn value(&self, term: Term) -> &str {
        &self.values[term.ordinal()]
    }

    pub fn set(&mut self, term: Term, value: impl Into<String>) {
        self.values[term.ordinal()] = value.into();
    }

    pub fn ordered<'a>(&'a self, terms: &'a [Term]) -> impl Iterator<Item = &'a str> + 'a {
        terms.iter().map(|term| self.value(*term))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    sample_accession: String,
    scientific_name: String,
}

impl NaturalKey {
    pub fn from_parts(sample_accession: &str, scientific_name: &str) -> Option<Self> {
        let sample_accession = sample_accession.trim();
        let scientific_name = scientific_name.trim();
        if sample_accession.is_empty() || scientific_name.is_empty() {
            return None;
        }
        Some(Self {
            sample_accession: sample_accession.to_string(),
            scientific_name: scientific_name.to_string(),
        })
    }

    pub fn of(record: &RawRecord) -> Option<Self> {
        Self::from_parts(
            record.field_or_empty(LogicalField::SampleAccession),
            record.field_or_empty(LogicalField::ScientificName),
        )
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.sample_accession, self.scientific_name)
    }
}
