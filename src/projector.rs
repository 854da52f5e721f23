use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::domain::{LogicalField, NaturalKey, RawRecord, Term, TransformedRecord};
use crate::error::HarvestError;
use crate::taxonomy::TaxonomyLookup;
use crate::transform::{
    to_associated_sequences, to_basis_of_record, to_country, to_latitude, to_locality,
    to_longitude, to_references, to_taxon_concept_id, to_taxon_id, trim_to_empty,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionStats {
    pub lines_processed: usize,
    pub lines_skipped: usize,
    pub incomplete: usize,
    pub duplicates: usize,
}

pub struct Projector<'a> {
    taxonomy: &'a dyn TaxonomyLookup,
}

impl<'a> Projector<'a> {
    pub fn new(taxonomy: &'a dyn TaxonomyLookup) -> Self {
        Self { taxonomy }
    }

    pub fn project<I>(&self, records: I) -> Projection<'a, I::IntoIter>
    where
        I: IntoIterator<Item = Result<RawRecord, HarvestError>>,
    {
        Projection {
            records: records.into_iter(),
            taxonomy: self.taxonomy,
            seen: HashSet::new(),
            stats: ProjectionStats::default(),
        }
    }
}

pub struct Projection<'a, I> {
    records: I,
    taxonomy: &'a dyn TaxonomyLookup,
    seen: HashSet<NaturalKey>,
    stats: ProjectionStats,
}

impl<I> Projection<'_, I> {
    pub fn stats(&self) -> ProjectionStats {
        self.stats
    }

    fn admit(&mut self, record: &RawRecord) -> bool {
        if lacks_occurrence_evidence(record) {
            self.stats.incomplete += 1;
            self.stats.lines_skipped += 1;
            return false;
        }

        if let Some(key) = NaturalKey::of(record) {
            if self.seen.contains(&key) {
                debug!(line = record.line_number(), key = %key, "duplicate record skipped");
                self.stats.duplicates += 1;
                self.stats.lines_skipped += 1;
                return false;
            }
            self.seen.insert(key);
        }
        true
    }
}

impl<I> Iterator for Projection<'_, I>
where
    I: Iterator<Item = Result<RawRecord, HarvestError>>,
{
    type Item = Result<TransformedRecord, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(err) => return Some(Err(err)),
            };
            if !self.admit(&record) {
                continue;
            }
            self.stats.lines_processed += 1;
            return Some(Ok(transform_record(&record, self.taxonomy)));
        }
    }
}

// A source that carries neither evidence column cannot be judged and is
// let through.
fn lacks_occurrence_evidence(record: &RawRecord) -> bool {
    let voucher = record.field(LogicalField::SpecimenVoucher);
    let date = record.field(LogicalField::CollectionDate);
    if voucher.is_none() && date.is_none() {
        return false;
    }
    let blank = |value: Option<&str>| value.map(str::trim).unwrap_or("").is_empty();
    blank(voucher) && blank(date)
}

pub fn transform_record(raw: &RawRecord, taxonomy: &dyn TaxonomyLookup) -> TransformedRecord {
    let field = |field: LogicalField| raw.field_or_empty(field);
    let accession = field(LogicalField::Accession);
    let location = field(LogicalField::Location);
    let country = field(LogicalField::Country);
    let voucher = field(LogicalField::SpecimenVoucher);
    let altitude = trim_to_empty(raw.field(LogicalField::Altitude));

    let mut record = TransformedRecord::default();
    record.set(Term::OccurrenceId, accession.trim());
    record.set(Term::AssociatedSequences, to_associated_sequences(accession));
    record.set(Term::References, to_references(accession));
    record.set(Term::DecimalLatitude, to_latitude(location));
    record.set(Term::DecimalLongitude, to_longitude(location));
    record.set(Term::Country, to_country(country));
    record.set(Term::Locality, to_locality(country));
    record.set(Term::IdentifiedBy, trim_to_empty(raw.field(LogicalField::IdentifiedBy)));
    record.set(Term::RecordedBy, trim_to_empty(raw.field(LogicalField::CollectedBy)));
    record.set(Term::EventDate, trim_to_empty(raw.field(LogicalField::CollectionDate)));
    record.set(Term::CatalogNumber, voucher.trim());
    record.set(Term::BasisOfRecord, to_basis_of_record(voucher));
    record.set(Term::TaxonId, to_taxon_id(field(LogicalField::SequenceMd5)));
    record.set(Term::ScientificName, trim_to_empty(raw.field(LogicalField::ScientificName)));
    record.set(Term::TaxonConceptId, to_taxon_concept_id(field(LogicalField::TaxId)));
    record.set(Term::MinimumElevationInMeters, altitude.as_str());
    record.set(Term::MaximumElevationInMeters, altitude);
    record.set(Term::Sex, trim_to_empty(raw.field(LogicalField::Sex)));
    record.set(Term::OccurrenceRemarks, trim_to_empty(raw.field(LogicalField::Description)));
    record.set(Term::AssociatedTaxa, trim_to_empty(raw.field(LogicalField::Host)));

    if let Some(ranks) = taxonomy.lookup(field(LogicalField::TaxId)) {
        ranks.apply(&mut record);
    }
    record
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::ColumnMapping;
    use crate::taxonomy::{NoTaxonomy, TaxonRanks, TaxonomyTable};

    const HEADER: [LogicalField; 6] = [
        LogicalField::Accession,
        LogicalField::SampleAccession,
        LogicalField::ScientificName,
        LogicalField::SpecimenVoucher,
        LogicalField::CollectionDate,
        LogicalField::TaxId,
    ];

    fn rows(values: &[[&str; 6]]) -> Vec<Result<RawRecord, HarvestError>> {
        let mapping = Arc::new(ColumnMapping::fixed(&HEADER));
        values
            .iter()
            .enumerate()
            .map(|(index, row)| {
                Ok(RawRecord::new(
                    index + 2,
                    row.iter().map(|value| value.to_string()).collect(),
                    Arc::clone(&mapping),
                ))
            })
            .collect()
    }

    fn project(values: &[[&str; 6]]) -> (Vec<TransformedRecord>, ProjectionStats) {
        let taxonomy = NoTaxonomy;
        let projector = Projector::new(&taxonomy);
        let mut projection = projector.project(rows(values));
        let records = projection
            .by_ref()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        (records, projection.stats())
    }

    #[test]
    fn duplicates_by_sample_and_name_emit_once() {
        let (records, stats) = project(&[
            ["AB1", "SAMEA1", "Homo sapiens", "V1", "", "9606"],
            ["AB2", "SAMEA1", "Homo sapiens", "", "2020-01-01", "9606"],
            ["AB3", "SAMEA1", "Pan troglodytes", "V3", "", "9598"],
        ]);
        let ids = records
            .iter()
            .map(|record| record.value(Term::OccurrenceId))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["AB1", "AB3"]);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.lines_processed, 2);
        assert_eq!(stats.lines_skipped, 1);
    }

    #[test]
    fn records_without_full_key_are_never_deduplicated() {
        let (records, _) = project(&[
            ["AB1", "", "Homo sapiens", "V1", "", ""],
            ["AB2", "", "Homo sapiens", "V2", "", ""],
            ["AB3", "SAMEA9", "", "V3", "", ""],
            ["AB4", "SAMEA9", "", "V4", "", ""],
        ]);
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn incomplete_records_are_skipped_before_identity_check() {
        let (records, stats) = project(&[
            ["AB1", "SAMEA1", "Homo sapiens", "", "", ""],
            ["AB2", "SAMEA1", "Homo sapiens", " ", "2021", ""],
        ]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(Term::OccurrenceId), "AB2");
        assert_eq!(stats.incomplete, 1);
        assert_eq!(stats.duplicates, 0);
    }

    #[test]
    fn source_without_evidence_columns_is_not_gated() {
        let mapping = Arc::new(ColumnMapping::fixed(&[LogicalField::Accession]));
        let taxonomy = NoTaxonomy;
        let records = Projector::new(&taxonomy)
            .project(vec![Ok(RawRecord::new(2, vec!["AB1".to_string()], mapping))])
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(Term::BasisOfRecord), "MaterialSample");
    }

    #[test]
    fn taxonomy_ranks_are_filled_from_side_table() {
        let mut taxonomy = TaxonomyTable::new();
        taxonomy.insert(
            "9606",
            TaxonRanks {
                kingdom: "Animalia".to_string(),
                genus: "Homo".to_string(),
                ..TaxonRanks::default()
            },
        );
        let records = Projector::new(&taxonomy)
            .project(rows(&[["AB1", "S1", "Homo sapiens", "V1", "", "9606"]]))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records[0].value(Term::Kingdom), "Animalia");
        assert_eq!(records[0].value(Term::Genus), "Homo");
        assert_eq!(records[0].value(Term::Phylum), "");
        assert_eq!(
            records[0].value(Term::TaxonConceptId),
            "https://www.ebi.ac.uk/ena/browser/view/Taxon:9606"
        );
        assert_eq!(records[0].value(Term::BasisOfRecord), "PreservedSpecimen");
        assert_eq!(records[0].value(Term::CatalogNumber), "V1");
    }

    #[test]
    fn stream_errors_pass_through() {
        let taxonomy = NoTaxonomy;
        let mut projection = Projector::new(&taxonomy).project(vec![Err::<RawRecord, _>(
            HarvestError::Filesystem("boom".to_string()),
        )]);
        assert!(matches!(
            projection.next(),
            Some(Err(HarvestError::Filesystem(_)))
        ));
        assert!(projection.next().is_none());
    }
}
