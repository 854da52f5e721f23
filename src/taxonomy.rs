use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::domain::{Term, TransformedRecord};
use crate::error::HarvestError;
use crate::reader::{DelimitedReader, Layout, ReaderOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonRanks {
    pub kingdom: String,
    pub phylum: String,
    pub class: String,
    pub order: String,
    pub family: String,
    pub genus: String,
}

impl TaxonRanks {
    pub fn apply(&self, record: &mut TransformedRecord) {
        record.set(Term::Kingdom, self.kingdom.as_str());
        record.set(Term::Phylum, self.phylum.as_str());
        record.set(Term::Class, self.class.as_str());
        record.set(Term::Order, self.order.as_str());
        record.set(Term::Family, self.family.as_str());
        record.set(Term::Genus, self.genus.as_str());
    }
}

pub trait TaxonomyLookup: Send + Sync {
    fn lookup(&self, tax_id: &str) -> Option<TaxonRanks>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTaxonomy;

impl TaxonomyLookup for NoTaxonomy {
    fn lookup(&self, _tax_id: &str) -> Option<TaxonRanks> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaxonomyTable {
    entries: HashMap<String, TaxonRanks>,
}

const TAXON_ID_COLUMN: &str = "taxonID";

impl TaxonomyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tax_id: impl Into<String>, ranks: TaxonRanks) {
        self.entries.insert(tax_id.into(), ranks);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads a tab-delimited taxonomy export whose header names `taxonID`
    /// and the Darwin Core rank terms. Rows without a taxon id are skipped.
    pub fn load(path: &Path) -> Result<Self, HarvestError> {
        let reader = DelimitedReader::new(
            path,
            ReaderOptions {
                layout: Layout::discovered(&[]),
                ..ReaderOptions::default()
            },
        );
        let records = reader.records()?;
        if !records
            .mapping()
            .header()
            .iter()
            .any(|name| name == TAXON_ID_COLUMN)
        {
            return Err(HarvestError::MissingColumns {
                path: path.display().to_string(),
                missing: TAXON_ID_COLUMN.to_string(),
            });
        }

        let mut table = Self::new();
        for record in records {
            let record = record?;
            let tax_id = record.column(TAXON_ID_COLUMN).unwrap_or("").trim();
            if tax_id.is_empty() {
                warn!(line = record.line_number(), "missing taxonID");
                continue;
            }
            let rank = |term: Term| {
                record
                    .column(term.simple_name())
                    .unwrap_or("")
                    .trim()
                    .to_string()
            };
            let ranks = TaxonRanks {
                kingdom: rank(Term::Kingdom),
                phylum: rank(Term::Phylum),
                class: rank(Term::Class),
                order: rank(Term::Order),
                family: rank(Term::Family),
                genus: rank(Term::Genus),
            };
            table.insert(tax_id, ranks);
        }
        if table.is_empty() {
            warn!(path = %path.display(), "taxonomy file holds no taxa, ranks stay empty");
        }
        debug!(path = %path.display(), taxa = table.len(), "taxonomy loaded");
        Ok(table)
    }
}

impl TaxonomyLookup for TaxonomyTable {
    fn lookup(&self, tax_id: &str) -> Option<TaxonRanks> {
        self.entries.get(tax_id.trim()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_skips_rows_without_taxon_id() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("taxonomy.tsv");
        std::fs::write(
            &path,
            "taxonID\tkingdom\tphylum\tclass\torder\tfamily\tgenus\n\
             9606\tAnimalia\tChordata\tMammalia\tPrimates\tHominidae\tHomo\n\
             \tPlantae\t\t\t\t\t\n",
        )
        .unwrap();

        let table = TaxonomyTable::load(&path).unwrap();
        assert_eq!(table.len(), 1);
        let ranks = table.lookup("9606").unwrap();
        assert_eq!(ranks.kingdom, "Animalia");
        assert_eq!(ranks.genus, "Homo");
        assert!(table.lookup("1").is_none());
    }

    #[test]
    fn header_only_file_loads_empty_table() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("taxonomy.tsv");
        std::fs::write(&path, "taxonID\tkingdom\n").unwrap();
        let table = TaxonomyTable::load(&path).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn load_rejects_file_without_taxon_id_column() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("taxonomy.tsv");
        std::fs::write(&path, "kingdom\tgenus\nAnimalia\tHomo\n").unwrap();
        assert!(TaxonomyTable::load(&path).is_err());
    }
}
