use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

pub const COUNTRY_DELIMITER: char = ':';
pub const TAXON_ID_PREFIX: &str = "ASV:";
pub const ASSOCIATED_SEQUENCES_URL: &str = "https://www.ebi.ac.uk/ena/browser/api/embl/";
pub const REFERENCES_URL: &str = "https://www.ebi.ac.uk/ena/browser/view/";
pub const TAXON_CONCEPT_ID_URL: &str = "https://www.ebi.ac.uk/ena/browser/view/Taxon:";

pub const PRESERVED_SPECIMEN: &str = "PreservedSpecimen";
pub const MATERIAL_SAMPLE: &str = "MaterialSample";

static LOCATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9.]+)\s+(\w)\s+([0-9.]+)\s+(\w)").expect("location pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    fn groups(self) -> (usize, usize) {
        match self {
            Axis::Latitude => (1, 2),
            Axis::Longitude => (3, 4),
        }
    }

    fn is_negative(self, letter: &str) -> Option<bool> {
        match (self, letter.to_ascii_uppercase().as_str()) {
            (Axis::Latitude, "S") | (Axis::Longitude, "W") => Some(true),
            (Axis::Latitude, "N") | (Axis::Longitude, "E") => Some(false),
            _ => None,
        }
    }
}

pub fn to_latitude(location: &str) -> String {
    coordinate(location, Axis::Latitude)
}

pub fn to_longitude(location: &str) -> String {
    coordinate(location, Axis::Longitude)
}

fn coordinate(location: &str, axis: Axis) -> String {
    if location.trim().is_empty() {
        return String::new();
    }
    let Some(captures) = LOCATION_PATTERN.captures(location) else {
        warn!(location, "coordinates do not match pattern");
        return String::new();
    };

    let (magnitude_group, letter_group) = axis.groups();
    let magnitude = &captures[magnitude_group];
    let letter = &captures[letter_group];

    if magnitude.parse::<f64>().is_err() {
        warn!(location, magnitude, "coordinate magnitude is not a number");
        return String::new();
    }

    match axis.is_negative(letter) {
        Some(true) => format!("-{magnitude}"),
        Some(false) => magnitude.to_string(),
        None => {
            warn!(location, letter, "wrong coordinate letter");
            String::new()
        }
    }
}

pub fn to_country(country: &str) -> String {
    if country.trim().is_empty() {
        return String::new();
    }
    match country.split_once(COUNTRY_DELIMITER) {
        Some((head, _)) => head.to_string(),
        None => country.to_string(),
    }
}

pub fn to_locality(country: &str) -> String {
    if country.trim().is_empty() {
        return String::new();
    }
    match country.split_once(COUNTRY_DELIMITER) {
        Some((_, tail)) => tail.to_string(),
        None => String::new(),
    }
}

pub fn to_basis_of_record(specimen_voucher: &str) -> String {
    if specimen_voucher.trim().is_empty() {
        MATERIAL_SAMPLE.to_string()
    } else {
        PRESERVED_SPECIMEN.to_string()
    }
}

pub fn to_taxon_id(sequence_md5: &str) -> String {
    prefixed(TAXON_ID_PREFIX, sequence_md5)
}

pub fn to_taxon_concept_id(tax_id: &str) -> String {
    prefixed(TAXON_CONCEPT_ID_URL, tax_id)
}

pub fn to_references(accession: &str) -> String {
    prefixed(REFERENCES_URL, accession)
}

pub fn to_associated_sequences(accession: &str) -> String {
    prefixed(ASSOCIATED_SEQUENCES_URL, accession)
}

pub fn trim_to_empty(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

fn prefixed(prefix: &str, value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        String::new()
    } else {
        format!("{prefix}{value}")
    }
}
