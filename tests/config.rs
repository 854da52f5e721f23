use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_dwca_harvester::config::{Config, ConfigLoader, DEFAULT_WORKERS};
use kira_dwca_harvester::domain::{LogicalField, Term};
use kira_dwca_harvester::error::HarvestError;
use kira_dwca_harvester::pipeline::TaskStep;
use kira_dwca_harvester::reader::Layout;
use kira_dwca_harvester::staging::STAGED_FIELD_COUNT;

const FULL_CONFIG: &str = r#"{
    "working_directory": "/data/embl",
    "workers": 2,
    "database": "staging.sqlite",
    "taxonomy_file": "/data/taxonomy.tsv",
    "tasks": [
        {
            "name": "sequences",
            "metadata_file": "eml/sequences.xml",
            "archive_name": "sequences_{date}.zip",
            "table_name": "embl_data",
            "steps": ["download", "store"],
            "sources": [
                {
                    "raw_file": "raw/sequence1.tsv",
                    "request": {
                        "result": "sequence",
                        "fields": "accession,location,country",
                        "query": "dataclass=\"STD\"",
                        "offset": 100,
                        "limit": 50
                    },
                    "min_columns": 14
                },
                {
                    "raw_file": "raw/sequence2.tsv",
                    "layout": "fixed",
                    "columns": ["accession", "location", "country"],
                    "delimiter": ",",
                    "omit_fields": ["sequence_md5"]
                }
            ]
        },
        {
            "name": "archive",
            "metadata_file": "eml/sequences.xml",
            "archive_name": "embl_{date}.zip",
            "table_name": "embl_data",
            "steps": ["process", "delete_raw_files"],
            "terms": ["occurrenceID", "country", "http://rs.tdwg.org/dwc/terms/locality"],
            "depends_on": ["sequences"]
        }
    ]
}"#;

#[test]
fn resolve_reads_full_config_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-dwca.json");
    fs::write(&path, FULL_CONFIG).unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.workers, 2);
    assert_eq!(
        resolved.database,
        Some(Utf8PathBuf::from("/data/embl/staging.sqlite"))
    );
    assert_eq!(
        resolved.taxonomy_file,
        Some(Utf8PathBuf::from("/data/taxonomy.tsv"))
    );
    assert_eq!(resolved.tasks.len(), 2);

    let sequences = resolved.task("sequences").unwrap();
    assert_eq!(sequences.steps, vec![TaskStep::Download, TaskStep::Store]);
    let plan = sequences.table.as_ref().unwrap();
    assert_eq!(plan.columns().len(), STAGED_FIELD_COUNT);
    assert!(plan.validate(STAGED_FIELD_COUNT).is_ok());

    let first = &sequences.sources[0];
    let request = first.request.as_ref().unwrap();
    assert_eq!(request.offset, 100);
    assert!(request.to_url(request.offset).contains("&offset=100&limit=50&"));
    assert_eq!(
        first.raw_file,
        Utf8PathBuf::from("/data/embl/raw/sequence1.tsv")
    );

    let second = &sequences.sources[1];
    assert!(second.request.is_none());
    assert_eq!(second.options.delimiter, ',');
    assert_eq!(second.options.omit, vec![LogicalField::SequenceMd5]);
    assert_matches!(&second.options.layout, Layout::Fixed(mapping) if mapping.position(LogicalField::Country) == Some(2));

    let archive = resolved.task("archive").unwrap();
    assert!(archive.sources.is_empty());
    assert_eq!(
        archive.terms,
        vec![Term::OccurrenceId, Term::Country, Term::Locality]
    );
    assert_eq!(archive.depends_on, vec!["sequences".to_string()]);
}

#[test]
fn missing_default_config_is_reported() {
    let result = ConfigLoader::resolve(None);
    assert_matches!(result, Err(HarvestError::MissingConfig));
}

#[test]
fn unreadable_and_malformed_configs_are_distinct_errors() {
    let temp = tempfile::tempdir().unwrap();
    let absent = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(Some(absent.to_str().unwrap())),
        Err(HarvestError::ConfigRead(_))
    );

    let broken = temp.path().join("broken.json");
    fs::write(&broken, "{ \"tasks\": [ }").unwrap();
    assert_matches!(
        ConfigLoader::resolve(Some(broken.to_str().unwrap())),
        Err(HarvestError::ConfigParse(_))
    );
}

#[test]
fn duplicate_task_names_are_rejected() {
    let config: Config = serde_json::from_str(
        r#"{
            "working_directory": "/w",
            "tasks": [
                {"name": "t", "metadata_file": "m", "archive_name": "a.zip",
                 "sources": [{"raw_file": "a.tsv"}]},
                {"name": "t", "metadata_file": "m", "archive_name": "b.zip",
                 "sources": [{"raw_file": "b.tsv"}]}
            ]
        }"#,
    )
    .unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert!(err.is_configuration());
    assert_matches!(err, HarvestError::Config(message) if message.contains("duplicate"));
}

#[test]
fn invalid_table_name_is_rejected() {
    let config: Config = serde_json::from_str(
        r#"{
            "working_directory": "/w",
            "tasks": [{"name": "t", "metadata_file": "m", "archive_name": "a.zip",
                       "table_name": "embl; DROP TABLE x",
                       "sources": [{"raw_file": "a.tsv"}]}]
        }"#,
    )
    .unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(HarvestError::Config(_))
    );
}

#[test]
fn zero_workers_is_rejected() {
    let config: Config =
        serde_json::from_str(r#"{"working_directory": "/w", "workers": 0}"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(HarvestError::Config(_))
    );
    let config: Config = serde_json::from_str(r#"{"working_directory": "/w"}"#).unwrap();
    assert_eq!(
        ConfigLoader::resolve_config(config).unwrap().workers,
        DEFAULT_WORKERS
    );
}
