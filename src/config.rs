use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{ColumnMapping, LogicalField, Term};
use crate::error::HarvestError;
use crate::pipeline::TaskStep;
use crate::portal::PortalRequest;
use crate::reader::{DEFAULT_DELIMITER, DelimitedReader, Layout, ReaderOptions};
use crate::runner::dependency_waves;
use crate::staging::InsertPlan;
use crate::workdir::WorkDir;

pub const DEFAULT_CONFIG_FILE: &str = "kira-dwca.json";
pub const DEFAULT_WORKERS: usize = 3;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub taxonomy_file: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TaskEntry {
    pub name: String,
    pub metadata_file: String,
    pub archive_name: String,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub insert_statement: Option<String>,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub terms: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    #[default]
    Discovered,
    Fixed,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntry {
    pub raw_file: String,
    #[serde(default)]
    pub request: Option<PortalRequest>,
    #[serde(default)]
    pub layout: LayoutKind,
    #[serde(default)]
    pub columns: Option<Vec<LogicalField>>,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub omit_fields: Vec<LogicalField>,
    #[serde(default)]
    pub required_fields: Option<Vec<LogicalField>>,
    #[serde(default)]
    pub min_columns: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SourceDefinition {
    pub raw_file: Utf8PathBuf,
    pub request: Option<PortalRequest>,
    pub options: ReaderOptions,
}

impl SourceDefinition {
    pub fn reader(&self) -> DelimitedReader {
        DelimitedReader::new(self.raw_file.as_std_path(), self.options.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub metadata_file: Utf8PathBuf,
    pub archive_name: String,
    pub table: Option<InsertPlan>,
    pub steps: Vec<TaskStep>,
    pub terms: Vec<Term>,
    pub depends_on: Vec<String>,
    pub sources: Vec<SourceDefinition>,
}

impl TaskDefinition {
    pub fn runs(&self, step: TaskStep) -> bool {
        self.steps.contains(&step)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub workdir: WorkDir,
    pub workers: usize,
    pub database: Option<Utf8PathBuf>,
    pub taxonomy_file: Option<Utf8PathBuf>,
    pub tasks: Vec<TaskDefinition>,
}

impl ResolvedConfig {
    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|task| task.name == name)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let root = match config.working_directory {
            Some(dir) => Utf8PathBuf::from(dir),
            None => WorkDir::default_root()?,
        };
        let workdir = WorkDir::new(root);

        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(HarvestError::Config("workers must be at least 1".to_string()));
        }

        let tasks = config
            .tasks
            .into_iter()
            .map(|entry| resolve_task(entry, &workdir))
            .collect::<Result<Vec<_>, HarvestError>>()?;
        validate_tasks(&tasks)?;

        Ok(ResolvedConfig {
            database: config.database.map(|path| workdir.resolve(&path)),
            taxonomy_file: config.taxonomy_file.map(|path| workdir.resolve(&path)),
            workdir,
            workers,
            tasks,
        })
    }
}

fn resolve_task(entry: TaskEntry, workdir: &WorkDir) -> Result<TaskDefinition, HarvestError> {
    let name = entry.name.trim().to_string();
    if name.is_empty() {
        return Err(HarvestError::Config("task name must not be empty".to_string()));
    }

    let table = match &entry.table_name {
        Some(table) => {
            let plan = match entry.columns {
                Some(columns) => InsertPlan::with_columns(table, columns)?,
                None => InsertPlan::new(table)?,
            };
            Some(match &entry.insert_statement {
                Some(statement) => plan.with_statement(statement),
                None => plan,
            })
        }
        None => None,
    };

    let steps = if entry.steps.is_empty() {
        TaskStep::ALL.to_vec()
    } else {
        entry.steps
    };

    let terms = match entry.terms {
        Some(names) => names
            .iter()
            .map(|term| term.parse::<Term>())
            .collect::<Result<Vec<_>, HarvestError>>()?,
        None => Term::ALL.to_vec(),
    };
    if !terms.contains(&Term::OccurrenceId) {
        return Err(HarvestError::Config(format!(
            "task {name}: terms must include occurrenceID"
        )));
    }
    let mut seen = HashSet::new();
    if let Some(term) = terms.iter().find(|term| !seen.insert(**term)) {
        return Err(HarvestError::Config(format!(
            "task {name}: term {term} listed twice"
        )));
    }

    let sources = entry
        .sources
        .into_iter()
        .map(|source| resolve_source(source, workdir))
        .collect::<Result<Vec<_>, HarvestError>>()?;

    // Reading from a staging table without filling it needs no raw source.
    let reads_raw = steps.contains(&TaskStep::Download)
        || (table.is_some() && steps.contains(&TaskStep::Store))
        || (table.is_none() && steps.contains(&TaskStep::Process));
    if sources.is_empty() && reads_raw {
        return Err(HarvestError::Config(format!(
            "task {name}: at least one source is required"
        )));
    }

    Ok(TaskDefinition {
        metadata_file: workdir.resolve(&entry.metadata_file),
        archive_name: entry.archive_name,
        table,
        steps,
        terms,
        depends_on: entry.depends_on,
        sources,
        name,
    })
}

fn resolve_source(entry: SourceEntry, workdir: &WorkDir) -> Result<SourceDefinition, HarvestError> {
    let layout = match entry.layout {
        LayoutKind::Discovered => Layout::Discovered {
            required: entry
                .required_fields
                .unwrap_or_else(|| vec![LogicalField::Accession]),
            min_columns: entry.min_columns,
        },
        LayoutKind::Fixed => {
            let columns = entry
                .columns
                .unwrap_or_else(|| LogicalField::LEGACY_LAYOUT.to_vec());
            if columns.is_empty() {
                return Err(HarvestError::Config(format!(
                    "{}: fixed layout needs at least one column",
                    entry.raw_file
                )));
            }
            let mapping = ColumnMapping::fixed(&columns);
            Layout::Fixed(match entry.min_columns {
                Some(min) => mapping.with_min_columns(min),
                None => mapping,
            })
        }
    };

    Ok(SourceDefinition {
        raw_file: workdir.resolve(&entry.raw_file),
        request: entry.request,
        options: ReaderOptions {
            delimiter: entry.delimiter.unwrap_or(DEFAULT_DELIMITER),
            layout,
            omit: entry.omit_fields,
        },
    })
}

fn validate_tasks(tasks: &[TaskDefinition]) -> Result<(), HarvestError> {
    let mut names = HashSet::new();
    for task in tasks {
        if !names.insert(task.name.as_str()) {
            return Err(HarvestError::Config(format!(
                "duplicate task name {}",
                task.name
            )));
        }
    }
    for task in tasks {
        if let Some(missing) = task
            .depends_on
            .iter()
            .find(|dependency| !names.contains(dependency.as_str()))
        {
            return Err(HarvestError::Config(format!(
                "task {} depends on unknown task {missing}",
                task.name
            )));
        }
    }
    dependency_waves(tasks).map(|_| ())
}
