use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span};

use crate::archive::{ArchiveAssembler, ArchiveReport};
use crate::config::TaskDefinition;
use crate::domain::TransformedRecord;
use crate::error::HarvestError;
use crate::fs_util::remove_files;
use crate::portal::PortalClient;
use crate::projector::{ProjectionStats, Projector};
use crate::reader::{MergedRecords, ReadStats};
use crate::staging::{
    InsertStats, STAGED_FIELD_COUNT, StagedRecords, StagingStore, WRITE_BATCH_SIZE, bulk_insert,
};
use crate::taxonomy::TaxonomyLookup;
use crate::workdir::WorkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Downloading,
    Staging,
    Transforming,
    Assembling,
    CleaningUp,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Downloading => "downloading",
            TaskState::Staging => "staging",
            TaskState::Transforming => "transforming",
            TaskState::Assembling => "assembling",
            TaskState::CleaningUp => "cleaning up",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    Download,
    Store,
    Process,
    DeleteRawFiles,
}

impl TaskStep {
    pub const ALL: [TaskStep; 4] = [
        TaskStep::Download,
        TaskStep::Store,
        TaskStep::Process,
        TaskStep::DeleteRawFiles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStep::Download => "download",
            TaskStep::Store => "store",
            TaskStep::Process => "process",
            TaskStep::DeleteRawFiles => "delete_raw_files",
        }
    }
}

impl fmt::Display for TaskStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub state: TaskState,
    pub downloaded_bytes: u64,
    pub read: ReadStats,
    pub staged: Option<InsertStats>,
    pub projection: Option<ProjectionStats>,
    pub archive: Option<ArchiveReport>,
    pub raw_files_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskReport {
    fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            state: TaskState::Idle,
            downloaded_bytes: 0,
            read: ReadStats::default(),
            staged: None,
            projection: None,
            archive: None,
            raw_files_deleted: false,
            error: None,
        }
    }

    pub fn failed(task: &str, err: &HarvestError) -> Self {
        Self {
            state: TaskState::Failed,
            error: Some(err.to_string()),
            ..Self::new(task)
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    workdir: WorkDir,
    portal: Arc<dyn PortalClient>,
    store: Arc<dyn StagingStore>,
    taxonomy: Arc<dyn TaxonomyLookup>,
    assembler: ArchiveAssembler,
}

impl Pipeline {
    pub fn new(
        workdir: WorkDir,
        portal: Arc<dyn PortalClient>,
        store: Arc<dyn StagingStore>,
        taxonomy: Arc<dyn TaxonomyLookup>,
    ) -> Self {
        let assembler = ArchiveAssembler::new(workdir.clone());
        Self {
            workdir,
            portal,
            store,
            taxonomy,
            assembler,
        }
    }

    pub fn with_run_date(mut self, date: NaiveDate) -> Self {
        self.assembler = self.assembler.with_publication_date(date);
        self
    }

    /// On failure the error names the state the task was in and raw files
    /// are left in place.
    pub fn run(&self, task: &TaskDefinition) -> Result<TaskReport, HarvestError> {
        let span = info_span!("task", task = %task.name);
        let _guard = span.enter();

        let mut run = TaskRun::new(&task.name);
        match self.execute(task, &mut run) {
            Ok(()) => {
                run.transition(TaskState::Done);
                Ok(run.report)
            }
            Err(err) => {
                let state = run.report.state;
                error!(state = %state, error = %err, "task failed");
                Err(HarvestError::TaskFailed {
                    task: task.name.clone(),
                    state,
                    source: Box::new(err),
                })
            }
        }
    }

    fn execute(&self, task: &TaskDefinition, run: &mut TaskRun) -> Result<(), HarvestError> {
        if let Some(plan) = &task.table {
            plan.validate(STAGED_FIELD_COUNT)?;
        }

        run.transition(TaskState::Downloading);
        if task.runs(TaskStep::Download) {
            for source in &task.sources {
                match &source.request {
                    Some(request) => {
                        let bytes = self
                            .portal
                            .download(request, request.offset, &source.raw_file)?;
                        run.report.downloaded_bytes += bytes;
                    }
                    None => debug!(raw_file = %source.raw_file, "no request configured"),
                }
            }
        } else {
            info!("skipping download step");
        }

        run.transition(TaskState::Staging);
        match &task.table {
            Some(plan) if task.runs(TaskStep::Store) => {
                self.store.ensure_table(plan)?;
                self.store.reset(plan.table())?;
                let mut staged = InsertStats::default();
                for source in &task.sources {
                    let mut records = source.reader().records()?;
                    let stats = bulk_insert(&*self.store, plan, &mut records, WRITE_BATCH_SIZE)?;
                    run.report.read.absorb(records.stats());
                    staged.inserted += stats.inserted;
                    staged.ignored += stats.ignored;
                    staged.batches += stats.batches;
                }
                info!(
                    table = plan.table(),
                    inserted = staged.inserted,
                    ignored = staged.ignored,
                    "raw data stored"
                );
                run.report.staged = Some(staged);
            }
            Some(_) => info!("skipping store step"),
            None => debug!("no staging table, records are read directly"),
        }

        if task.runs(TaskStep::Process) {
            run.transition(TaskState::Transforming);
            let projector = Projector::new(&*self.taxonomy);
            let archive = match &task.table {
                Some(plan) => {
                    let mut staged = StagedRecords::new(&*self.store, plan.clone());
                    let mut projection = projector.project(&mut staged);
                    let archive = self.assemble(task, run, &mut projection)?;
                    run.report.projection = Some(projection.stats());
                    archive
                }
                None => {
                    let mut merged =
                        MergedRecords::new(task.sources.iter().map(|s| s.reader()).collect());
                    let mut projection = projector.project(&mut merged);
                    let archive = self.assemble(task, run, &mut projection)?;
                    run.report.projection = Some(projection.stats());
                    drop(projection);
                    run.report.read.absorb(merged.stats());
                    archive
                }
            };
            if let Some(stats) = run.report.projection {
                info!(
                    processed = stats.lines_processed,
                    skipped = stats.lines_skipped,
                    "records processed"
                );
            }
            run.report.archive = Some(archive);
        } else {
            info!("skipping process step");
        }

        run.transition(TaskState::CleaningUp);
        if task.runs(TaskStep::DeleteRawFiles) {
            // Raw files go only once an archive was built from them.
            if run.report.archive.is_some() {
                let paths = task
                    .sources
                    .iter()
                    .map(|source| source.raw_file.clone().into_std_path_buf())
                    .collect::<Vec<_>>();
                remove_files(&paths)?;
                run.report.raw_files_deleted = true;
            } else {
                info!("no archive built in this run, keeping raw files");
            }
        }
        Ok(())
    }

    fn assemble<I>(
        &self,
        task: &TaskDefinition,
        run: &mut TaskRun,
        records: I,
    ) -> Result<ArchiveReport, HarvestError>
    where
        I: IntoIterator<Item = Result<TransformedRecord, HarvestError>>,
    {
        run.transition(TaskState::Assembling);
        let output = self
            .workdir
            .archive_path(&task.archive_name, self.assembler.publication_date());
        self.assembler.assemble(
            &output,
            records,
            &task.terms,
            task.metadata_file.as_std_path(),
        )
    }
}

struct TaskRun {
    report: TaskReport,
}

impl TaskRun {
    fn new(task: &str) -> Self {
        Self {
            report: TaskReport::new(task),
        }
    }

    fn transition(&mut self, next: TaskState) {
        info!(from = %self.report.state, to = %next, "state transition");
        self.report.state = next;
    }
}
