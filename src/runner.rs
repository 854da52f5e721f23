// Tasks staging into the same table must be ordered by a dependency. Two
// concurrent tasks on one table would reset each other's rows.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::TaskDefinition;
use crate::error::HarvestError;
use crate::pipeline::{Pipeline, TaskReport, TaskState};

/// Groups task indices into waves. Every task lands in a later wave than
/// the tasks it depends on; dependencies outside `tasks` count as met.
pub fn dependency_waves(tasks: &[TaskDefinition]) -> Result<Vec<Vec<usize>>, HarvestError> {
    let index = tasks
        .iter()
        .enumerate()
        .map(|(position, task)| (task.name.as_str(), position))
        .collect::<HashMap<_, _>>();

    let mut remaining = (0..tasks.len()).collect::<Vec<_>>();
    let mut placed = HashSet::new();
    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<usize>, Vec<usize>) =
            remaining.iter().partition(|&&position| {
                tasks[position]
                    .depends_on
                    .iter()
                    .filter_map(|dependency| index.get(dependency.as_str()))
                    .all(|upstream| placed.contains(upstream))
            });
        if ready.is_empty() {
            let names = blocked
                .iter()
                .map(|&position| tasks[position].name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(HarvestError::Config(format!(
                "dependency cycle between tasks: {names}"
            )));
        }
        placed.extend(ready.iter().copied());
        waves.push(ready);
        remaining = blocked;
    }
    Ok(waves)
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub tasks: Vec<TaskReport>,
    #[serde(skip)]
    pub failures: Vec<HarvestError>,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|report| report.state == TaskState::Done)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.tasks.len() - self.completed()
    }
}

pub struct Runner {
    pipeline: Pipeline,
    workers: usize,
}

impl Runner {
    pub fn new(pipeline: Pipeline, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
        }
    }

    pub fn run(&self, tasks: &[TaskDefinition]) -> Result<RunSummary, HarvestError> {
        let waves = dependency_waves(tasks)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|index| format!("kira-dwca-worker-{index}"))
            .build()
            .map_err(|err| HarvestError::Config(format!("failed to create worker pool: {err}")))?;
        info!(tasks = tasks.len(), workers = self.workers, "starting harvest run");

        let mut outcomes: Vec<Option<Result<TaskReport, HarvestError>>> =
            (0..tasks.len()).map(|_| None).collect();
        let mut failed = HashSet::new();

        for wave in waves {
            let mut ready = Vec::with_capacity(wave.len());
            for position in wave {
                let task = &tasks[position];
                match task
                    .depends_on
                    .iter()
                    .find(|dependency| failed.contains(dependency.as_str()))
                {
                    Some(dependency) => {
                        warn!(task = %task.name, dependency = %dependency, "dependency failed, task not started");
                        failed.insert(task.name.as_str());
                        outcomes[position] = Some(Err(HarvestError::DependencyFailed {
                            task: task.name.clone(),
                            dependency: dependency.clone(),
                        }));
                    }
                    None => ready.push(position),
                }
            }

            let results = pool.install(|| {
                ready
                    .par_iter()
                    .map(|&position| (position, self.pipeline.run(&tasks[position])))
                    .collect::<Vec<_>>()
            });
            for (position, result) in results {
                if result.is_err() {
                    failed.insert(tasks[position].name.as_str());
                }
                outcomes[position] = Some(result);
            }
        }

        let mut summary = RunSummary {
            tasks: Vec::with_capacity(tasks.len()),
            failures: Vec::new(),
        };
        for (task, outcome) in tasks.iter().zip(outcomes) {
            match outcome {
                Some(Ok(report)) => summary.tasks.push(report),
                Some(Err(err)) => {
                    summary.tasks.push(TaskReport::failed(&task.name, &err));
                    summary.failures.push(err);
                }
                None => {
                    let err = HarvestError::Config(format!("task {} was never scheduled", task.name));
                    summary.tasks.push(TaskReport::failed(&task.name, &err));
                    summary.failures.push(err);
                }
            }
        }

        if summary.failures.is_empty() {
            info!(completed = summary.completed(), "harvest run finished");
        } else {
            error!(
                completed = summary.completed(),
                failed = summary.failed(),
                "harvest run finished with failures"
            );
        }
        Ok(summary)
    }
}
