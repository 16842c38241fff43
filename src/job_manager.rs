use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use email_enricher_lib::{
    input_loader, CsvReporter, EnricherConfig, LookupEngine, Pipeline, Progress, ProgressReporter, ResultRow,
    RowStatus, RunControl,
};
use log::{debug, error, info, warn};

const MAX_LOGS: usize = 50;

#[derive(Clone, serde::Serialize)]
pub struct LastResult {
    pub name: String,
    pub email: Option<String>,
    pub status: String,
    pub confidence: Option<u8>,
}

#[derive(Clone, serde::Serialize)]
pub struct JobStatus {
    pub id: String,
    pub status: String, // "queued", "processing", "stopping", "stopped", "completed", "failed"
    pub total_records: usize,
    pub processed_count: usize,
    pub current_record: String,
    pub found_count: usize,
    pub cancelled_count: usize,
    pub logs: Vec<String>,
    pub last_result: Option<LastResult>,
    #[serde(skip)]
    pub control: Option<Arc<RunControl>>,
    #[serde(skip)]
    pub output_path: PathBuf,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl JobStatus {
    fn log(&mut self, message: impl Into<String>) {
        self.logs.push(message.into());
        if self.logs.len() > MAX_LOGS {
            self.logs.remove(0);
        }
    }
}

type Jobs = Arc<Mutex<HashMap<String, JobStatus>>>;

fn lock(jobs: &Jobs) -> MutexGuard<'_, HashMap<String, JobStatus>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn update(jobs: &Jobs, job_id: &str, f: impl FnOnce(&mut JobStatus)) {
    if let Some(job) = lock(jobs).get_mut(job_id) {
        f(job);
    }
}

pub struct JobManager {
    jobs: Jobs,
    config: EnricherConfig,
}

impl JobManager {
    pub fn new(config: EnricherConfig) -> Self {
        JobManager {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        lock(&self.jobs).get(job_id).cloned()
    }

    pub fn start_job(&self, job_id: String, input_path: PathBuf, output_path: PathBuf) -> String {
        let control = RunControl::new();
        let initial_status = JobStatus {
            id: job_id.clone(),
            status: "queued".to_string(),
            total_records: 0,
            processed_count: 0,
            current_record: "Initializing...".to_string(),
            found_count: 0,
            cancelled_count: 0,
            logs: vec!["Job started.".to_string()],
            last_result: None,
            control: Some(control.clone()),
            output_path: output_path.clone(),
            finished_at: None,
        };
        self.evict_finished(self.config.job_ttl());
        lock(&self.jobs).insert(job_id.clone(), initial_status);

        let jobs = self.jobs.clone();
        let config = self.config.clone();
        let id = job_id.clone();
        thread::spawn(move || {
            Self::run_job(id, jobs, config, control, input_path, output_path);
        });

        job_id
    }

    /// Forgets jobs finished more than `ttl` ago and deletes their result files.
    pub fn evict_finished(&self, ttl: Duration) -> usize {
        let mut guard = lock(&self.jobs);
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, job)| job.finished_at.map_or(false, |at| at.elapsed() >= ttl))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(job) = guard.remove(id) {
                remove_file(&job.output_path);
            }
        }
        if !expired.is_empty() {
            info!("Evicted {} finished job(s)", expired.len());
        }
        expired.len()
    }

    /// Requests cancellation. Rows already written stay in the output.
    pub fn stop(&self, job_id: &str) -> bool {
        let mut guard = lock(&self.jobs);
        let Some(job) = guard.get_mut(job_id) else {
            return false;
        };
        if let Some(control) = &job.control {
            control.cancel();
        }
        if job.status == "queued" || job.status == "processing" {
            job.status = "stopping".to_string();
            job.log("Stop requested.");
        }
        true
    }

    fn run_job(
        job_id: String,
        jobs: Jobs,
        config: EnricherConfig,
        control: Arc<RunControl>,
        input_path: PathBuf,
        output_path: PathBuf,
    ) {
        let fail = |message: String| {
            error!("Job {} failed: {}", job_id, message);
            remove_file(&input_path);
            update(&jobs, &job_id, |job| {
                job.status = "failed".to_string();
                job.log(message);
                job.control = None;
                job.finished_at = Some(Instant::now());
            });
        };

        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => return fail(format!("Could not start runtime: {}", e)),
        };

        let records = match input_loader::load_records(&input_path) {
            Ok(r) => r,
            Err(e) => return fail(format!("Could not load input: {}", e)),
        };
        let engine = match LookupEngine::from_config(&config) {
            Ok(engine) => Arc::new(engine),
            Err(e) => return fail(format!("Configuration error: {}", e)),
        };
        let csv = match CsvReporter::create(&output_path) {
            Ok(w) => w,
            Err(e) => return fail(format!("Failed to open output file: {}", e)),
        };

        update(&jobs, &job_id, |job| {
            job.total_records = records.len();
            if job.status == "queued" {
                job.status = "processing".to_string();
            }
            job.log(format!("Loaded {} records.", records.len()));
        });
        info!("Job {} processing {} records", job_id, records.len());

        let reporter = (
            csv,
            JobReporter {
                job_id: job_id.clone(),
                jobs: jobs.clone(),
            },
        );
        let report = runtime.block_on(Pipeline::new(&config).run(records, engine, control.clone(), &reporter));
        remove_file(&input_path);

        update(&jobs, &job_id, |job| {
            job.cancelled_count = report.cancelled;
            job.control = None;
            job.finished_at = Some(Instant::now());
            if control.is_cancelled() {
                job.status = "stopped".to_string();
                job.current_record = "Stopped".to_string();
                job.log(format!(
                    "Job stopped by user: {} records written, {} cancelled.",
                    report.completed, report.cancelled
                ));
            } else {
                job.status = "completed".to_string();
                job.current_record = "Done".to_string();
                job.log(format!("All records processed, {} skipped.", report.skipped));
            }
        });
        info!("Job {} finished", job_id);
    }
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {:?}: {}", path, e),
    }
}

/// Mirrors finalized rows into the job status.
struct JobReporter {
    job_id: String,
    jobs: Jobs,
}

impl ProgressReporter for JobReporter {
    fn row_finalized(&self, row: &ResultRow, progress: Progress) {
        update(&self.jobs, &self.job_id, |job| {
            job.processed_count = progress.processed;
            job.current_record = row.record.name.clone();
            let status = row.status();
            if status == RowStatus::Valid {
                job.found_count += 1;
                job.log(format!("Found: {} -> {}", row.record.name, row.email().unwrap_or_default()));
            } else if status == RowStatus::Skipped {
                job.log(format!(
                    "Skipped row {}: {}",
                    row.index + 1,
                    row.skipped.as_deref().unwrap_or_default()
                ));
            }
            job.last_result = Some(LastResult {
                name: row.record.name.clone(),
                email: row.email().map(str::to_string),
                status: status.as_str().to_string(),
                confidence: row.verdict.as_ref().and_then(|v| v.confidence),
            });
        });
    }
}
