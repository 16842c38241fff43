use email_enricher_lib::config::VerifierKind;
use email_enricher_lib::{input_loader, logger};
use email_enricher_lib::{CsvReporter, EnricherConfig, LogReporter, LookupEngine, Pipeline, Record, RunControl};

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "email-enricher")]
#[command(version)]
#[command(about = "Finds and verifies work email addresses for a list of people")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Concurrent candidate checks
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Cheap verification stage run before the browser
    #[arg(long, value_enum, global = true)]
    verifier: Option<VerifierKind>,

    #[arg(long, global = true)]
    api_key: Option<String>,

    /// WebDriver endpoint enabling the browser stage
    #[arg(long, global = true)]
    webdriver_url: Option<String>,

    /// Candidate addresses generated per person
    #[arg(long, global = true)]
    max_candidates: Option<usize>,

    /// Keep checking a person's candidates after one is valid
    #[arg(long, global = true)]
    check_all: bool,

    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich every record of a file
    Run {
        /// CSV, XLSX or XLS file with name and company domain columns
        input: PathBuf,

        /// Result CSV, rewritten row by row as records finish
        #[arg(short, long, default_value = "results.csv")]
        output: PathBuf,
    },
    /// Look up a single person
    Verify {
        #[arg(long)]
        name: String,

        /// Company domain or website
        #[arg(long)]
        domain: String,

        /// Known address or local part, checked first
        #[arg(long)]
        email: Option<String>,
    },
}

impl Cli {
    /// Flags win over file and environment.
    fn apply(&self, config: &mut EnricherConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(kind) = self.verifier {
            config.verifier = Some(kind);
        }
        if let Some(key) = &self.api_key {
            config.api_key = Some(key.clone());
        }
        if let Some(url) = &self.webdriver_url {
            config.webdriver_url = Some(url.clone());
        }
        if let Some(max) = self.max_candidates {
            config.max_candidates = max;
        }
        if self.check_all {
            config.stop_on_first_valid = false;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut config = EnricherConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    logger::init(&config.log_level);
    info!("Starting Email Enricher...");

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    match &cli.command {
        Commands::Run { input, output } => run_file(&config, input, output).await,
        Commands::Verify { name, domain, email } => {
            let mut record = Record::new(name.as_str(), domain.as_str());
            if let Some(hint) = email {
                record = record.with_email_hint(hint.as_str());
            }
            verify_single(&config, record).await
        }
    }
}

async fn verify_single(config: &EnricherConfig, record: Record) -> Result<(), Box<dyn Error>> {
    let engine = Arc::new(LookupEngine::from_config(config)?);
    let row = Pipeline::new(config).verify_one(record, engine).await;
    println!("{}", serde_json::to_string_pretty(&row)?);
    Ok(())
}

async fn run_file(config: &EnricherConfig, input: &Path, output: &Path) -> Result<(), Box<dyn Error>> {
    // 1. Load inputs
    let records = match input_loader::load_records(input) {
        Ok(r) => r,
        Err(e) => {
            error!("Could not load {:?}: {}", input, e);
            return Err(e.into());
        }
    };
    if records.is_empty() {
        warn!("No records found in {:?}. Expected name and company domain columns.", input);
        return Ok(());
    }

    // 2. Engine and output
    let engine = Arc::new(LookupEngine::from_config(config)?);
    let reporter = (CsvReporter::create(output)?, LogReporter);

    // 3. Ctrl-C cancels the run
    let control = RunControl::new();
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run...");
                control.cancel();
            }
        });
    }

    let report = Pipeline::new(config).run(records, engine, control, &reporter).await;

    let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
    for row in &report.rows {
        *by_status.entry(row.status().as_str()).or_default() += 1;
    }
    let breakdown = by_status
        .iter()
        .map(|(status, count)| format!("{}={}", status, count))
        .collect::<Vec<_>>()
        .join(", ");

    info!(
        "Enrichment {}. {} of {} records written to {:?} ({}), {} cancelled, {} checks made.",
        if report.cancelled > 0 { "cancelled" } else { "completed" },
        report.completed,
        report.total,
        output,
        breakdown,
        report.cancelled,
        report.probes
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_takes_one_person() {
        let cli = Cli::try_parse_from([
            "email-enricher",
            "verify",
            "--name",
            "A Smith",
            "--domain",
            "acme.com",
            "--workers",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.workers, Some(2));
        match cli.command {
            Commands::Verify { name, domain, email } => {
                assert_eq!(name, "A Smith");
                assert_eq!(domain, "acme.com");
                assert_eq!(email, None);
            }
            Commands::Run { .. } => panic!("parsed as run"),
        }
    }

    #[test]
    fn run_keeps_file_and_output_flags() {
        let cli = Cli::try_parse_from(["email-enricher", "run", "people.csv", "-o", "out.csv", "--check-all"]).unwrap();
        let mut config = EnricherConfig::default();
        cli.apply(&mut config);
        assert!(!config.stop_on_first_valid);
        match cli.command {
            Commands::Run { input, output } => {
                assert_eq!(input, PathBuf::from("people.csv"));
                assert_eq!(output, PathBuf::from("out.csv"));
            }
            Commands::Verify { .. } => panic!("parsed as verify"),
        }
        assert!(Cli::try_parse_from(["email-enricher", "verify", "--name", "A Smith"]).is_err());
    }
}
