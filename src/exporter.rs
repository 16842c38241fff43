use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;
use csv::Writer;
use log::error;

use crate::model::ResultRow;
use crate::pipeline::{Progress, ProgressReporter};

pub const HEADERS: [&str; 11] = [
    "name",
    "domain",
    "email",
    "status",
    "confidence",
    "evidence_url",
    "source",
    "candidates_tried",
    "attempts",
    "note",
    "timestamp",
];

/// Flattens a row into the export columns.
pub fn row_fields(row: &ResultRow, timestamp: &str) -> Vec<String> {
    let verdict = row.verdict.as_ref();
    let evidence = verdict.map(|v| &v.evidence);
    let note = match &row.skipped {
        Some(reason) => reason.clone(),
        None => evidence.and_then(|e| e.note.clone()).unwrap_or_default(),
    };

    vec![
        row.record.name.clone(),
        row.record.domain.clone(),
        row.email().unwrap_or_default().to_string(),
        row.status().as_str().to_string(),
        verdict
            .and_then(|v| v.confidence)
            .map(|c| c.to_string())
            .unwrap_or_default(),
        evidence.and_then(|e| e.url.clone()).unwrap_or_default(),
        evidence.and_then(|e| e.stage.clone()).unwrap_or_default(),
        row.candidates_tried.to_string(),
        verdict.map(|v| v.attempts.to_string()).unwrap_or_default(),
        note,
        timestamp.to_string(),
    ]
}

/// Streams finalized rows to a CSV file, flushing after every row so a
/// partially written file is always downloadable.
pub struct CsvReporter {
    writer: Mutex<Writer<File>>,
}

impl CsvReporter {
    /// Truncates `path` and writes the header.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, csv::Error> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = csv::WriterBuilder::new().from_writer(file);
        writer.write_record(HEADERS)?;
        writer.flush()?;
        Ok(CsvReporter {
            writer: Mutex::new(writer),
        })
    }
}

impl ProgressReporter for CsvReporter {
    fn row_finalized(&self, row: &ResultRow, _progress: Progress) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let fields = row_fields(row, &timestamp);

        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.write_record(&fields) {
            error!("Failed to write CSV record for {}: {}", row.record.name, e);
        }
        if let Err(e) = writer.flush() {
            error!("Failed to flush CSV output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, Verdict, VerdictStatus};

    fn valid_row() -> ResultRow {
        let mut verdict = Verdict::new(VerdictStatus::Valid, "asmith@acme.com")
            .with_confidence(95)
            .with_url("https://www.linkedin.com/in/asmith")
            .with_note("api status: valid");
        verdict.evidence.stage = Some("verifier_api".into());
        verdict.attempts = 2;
        ResultRow {
            index: 0,
            record: Record::new("A Smith", "acme.com"),
            verdict: Some(verdict),
            skipped: None,
            candidates_tried: 3,
        }
    }

    #[test]
    fn flattens_valid_row() {
        let fields = row_fields(&valid_row(), "2024-01-01 00:00:00");
        assert_eq!(
            fields,
            vec![
                "A Smith",
                "acme.com",
                "asmith@acme.com",
                "valid",
                "95",
                "https://www.linkedin.com/in/asmith",
                "verifier_api",
                "3",
                "2",
                "api status: valid",
                "2024-01-01 00:00:00",
            ]
        );
    }

    #[test]
    fn non_valid_rows_carry_no_email() {
        let mut row = valid_row();
        if let Some(v) = row.verdict.as_mut() {
            v.status = VerdictStatus::Invalid;
        }
        let fields = row_fields(&row, "t");
        assert_eq!(fields[2], "");
        assert_eq!(fields[3], "invalid");

        let skipped = ResultRow::skipped(1, Record::new("", "acme.com"), "record has no name");
        let fields = row_fields(&skipped, "t");
        assert_eq!(fields[3], "skipped");
        assert_eq!(fields[9], "record has no name");
        assert_eq!(fields[8], "");
    }

    #[test]
    fn streams_rows_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let reporter = CsvReporter::create(&path).unwrap();

        reporter.row_finalized(&valid_row(), Progress { processed: 1, total: 2 });
        // readable before the reporter is dropped
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], HEADERS.join(","));
        assert!(lines[1].starts_with("A Smith,acme.com,asmith@acme.com,valid,95,"));
    }
}
