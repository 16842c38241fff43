use std::fs;
use std::path::Path;

use calamine::{open_workbook_auto, Reader};
use log::{info, warn};
use regex::Regex;

use crate::error::LoadError;
use crate::model::Record;

/// Column positions found in the header row.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub first_name: Option<usize>,
    pub last_name: Option<usize>,
    pub full_name: Option<usize>,
    pub domain: Option<usize>,
    pub email: Option<usize>,
}

/// Loads records from CSV, XLSX or XLS, keeping input order.
pub fn load_records<P: AsRef<Path>>(filename: P) -> Result<Vec<Record>, LoadError> {
    let path = filename.as_ref();
    if !path.exists() {
        return Err(LoadError::Missing(path.display().to_string()));
    }

    let is_spreadsheet = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_lowercase().as_str(), "xlsx" | "xlsm" | "xls" | "ods"))
        .unwrap_or(false);

    let table = if is_spreadsheet {
        read_spreadsheet(path)?
    } else {
        read_csv(path)?
    };

    let records = records_from_table(table)?;
    info!("Loaded {} records from {:?}", records.len(), path);
    Ok(records)
}

fn read_csv(path: &Path) -> Result<Vec<Vec<String>>, LoadError> {
    let content = read_file_as_utf8(path)?;
    let delimiter = sniff_delimiter(&content);

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn read_spreadsheet(path: &Path) -> Result<Vec<Vec<String>>, LoadError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| LoadError::Spreadsheet(e.to_string()))?;

    let worksheets = workbook.worksheets();
    let Some((name, range)) = worksheets.first() else {
        return Err(LoadError::Spreadsheet("workbook has no sheets".into()));
    };
    if worksheets.len() > 1 {
        info!("Reading first sheet '{}' of {}", name, worksheets.len());
    }

    Ok(range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string().trim().to_string()).collect())
        .collect())
}

/// UTF-8 if possible, else Windows-1252 (Excel-exported CSVs).
fn read_file_as_utf8(path: &Path) -> Result<String, LoadError> {
    let bytes = fs::read(path)?;
    let content = match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!("{:?} is not UTF-8, decoding as Windows-1252", path);
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(e.as_bytes());
            decoded.into_owned()
        }
    };
    Ok(content.trim_start_matches('\u{feff}').to_string())
}

/// Picks the delimiter giving the most consistent field count over the first lines.
fn sniff_delimiter(content: &str) -> u8 {
    let candidates: &[u8] = &[b'\t', b';', b',', b'|'];
    let sample_lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).take(10).collect();

    let mut best = b',';
    let mut best_score = 0usize;

    for &delim in candidates {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let target = counts.first().copied().unwrap_or(0);
        if target <= 1 {
            continue;
        }
        let score = counts.iter().filter(|&&c| c == target).count() * target;
        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}

fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Maps header names onto record fields. Falls back to cell contents for the
/// domain column when no header matches.
pub fn detect_columns(headers: &[String], rows: &[Vec<String>]) -> Result<ColumnMap, LoadError> {
    let patterns: Vec<(&str, Regex)> = [
        ("email", r"^(e?mail|emailaddress|emailhint|knownemail)$"),
        ("first", r"^(first|given|fore)(name)?$|^fname$"),
        ("last", r"^(last|sur|family)(name)?$|^lname$"),
        ("full", r"^(full|contact|person|employee)?name$"),
        ("domain", r"(url|website|domain|site|web)"),
    ]
    .into_iter()
    .map(|(role, pattern)| (role, Regex::new(pattern).unwrap()))
    .collect();

    let mut map = ColumnMap::default();
    for (idx, header) in headers.iter().enumerate() {
        let normalized = normalize_header(header);
        if normalized.is_empty() {
            continue;
        }
        for (role, re) in &patterns {
            if !re.is_match(&normalized) {
                continue;
            }
            let slot = match *role {
                "email" => &mut map.email,
                "first" => &mut map.first_name,
                "last" => &mut map.last_name,
                "full" => &mut map.full_name,
                _ => &mut map.domain,
            };
            if slot.is_none() {
                *slot = Some(idx);
                break;
            }
        }
    }

    if map.domain.is_none() {
        map.domain = guess_domain_column(headers.len(), rows, &map);
        if let Some(idx) = map.domain {
            info!("No domain header found, using column '{}' by content", headers[idx]);
        }
    }

    if map.full_name.is_none() && map.first_name.is_none() && map.last_name.is_none() {
        return Err(LoadError::MissingColumns("person name (full name or first/last name)".into()));
    }
    if map.domain.is_none() && map.email.is_none() {
        return Err(LoadError::MissingColumns("company domain or website".into()));
    }
    Ok(map)
}

fn guess_domain_column(width: usize, rows: &[Vec<String>], taken: &ColumnMap) -> Option<usize> {
    let domain_like =
        Regex::new(r"^(?i)(https?://)?(www\.)?[a-z0-9-]+(\.[a-z0-9-]+)*\.[a-z]{2,}(/\S*)?$").unwrap();
    let used = [taken.first_name, taken.last_name, taken.full_name, taken.email];

    (0..width)
        .filter(|idx| !used.contains(&Some(*idx)))
        .filter_map(|idx| {
            let values: Vec<&str> = rows
                .iter()
                .take(50)
                .filter_map(|r| r.get(idx))
                .map(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                return None;
            }
            let hits = values.iter().filter(|v| !v.contains('@') && domain_like.is_match(v)).count();
            (hits * 2 > values.len()).then_some((idx, hits))
        })
        .max_by_key(|(_, hits)| *hits)
        .map(|(idx, _)| idx)
}

fn cell(row: &[String], idx: Option<usize>) -> String {
    idx.and_then(|i| row.get(i)).map(|v| v.trim().to_string()).unwrap_or_default()
}

fn records_from_table(table: Vec<Vec<String>>) -> Result<Vec<Record>, LoadError> {
    let mut rows = table.into_iter();
    let Some(headers) = rows.next() else {
        return Err(LoadError::MissingColumns("header row".into()));
    };
    let data: Vec<Vec<String>> = rows
        .filter(|row| row.iter().any(|v| !v.trim().is_empty()))
        .collect();

    let columns = detect_columns(&headers, &data)?;

    Ok(data
        .iter()
        .map(|row| {
            let full = cell(row, columns.full_name);
            let name = if full.is_empty() {
                [cell(row, columns.first_name), cell(row, columns.last_name)]
                    .iter()
                    .filter(|p| !p.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                full
            };
            let record = Record::new(name, cell(row, columns.domain));
            match cell(row, columns.email) {
                hint if hint.is_empty() => record,
                hint => record.with_email_hint(hint),
            }
        })
        .collect())
}
