use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::{EnrichedRecord, FailureRecord, PoliticianRecord, Stage, ENRICHED_COLUMNS};

#[derive(Error, Debug)]
pub enum TableError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("roster row {line}: empty name")]
    EmptyName { line: u64 },

    #[error("population row {line}: {value:?} is not a number")]
    BadPopulation { line: u64, value: String },
}

#[derive(Debug, Deserialize)]
struct PopulationRow {
    #[serde(rename = "Geography")]
    geography: String,
    #[serde(rename = "Population", alias = "Population (millions)")]
    population: String,
}

fn line_of(record: &csv::StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or_default()
}

pub fn load_roster(path: &Path) -> Result<Vec<PoliticianRecord>, TableError> {
    read_roster(File::open(path)?)
}

pub fn read_roster<R: io::Read>(input: R) -> Result<Vec<PoliticianRecord>, TableError> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(input);
    let headers = reader.headers()?.clone();
    let mut roster = Vec::new();
    for row in reader.records() {
        let row = row?;
        let record: PoliticianRecord = row.deserialize(Some(&headers))?;
        if record.name.is_empty() {
            return Err(TableError::EmptyName {
                line: line_of(&row),
            });
        }
        roster.push(record);
    }
    Ok(roster)
}

pub fn load_population(path: &Path) -> Result<Vec<(String, f64)>, TableError> {
    read_population(File::open(path)?)
}

/// `(Geography, Population)` rows in file order. Accepts thousands separators.
pub fn read_population<R: io::Read>(input: R) -> Result<Vec<(String, f64)>, TableError> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(input);
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row?;
        let parsed: PopulationRow = row.deserialize(Some(&headers))?;
        let population = parsed
            .population
            .replace(',', "")
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite())
            .ok_or_else(|| TableError::BadPopulation {
                line: line_of(&row),
                value: parsed.population.clone(),
            })?;
        rows.push((parsed.geography, population));
    }
    Ok(rows)
}

/// Writes enriched rows in the order given, header first even when there are none.
pub struct RecordWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl RecordWriter<File> {
    pub fn create(path: &Path) -> Result<Self, TableError> {
        Ok(RecordWriter::from_writer(File::create(path)?))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn from_writer(output: W) -> Self {
        RecordWriter {
            inner: WriterBuilder::new().has_headers(false).from_writer(output),
        }
    }

    /// Consumes the records and returns the underlying writer.
    pub fn write(mut self, records: Vec<EnrichedRecord>) -> Result<W, TableError> {
        self.inner.write_record(ENRICHED_COLUMNS)?;
        for record in &records {
            self.inner.serialize(record)?;
        }
        self.inner.flush()?;
        self.inner
            .into_inner()
            .map_err(|e| TableError::Io(e.into_error()))
    }
}

#[derive(Serialize)]
struct FailureRow<'a> {
    name: &'a str,
    url: &'a str,
    country: &'a str,
    stage: &'static str,
    error: &'a str,
    raw_response: String,
}

const FAILURE_COLUMNS: [&str; 6] = ["name", "url", "country", "stage", "error", "raw_response"];

pub struct FailureWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl FailureWriter<File> {
    pub fn create(path: &Path) -> Result<Self, TableError> {
        Ok(FailureWriter::from_writer(File::create(path)?))
    }
}

impl<W: Write> FailureWriter<W> {
    pub fn from_writer(output: W) -> Self {
        FailureWriter {
            inner: WriterBuilder::new().has_headers(false).from_writer(output),
        }
    }

    pub fn write(mut self, failures: &[FailureRecord]) -> Result<W, TableError> {
        self.inner.write_record(FAILURE_COLUMNS)?;
        for failure in failures {
            let raw_response = match &failure.raw_response {
                Some(value) => serde_json::to_string(value).map_err(io::Error::from)?,
                None => String::new(),
            };
            self.inner.serialize(FailureRow {
                name: &failure.politician.name,
                url: &failure.politician.url,
                country: &failure.politician.country,
                stage: failure.stage.as_str(),
                error: &failure.error,
                raw_response,
            })?;
        }
        self.inner.flush()?;
        self.inner
            .into_inner()
            .map_err(|e| TableError::Io(e.into_error()))
    }
}

/// Sorted, de-duplicated countries that had no region.
pub fn unmatched_countries(failures: &[FailureRecord]) -> Vec<String> {
    failures
        .iter()
        .filter(|f| f.stage == Stage::RegionLookup)
        .map(|f| f.politician.country.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn write_lines(path: &Path, lines: &[String]) -> Result<(), TableError> {
    let mut file = File::create(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}
