//! Immutable per-patient records for one split.
//!
//! Each record carries the raw demographic codes, one event stream per [`RecordKind`],
//! and the label vector. Records are built in a single pass over the split's tables;
//! nothing is mutated after loading.

use super::tables::StringTable;
use super::{DataError, cleaned_dir};
use crate::types::{DemographicField, RecordKind, Split};
use ahash::AHashMap;
use chrono::{Datelike, NaiveDate};
use std::path::Path;

/// One coded event with the patient's age when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub age_years: i64,
    pub age_months: i64,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Demographics {
    /// Raw codes in `DemographicField::ALL` order; `None` when not recorded.
    pub codes: Vec<Option<String>>,
    pub age_now_days: f64,
}

impl Demographics {
    pub fn code(&self, field: DemographicField) -> Option<&str> {
        self.codes.get(field.index())?.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub id: String,
    pub demographics: Demographics,
    /// Event streams indexed by `RecordKind::index()`.
    pub events: Vec<Vec<Event>>,
    pub labels: Vec<bool>,
}

impl PatientRecord {
    pub fn events(&self, kind: RecordKind) -> &[Event] {
        &self.events[kind.index()]
    }
}

fn invalid(
    table: &StringTable,
    column: &str,
    row: usize,
    value: &str,
    expected: &'static str,
) -> DataError {
    DataError::InvalidValue {
        path: table.path().to_path_buf(),
        column: column.to_string(),
        row,
        value: value.to_string(),
        expected,
    }
}

fn parse_label(table: &StringTable, column: &str, row: usize, raw: Option<&str>) -> Result<bool, DataError> {
    match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("false") | Some("0") | Some("0.0") => Ok(false),
        Some("true") | Some("1") | Some("1.0") => Ok(true),
        Some(_) => Err(invalid(
            table,
            column,
            row,
            raw.unwrap_or_default(),
            "a boolean label",
        )),
    }
}

/// Parses the date part of a `YYYY-MM-DD[ time]` value.
fn parse_birthdate(raw: &str) -> Option<NaiveDate> {
    let date = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn parse_age(table: &StringTable, column: &str, row: usize, raw: &str) -> Result<i64, DataError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.floor() as i64)
        .ok_or_else(|| invalid(table, column, row, raw, "an age in whole units"))
}

fn load_demographics(path: &Path) -> Result<AHashMap<String, Demographics>, DataError> {
    let table = StringTable::open(path)?;
    let patients = table.required("patient")?;
    let birthdates = table.column("birthdate")?;
    let age_now_days = table.numeric("age_now_days")?;

    let mut field_columns = Vec::with_capacity(DemographicField::COUNT);
    for field in DemographicField::ALL {
        if field.column() == "birthdate" {
            field_columns.push(None);
        } else {
            field_columns.push(Some(table.column(field.column())?));
        }
    }

    let mut out = AHashMap::with_capacity(patients.len());
    for (row, patient) in patients.into_iter().enumerate() {
        let birthdate = match birthdates[row].as_deref() {
            None => None,
            Some(raw) => Some(
                parse_birthdate(raw)
                    .ok_or_else(|| invalid(&table, "birthdate", row, raw, "a YYYY-MM-DD date"))?,
            ),
        };

        let codes = DemographicField::ALL
            .iter()
            .zip(&field_columns)
            .map(|(field, column)| match field {
                DemographicField::BirthDay => birthdate.map(|d| d.day().to_string()),
                DemographicField::BirthMonth => birthdate.map(|d| d.month().to_string()),
                DemographicField::BirthYear => birthdate.map(|d| d.year().to_string()),
                _ => column.as_ref().and_then(|c| c[row].clone()),
            })
            .collect();

        out.insert(
            patient,
            Demographics {
                codes,
                age_now_days: age_now_days[row],
            },
        );
    }
    Ok(out)
}

/// Loads all patients of a split, in `patients.csv` order.
///
/// `labels` names the boolean label columns of `patients.csv`. Event rows of patients
/// not listed in `patients.csv` are skipped.
pub fn load_split(
    dataset: &Path,
    split: Split,
    labels: &[String],
) -> Result<Vec<PatientRecord>, DataError> {
    let dir = cleaned_dir(dataset, split);

    let patients_path = dir.join("patients.csv");
    let patients = StringTable::open(&patients_path)?;
    let ids = patients.required("patient")?;
    let label_columns = labels
        .iter()
        .map(|l| patients.column(l))
        .collect::<Result<Vec<_>, _>>()?;

    let mut demographics = load_demographics(&dir.join("patient_demographics.csv"))?;

    let mut records = Vec::with_capacity(ids.len());
    let mut position = AHashMap::with_capacity(ids.len());
    for (row, id) in ids.into_iter().enumerate() {
        let demo = demographics
            .remove(&id)
            .ok_or_else(|| DataError::MissingDemographics {
                path: patients_path.clone(),
                patient: id.clone(),
            })?;
        let label_values = labels
            .iter()
            .zip(&label_columns)
            .map(|(name, column)| parse_label(&patients, name, row, column[row].as_deref()))
            .collect::<Result<Vec<_>, _>>()?;

        position.insert(id.clone(), records.len());
        records.push(PatientRecord {
            id,
            demographics: demo,
            events: vec![Vec::new(); RecordKind::COUNT],
            labels: label_values,
        });
    }

    for kind in RecordKind::ALL {
        let table = StringTable::open(&dir.join(format!("{}.csv", kind.file_stem())))?;
        let patient_col = table.required("patient")?;
        let code_col = table.required("code")?;
        let age_col = table.required("age")?;
        let month_col = table.required("age_months")?;

        let mut skipped = 0usize;
        for row in 0..table.height() {
            let Some(&pos) = position.get(&patient_col[row]) else {
                skipped += 1;
                continue;
            };
            records[pos].events[kind.index()].push(Event {
                age_years: parse_age(&table, "age", row, &age_col[row])?,
                age_months: parse_age(&table, "age_months", row, &month_col[row])?,
                code: code_col[row].clone(),
            });
        }
        if skipped > 0 {
            log::debug!("Skipped {skipped} {kind} rows of patients outside the {split} split");
        }
    }

    log::info!("Loaded {} {split} patients from '{}'", records.len(), dir.display());
    Ok(records)
}

/// Positive-class weight per label, `negatives / positives`; 1.0 for a label with no
/// positive patients.
pub fn positive_weights(records: &[PatientRecord], num_labels: usize) -> Vec<f32> {
    (0..num_labels)
        .map(|l| {
            let positives = records.iter().filter(|r| r.labels[l]).count();
            let negatives = records.len() - positives;
            if positives == 0 {
                1.0
            } else {
                negatives as f32 / positives as f32
            }
        })
        .collect()
}
