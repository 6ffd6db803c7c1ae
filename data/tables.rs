//! Text-typed table access and the training code tables vocabularies are built from.

use super::{DataError, codes_dir};
use crate::types::{DemographicField, RecordKind};
use crate::vocab::{CodeTable, ObsCodeRow};
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A CSV file read with every column as text.
pub(crate) struct StringTable {
    path: PathBuf,
    df: DataFrame,
}

impl StringTable {
    pub(crate) fn open(path: &Path) -> Result<Self, DataError> {
        if !path.exists() {
            return Err(DataError::FileNotFound(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        // A zero-row schema inference window reads every column as String; values are
        // validated column by column afterwards.
        let df = CsvReader::new(file)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(Some(0)),
            )
            .finish()
            .map_err(|source| DataError::Polars {
                path: path.to_path_buf(),
                source,
            })?;

        log::debug!("Read {} rows from '{}'", df.height(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            df,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn height(&self) -> usize {
        self.df.height()
    }

    pub(crate) fn has_column(&self, name: &str) -> bool {
        self.df.get_column_names().iter().any(|c| c.as_str() == name)
    }

    /// All values of a column; nulls stay `None`.
    pub(crate) fn column(&self, name: &str) -> Result<Vec<Option<String>>, DataError> {
        if !self.has_column(name) {
            return Err(DataError::ColumnNotFound {
                path: self.path.clone(),
                column: name.to_string(),
            });
        }
        let polars_err = |source| DataError::Polars {
            path: self.path.clone(),
            source,
        };
        let values = self
            .df
            .column(name)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect();
        Ok(values)
    }

    /// A column that must not contain nulls.
    pub(crate) fn required(&self, name: &str) -> Result<Vec<String>, DataError> {
        self.column(name)?
            .into_iter()
            .enumerate()
            .map(|(row, v)| {
                v.ok_or_else(|| DataError::MissingValue {
                    path: self.path.clone(),
                    column: name.to_string(),
                    row,
                })
            })
            .collect()
    }

    /// A text column where nulls read as the empty string.
    pub(crate) fn text(&self, name: &str) -> Result<Vec<String>, DataError> {
        Ok(self
            .column(name)?
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect())
    }

    /// A required numeric column.
    pub(crate) fn numeric(&self, name: &str) -> Result<Vec<f64>, DataError> {
        self.required(name)?
            .into_iter()
            .enumerate()
            .map(|(row, raw)| {
                raw.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| DataError::InvalidValue {
                        path: self.path.clone(),
                        column: name.to_string(),
                        row,
                        value: raw.clone(),
                        expected: "a finite number",
                    })
            })
            .collect()
    }
}

/// Demographic code values seen in the training split, plus current ages.
#[derive(Debug, Clone, Default)]
pub struct PatientCodeTable {
    /// Non-null values per categorical field (marital through zip), table order.
    pub fields: Vec<(DemographicField, Vec<String>)>,
    pub age_now_days: Vec<f64>,
}

impl PatientCodeTable {
    pub fn values(&self, field: DemographicField) -> &[String] {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Everything vocabulary construction reads from disk.
#[derive(Debug, Clone, Default)]
pub struct VocabCodeTables {
    pub patients: PatientCodeTable,
    pub observations: Vec<ObsCodeRow>,
    /// Code tables of the non-observation record kinds, in `RecordKind::ALL[1..]` order.
    pub records: Vec<CodeTable>,
}

fn code_file(dataset: &Path, stem: &str) -> PathBuf {
    codes_dir(dataset).join(format!("code_{stem}.csv"))
}

fn load_patient_codes(path: &Path) -> Result<PatientCodeTable, DataError> {
    let table = StringTable::open(path)?;
    let fields = DemographicField::ALL
        .iter()
        .filter(|f| f.column() != "birthdate")
        .map(|&field| {
            let values = table.column(field.column())?.into_iter().flatten().collect();
            Ok((field, values))
        })
        .collect::<Result<Vec<_>, DataError>>()?;
    Ok(PatientCodeTable {
        fields,
        age_now_days: table.numeric("age_now_days")?,
    })
}

fn load_observation_codes(path: &Path) -> Result<Vec<ObsCodeRow>, DataError> {
    let table = StringTable::open(path)?;
    let orig_code = table.required("orig_code")?;
    let desc = table.text("desc")?;
    let value = table.text("value")?;
    let units = table.text("units")?;
    let kind = table.required("type")?;

    Ok(orig_code
        .into_iter()
        .zip(desc)
        .zip(value)
        .zip(units)
        .zip(kind)
        .map(|((((orig_code, desc), value), units), kind)| ObsCodeRow {
            orig_code,
            desc,
            value,
            units,
            kind,
        })
        .collect())
}

fn load_code_table(path: &Path) -> Result<CodeTable, DataError> {
    let table = StringTable::open(path)?;
    let codes = table.required("code")?;
    if table.has_column("desc") {
        Ok(CodeTable::with_descriptions(codes.into_iter().zip(table.text("desc")?)))
    } else {
        Ok(CodeTable::from_codes(codes))
    }
}

/// Reads `{dataset}/cleaned/train/codes/code_*.csv`.
pub fn load_vocab_code_tables(dataset: &Path) -> Result<VocabCodeTables, DataError> {
    let patients = load_patient_codes(&code_file(dataset, "patients"))?;
    let observations =
        load_observation_codes(&code_file(dataset, RecordKind::Observations.file_stem()))?;
    let records = RecordKind::ALL[1..]
        .iter()
        .map(|kind| load_code_table(&code_file(dataset, kind.file_stem())))
        .collect::<Result<Vec<_>, _>>()?;

    log::info!(
        "Loaded vocab code tables from '{}': {} patients, {} observation rows",
        codes_dir(dataset).display(),
        patients.age_now_days.len(),
        observations.len()
    );
    Ok(VocabCodeTables {
        patients,
        observations,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_every_column_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        fs::write(&path, "code,desc\n0042,first\n17,\n").unwrap();

        let table = StringTable::open(&path).unwrap();
        assert_eq!(table.height(), 2);
        // Leading zeros survive because nothing is inferred as a number.
        assert_eq!(table.required("code").unwrap(), vec!["0042", "17"]);
        assert_eq!(table.text("desc").unwrap(), vec!["first", ""]);
    }

    #[test]
    fn missing_file_and_column_are_named() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.csv");
        assert!(matches!(
            StringTable::open(&path),
            Err(DataError::FileNotFound(p)) if p == path
        ));

        let present = dir.path().join("p.csv");
        fs::write(&present, "code\nA\n").unwrap();
        let table = StringTable::open(&present).unwrap();
        assert!(matches!(
            table.required("desc"),
            Err(DataError::ColumnNotFound { column, .. }) if column == "desc"
        ));
    }

    #[test]
    fn numeric_column_rejects_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.csv");
        fs::write(&path, "age_now_days\n100\nold\n").unwrap();
        let table = StringTable::open(&path).unwrap();
        assert!(matches!(
            table.numeric("age_now_days"),
            Err(DataError::InvalidValue { row: 1, .. })
        ));
    }
}
