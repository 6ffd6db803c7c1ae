//! The full set of vocabularies for one dataset, plus the age normalisation constants.
//!
//! Built once from the training split's code tables and persisted as
//! `{dataset}/processed/vocabs.json`. The encoder and embedding sizing read it back
//! read-only.

use super::{DEFAULT_EMB_ALPHA, EhrVocab, ObsVocab, RecordVocab, VocabError, Vocabulary};
use super::ehr::CodeTable;
use crate::data::{VocabCodeTables, load_vocab_code_tables};
use crate::shared::files::{read_json, write_json_atomic};
use crate::types::{DemographicField, RecordKind};
use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bumped whenever the persisted layout changes incompatibly.
pub const VOCAB_FORMAT_VERSION: u32 = 1;

const FIRST_BIRTH_YEAR: i32 = 1900;

/// Embedding table sizes for every demographic field and record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingDims {
    /// `(vocab_size, width)` per field, `DemographicField::ALL` order.
    pub demographics: Vec<(usize, usize)>,
    /// `(vocab_size, width)` per stream, `RecordKind::ALL` order.
    pub records: Vec<(usize, usize)>,
    pub demographics_width: usize,
    pub records_width: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabList {
    format_version: u32,
    demographics: Vec<EhrVocab>,
    records: Vec<RecordVocab>,
    pub age_mean: f64,
    pub age_std: f64,
    #[serde(skip)]
    dataset: PathBuf,
}

fn demographic_tables(tables: &VocabCodeTables) -> Vec<CodeTable> {
    let current_year = Local::now().year();
    DemographicField::ALL
        .iter()
        .map(|&field| match field {
            DemographicField::BirthDay => CodeTable::from_codes((1..=31).map(|d| d.to_string())),
            DemographicField::BirthMonth => {
                CodeTable::from_codes((1..=12).map(|m| m.to_string()))
            }
            DemographicField::BirthYear => CodeTable::from_codes(
                (FIRST_BIRTH_YEAR..=current_year).map(|y| y.to_string()),
            ),
            _ => CodeTable::from_codes(tables.patients.values(field).iter().cloned()),
        })
        .collect()
}

/// Mean and sample standard deviation. A degenerate spread falls back to 1.0 so the
/// normalised age stays finite.
fn age_moments(ages: &[f64]) -> (f64, f64) {
    if ages.is_empty() {
        return (0.0, 1.0);
    }
    let n = ages.len() as f64;
    let mean = ages.iter().sum::<f64>() / n;
    if ages.len() < 2 {
        return (mean, 1.0);
    }
    let var = ages.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std.is_finite() && std > 0.0 {
        (mean, std)
    } else {
        (mean, 1.0)
    }
}

impl VocabList {
    /// `{dataset}/processed/vocabs.json`
    pub fn file_path(dataset: &Path) -> PathBuf {
        dataset.join("processed").join("vocabs.json")
    }

    /// Reads the training code tables of `dataset` and builds every vocabulary.
    pub fn create(dataset: &Path, num_buckets: usize) -> Result<Self, VocabError> {
        let tables = load_vocab_code_tables(dataset)?;
        Self::from_tables(&tables, num_buckets, dataset)
    }

    /// Builds every vocabulary from tables already in memory.
    pub fn from_tables(
        tables: &VocabCodeTables,
        num_buckets: usize,
        dataset: &Path,
    ) -> Result<Self, VocabError> {
        let demographics = demographic_tables(tables)
            .iter()
            .map(EhrVocab::create)
            .collect();

        let mut records = Vec::with_capacity(RecordKind::COUNT);
        records.push(RecordVocab::Observation(ObsVocab::create(
            &tables.observations,
            num_buckets,
        )?));
        records.extend(
            tables
                .records
                .iter()
                .map(|t| RecordVocab::Plain(EhrVocab::create(t))),
        );

        let (age_mean, age_std) = age_moments(&tables.patients.age_now_days);
        log::info!("Built {} record vocabs, age mean {age_mean:.1} days, std {age_std:.1}", records.len());

        Ok(Self {
            format_version: VOCAB_FORMAT_VERSION,
            demographics,
            records,
            age_mean,
            age_std,
            dataset: dataset.to_path_buf(),
        })
    }

    /// Persists to `{dataset}/processed/vocabs.json`, returning the path written.
    pub fn save(&self) -> Result<PathBuf, VocabError> {
        let path = Self::file_path(&self.dataset);
        write_json_atomic(&path, self)?;
        log::info!("Saved vocab lists to '{}'", path.display());
        Ok(path)
    }

    pub fn load(dataset: &Path) -> Result<Self, VocabError> {
        let mut list: Self = read_json(&Self::file_path(dataset))?;
        if list.format_version != VOCAB_FORMAT_VERSION {
            return Err(VocabError::UnsupportedFormat {
                found: list.format_version,
                expected: VOCAB_FORMAT_VERSION,
            });
        }
        list.check_layout()?;
        list.dataset = dataset.to_path_buf();
        Ok(list)
    }

    /// One vocab per demographic field and record stream, observations first, each
    /// holding at least the two reserved rows.
    fn check_layout(&self) -> Result<(), VocabError> {
        let inconsistent = |msg: String| Err(VocabError::Inconsistent(msg));
        if self.demographics.len() != DemographicField::COUNT {
            return inconsistent(format!(
                "{} demographic vocabs, expected {}",
                self.demographics.len(),
                DemographicField::COUNT
            ));
        }
        if self.records.len() != RecordKind::COUNT {
            return inconsistent(format!(
                "{} record vocabs, expected {}",
                self.records.len(),
                RecordKind::COUNT
            ));
        }
        for (kind, vocab) in RecordKind::ALL.iter().zip(&self.records) {
            let is_obs = matches!(vocab, RecordVocab::Observation(_));
            if is_obs != (*kind == RecordKind::Observations) {
                return inconsistent(format!("the {kind} vocab has the wrong variant"));
            }
        }
        let mut sizes = self
            .demographics
            .iter()
            .map(|v| v.size())
            .chain(self.records.iter().map(|v| v.size()));
        if sizes.any(|size| size < 2) {
            return inconsistent("a vocab is missing its reserved rows".to_string());
        }
        if !(self.age_std.is_finite() && self.age_std > 0.0 && self.age_mean.is_finite()) {
            return inconsistent(format!(
                "age mean {} and std {} cannot normalise ages",
                self.age_mean, self.age_std
            ));
        }
        Ok(())
    }

    pub fn dataset(&self) -> &Path {
        &self.dataset
    }

    pub fn demographic(&self, field: DemographicField) -> &EhrVocab {
        &self.demographics[field.index()]
    }

    pub fn record(&self, kind: RecordKind) -> &RecordVocab {
        &self.records[kind.index()]
    }

    /// `(age_now_days - mean) / std`
    pub fn normalize_age(&self, age_now_days: f64) -> f64 {
        (age_now_days - self.age_mean) / self.age_std
    }

    pub fn all_embedding_dims(&self, alpha: f64) -> EmbeddingDims {
        let demographics: Vec<_> = self
            .demographics
            .iter()
            .map(|v| v.embedding_dims(alpha))
            .collect();
        let records: Vec<_> = self.records.iter().map(|v| v.embedding_dims(alpha)).collect();
        EmbeddingDims {
            demographics_width: demographics.iter().map(|d| d.1).sum(),
            records_width: records.iter().map(|d| d.1).sum(),
            demographics,
            records,
        }
    }

    /// Embedding sizes with the default scaling exponent.
    pub fn default_embedding_dims(&self) -> EmbeddingDims {
        self.all_embedding_dims(DEFAULT_EMB_ALPHA)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::PatientCodeTable;
    use crate::vocab::{ExceptionLog, ObsCodeRow};

    pub(crate) fn sample_tables() -> VocabCodeTables {
        let fields = DemographicField::ALL
            .iter()
            .filter(|f| f.column() != "birthdate")
            .map(|&f| (f, vec![format!("{f:?}-a"), format!("{f:?}-b")]))
            .collect();
        let obs_row = |value: &str| ObsCodeRow {
            orig_code: "8302-2".into(),
            desc: "Body Height".into(),
            value: value.into(),
            units: "cm".into(),
            kind: "numeric".into(),
        };
        VocabCodeTables {
            patients: PatientCodeTable {
                fields,
                age_now_days: vec![1000.0, 2000.0, 3000.0],
            },
            observations: vec![obs_row("50"), obs_row("150")],
            records: RecordKind::ALL[1..]
                .iter()
                .map(|k| CodeTable::from_codes([format!("{k}-1"), format!("{k}-2")]))
                .collect(),
        }
    }

    #[test]
    fn builds_fixed_calendar_vocabs_and_age_moments() {
        let list = VocabList::from_tables(&sample_tables(), 5, Path::new("unused")).unwrap();
        assert_eq!(list.demographic(DemographicField::BirthDay).size(), 33);
        assert_eq!(list.demographic(DemographicField::BirthMonth).size(), 14);
        let years = (Local::now().year() - FIRST_BIRTH_YEAR + 1) as usize;
        assert_eq!(list.demographic(DemographicField::BirthYear).size(), years + 2);
        assert_eq!(list.demographic(DemographicField::Gender).size(), 4);

        assert_eq!(list.record(RecordKind::Observations).size(), 7);
        assert_eq!(list.record(RecordKind::Conditions).size(), 4);

        assert_eq!(list.age_mean, 2000.0);
        assert_eq!(list.age_std, 1000.0);
        assert_eq!(list.normalize_age(3000.0), 1.0);
    }

    #[test]
    fn degenerate_age_spread_falls_back_to_unit_std() {
        assert_eq!(age_moments(&[5.0]), (5.0, 1.0));
        assert_eq!(age_moments(&[5.0, 5.0]), (5.0, 1.0));
    }

    #[test]
    fn embedding_dims_sum_to_widths() {
        let list = VocabList::from_tables(&sample_tables(), 5, Path::new("unused")).unwrap();
        let dims = list.all_embedding_dims(DEFAULT_EMB_ALPHA);
        assert_eq!(dims.demographics.len(), DemographicField::COUNT);
        assert_eq!(dims.records.len(), RecordKind::COUNT);
        assert_eq!(
            dims.records_width,
            dims.records.iter().map(|d| d.1).sum::<usize>()
        );
        assert_eq!(dims, list.default_embedding_dims());
    }

    #[test]
    fn save_then_load_preserves_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let list = VocabList::from_tables(&sample_tables(), 5, dir.path()).unwrap();
        let path = list.save().unwrap();
        assert_eq!(path, dir.path().join("processed").join("vocabs.json"));

        let loaded = VocabList::load(dir.path()).unwrap();
        let log = ExceptionLog::disabled();
        let codes = ["8302-2||149||cm||numeric"];
        assert_eq!(
            loaded.record(RecordKind::Observations).numericalize(&codes, &log),
            list.record(RecordKind::Observations).numericalize(&codes, &log)
        );
        assert_eq!(loaded.age_std, list.age_std);
        assert_eq!(loaded.dataset(), dir.path());
    }

    #[test]
    fn load_rejects_other_format_versions() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = VocabList::from_tables(&sample_tables(), 2, dir.path()).unwrap();
        list.format_version = VOCAB_FORMAT_VERSION + 1;
        list.save().unwrap();
        assert!(matches!(
            VocabList::load(dir.path()),
            Err(VocabError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn load_rejects_truncated_or_reordered_lists() {
        let dir = tempfile::tempdir().unwrap();
        let list = VocabList::from_tables(&sample_tables(), 2, dir.path()).unwrap();

        let mut truncated = list.clone();
        truncated.records.pop();
        truncated.save().unwrap();
        assert!(matches!(
            VocabList::load(dir.path()),
            Err(VocabError::Inconsistent(_))
        ));

        let mut short = list.clone();
        short.demographics.truncate(3);
        short.save().unwrap();
        assert!(matches!(
            VocabList::load(dir.path()),
            Err(VocabError::Inconsistent(_))
        ));

        let mut swapped = list.clone();
        swapped.records.swap(0, 1);
        swapped.save().unwrap();
        assert!(matches!(
            VocabList::load(dir.path()),
            Err(VocabError::Inconsistent(_))
        ));

        list.save().unwrap();
        assert!(VocabList::load(dir.path()).is_ok());
    }

    #[test]
    fn load_without_vocab_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VocabList::load(dir.path()),
            Err(VocabError::File(crate::shared::files::FileError::NotFound(_)))
        ));
    }
}
