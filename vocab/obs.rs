//! Observation vocabulary with value bucketing.
//!
//! Every vocabulary entry is a synthetic bucket row `(code, desc, value, units, type)`.
//! Numeric observations get `num_buckets` representative values per (code, unit), evenly
//! spaced over the observed range; text observations get one bucket per distinct value.
//!
//! Raw observations arrive as composite codes `"{code}||{value}||{units}||{type}"`. A
//! numeric value resolves to the bucket whose representative value is nearest, so value
//! precision is intentionally reduced to bucket granularity. When two buckets are
//! equally near, the one with the lower index wins.

use super::{CodeText, ExceptionLog, VocabError, Vocabulary};
use crate::types::{
    NONE_DESCRIPTION, NONE_INDEX, NONE_TOKEN, UNK_DESCRIPTION, UNK_INDEX, UNK_TOKEN,
};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator of the composite observation code.
pub const FIELD_SEPARATOR: &str = "||";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObsKind {
    Numeric,
    Text,
    /// The two reserved rows.
    Reserved,
}

impl ObsKind {
    /// Parses the declared type of a data row. Reserved rows never come from data.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "numeric" => Some(Self::Numeric),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Text => "text",
            Self::Reserved => "reserved",
        }
    }
}

/// Representative value of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BucketValue {
    Numeric(f64),
    Text(String),
    Reserved,
}

impl fmt::Display for BucketValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Text(t) => f.write_str(t),
            Self::Reserved => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsBucket {
    pub code: String,
    pub desc: String,
    pub value: BucketValue,
    pub units: String,
    pub kind: ObsKind,
}

impl ObsBucket {
    fn reserved(token: &str, desc: &str) -> Self {
        Self {
            code: token.to_string(),
            desc: desc.to_string(),
            value: BucketValue::Reserved,
            units: token.to_string(),
            kind: ObsKind::Reserved,
        }
    }

    /// The composite code this bucket answers to.
    pub fn composite_code(&self) -> String {
        match self.kind {
            ObsKind::Reserved => self.code.clone(),
            kind => {
                let value = self.value.to_string();
                composite_code(&self.code, &value, &self.units, kind.as_str())
            }
        }
    }
}

/// One row of the cleaned observation code table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObsCodeRow {
    pub orig_code: String,
    pub desc: String,
    pub value: String,
    pub units: String,
    pub kind: String,
}

/// Builds the composite code for a raw observation.
pub fn composite_code(code: &str, value: &str, units: &str, kind: &str) -> String {
    [code, value, units, kind].join(FIELD_SEPARATOR)
}

/// Bucket indices sharing a (code, units), split by type, in ascending index order.
#[derive(Debug, Clone, Default)]
struct BucketGroup {
    numeric: Vec<usize>,
    text: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct StoredObsVocab {
    buckets: Vec<ObsBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredObsVocab", into = "StoredObsVocab")]
pub struct ObsVocab {
    buckets: Vec<ObsBucket>,
    groups: AHashMap<String, AHashMap<String, BucketGroup>>,
}

impl From<StoredObsVocab> for ObsVocab {
    fn from(stored: StoredObsVocab) -> Self {
        Self::from_buckets(stored.buckets)
    }
}

impl From<ObsVocab> for StoredObsVocab {
    fn from(vocab: ObsVocab) -> Self {
        Self {
            buckets: vocab.buckets,
        }
    }
}

/// `num` evenly spaced values over `[start, stop]`, both ends included.
fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| if i == num - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

struct NumericRange<'a> {
    desc: &'a str,
    min: f64,
    max: f64,
}

struct TextValues<'a> {
    desc: &'a str,
    values: Vec<&'a str>,
    seen: AHashSet<&'a str>,
}

/// Keys in first-seen order: codes, and units within each code.
#[derive(Default)]
struct FirstSeen<'a> {
    codes: Vec<&'a str>,
    units: AHashMap<&'a str, Vec<&'a str>>,
}

impl<'a> FirstSeen<'a> {
    /// Returns true if the (code, unit) pair is new.
    fn insert(&mut self, code: &'a str, unit: &'a str) -> bool {
        let units = self.units.entry(code).or_insert_with(|| {
            self.codes.push(code);
            Vec::new()
        });
        if units.contains(&unit) {
            false
        } else {
            units.push(unit);
            true
        }
    }

    fn pairs(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.codes
            .iter()
            .flat_map(|code| self.units[code].iter().map(move |unit| (*code, *unit)))
    }
}

impl ObsVocab {
    fn from_buckets(buckets: Vec<ObsBucket>) -> Self {
        let mut groups: AHashMap<String, AHashMap<String, BucketGroup>> = AHashMap::new();
        for (i, bucket) in buckets.iter().enumerate() {
            let group = groups
                .entry(bucket.code.clone())
                .or_default()
                .entry(bucket.units.clone())
                .or_default();
            match bucket.kind {
                ObsKind::Numeric => group.numeric.push(i),
                ObsKind::Text => group.text.push(i),
                ObsKind::Reserved => {}
            }
        }
        Self { buckets, groups }
    }

    /// Builds the bucketed vocabulary from the observation code table.
    ///
    /// Numeric codes are emitted first, then text codes, each in first-seen order of
    /// code and of unit within code. If the smallest and largest value of a (code, unit)
    /// coincide, all of its buckets share that value.
    pub fn create(rows: &[ObsCodeRow], num_buckets: usize) -> Result<Self, VocabError> {
        if num_buckets == 0 {
            return Err(VocabError::InvalidBucketCount(num_buckets));
        }

        let mut numeric_order = FirstSeen::default();
        let mut numeric_ranges: AHashMap<(&str, &str), NumericRange> = AHashMap::new();
        let mut text_order = FirstSeen::default();
        let mut text_values: AHashMap<(&str, &str), TextValues> = AHashMap::new();

        for row in rows {
            let code = row.orig_code.as_str();
            let unit = row.units.as_str();
            match ObsKind::parse(&row.kind) {
                Some(ObsKind::Numeric) => {
                    let value: f64 = row.value.trim().parse().map_err(|_| {
                        VocabError::InvalidNumericValue {
                            code: row.orig_code.clone(),
                            value: row.value.clone(),
                        }
                    })?;
                    if numeric_order.insert(code, unit) {
                        numeric_ranges.insert(
                            (code, unit),
                            NumericRange {
                                desc: &row.desc,
                                min: value,
                                max: value,
                            },
                        );
                    } else if let Some(range) = numeric_ranges.get_mut(&(code, unit)) {
                        range.min = range.min.min(value);
                        range.max = range.max.max(value);
                    }
                }
                Some(ObsKind::Text) => {
                    if text_order.insert(code, unit) {
                        text_values.insert(
                            (code, unit),
                            TextValues {
                                desc: &row.desc,
                                values: Vec::new(),
                                seen: AHashSet::new(),
                            },
                        );
                    }
                    if let Some(entry) = text_values.get_mut(&(code, unit)) {
                        let value = row.value.as_str();
                        if entry.seen.insert(value) {
                            entry.values.push(value);
                        }
                    }
                }
                Some(ObsKind::Reserved) | None => {
                    return Err(VocabError::UnknownObservationType {
                        code: row.orig_code.clone(),
                        kind: row.kind.clone(),
                    });
                }
            }
        }

        let mut buckets = vec![
            ObsBucket::reserved(NONE_TOKEN, NONE_DESCRIPTION),
            ObsBucket::reserved(UNK_TOKEN, UNK_DESCRIPTION),
        ];

        for (code, unit) in numeric_order.pairs() {
            let range = &numeric_ranges[&(code, unit)];
            for value in linspace(range.min, range.max, num_buckets) {
                buckets.push(ObsBucket {
                    code: code.to_string(),
                    desc: range.desc.to_string(),
                    value: BucketValue::Numeric(value),
                    units: unit.to_string(),
                    kind: ObsKind::Numeric,
                });
            }
        }

        for (code, unit) in text_order.pairs() {
            let entry = &text_values[&(code, unit)];
            for value in &entry.values {
                buckets.push(ObsBucket {
                    code: code.to_string(),
                    desc: entry.desc.to_string(),
                    value: BucketValue::Text(value.to_string()),
                    units: unit.to_string(),
                    kind: ObsKind::Text,
                });
            }
        }

        let original = rows
            .iter()
            .map(|r| r.orig_code.as_str())
            .collect::<AHashSet<_>>()
            .len();
        let vocab_codes = buckets
            .iter()
            .map(|b| b.code.as_str())
            .collect::<AHashSet<_>>()
            .len();
        if original != vocab_codes - 2 {
            return Err(VocabError::CodeCountMismatch {
                original,
                vocab: vocab_codes - 2,
            });
        }

        log::debug!(
            "Built observation vocab: {} codes, {} buckets",
            original,
            buckets.len()
        );
        Ok(Self::from_buckets(buckets))
    }

    pub fn buckets(&self) -> &[ObsBucket] {
        &self.buckets
    }

    pub fn bucket(&self, index: usize) -> Option<&ObsBucket> {
        self.buckets.get(index)
    }

    /// Resolves one composite code, or `None` if nothing in the vocabulary matches.
    fn resolve(&self, composite: &str) -> Option<usize> {
        match composite {
            NONE_TOKEN => return Some(NONE_INDEX),
            UNK_TOKEN => return Some(UNK_INDEX),
            _ => {}
        }

        let parts: Vec<&str> = composite.split(FIELD_SEPARATOR).collect();
        let [code, value, units, kind] = parts.as_slice() else {
            return None;
        };
        let group = self.groups.get(*code)?.get(*units)?;

        match ObsKind::parse(kind)? {
            ObsKind::Numeric => {
                let target: f64 = value.trim().parse().ok()?;
                if !target.is_finite() {
                    return None;
                }
                let mut best: Option<(usize, f64)> = None;
                for &i in &group.numeric {
                    if let BucketValue::Numeric(rep) = self.buckets[i].value {
                        let distance = (rep - target).abs();
                        // Strict comparison keeps the lowest index on ties.
                        if best.is_none_or(|(_, d)| distance < d) {
                            best = Some((i, distance));
                        }
                    }
                }
                best.map(|(i, _)| i)
            }
            ObsKind::Text => group.text.iter().copied().find(|&i| {
                matches!(&self.buckets[i].value, BucketValue::Text(t) if t.as_str() == *value)
            }),
            ObsKind::Reserved => None,
        }
    }
}

impl Vocabulary for ObsVocab {
    fn numericalize<S: AsRef<str>>(&self, codes: &[S], log: &ExceptionLog) -> Vec<usize> {
        let indices: Vec<usize> = codes
            .iter()
            .map(|code| {
                let code = code.as_ref();
                self.resolve(code).unwrap_or_else(|| {
                    log.record("ObsVocab", code);
                    UNK_INDEX
                })
            })
            .collect();
        assert_eq!(
            indices.len(),
            codes.len(),
            "numericalize must map every code to exactly one index"
        );
        indices
    }

    fn textify(&self, indices: &[usize]) -> Result<Vec<CodeText>, VocabError> {
        indices
            .iter()
            .map(|&i| {
                let bucket = self.buckets.get(i).ok_or(VocabError::IndexOutOfRange {
                    index: i,
                    size: self.buckets.len(),
                })?;
                Ok(CodeText {
                    code: bucket.composite_code(),
                    descriptions: vec![bucket.desc.clone()],
                })
            })
            .collect()
    }

    fn size(&self) -> usize {
        self.buckets.len()
    }
}
