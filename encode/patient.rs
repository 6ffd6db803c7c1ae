//! Per-patient encoding into `(values, offsets)` bags over a fixed age span.

use super::EncodeError;
use crate::data::{Event, PatientRecord};
use crate::types::{DemographicField, NONE_INDEX, NONE_TOKEN, RecordKind};
use crate::vocab::{ExceptionLog, VocabList, Vocabulary};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Year,
    Month,
}

/// The half-open age range `[start, stop)` in years, cut into year or month buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeSpan {
    start: u32,
    stop: u32,
    granularity: Granularity,
}

impl AgeSpan {
    pub fn new(start: u32, stop: u32, granularity: Granularity) -> Result<Self, EncodeError> {
        if start >= stop {
            return Err(EncodeError::InvalidAgeSpan { start, stop });
        }
        Ok(Self {
            start,
            stop,
            granularity,
        })
    }

    fn per_year(&self) -> i64 {
        match self.granularity {
            Granularity::Year => 1,
            Granularity::Month => 12,
        }
    }

    pub fn num_buckets(&self) -> usize {
        ((self.stop - self.start) as i64 * self.per_year()) as usize
    }

    /// Bucket of an event, or `None` when it falls outside the span.
    pub fn bucket_of(&self, event: &Event) -> Option<usize> {
        let age = match self.granularity {
            Granularity::Year => event.age_years,
            Granularity::Month => event.age_months,
        };
        let first = self.start as i64 * self.per_year();
        let bucket = age - first;
        (0..self.num_buckets() as i64)
            .contains(&bucket)
            .then_some(bucket as usize)
    }
}

/// Flattened indices of one record stream with the start of every bucket.
///
/// `offsets.len()` is the number of age buckets, `offsets[0] == 0`, and every bucket is
/// non-empty (an empty bucket holds the `xxnone` index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagInput {
    pub values: Vec<usize>,
    pub offsets: Vec<usize>,
}

impl BagInput {
    pub fn num_bags(&self) -> usize {
        self.offsets.len()
    }

    /// Indices of bucket `i`.
    pub fn bag(&self, i: usize) -> &[usize] {
        let start = self.offsets[i];
        let end = self
            .offsets
            .get(i + 1)
            .copied()
            .unwrap_or(self.values.len());
        &self.values[start..end]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPatient {
    pub id: String,
    /// One bag input per `RecordKind::ALL`.
    pub records: Vec<BagInput>,
    /// One index per `DemographicField::ALL`.
    pub demographics: Vec<usize>,
    /// `age_now_days` normalised with the vocabulary's mean and std.
    pub age_now: f32,
    pub labels: Vec<bool>,
}

pub struct PatientEncoder<'a> {
    vocabs: &'a VocabList,
    span: AgeSpan,
    exceptions: &'a ExceptionLog,
}

impl<'a> PatientEncoder<'a> {
    pub fn new(vocabs: &'a VocabList, span: AgeSpan, exceptions: &'a ExceptionLog) -> Self {
        Self {
            vocabs,
            span,
            exceptions,
        }
    }

    pub fn span(&self) -> AgeSpan {
        self.span
    }

    fn encode_stream(&self, kind: RecordKind, events: &[Event]) -> Result<BagInput, EncodeError> {
        let n = self.span.num_buckets();
        let mut buckets: Vec<Vec<&str>> = vec![Vec::new(); n];
        for event in events {
            if let Some(b) = self.span.bucket_of(event) {
                buckets[b].push(&event.code);
            }
        }

        let mut codes = Vec::with_capacity(n.max(events.len()));
        let mut offsets = Vec::with_capacity(n);
        for bucket in buckets {
            offsets.push(codes.len());
            if bucket.is_empty() {
                codes.push(NONE_TOKEN);
            } else {
                codes.extend(bucket);
            }
        }

        let values = self
            .vocabs
            .record(kind)
            .numericalize(&codes, self.exceptions);
        if values.len() != codes.len() {
            return Err(EncodeError::LengthMismatch {
                stream: kind.to_string(),
                expected: codes.len(),
                found: values.len(),
            });
        }
        Ok(BagInput { values, offsets })
    }

    pub fn encode(&self, record: &PatientRecord) -> Result<EncodedPatient, EncodeError> {
        let records = RecordKind::ALL
            .iter()
            .map(|&kind| self.encode_stream(kind, record.events(kind)))
            .collect::<Result<Vec<_>, _>>()?;

        let demographics = DemographicField::ALL
            .iter()
            .map(|&field| match record.demographics.code(field) {
                None => NONE_INDEX,
                Some(code) => self
                    .vocabs
                    .demographic(field)
                    .numericalize(&[code], self.exceptions)
                    .first()
                    .copied()
                    .unwrap_or(NONE_INDEX),
            })
            .collect();

        Ok(EncodedPatient {
            id: record.id.clone(),
            records,
            demographics,
            age_now: self.vocabs.normalize_age(record.demographics.age_now_days) as f32,
            labels: record.labels.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::Demographics;
    use crate::types::UNK_INDEX;
    use crate::vocab::list::tests::sample_tables;
    use std::path::Path;

    pub(crate) fn sample_vocabs() -> VocabList {
        VocabList::from_tables(&sample_tables(), 5, Path::new("unused")).unwrap()
    }

    fn event(age_years: i64, code: &str) -> Event {
        Event {
            age_years,
            age_months: age_years * 12 + 1,
            code: code.to_string(),
        }
    }

    pub(crate) fn sample_record(id: &str, label: bool) -> PatientRecord {
        let mut events = vec![Vec::new(); RecordKind::COUNT];
        events[RecordKind::Conditions.index()] = vec![
            event(0, "conditions-1"),
            event(2, "conditions-2"),
            event(2, "conditions-1"),
            event(2, "never-seen"),
            event(25, "conditions-2"),
        ];
        events[RecordKind::Observations.index()] = vec![event(1, "8302-2||149||cm||numeric")];
        let mut codes = vec![None; DemographicField::COUNT];
        codes[DemographicField::BirthMonth.index()] = Some("3".to_string());
        codes[DemographicField::Gender.index()] = Some("Gender-b".to_string());
        PatientRecord {
            id: id.to_string(),
            demographics: Demographics {
                codes,
                age_now_days: 2500.0,
            },
            events,
            labels: vec![label],
        }
    }

    #[test]
    fn age_span_counts_buckets_per_granularity() {
        assert_eq!(AgeSpan::new(0, 20, Granularity::Year).unwrap().num_buckets(), 20);
        assert_eq!(AgeSpan::new(2, 4, Granularity::Month).unwrap().num_buckets(), 24);
        assert!(matches!(
            AgeSpan::new(5, 5, Granularity::Year),
            Err(EncodeError::InvalidAgeSpan { start: 5, stop: 5 })
        ));
    }

    #[test]
    fn month_buckets_use_age_in_months() {
        let span = AgeSpan::new(1, 2, Granularity::Month).unwrap();
        let at = |months| Event {
            age_years: months / 12,
            age_months: months,
            code: String::new(),
        };
        assert_eq!(span.bucket_of(&at(11)), None);
        assert_eq!(span.bucket_of(&at(12)), Some(0));
        assert_eq!(span.bucket_of(&at(23)), Some(11));
        assert_eq!(span.bucket_of(&at(24)), None);
    }

    #[test]
    fn every_bucket_gets_an_entry() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let span = AgeSpan::new(0, 4, Granularity::Year).unwrap();
        let encoder = PatientEncoder::new(&vocabs, span, &log);

        let encoded = encoder.encode(&sample_record("p1", true)).unwrap();
        let conditions = &encoded.records[RecordKind::Conditions.index()];
        assert_eq!(conditions.num_bags(), 4);
        assert_eq!(conditions.offsets, vec![0, 1, 2, 5]);
        assert_eq!(conditions.bag(0), &[2]);
        assert_eq!(conditions.bag(1), &[NONE_INDEX]);
        assert_eq!(conditions.bag(2), &[3, 2, UNK_INDEX]);
        assert_eq!(conditions.bag(3), &[NONE_INDEX]);
        // The out-of-span event at age 25 is dropped; the unseen code is logged.
        assert_eq!(log.recorded(), 1);

        let allergies = &encoded.records[RecordKind::Allergies.index()];
        assert_eq!(allergies.values, vec![NONE_INDEX; 4]);

        let observations = &encoded.records[RecordKind::Observations.index()];
        // 149 is nearest to the top bucket (150) of the five 50..150 buckets.
        assert_eq!(observations.bag(1), &[6]);
    }

    #[test]
    fn demographics_encode_one_index_per_field() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder = PatientEncoder::new(
            &vocabs,
            AgeSpan::new(0, 2, Granularity::Year).unwrap(),
            &log,
        );
        let encoded = encoder.encode(&sample_record("p1", false)).unwrap();
        assert_eq!(encoded.demographics.len(), DemographicField::COUNT);
        assert_eq!(encoded.demographics[DemographicField::BirthDay.index()], NONE_INDEX);
        // Months are "1".."12" after the two reserved rows.
        assert_eq!(encoded.demographics[DemographicField::BirthMonth.index()], 4);
        assert_eq!(encoded.demographics[DemographicField::Gender.index()], 3);
        assert_eq!(encoded.age_now, 0.5);
        assert_eq!(encoded.labels, vec![false]);
    }
}
