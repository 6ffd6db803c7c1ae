//! Plain code vocabulary: direct dictionary lookup with reserved none/unknown slots.

use super::{CodeText, ExceptionLog, VocabError, Vocabulary};
use crate::types::{
    NONE_DESCRIPTION, NONE_TOKEN, UNK_DESCRIPTION, UNK_INDEX, UNK_TOKEN, is_reserved_token,
};
use ahash::AHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One row per code occurrence, optionally with a free-text description.
#[derive(Debug, Clone, Default)]
pub struct CodeTable {
    pub codes: Vec<String>,
    pub descriptions: Option<Vec<String>>,
}

impl CodeTable {
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
            descriptions: None,
        }
    }

    pub fn with_descriptions<I, C, D>(rows: I) -> Self
    where
        I: IntoIterator<Item = (C, D)>,
        C: Into<String>,
        D: Into<String>,
    {
        let (codes, descriptions): (Vec<String>, Vec<String>) = rows
            .into_iter()
            .map(|(c, d)| (c.into(), d.into()))
            .unzip();
        Self {
            codes,
            descriptions: Some(descriptions),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Persisted form; the reverse index is rebuilt on load.
#[derive(Serialize, Deserialize)]
struct StoredEhrVocab {
    itoc: Vec<String>,
    ctod: Option<Vec<BTreeSet<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredEhrVocab", into = "StoredEhrVocab")]
pub struct EhrVocab {
    itoc: Vec<String>,
    ctoi: AHashMap<String, usize>,
    ctod: Option<Vec<BTreeSet<String>>>,
}

impl From<StoredEhrVocab> for EhrVocab {
    fn from(stored: StoredEhrVocab) -> Self {
        Self::from_parts(stored.itoc, stored.ctod)
    }
}

impl From<EhrVocab> for StoredEhrVocab {
    fn from(vocab: EhrVocab) -> Self {
        Self {
            itoc: vocab.itoc,
            ctod: vocab.ctod,
        }
    }
}

impl EhrVocab {
    fn from_parts(itoc: Vec<String>, ctod: Option<Vec<BTreeSet<String>>>) -> Self {
        let ctoi = itoc
            .iter()
            .enumerate()
            .map(|(i, code)| (code.clone(), i))
            .collect();
        Self { itoc, ctoi, ctod }
    }

    /// Builds the vocabulary from a code table.
    ///
    /// Index 0 is `xxnone`, index 1 is `xxunk`, then every other distinct code in the
    /// order it is first seen. Reserved tokens present in the table are not duplicated.
    /// When the table carries descriptions, all distinct descriptions of a code are
    /// collected into a set.
    pub fn create(table: &CodeTable) -> Self {
        let mut itoc = vec![NONE_TOKEN.to_string(), UNK_TOKEN.to_string()];
        itoc.extend(
            table
                .codes
                .iter()
                .filter(|c| !is_reserved_token(c))
                .unique()
                .cloned(),
        );

        let mut vocab = Self::from_parts(itoc, None);

        if let Some(descriptions) = &table.descriptions {
            let mut ctod = vec![BTreeSet::new(); vocab.itoc.len()];
            ctod[0].insert(NONE_DESCRIPTION.to_string());
            ctod[1].insert(UNK_DESCRIPTION.to_string());
            for (code, desc) in table.codes.iter().zip(descriptions) {
                if is_reserved_token(code) {
                    continue;
                }
                if let Some(&i) = vocab.ctoi.get(code.as_str()) {
                    ctod[i].insert(desc.clone());
                }
            }
            vocab.ctod = Some(ctod);
        }

        vocab
    }

    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.ctoi.get(code).copied()
    }

    pub fn code_at(&self, index: usize) -> Option<&str> {
        self.itoc.get(index).map(String::as_str)
    }

    pub fn has_descriptions(&self) -> bool {
        self.ctod.is_some()
    }
}

impl Vocabulary for EhrVocab {
    fn numericalize<S: AsRef<str>>(&self, codes: &[S], log: &ExceptionLog) -> Vec<usize> {
        let indices: Vec<usize> = codes
            .iter()
            .map(|code| {
                let code = code.as_ref();
                self.ctoi.get(code).copied().unwrap_or_else(|| {
                    log.record("EhrVocab", code);
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
                let code = self.itoc.get(i).ok_or(VocabError::IndexOutOfRange {
                    index: i,
                    size: self.itoc.len(),
                })?;
                let descriptions = self
                    .ctod
                    .as_ref()
                    .map(|ctod| ctod[i].iter().cloned().collect())
                    .unwrap_or_default();
                Ok(CodeText {
                    code: code.clone(),
                    descriptions,
                })
            })
            .collect()
    }

    fn size(&self) -> usize {
        self.itoc.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NONE_INDEX;

    fn ab_vocab() -> EhrVocab {
        EhrVocab::create(&CodeTable::from_codes(["A", "B"]))
    }

    #[test]
    fn reserved_slots_come_first() {
        let vocab = ab_vocab();
        assert_eq!(vocab.size(), 4);
        assert_eq!(vocab.index_of(NONE_TOKEN), Some(NONE_INDEX));
        assert_eq!(vocab.index_of(UNK_TOKEN), Some(UNK_INDEX));
        assert_eq!(vocab.index_of("A"), Some(2));
        assert_eq!(vocab.index_of("B"), Some(3));
    }

    #[test]
    fn unknown_codes_fall_back_and_are_logged_once_each() {
        let vocab = ab_vocab();
        let log = ExceptionLog::disabled();
        assert_eq!(vocab.numericalize(&["A", "C", "B"], &log), vec![2, 1, 3]);
        assert_eq!(log.recorded(), 1);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let log = ExceptionLog::disabled();
        let empty: [&str; 0] = [];
        assert!(ab_vocab().numericalize(&empty, &log).is_empty());
        assert_eq!(log.recorded(), 0);
    }

    #[test]
    fn first_seen_order_not_sorted() {
        let vocab = EhrVocab::create(&CodeTable::from_codes(["z", "a", "z", "m", "a"]));
        assert_eq!(vocab.code_at(2), Some("z"));
        assert_eq!(vocab.code_at(3), Some("a"));
        assert_eq!(vocab.code_at(4), Some("m"));
        assert_eq!(vocab.size(), 5);
    }

    #[test]
    fn reserved_tokens_in_input_are_not_duplicated() {
        let vocab = EhrVocab::create(&CodeTable::from_codes(["xxunk", "A", "xxnone"]));
        assert_eq!(vocab.size(), 3);
        assert_eq!(vocab.index_of("A"), Some(2));
    }

    #[test]
    fn descriptions_collapse_into_sets() {
        let table = CodeTable::with_descriptions([
            ("A", "Asthma"),
            ("B", "Bronchitis"),
            ("A", "Asthma"),
            ("A", "Childhood asthma"),
        ]);
        let vocab = EhrVocab::create(&table);
        let text = vocab.textify(&[0, 1, 2]).unwrap();
        assert_eq!(text[0].descriptions, vec!["Nothing recorded"]);
        assert_eq!(text[1].descriptions, vec!["Unknown"]);
        assert_eq!(text[2].code, "A");
        assert_eq!(text[2].descriptions, vec!["Asthma", "Childhood asthma"]);
    }

    #[test]
    fn textify_inverts_numericalize() {
        let vocab = EhrVocab::create(&CodeTable::from_codes(["10509002", "444814009"]));
        let log = ExceptionLog::disabled();
        let codes = ["444814009", "10509002"];
        let indices = vocab.numericalize(&codes, &log);
        let back: Vec<String> = vocab
            .textify(&indices)
            .unwrap()
            .into_iter()
            .map(|t| t.code)
            .collect();
        assert_eq!(back, codes);
    }

    #[test]
    fn textify_rejects_out_of_range_indices() {
        assert!(matches!(
            ab_vocab().textify(&[4]),
            Err(VocabError::IndexOutOfRange { index: 4, size: 4 })
        ));
    }

    #[test]
    fn create_is_idempotent() {
        let table = CodeTable::from_codes(["q", "r", "q", "s"]);
        let first = EhrVocab::create(&table);
        let second = EhrVocab::create(&table);
        assert_eq!(first.itoc, second.itoc);
    }

    #[test]
    fn serde_round_trip_rebuilds_reverse_index() {
        let vocab = ab_vocab();
        let json = serde_json::to_string(&vocab).unwrap();
        let back: EhrVocab = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index_of("B"), Some(3));
        assert_eq!(back.size(), 4);
    }
}
