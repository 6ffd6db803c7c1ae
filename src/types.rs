// ========================================================================================
//
//                       CORE DATA TYPES FOR THE EHRLEARN PIPELINE
//
// ========================================================================================
//
// This module is the dictionary of types shared across the architectural boundaries of
// the crate (`vocab`, `data`, `encode`, `learn`). Types used by a single file live in
// that file.

use serde::{Deserialize, Serialize};
use std::fmt;

// ========================================================================================
//                                 RESERVED VOCAB SLOTS
// ========================================================================================

/// Token for an age bucket (or demographic field) with nothing recorded.
pub const NONE_TOKEN: &str = "xxnone";
/// Token substituted for any code absent from a vocabulary.
pub const UNK_TOKEN: &str = "xxunk";

pub const NONE_INDEX: usize = 0;
pub const UNK_INDEX: usize = 1;

pub const NONE_DESCRIPTION: &str = "Nothing recorded";
pub const UNK_DESCRIPTION: &str = "Unknown";

/// Returns true for the two tokens every vocabulary reserves.
pub fn is_reserved_token(code: &str) -> bool {
    code == NONE_TOKEN || code == UNK_TOKEN
}

// ========================================================================================
//                                   RECORD STREAMS
// ========================================================================================

/// The typed event streams that make up a patient record.
///
/// The declaration order is the canonical order used for vocabularies, encoded bags
/// and embedding tables; it must never change between vocab build and training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    Observations,
    Allergies,
    Careplans,
    Medications,
    Imaging,
    Procedures,
    Conditions,
    Immunizations,
}

impl RecordKind {
    pub const ALL: [RecordKind; 8] = [
        RecordKind::Observations,
        RecordKind::Allergies,
        RecordKind::Careplans,
        RecordKind::Medications,
        RecordKind::Imaging,
        RecordKind::Procedures,
        RecordKind::Conditions,
        RecordKind::Immunizations,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Stem of the cleaned CSV file holding this stream.
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Observations => "observations",
            Self::Allergies => "allergies",
            Self::Careplans => "careplans",
            Self::Medications => "medications",
            Self::Imaging => "imaging_studies",
            Self::Procedures => "procedures",
            Self::Conditions => "conditions",
            Self::Immunizations => "immunizations",
        }
    }

    /// Position in [`RecordKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

// ========================================================================================
//                                    DEMOGRAPHICS
// ========================================================================================

/// Categorical demographic fields, in embedding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DemographicField {
    BirthDay,
    BirthMonth,
    BirthYear,
    Marital,
    Race,
    Ethnicity,
    Gender,
    Birthplace,
    City,
    State,
    Zip,
}

impl DemographicField {
    pub const ALL: [DemographicField; 11] = [
        DemographicField::BirthDay,
        DemographicField::BirthMonth,
        DemographicField::BirthYear,
        DemographicField::Marital,
        DemographicField::Race,
        DemographicField::Ethnicity,
        DemographicField::Gender,
        DemographicField::Birthplace,
        DemographicField::City,
        DemographicField::State,
        DemographicField::Zip,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Column in the patient tables that carries this field. Birth day, month and
    /// year are all derived from `birthdate`.
    pub fn column(self) -> &'static str {
        match self {
            Self::BirthDay | Self::BirthMonth | Self::BirthYear => "birthdate",
            Self::Marital => "marital",
            Self::Race => "race",
            Self::Ethnicity => "ethnicity",
            Self::Gender => "gender",
            Self::Birthplace => "birthplace",
            Self::City => "city",
            Self::State => "state",
            Self::Zip => "zip",
        }
    }

    /// Position in [`DemographicField::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

// ========================================================================================
//                                      SPLITS
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kind_index_matches_canonical_order() {
        for (i, kind) in RecordKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn birth_fields_share_the_birthdate_column() {
        assert_eq!(DemographicField::BirthDay.column(), "birthdate");
        assert_eq!(DemographicField::BirthYear.column(), "birthdate");
        assert_eq!(DemographicField::Zip.column(), "zip");
    }
}
