//! PHI level checks for study exports
//!
//! Every field carries a PHI level. An export requested at level `L` must
//! contain exactly the fields ranked below `L`; an export at `NotPHI`
//! carries everything.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::archive::ExportArchive;
use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhiLevel {
    #[default]
    #[serde(rename = "NotPHI")]
    NotPhi,
    Limited,
    #[serde(rename = "PHI")]
    Phi,
    Restricted,
}

impl PhiLevel {
    pub fn rank(&self) -> u8 {
        match self {
            PhiLevel::NotPhi => 0,
            PhiLevel::Limited => 1,
            PhiLevel::Phi => 2,
            PhiLevel::Restricted => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhiLevel::NotPhi => "NotPHI",
            PhiLevel::Limited => "Limited",
            PhiLevel::Phi => "PHI",
            PhiLevel::Restricted => "Restricted",
        }
    }

    /// Whether an export at this level keeps a field at `field`
    pub fn keeps(&self, field: PhiLevel) -> bool {
        *self == PhiLevel::NotPhi || field.rank() < self.rank()
    }
}

impl fmt::Display for PhiLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhiLevel {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "notphi" | "not_phi" | "none" => Ok(PhiLevel::NotPhi),
            "limited" => Ok(PhiLevel::Limited),
            "phi" => Ok(PhiLevel::Phi),
            "restricted" => Ok(PhiLevel::Restricted),
            other => Err(E2eError::Config(format!("unknown PHI level '{other}'"))),
        }
    }
}

/// A field and its declared PHI level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPhi {
    pub field: String,
    pub level: PhiLevel,
}

impl FieldPhi {
    pub fn new(field: impl Into<String>, level: PhiLevel) -> Self {
        Self {
            field: field.into(),
            level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhiViolation {
    /// Exported although its level is at or above the export level
    Leaked { field: String, level: PhiLevel },
    /// Allowed by the export level but absent
    Missing { field: String, level: PhiLevel },
}

impl fmt::Display for PhiViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhiViolation::Leaked { field, level } => write!(f, "{field} ({level}) was exported"),
            PhiViolation::Missing { field, level } => write!(f, "{field} ({level}) is missing"),
        }
    }
}

fn same_field(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Fields an export at `level` should contain
pub fn expected_columns(fields: &[FieldPhi], level: PhiLevel) -> Vec<&str> {
    fields
        .iter()
        .filter(|f| level.keeps(f.level))
        .map(|f| f.field.as_str())
        .collect()
}

/// Compare exported column names against the PHI map. Columns the map does
/// not mention are ignored.
pub fn verify_columns<S: AsRef<str>>(listed: &[S], fields: &[FieldPhi], level: PhiLevel) -> Vec<PhiViolation> {
    let present = |field: &str| listed.iter().any(|c| same_field(c.as_ref(), field));

    fields
        .iter()
        .filter_map(|f| match (level.keeps(f.level), present(&f.field)) {
            (false, true) => Some(PhiViolation::Leaked {
                field: f.field.clone(),
                level: f.level,
            }),
            (true, false) => Some(PhiViolation::Missing {
                field: f.field.clone(),
                level: f.level,
            }),
            _ => None,
        })
        .collect()
}

/// Check the header of one exported TSV member
pub fn verify_export(
    archive: &ExportArchive,
    member: &str,
    fields: &[FieldPhi],
    level: PhiLevel,
) -> E2eResult<Vec<PhiViolation>> {
    let header = archive.tsv_header(member)?;
    Ok(verify_columns(&header, fields, level))
}
