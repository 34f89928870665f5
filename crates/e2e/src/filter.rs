//! Grid filter operators
//!
//! One operator vocabulary serves three consumers: the data-region filter
//! dialog (by UI label), the query API (by URL suffix, `query.Col~suffix=v`)
//! and local evaluation for in-process regions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::E2eError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    StartsWith,
    DoesNotStartWith,
    Contains,
    DoesNotContain,
    IsBlank,
    IsNotBlank,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    /// Value is a `;`-separated list
    In,
}

const ALL: [FilterOp; 13] = [
    FilterOp::Equals,
    FilterOp::NotEquals,
    FilterOp::StartsWith,
    FilterOp::DoesNotStartWith,
    FilterOp::Contains,
    FilterOp::DoesNotContain,
    FilterOp::IsBlank,
    FilterOp::IsNotBlank,
    FilterOp::GreaterThan,
    FilterOp::LessThan,
    FilterOp::GreaterOrEqual,
    FilterOp::LessOrEqual,
    FilterOp::In,
];

impl FilterOp {
    /// Label shown in the filter dialog
    pub fn label(&self) -> &'static str {
        match self {
            FilterOp::Equals => "Equals",
            FilterOp::NotEquals => "Does Not Equal",
            FilterOp::StartsWith => "Starts With",
            FilterOp::DoesNotStartWith => "Does Not Start With",
            FilterOp::Contains => "Contains",
            FilterOp::DoesNotContain => "Does Not Contain",
            FilterOp::IsBlank => "Is Blank",
            FilterOp::IsNotBlank => "Is Not Blank",
            FilterOp::GreaterThan => "Is Greater Than",
            FilterOp::LessThan => "Is Less Than",
            FilterOp::GreaterOrEqual => "Is Greater Than or Equal To",
            FilterOp::LessOrEqual => "Is Less Than or Equal To",
            FilterOp::In => "Equals One Of",
        }
    }

    /// Suffix used in query URLs
    pub fn url_suffix(&self) -> &'static str {
        match self {
            FilterOp::Equals => "eq",
            FilterOp::NotEquals => "neq",
            FilterOp::StartsWith => "startswith",
            FilterOp::DoesNotStartWith => "doesnotstartwith",
            FilterOp::Contains => "contains",
            FilterOp::DoesNotContain => "doesnotcontain",
            FilterOp::IsBlank => "isblank",
            FilterOp::IsNotBlank => "isnonblank",
            FilterOp::GreaterThan => "gt",
            FilterOp::LessThan => "lt",
            FilterOp::GreaterOrEqual => "gte",
            FilterOp::LessOrEqual => "lte",
            FilterOp::In => "in",
        }
    }

    /// Whether the operator ignores its value
    pub fn is_unary(&self) -> bool {
        matches!(self, FilterOp::IsBlank | FilterOp::IsNotBlank)
    }

    /// Evaluate against a rendered cell value
    pub fn evaluate(&self, cell: &str, value: Option<&str>) -> bool {
        let cell = cell.trim();
        let value = value.unwrap_or("").trim();
        let lc = cell.to_lowercase();
        let lv = value.to_lowercase();

        match self {
            FilterOp::IsBlank => cell.is_empty(),
            FilterOp::IsNotBlank => !cell.is_empty(),
            FilterOp::Equals => compare(cell, value) == Some(std::cmp::Ordering::Equal),
            FilterOp::NotEquals => compare(cell, value) != Some(std::cmp::Ordering::Equal),
            FilterOp::StartsWith => lc.starts_with(&lv),
            FilterOp::DoesNotStartWith => !lc.starts_with(&lv),
            FilterOp::Contains => lc.contains(&lv),
            FilterOp::DoesNotContain => !lc.contains(&lv),
            FilterOp::GreaterThan => compare(cell, value) == Some(std::cmp::Ordering::Greater),
            FilterOp::LessThan => compare(cell, value) == Some(std::cmp::Ordering::Less),
            FilterOp::GreaterOrEqual => matches!(
                compare(cell, value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            FilterOp::LessOrEqual => matches!(
                compare(cell, value),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            FilterOp::In => value
                .split(';')
                .any(|v| compare(cell, v.trim()) == Some(std::cmp::Ordering::Equal)),
        }
    }
}

/// Numeric when both sides parse, case-insensitive text otherwise.
/// Blank cells never order against a non-blank value.
fn compare(cell: &str, value: &str) -> Option<std::cmp::Ordering> {
    if cell.is_empty() != value.is_empty() {
        return None;
    }
    match (cell.parse::<f64>(), value.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(cell.to_lowercase().cmp(&value.to_lowercase())),
    }
}

/// Sort order for rendered cells: blanks first, then numeric or text order
pub fn compare_cells(a: &str, b: &str) -> std::cmp::Ordering {
    let (a, b) = (a.trim(), b.trim());
    match (a.is_empty(), b.is_empty()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        (false, false) => compare(a, b).unwrap_or(std::cmp::Ordering::Equal),
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for FilterOp {
    type Err = E2eError;

    /// Accepts a UI label ("Starts With") or a URL suffix ("startswith")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ALL.iter()
            .copied()
            .find(|op| op.label().eq_ignore_ascii_case(s) || op.url_suffix() == s)
            .ok_or_else(|| E2eError::PlanParse(format!("unknown filter operator: {s}")))
    }
}

/// A (column, operator, value) triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Option<String>,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: Some(value.into()),
        }
    }

    pub fn unary(column: impl Into<String>, op: FilterOp) -> Self {
        Self {
            column: column.into(),
            op,
            value: None,
        }
    }

    /// `query.<column>~<suffix>` parameter name
    pub fn query_param(&self, prefix: &str) -> (String, String) {
        (
            format!("{prefix}.{}~{}", self.column, self.op.url_suffix()),
            self.value.clone().unwrap_or_default(),
        )
    }
}
