//! Recorded assertions
//!
//! [`Checks`] compares page text and table snapshots against expectations.
//! Every check, passing or failing, lands in the assertion log that ends up
//! in the scenario outcome. Checks only read; they never touch the server.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::region::TableSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub description: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Default)]
pub struct Checks {
    log: Vec<CheckRecord>,
}

impl Checks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> &[CheckRecord] {
        &self.log
    }

    pub fn take_log(&mut self) -> Vec<CheckRecord> {
        std::mem::take(&mut self.log)
    }

    pub fn passed(&self) -> usize {
        self.log.iter().filter(|c| c.passed).count()
    }

    fn record(&mut self, description: String, outcome: Result<(), String>) -> E2eResult<()> {
        let passed = outcome.is_ok();
        debug!("{} {}", if passed { "✓" } else { "✗" }, description);
        let detail = outcome.as_ref().err().cloned();
        self.log.push(CheckRecord {
            description: description.clone(),
            passed,
            detail,
        });
        outcome.map_err(|detail| E2eError::AssertionFailed(format!("{description}: {detail}")))
    }

    /// Every text occurs in the page
    pub fn text_present(&mut self, page_text: &str, texts: &[&str]) -> E2eResult<()> {
        let missing: Vec<&str> = texts
            .iter()
            .copied()
            .filter(|t| !page_text.contains(t))
            .collect();
        let outcome = if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing {missing:?}"))
        };
        self.record(format!("text present {texts:?}"), outcome)
    }

    /// No text occurs in the page
    pub fn text_absent(&mut self, page_text: &str, texts: &[&str]) -> E2eResult<()> {
        let found: Vec<&str> = texts
            .iter()
            .copied()
            .filter(|t| page_text.contains(t))
            .collect();
        let outcome = if found.is_empty() {
            Ok(())
        } else {
            Err(format!("found {found:?}"))
        };
        self.record(format!("text absent {texts:?}"), outcome)
    }

    pub fn text_present_times(&mut self, page_text: &str, text: &str, times: usize) -> E2eResult<()> {
        let count = if text.is_empty() {
            0
        } else {
            page_text.matches(text).count()
        };
        let outcome = if count == times {
            Ok(())
        } else {
            Err(format!("found {count} time(s)"))
        };
        self.record(format!("{text:?} present {times} time(s)"), outcome)
    }

    pub fn row_count(&mut self, table: &TableSnapshot, expected: usize) -> E2eResult<()> {
        let actual = table.row_count()?;
        let outcome = if actual == expected {
            Ok(())
        } else {
            Err(format!("got {actual}"))
        };
        self.record(format!("{} has {expected} row(s)", table.name()), outcome)
    }

    /// Column values equal `expected`, in rendered order
    pub fn column_values(&mut self, table: &TableSnapshot, column: &str, expected: &[&str]) -> E2eResult<()> {
        let actual = table.column_values(column)?;
        let outcome = if actual == expected {
            Ok(())
        } else {
            Err(format!("got {actual:?}"))
        };
        self.record(format!("{}.{column} = {expected:?}", table.name()), outcome)
    }

    pub fn column_contains(&mut self, table: &TableSnapshot, column: &str, value: &str) -> E2eResult<()> {
        let outcome = match table.find_row(column, value)? {
            Some(_) => Ok(()),
            None => Err("no such row".to_string()),
        };
        self.record(format!("{}.{column} contains {value:?}", table.name()), outcome)
    }

    pub fn summary_equals(&mut self, table: &TableSnapshot, column: &str, expected: &str) -> E2eResult<()> {
        let outcome = match table.summary_value(column)? {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(format!("got {actual:?}")),
            None => Err("no summary row".to_string()),
        };
        self.record(format!("{} summary of {column} is {expected:?}", table.name()), outcome)
    }

    pub fn cell_equals(&mut self, table: &TableSnapshot, row: usize, column: &str, expected: &str) -> E2eResult<()> {
        let actual = table.cell(row, column)?;
        let outcome = if actual == expected {
            Ok(())
        } else {
            Err(format!("got {actual:?}"))
        };
        self.record(format!("{}[{row}].{column} = {expected:?}", table.name()), outcome)
    }

    pub fn equals<T: PartialEq + Debug>(&mut self, what: &str, expected: T, actual: T) -> E2eResult<()> {
        let outcome = if expected == actual {
            Ok(())
        } else {
            Err(format!("expected {expected:?}, got {actual:?}"))
        };
        self.record(what.to_string(), outcome)
    }
}
