//! Data region snapshots
//!
//! A [`TableSnapshot`] is one read of a rendered grid. Anything that
//! re-renders the grid (filter, sort, paging, page size) consumes the
//! snapshot and hands back a freshly fetched one, so post-mutation data can
//! only be read through the new handle. A second handle fetched earlier for
//! the same region is detected at read time through the region's render
//! generation and fails with [`E2eError::StaleSnapshot`].
//!
//! Selection changes (`check_row`, `check_all`, ...) do not re-render rows
//! and keep the snapshot valid.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::driver::{Driver, RegionCommand, RegionData};
use crate::error::{E2eError, E2eResult};
use crate::filter::FilterOp;
use crate::page::Page;
use crate::wait::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Ascending,
    Descending,
}

/// Parsed "1 - 37 of 37" caption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub first: usize,
    pub last: usize,
    pub total: usize,
}

impl Pagination {
    pub fn parse(caption: &str) -> Option<Self> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = RE
            .get_or_init(|| Regex::new(r"(\d[\d,]*)\s*-\s*(\d[\d,]*)\s+of\s+(\d[\d,]*)").ok())
            .as_ref()?;
        let caps = re.captures(caption)?;
        let num = |i: usize| caps[i].replace(',', "").parse::<usize>().ok();
        Some(Self {
            first: num(1)?,
            last: num(2)?,
            total: num(3)?,
        })
    }
}

/// Split a footer cell such as "Sum: 1,044.5" into ("Sum", 1044.5)
pub fn parse_aggregate(text: &str) -> Option<(String, f64)> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"^\s*([A-Za-z][A-Za-z ]*?)\s*:\s*(-?[\d,]*\.?\d+)\s*$").ok())
        .as_ref()?;
    let caps = re.captures(text)?;
    let value = caps[2].replace(',', "").parse::<f64>().ok()?;
    Some((caps[1].to_string(), value))
}

/// Entry point for reading a named grid
pub struct DataRegion;

impl DataRegion {
    pub async fn fetch(driver: &Arc<dyn Driver>, name: &str) -> E2eResult<TableSnapshot> {
        TableSnapshot::fetch(driver, name).await
    }

    pub async fn wait_and_fetch(page: &Page, name: &str) -> E2eResult<TableSnapshot> {
        TableSnapshot::wait_and_fetch(page, name).await
    }
}

pub struct TableSnapshot {
    driver: Arc<dyn Driver>,
    data: RegionData,
    generation: u64,
    epoch: Arc<AtomicU64>,
}

impl std::fmt::Debug for TableSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSnapshot")
            .field("region", &self.data.name)
            .field("rows", &self.data.rows.len())
            .field("generation", &self.generation)
            .finish()
    }
}

impl TableSnapshot {
    /// Read the named region as it is rendered right now
    pub async fn fetch(driver: &Arc<dyn Driver>, name: &str) -> E2eResult<Self> {
        let epoch = driver.epochs().handle(name);
        let generation = epoch.load(Ordering::SeqCst);
        let mut data = driver
            .read_region(name)
            .await?
            .ok_or_else(|| E2eError::RegionNotFound(name.to_string()))?;
        data.name = name.to_string();
        if data.checked.len() != data.rows.len() {
            data.checked.resize(data.rows.len(), false);
        }
        debug!(
            "Fetched region '{}' ({} rows, generation {})",
            name,
            data.rows.len(),
            generation
        );
        Ok(Self {
            driver: driver.clone(),
            data,
            generation,
            epoch,
        })
    }

    /// Wait for the region to render, then read it
    pub async fn wait_and_fetch(page: &Page, name: &str) -> E2eResult<Self> {
        page.until(&Condition::RegionPresent(name.to_string())).await?;
        Self::fetch(page.driver(), name).await
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.generation
    }

    fn ensure_current(&self) -> E2eResult<()> {
        let current = self.epoch.load(Ordering::SeqCst);
        if current != self.generation {
            return Err(E2eError::StaleSnapshot {
                region: self.data.name.clone(),
                held: self.generation,
                current,
            });
        }
        Ok(())
    }

    fn column_index(&self, column: &str) -> E2eResult<usize> {
        let cols = &self.data.columns;
        cols.iter()
            .position(|c| c == column)
            .or_else(|| cols.iter().position(|c| c.eq_ignore_ascii_case(column)))
            .ok_or_else(|| E2eError::UnknownColumn {
                region: self.data.name.clone(),
                column: column.to_string(),
            })
    }

    fn check_row_index(&self, row: usize) -> E2eResult<()> {
        if row >= self.data.rows.len() {
            return Err(E2eError::RowOutOfRange {
                region: self.data.name.clone(),
                row,
                rows: self.data.rows.len(),
            });
        }
        Ok(())
    }

    pub fn row_count(&self) -> E2eResult<usize> {
        self.ensure_current()?;
        Ok(self.data.rows.len())
    }

    pub fn column_names(&self) -> E2eResult<&[String]> {
        self.ensure_current()?;
        Ok(&self.data.columns)
    }

    pub fn has_column(&self, column: &str) -> E2eResult<bool> {
        self.ensure_current()?;
        Ok(self.column_index(column).is_ok())
    }

    pub fn cell(&self, row: usize, column: &str) -> E2eResult<&str> {
        self.ensure_current()?;
        self.check_row_index(row)?;
        let col = self.column_index(column)?;
        Ok(self.data.rows[row].get(col).map(String::as_str).unwrap_or(""))
    }

    /// Values of one column, top to bottom as rendered
    pub fn column_values(&self, column: &str) -> E2eResult<Vec<&str>> {
        self.ensure_current()?;
        let col = self.column_index(column)?;
        Ok(self
            .data
            .rows
            .iter()
            .map(|r| r.get(col).map(String::as_str).unwrap_or(""))
            .collect())
    }

    /// One row keyed by column name
    pub fn row(&self, row: usize) -> E2eResult<BTreeMap<&str, &str>> {
        self.ensure_current()?;
        self.check_row_index(row)?;
        Ok(self
            .data
            .columns
            .iter()
            .map(String::as_str)
            .zip(self.data.rows[row].iter().map(String::as_str))
            .collect())
    }

    pub fn find_row(&self, column: &str, value: &str) -> E2eResult<Option<usize>> {
        Ok(self
            .column_values(column)?
            .iter()
            .position(|v| *v == value))
    }

    /// Indices of rows whose cell satisfies the operator, evaluated locally
    pub fn rows_where(&self, column: &str, op: FilterOp, value: Option<&str>) -> E2eResult<Vec<usize>> {
        Ok(self
            .column_values(column)?
            .iter()
            .enumerate()
            .filter(|(_, cell)| op.evaluate(cell, value))
            .map(|(i, _)| i)
            .collect())
    }

    /// Footer aggregate for a column; absent when no summary row is configured
    pub fn summary_value(&self, column: &str) -> E2eResult<Option<&str>> {
        self.ensure_current()?;
        let Some(summary) = &self.data.summary else {
            return Ok(None);
        };
        let key = self.data.columns[self.column_index(column)?].as_str();
        Ok(summary.get(key).map(String::as_str))
    }

    /// Footer aggregate split into label and number, e.g. ("Sum", 44.0)
    pub fn summary_number(&self, column: &str) -> E2eResult<Option<(String, f64)>> {
        Ok(self.summary_value(column)?.and_then(parse_aggregate))
    }

    /// SHA-256 over the ordered column values, for export/import comparisons
    pub fn column_checksum(&self, column: &str) -> E2eResult<String> {
        let mut hasher = Sha256::new();
        for value in self.column_values(column)? {
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn pagination(&self) -> E2eResult<Option<Pagination>> {
        self.ensure_current()?;
        Ok(self.data.pagination.as_deref().and_then(Pagination::parse))
    }

    pub fn checked_rows(&self) -> E2eResult<Vec<usize>> {
        self.ensure_current()?;
        Ok(self
            .data
            .checked
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| i)
            .collect())
    }

    pub fn is_checked(&self, row: usize) -> E2eResult<bool> {
        self.ensure_current()?;
        self.check_row_index(row)?;
        Ok(self.data.checked[row])
    }

    pub async fn check_row(&mut self, row: usize) -> E2eResult<()> {
        self.set_row_checked(row, true).await
    }

    pub async fn uncheck_row(&mut self, row: usize) -> E2eResult<()> {
        self.set_row_checked(row, false).await
    }

    async fn set_row_checked(&mut self, row: usize, checked: bool) -> E2eResult<()> {
        self.ensure_current()?;
        self.check_row_index(row)?;
        self.driver
            .region_command(&self.data.name, &RegionCommand::SetChecked { row, checked })
            .await?;
        self.data.checked[row] = checked;
        Ok(())
    }

    pub async fn check_all(&mut self) -> E2eResult<()> {
        self.set_all_checked(true).await
    }

    pub async fn uncheck_all(&mut self) -> E2eResult<()> {
        self.set_all_checked(false).await
    }

    async fn set_all_checked(&mut self, checked: bool) -> E2eResult<()> {
        self.ensure_current()?;
        self.driver
            .region_command(&self.data.name, &RegionCommand::SetAllChecked { checked })
            .await?;
        self.data.checked.iter_mut().for_each(|c| *c = checked);
        Ok(())
    }

    pub async fn apply_filter(self, column: &str, op: FilterOp, value: Option<&str>) -> E2eResult<Self> {
        let column = self.resolve_column(column)?;
        self.restructure(RegionCommand::SetFilter {
            column,
            op,
            value: value.map(str::to_string),
        })
        .await
    }

    pub async fn clear_filter(self, column: &str) -> E2eResult<Self> {
        let column = self.resolve_column(column)?;
        self.restructure(RegionCommand::ClearFilter { column }).await
    }

    pub async fn clear_all_filters(self) -> E2eResult<Self> {
        self.restructure(RegionCommand::ClearAllFilters).await
    }

    pub async fn sort(self, column: &str, dir: SortDir) -> E2eResult<Self> {
        let column = self.resolve_column(column)?;
        self.restructure(RegionCommand::Sort {
            column,
            descending: dir == SortDir::Descending,
        })
        .await
    }

    pub async fn set_page_size(self, size: usize) -> E2eResult<Self> {
        self.restructure(RegionCommand::SetPageSize { size }).await
    }

    pub async fn show_all(self) -> E2eResult<Self> {
        self.restructure(RegionCommand::ShowAll).await
    }

    pub async fn next_page(self) -> E2eResult<Self> {
        self.restructure(RegionCommand::NextPage).await
    }

    pub async fn previous_page(self) -> E2eResult<Self> {
        self.restructure(RegionCommand::PreviousPage).await
    }

    /// Canonical column name, so commands use the rendered spelling
    fn resolve_column(&self, column: &str) -> E2eResult<String> {
        self.ensure_current()?;
        Ok(self.data.columns[self.column_index(column)?].clone())
    }

    async fn restructure(self, command: RegionCommand) -> E2eResult<Self> {
        self.ensure_current()?;
        let name = self.data.name.clone();
        debug!("Region '{}': {:?}", name, command);
        self.driver.region_command(&name, &command).await?;
        self.driver.epochs().bump(&name);
        Self::fetch(&self.driver, &name).await
    }
}
