//! Transport to the application under test
//!
//! A [`Driver`] answers locator queries against the live document, performs
//! element actions, and exposes data regions as structured rows. The harness
//! layers (pages, grids, wizards, scenarios) only ever talk to this trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::E2eResult;
use crate::filter::FilterOp;
use crate::locator::Locator;

/// Point-in-time view of one element
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub tag: String,
    pub text: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub checked: bool,
}

impl ElementInfo {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Interaction with a single resolved element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click,
    Fill { value: String },
    SetChecked { checked: bool },
    Select { value: String },
    Upload { path: PathBuf },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click => "click",
            Action::Fill { .. } => "fill",
            Action::SetChecked { .. } => "set_checked",
            Action::Select { .. } => "select",
            Action::Upload { .. } => "upload",
        }
    }
}

/// Raw contents of a rendered data region
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionData {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Footer aggregate text per column (e.g. "Sum: 44"), when configured
    #[serde(default)]
    pub summary: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub checked: Vec<bool>,
    /// Pagination caption such as "1 - 37 of 37"
    #[serde(default)]
    pub pagination: Option<String>,
}

/// Commands understood by a data region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegionCommand {
    SetFilter {
        column: String,
        op: FilterOp,
        value: Option<String>,
    },
    ClearFilter { column: String },
    ClearAllFilters,
    Sort { column: String, descending: bool },
    SetPageSize { size: usize },
    ShowAll,
    NextPage,
    PreviousPage,
    SetChecked { row: usize, checked: bool },
    SetAllChecked { checked: bool },
}

impl RegionCommand {
    /// Structural commands re-render rows; selection commands do not
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            RegionCommand::SetChecked { .. } | RegionCommand::SetAllChecked { .. }
        )
    }
}

/// Per-region render generations shared between a driver and its snapshots
#[derive(Debug, Default)]
pub struct RegionEpochs {
    epochs: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl RegionEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, region: &str) -> Arc<AtomicU64> {
        self.epochs
            .lock()
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn bump(&self, region: &str) -> u64 {
        self.handle(region).fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Navigation re-renders every region on the page
    pub fn bump_all(&self) {
        for epoch in self.epochs.lock().values() {
            epoch.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Render generations of the regions this driver has served
    fn epochs(&self) -> &RegionEpochs;

    /// Load a path relative to the server base URL
    async fn navigate(&self, path: &str) -> E2eResult<()>;

    /// All current matches in document order; never cached
    async fn query(&self, locator: &Locator) -> E2eResult<Vec<ElementInfo>>;

    /// Perform an action on the single element the locator resolves to
    async fn perform(&self, locator: &Locator, action: &Action) -> E2eResult<()>;

    /// Rendered text of the whole page
    async fn page_text(&self) -> E2eResult<String>;

    /// Contents of a named data region, `None` if it is not rendered
    async fn read_region(&self, name: &str) -> E2eResult<Option<RegionData>>;

    async fn region_command(&self, name: &str, command: &RegionCommand) -> E2eResult<()>;

    async fn shutdown(&self) -> E2eResult<()> {
        Ok(())
    }
}
