//! In-process simulated server
//!
//! [`SimDriver`] renders pages, data regions, wizards and dialogs into a
//! [`Document`] and answers locator queries against it, the same way a
//! browser backend would. It also serves the control plane (containers,
//! users, query tables, pipeline jobs) from the same state, so a scenario
//! can insert rows through the API and then see them in a grid.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

use crate::api::{cell_text, join_path, ControlPlane, FolderType, JobInfo, JobStatus, Row};
use crate::dom::{Document, Node};
use crate::driver::{Action, Driver, ElementInfo, RegionCommand, RegionData, RegionEpochs};
use crate::error::{E2eError, E2eResult};
use crate::filter::{compare_cells, Filter};
use crate::locator::Locator;
use crate::wizard::{FieldKind, FieldValue, WizardDefinition};

const SIM_ATTR: &str = "data-sim";
const DEFAULT_PAGE_SIZE: usize = 100;

/// What a page button does when clicked
#[derive(Debug, Clone, PartialEq)]
pub enum SimEffect {
    Navigate(String),
    /// Open a registered wizard, optionally at a later page
    OpenWizard { wizard: String, page: Option<String> },
    /// Re-copy a region's rows from its source table
    RefreshRegion(String),
    Dialog { title: String, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct SimPage {
    title: String,
    paragraphs: Vec<String>,
    links: Vec<(String, String)>,
    buttons: Vec<(String, SimEffect)>,
    regions: Vec<String>,
}

impl SimPage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.paragraphs.push(text.into());
        self
    }

    pub fn link(mut self, text: impl Into<String>, path: impl Into<String>) -> Self {
        self.links.push((text.into(), path.into()));
        self
    }

    pub fn button(mut self, label: impl Into<String>, effect: SimEffect) -> Self {
        self.buttons.push((label.into(), effect));
        self
    }

    pub fn region(mut self, name: impl Into<String>) -> Self {
        self.regions.push(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Mean,
    Count,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableRef {
    container: String,
    schema: String,
    query: String,
}

#[derive(Debug, Clone)]
pub struct SimRegion {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    filters: Vec<Filter>,
    sort: Option<(String, bool)>,
    page_size: Option<usize>,
    initial_page_size: Option<usize>,
    offset: usize,
    checked: BTreeSet<usize>,
    aggregates: BTreeMap<String, Aggregate>,
    source: Option<TableRef>,
}

impl SimRegion {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
            filters: Vec::new(),
            sort: None,
            page_size: Some(DEFAULT_PAGE_SIZE),
            initial_page_size: Some(DEFAULT_PAGE_SIZE),
            offset: 0,
            checked: BTreeSet::new(),
            aggregates: BTreeMap::new(),
            source: None,
        }
    }

    pub fn row(mut self, values: &[&str]) -> Self {
        self.rows.push(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self.initial_page_size = Some(size);
        self
    }

    pub fn aggregate(mut self, column: impl Into<String>, aggregate: Aggregate) -> Self {
        self.aggregates.insert(column.into(), aggregate);
        self
    }

    /// Materialize rows from a query table; refreshed by [`SimEffect::RefreshRegion`]
    pub fn source(mut self, container: &str, schema: &str, query: &str) -> Self {
        self.source = Some(TableRef {
            container: normalize(container),
            schema: schema.to_string(),
            query: query.to_string(),
        });
        self
    }

    /// Drop filters, sort, paging and selection, as a page reload does
    fn reset_view(&mut self) {
        self.filters.clear();
        self.sort = None;
        self.page_size = self.initial_page_size;
        self.offset = 0;
        self.checked.clear();
    }

    fn column_index(&self, column: &str) -> E2eResult<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| E2eError::UnknownColumn {
                region: self.name.clone(),
                column: column.to_string(),
            })
    }

    /// Rows passing every filter, in display order
    fn filtered(&self) -> Vec<&Vec<String>> {
        let mut rows: Vec<&Vec<String>> = self
            .rows
            .iter()
            .filter(|row| {
                self.filters.iter().all(|f| match self.column_index(&f.column) {
                    Ok(i) => f.op.evaluate(row.get(i).map(String::as_str).unwrap_or(""), f.value.as_deref()),
                    Err(_) => false,
                })
            })
            .collect();
        if let Some((column, descending)) = &self.sort {
            if let Ok(i) = self.column_index(column) {
                rows.sort_by(|a, b| {
                    let cell = |r: &Vec<String>| r.get(i).cloned().unwrap_or_default();
                    let ord = compare_cells(&cell(*a), &cell(*b));
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
        }
        rows
    }

    fn visible(&self) -> (Vec<Vec<String>>, Option<String>) {
        let filtered = self.filtered();
        let total = filtered.len();
        let (start, end) = match self.page_size {
            Some(size) => {
                let start = self.offset.min(total);
                (start, (start + size).min(total))
            }
            None => (0, total),
        };
        let caption = (total > 0).then(|| format!("{} - {} of {}", start + 1, end, total));
        let rows = filtered[start..end].iter().map(|r| (*r).clone()).collect();
        (rows, caption)
    }

    fn summary(&self) -> Option<BTreeMap<String, String>> {
        if self.aggregates.is_empty() {
            return None;
        }
        let filtered = self.filtered();
        let mut out = BTreeMap::new();
        for (column, aggregate) in &self.aggregates {
            let Ok(i) = self.column_index(column) else {
                continue;
            };
            let numbers: Vec<f64> = filtered
                .iter()
                .filter_map(|r| r.get(i).and_then(|v| v.trim().parse::<f64>().ok()))
                .collect();
            let text = match aggregate {
                Aggregate::Sum => format!("Sum: {}", format_number(numbers.iter().sum())),
                Aggregate::Mean if numbers.is_empty() => "Mean: 0".to_string(),
                Aggregate::Mean => format!(
                    "Mean: {}",
                    format_number(numbers.iter().sum::<f64>() / numbers.len() as f64)
                ),
                Aggregate::Count => format!("Count: {}", filtered.len()),
            };
            out.insert(self.columns[i].clone(), text);
        }
        Some(out)
    }

    fn data(&self) -> RegionData {
        let (rows, pagination) = self.visible();
        let checked = (0..rows.len()).map(|i| self.checked.contains(&i)).collect();
        RegionData {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows,
            summary: self.summary(),
            checked,
            pagination,
        }
    }

    fn apply(&mut self, command: &RegionCommand) -> E2eResult<()> {
        match command {
            RegionCommand::SetFilter { column, op, value } => {
                self.column_index(column)?;
                self.filters.retain(|f| !f.column.eq_ignore_ascii_case(column));
                self.filters.push(Filter {
                    column: column.clone(),
                    op: *op,
                    value: value.clone(),
                });
                self.offset = 0;
            }
            RegionCommand::ClearFilter { column } => {
                self.filters.retain(|f| !f.column.eq_ignore_ascii_case(column));
                self.offset = 0;
            }
            RegionCommand::ClearAllFilters => {
                self.filters.clear();
                self.offset = 0;
            }
            RegionCommand::Sort { column, descending } => {
                self.column_index(column)?;
                self.sort = Some((column.clone(), *descending));
            }
            RegionCommand::SetPageSize { size } => {
                self.page_size = Some((*size).max(1));
                self.offset = 0;
            }
            RegionCommand::ShowAll => {
                self.page_size = None;
                self.offset = 0;
            }
            RegionCommand::NextPage => {
                if let Some(size) = self.page_size {
                    if self.offset + size < self.filtered().len() {
                        self.offset += size;
                    }
                }
            }
            RegionCommand::PreviousPage => {
                if let Some(size) = self.page_size {
                    self.offset = self.offset.saturating_sub(size);
                }
            }
            RegionCommand::SetChecked { row, checked } => {
                if *checked {
                    self.checked.insert(*row);
                } else {
                    self.checked.remove(row);
                }
            }
            RegionCommand::SetAllChecked { checked } => {
                let shown = self.visible().0.len();
                self.checked.clear();
                if *checked {
                    self.checked.extend(0..shown);
                }
            }
        }
        if command.is_structural() {
            self.checked.clear();
        }
        Ok(())
    }

    fn render(&self) -> Vec<Node> {
        let data = self.data();
        let mut table = Node::new("table")
            .class("labkey-data-region")
            .attr("lk-region-name", &self.name)
            .child(
                Node::new("tr")
                    .class("labkey-col-header")
                    .child(Node::new("th"))
                    .children(self.columns.iter().map(|c| Node::new("th").text(c))),
            );

        if data.rows.is_empty() {
            table = table.child(Node::new("tr").child(Node::new("td").child(Node::new("em").text("No data to show."))));
        }
        for (i, row) in data.rows.iter().enumerate() {
            let mut select = Node::new("input")
                .attr("type", "checkbox")
                .attr("name", ".select")
                .attr("value", i.to_string())
                .attr(SIM_ATTR, format!("rowcheck:{}:{}", self.name, i));
            if data.checked[i] {
                select = select.attr("checked", "checked");
            }
            let class = if i % 2 == 0 { "labkey-row" } else { "labkey-alternate-row" };
            table = table.child(
                Node::new("tr")
                    .class(class)
                    .child(Node::new("td").child(select))
                    .children(row.iter().map(|v| Node::new("td").text(v))),
            );
        }
        if let Some(summary) = &data.summary {
            table = table.child(
                Node::new("tr")
                    .class("labkey-col-total")
                    .child(Node::new("td"))
                    .children(self.columns.iter().map(|c| {
                        Node::new("td").text(summary.get(c).cloned().unwrap_or_default())
                    })),
            );
        }

        let mut nodes = Vec::new();
        if let Some(caption) = data.pagination {
            nodes.push(Node::new("div").class("labkey-pagination").text(caption));
        }
        nodes.push(table);
        nodes
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        let s = format!("{value:.4}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[derive(Debug, Clone)]
enum RuleCheck {
    NonEmptySelection { field: String, unless: Option<(String, String)> },
    NonEmptyText { field: String },
}

#[derive(Debug, Clone)]
struct SimRule {
    page: String,
    check: RuleCheck,
    message: String,
}

impl SimRule {
    fn passes(&self, form: &BTreeMap<String, FieldValue>) -> bool {
        match &self.check {
            RuleCheck::NonEmptySelection { field, unless } => {
                if let Some((choice_field, exempt)) = unless {
                    if form.get(choice_field) == Some(&FieldValue::Choice(exempt.clone())) {
                        return true;
                    }
                }
                matches!(form.get(field), Some(FieldValue::GridSelection(rows)) if !rows.is_empty())
            }
            RuleCheck::NonEmptyText { field } => {
                matches!(form.get(field), Some(FieldValue::Text(t)) if !t.trim().is_empty())
            }
        }
    }
}

/// Server-side behavior of a wizard
#[derive(Debug, Clone)]
pub struct SimWizard {
    definition: WizardDefinition,
    options: BTreeMap<String, Vec<String>>,
    defaults: BTreeMap<String, FieldValue>,
    rules: Vec<SimRule>,
    forget_on_error: bool,
    forget_on_back: bool,
    on_finish: Option<String>,
}

impl SimWizard {
    pub fn new(definition: WizardDefinition) -> Self {
        Self {
            definition,
            options: BTreeMap::new(),
            defaults: BTreeMap::new(),
            rules: Vec::new(),
            forget_on_error: false,
            forget_on_back: false,
            on_finish: None,
        }
    }

    /// Radio options of a choice field, or rows of a grid selection field
    pub fn options(mut self, field: &str, options: &[&str]) -> Self {
        self.options
            .insert(field.to_string(), options.iter().map(|o| o.to_string()).collect());
        self
    }

    pub fn default_value(mut self, field: &str, value: FieldValue) -> Self {
        self.defaults.insert(field.to_string(), value);
        self
    }

    pub fn require_selection(mut self, page: &str, field: &str, message: &str) -> Self {
        self.rules.push(SimRule {
            page: page.to_string(),
            check: RuleCheck::NonEmptySelection {
                field: field.to_string(),
                unless: None,
            },
            message: message.to_string(),
        });
        self
    }

    /// Selection required unless `choice_field` holds `exempt`
    pub fn require_selection_unless(
        mut self,
        page: &str,
        field: &str,
        choice_field: &str,
        exempt: &str,
        message: &str,
    ) -> Self {
        self.rules.push(SimRule {
            page: page.to_string(),
            check: RuleCheck::NonEmptySelection {
                field: field.to_string(),
                unless: Some((choice_field.to_string(), exempt.to_string())),
            },
            message: message.to_string(),
        });
        self
    }

    pub fn require_text(mut self, page: &str, field: &str, message: &str) -> Self {
        self.rules.push(SimRule {
            page: page.to_string(),
            check: RuleCheck::NonEmptyText {
                field: field.to_string(),
            },
            message: message.to_string(),
        });
        self
    }

    /// Clear a page's inputs whenever it fails validation
    pub fn forget_values_on_error(mut self) -> Self {
        self.forget_on_error = true;
        self
    }

    /// Clear the previous page's inputs when Back returns to it
    pub fn forget_values_on_back(mut self) -> Self {
        self.forget_on_back = true;
        self
    }

    pub fn on_finish(mut self, path: impl Into<String>) -> Self {
        self.on_finish = Some(path.into());
        self
    }

    fn failures(&self, page: &str, form: &BTreeMap<String, FieldValue>) -> Vec<String> {
        self.rules
            .iter()
            .filter(|r| r.page == page && !r.passes(form))
            .map(|r| r.message.clone())
            .collect()
    }
}

struct ActiveWizard {
    name: String,
    index: usize,
    form: BTreeMap<String, FieldValue>,
}

struct SimDialog {
    title: String,
    message: String,
}

#[derive(Debug, Clone)]
pub struct SimJob {
    pub info: JobInfo,
    /// Polls that report the job as running before it settles
    pub polls_remaining: usize,
    pub outcome: JobStatus,
}

impl SimJob {
    pub fn new(id: &str, description: &str, polls: usize, outcome: JobStatus) -> Self {
        Self {
            info: JobInfo {
                id: id.to_string(),
                description: description.to_string(),
                status: JobStatus::Waiting,
            },
            polls_remaining: polls,
            outcome,
        }
    }
}

/// A wizard that reached Finish, with the values it was submitted with
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedWizard {
    pub name: String,
    pub values: BTreeMap<String, FieldValue>,
}

#[derive(Default)]
struct SimState {
    path: String,
    pages: BTreeMap<String, SimPage>,
    regions: BTreeMap<String, SimRegion>,
    wizards: BTreeMap<String, SimWizard>,
    active: Option<ActiveWizard>,
    dialog: Option<SimDialog>,
    completed: Vec<CompletedWizard>,
    containers: BTreeSet<String>,
    undeletable: BTreeSet<String>,
    users: BTreeSet<String>,
    tables: BTreeMap<(String, String, String), Vec<Row>>,
    jobs: BTreeMap<String, Vec<SimJob>>,
}

pub struct SimDriver {
    state: Mutex<SimState>,
    epochs: RegionEpochs,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            epochs: RegionEpochs::new(),
        }
    }

    pub fn add_page(&self, path: &str, page: SimPage) {
        self.state.lock().pages.insert(normalize(path), page);
    }

    pub fn add_region(&self, region: SimRegion) {
        let mut state = self.state.lock();
        let mut region = region;
        if let Some(source) = &region.source {
            region.rows = state.source_rows(source, &region.columns);
        }
        state.regions.insert(region.name.clone(), region);
    }

    pub fn add_wizard(&self, wizard: SimWizard) {
        self.state
            .lock()
            .wizards
            .insert(wizard.definition.name.clone(), wizard);
    }

    pub fn add_container(&self, path: &str) {
        self.state.lock().containers.insert(normalize(path));
    }

    pub fn add_user(&self, email: &str) {
        self.state.lock().users.insert(email.to_string());
    }

    pub fn add_job(&self, container: &str, job: SimJob) {
        self.state
            .lock()
            .jobs
            .entry(normalize(container))
            .or_default()
            .push(job);
    }

    /// Make deleting this container fail, as a locked folder would
    pub fn fail_deletion_of(&self, path: &str) {
        self.state.lock().undeletable.insert(normalize(path));
    }

    pub fn current_path(&self) -> String {
        self.state.lock().path.clone()
    }

    pub fn containers(&self) -> Vec<String> {
        self.state.lock().containers.iter().cloned().collect()
    }

    pub fn users(&self) -> Vec<String> {
        self.state.lock().users.iter().cloned().collect()
    }

    pub fn completed_wizards(&self) -> Vec<CompletedWizard> {
        self.state.lock().completed.clone()
    }

    pub fn wizard_open(&self) -> bool {
        self.state.lock().active.is_some()
    }

    pub fn document(&self) -> Document {
        self.state.lock().render()
    }

    fn resolve_one(&self, state: &SimState, locator: &Locator) -> E2eResult<ElementInfo> {
        let doc = state.render();
        let ids = doc.select(locator);
        match ids.as_slice() {
            [id] => Ok(doc.info(*id)),
            [] => Err(E2eError::NotFound(locator.to_string())),
            many => Err(E2eError::AmbiguousMatch {
                locator: locator.to_string(),
                count: many.len(),
            }),
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl SimState {
    fn source_rows(&self, source: &TableRef, columns: &[String]) -> Vec<Vec<String>> {
        let key = (source.container.clone(), source.schema.clone(), source.query.clone());
        self.tables
            .get(&key)
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        columns
                            .iter()
                            .map(|c| row.get(c).map(cell_text).unwrap_or_default())
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn page_regions(&self) -> Vec<&SimRegion> {
        self.pages
            .get(&self.path)
            .map(|p| p.regions.iter().filter_map(|r| self.regions.get(r)).collect())
            .unwrap_or_default()
    }

    fn render(&self) -> Document {
        let mut body = Node::new("body");

        if let Some(page) = self.pages.get(&self.path) {
            body = body.child(Node::new("div").class("labkey-page-title").text(&page.title));
            for text in &page.paragraphs {
                body = body.child(Node::new("p").text(text));
            }
            for (text, target) in &page.links {
                body = body.child(
                    Node::new("a")
                        .attr("href", format!("/{target}"))
                        .attr(SIM_ATTR, format!("nav:{}", normalize(target)))
                        .text(text),
                );
            }
            for (i, (label, _)) in page.buttons.iter().enumerate() {
                body = body.child(
                    Node::new("a")
                        .class("labkey-button")
                        .attr(SIM_ATTR, format!("effect:{i}"))
                        .text(label),
                );
            }
            for region in self.page_regions() {
                body = body.children(region.render());
            }
        }

        if let Some(active) = &self.active {
            if let Some(wizard) = self.wizards.get(&active.name) {
                body = body.child(render_wizard(wizard, active));
            }
        }

        if let Some(dialog) = &self.dialog {
            let dismiss = self
                .active
                .as_ref()
                .and_then(|a| self.wizards.get(&a.name))
                .map(|w| w.definition.buttons.dismiss.clone())
                .unwrap_or_else(|| "OK".to_string());
            body = body.child(
                Node::new("div")
                    .class("x-window")
                    .child(
                        Node::new("div")
                            .class("x-window-header")
                            .child(Node::new("span").class("x-window-header-text").text(&dialog.title)),
                    )
                    .child(Node::new("div").class("x-window-body").text(&dialog.message))
                    .child(
                        Node::new("a")
                            .class("labkey-button")
                            .attr(SIM_ATTR, "dismiss")
                            .text(dismiss),
                    ),
            );
        }

        Document::new(Node::new("html").child(body))
    }

    fn navigate(&mut self, path: &str, epochs: &RegionEpochs) -> E2eResult<()> {
        let path = normalize(path);
        if !self.pages.contains_key(&path) {
            return Err(E2eError::Driver(format!("no page at /{path}")));
        }
        let names = self.pages.get(&path).map(|p| p.regions.clone()).unwrap_or_default();
        for name in names {
            if let Some(region) = self.regions.get_mut(&name) {
                region.reset_view();
            }
        }
        self.path = path;
        self.active = None;
        self.dialog = None;
        epochs.bump_all();
        Ok(())
    }

    fn open_wizard(&mut self, name: &str, page: Option<&str>) -> E2eResult<()> {
        let wizard = self
            .wizards
            .get(name)
            .ok_or_else(|| E2eError::Driver(format!("no wizard named '{name}'")))?;
        let index = match page {
            Some(title) => wizard
                .definition
                .page_index(title)
                .ok_or_else(|| E2eError::Driver(format!("wizard '{name}' has no page '{title}'")))?,
            None => 0,
        };
        self.active = Some(ActiveWizard {
            name: name.to_string(),
            index,
            form: wizard.defaults.clone(),
        });
        Ok(())
    }

    fn run_effect(&mut self, effect: SimEffect, epochs: &RegionEpochs) -> E2eResult<()> {
        match effect {
            SimEffect::Navigate(path) => self.navigate(&path, epochs),
            SimEffect::OpenWizard { wizard, page } => self.open_wizard(&wizard, page.as_deref()),
            SimEffect::RefreshRegion(name) => {
                let source_and_columns = self
                    .regions
                    .get(&name)
                    .and_then(|r| r.source.clone().map(|s| (s, r.columns.clone())));
                if let Some((source, columns)) = source_and_columns {
                    let rows = self.source_rows(&source, &columns);
                    if let Some(region) = self.regions.get_mut(&name) {
                        region.rows = rows;
                        region.checked.clear();
                    }
                }
                epochs.bump(&name);
                Ok(())
            }
            SimEffect::Dialog { title, message } => {
                self.dialog = Some(SimDialog { title, message });
                Ok(())
            }
        }
    }

    fn wizard_button(&mut self, label: &str, epochs: &RegionEpochs) -> E2eResult<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let Some(wizard) = self.wizards.get(&active.name) else {
            return Ok(());
        };
        let buttons = &wizard.definition.buttons;
        let last = wizard.definition.pages.len().saturating_sub(1);
        let title = wizard.definition.pages[active.index].title.clone();

        if label == buttons.next || label == buttons.finish {
            let failures = wizard.failures(&title, &active.form);
            if !failures.is_empty() {
                if wizard.forget_on_error {
                    for field in &wizard.definition.pages[active.index].fields {
                        active.form.remove(&field.name);
                    }
                }
                self.dialog = Some(SimDialog {
                    title: wizard.definition.error_dialog.clone(),
                    message: failures.join(" "),
                });
                return Ok(());
            }
            if label == buttons.next && active.index < last {
                active.index += 1;
            } else if label == buttons.finish && active.index == last {
                let on_finish = wizard.on_finish.clone();
                self.completed.push(CompletedWizard {
                    name: active.name.clone(),
                    values: active.form.clone(),
                });
                self.active = None;
                if let Some(path) = on_finish {
                    self.navigate(&path, epochs)?;
                }
            }
        } else if label == buttons.back {
            active.index = active.index.saturating_sub(1);
            if wizard.forget_on_back {
                for field in &wizard.definition.pages[active.index].fields {
                    active.form.remove(&field.name);
                }
            }
        } else if label == buttons.cancel {
            self.active = None;
        }
        Ok(())
    }

    fn form_mut(&mut self) -> E2eResult<&mut BTreeMap<String, FieldValue>> {
        self.active
            .as_mut()
            .map(|a| &mut a.form)
            .ok_or_else(|| E2eError::Driver("no wizard is open".to_string()))
    }

    fn perform(&mut self, target: &ElementInfo, action: &Action, epochs: &RegionEpochs) -> E2eResult<()> {
        let Some(key) = target.attr(SIM_ATTR).map(str::to_string) else {
            // Plain text and headers ignore interaction
            return Ok(());
        };
        let mut parts = key.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        let first = parts.next().unwrap_or_default().to_string();
        let rest = parts.next().unwrap_or_default().to_string();

        match (kind, action) {
            ("nav", Action::Click) => self.navigate(&first, epochs),
            ("effect", Action::Click) => {
                let effect = first
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| self.pages.get(&self.path).and_then(|p| p.buttons.get(i)))
                    .map(|(_, e)| e.clone())
                    .ok_or_else(|| E2eError::Driver(format!("unknown button {key}")))?;
                self.run_effect(effect, epochs)
            }
            ("dismiss", Action::Click) => {
                self.dialog = None;
                Ok(())
            }
            ("wizard", Action::Click) => self.wizard_button(&target.text, epochs),
            ("text", Action::Fill { value }) => {
                self.form_mut()?.insert(first, FieldValue::Text(value.clone()));
                Ok(())
            }
            ("file", Action::Upload { path }) => {
                self.form_mut()?.insert(first, FieldValue::File(file_name(path).into()));
                Ok(())
            }
            ("select", Action::Select { value }) => {
                self.form_mut()?.insert(first, FieldValue::Choice(value.clone()));
                Ok(())
            }
            ("check", Action::SetChecked { checked }) => {
                self.form_mut()?.insert(first, FieldValue::Checkbox(*checked));
                Ok(())
            }
            ("check", Action::Click) => {
                let form = self.form_mut()?;
                let now = matches!(form.get(&first), Some(FieldValue::Checkbox(true)));
                form.insert(first, FieldValue::Checkbox(!now));
                Ok(())
            }
            ("radio", Action::Click | Action::SetChecked { checked: true }) => {
                self.form_mut()?.insert(first, FieldValue::Choice(rest));
                Ok(())
            }
            ("grid", Action::Click | Action::SetChecked { .. }) => {
                let form = self.form_mut()?;
                let mut rows = match form.get(&first) {
                    Some(FieldValue::GridSelection(rows)) => rows.clone(),
                    _ => Vec::new(),
                };
                let selected = rows.contains(&rest);
                let wanted = match action {
                    Action::SetChecked { checked } => *checked,
                    _ => !selected,
                };
                if wanted && !selected {
                    rows.push(rest);
                } else if !wanted {
                    rows.retain(|r| *r != rest);
                }
                form.insert(first, FieldValue::GridSelection(rows));
                Ok(())
            }
            ("rowcheck", Action::Click | Action::SetChecked { .. }) => {
                let row = rest
                    .parse::<usize>()
                    .map_err(|_| E2eError::Driver(format!("bad row key {key}")))?;
                let region = self
                    .regions
                    .get_mut(&first)
                    .ok_or_else(|| E2eError::RegionNotFound(first.clone()))?;
                let checked = match action {
                    Action::SetChecked { checked } => *checked,
                    _ => !region.checked.contains(&row),
                };
                region.apply(&RegionCommand::SetChecked { row, checked })
            }
            (kind, action) => Err(E2eError::Driver(format!(
                "cannot {} a {} element",
                action.name(),
                kind
            ))),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn render_wizard(wizard: &SimWizard, active: &ActiveWizard) -> Node {
    let def = &wizard.definition;
    let Some(page) = def.pages.get(active.index) else {
        return Node::new("div");
    };
    let mut panel = Node::new("div")
        .class("labkey-wizard")
        .child(Node::new("div").class("labkey-nav-page-header").text(&page.title));

    for field in &page.fields {
        let name = field.name.as_str();
        let value = active.form.get(name);
        let mut row = Node::new("div")
            .class("labkey-wizard-field")
            .child(Node::new("label").text(name));
        let options = wizard.options.get(name).cloned().unwrap_or_default();

        match field.kind {
            FieldKind::Text | FieldKind::File => {
                let (input_type, key, current) = match (field.kind, value) {
                    (FieldKind::Text, Some(FieldValue::Text(t))) => ("text", "text", t.clone()),
                    (FieldKind::Text, _) => ("text", "text", String::new()),
                    (_, Some(FieldValue::File(p))) => ("file", "file", p.to_string_lossy().to_string()),
                    _ => ("file", "file", String::new()),
                };
                row = row.child(
                    Node::new("input")
                        .attr("type", input_type)
                        .attr("name", name)
                        .attr("value", current)
                        .attr(SIM_ATTR, format!("{key}:{name}")),
                );
            }
            FieldKind::Checkbox => {
                let mut input = Node::new("input")
                    .attr("type", "checkbox")
                    .attr("name", name)
                    .attr(SIM_ATTR, format!("check:{name}"));
                if matches!(value, Some(FieldValue::Checkbox(true))) {
                    input = input.attr("checked", "checked");
                }
                row = row.child(input);
            }
            FieldKind::Choice if options.is_empty() => {
                let current = match value {
                    Some(FieldValue::Choice(c)) => c.clone(),
                    _ => String::new(),
                };
                row = row.child(
                    Node::new("select")
                        .attr("name", name)
                        .attr("value", current)
                        .attr(SIM_ATTR, format!("select:{name}")),
                );
            }
            FieldKind::Choice => {
                for option in &options {
                    let mut input = Node::new("input")
                        .attr("type", "radio")
                        .attr("name", name)
                        .attr("value", option)
                        .attr(SIM_ATTR, format!("radio:{name}:{option}"));
                    if value == Some(&FieldValue::Choice(option.clone())) {
                        input = input.attr("checked", "checked");
                    }
                    row = row.child(input).child(Node::new("span").text(option));
                }
            }
            FieldKind::GridSelection => {
                let selected = match value {
                    Some(FieldValue::GridSelection(rows)) => rows.clone(),
                    _ => Vec::new(),
                };
                let mut grid = Node::new("table").class("labkey-wizard-grid");
                for option in &options {
                    let mut input = Node::new("input")
                        .attr("type", "checkbox")
                        .attr("name", name)
                        .attr("value", option)
                        .attr(SIM_ATTR, format!("grid:{name}:{option}"));
                    if selected.contains(option) {
                        input = input.attr("checked", "checked");
                    }
                    grid = grid.child(
                        Node::new("tr")
                            .child(Node::new("td").child(input))
                            .child(Node::new("td").text(option)),
                    );
                }
                row = row.child(grid);
            }
        }
        panel = panel.child(row);
    }

    let last = def.pages.len().saturating_sub(1);
    let mut labels = Vec::new();
    if active.index > 0 {
        labels.push(&def.buttons.back);
    }
    if active.index < last {
        labels.push(&def.buttons.next);
    } else {
        labels.push(&def.buttons.finish);
    }
    labels.push(&def.buttons.cancel);
    panel.children(labels.into_iter().map(|label| {
        Node::new("a")
            .class("labkey-button")
            .attr(SIM_ATTR, "wizard")
            .text(label)
    }))
}

#[async_trait]
impl Driver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn epochs(&self) -> &RegionEpochs {
        &self.epochs
    }

    async fn navigate(&self, path: &str) -> E2eResult<()> {
        self.state.lock().navigate(path, &self.epochs)
    }

    async fn query(&self, locator: &Locator) -> E2eResult<Vec<ElementInfo>> {
        let doc = self.state.lock().render();
        Ok(doc.select(locator).into_iter().map(|id| doc.info(id)).collect())
    }

    async fn perform(&self, locator: &Locator, action: &Action) -> E2eResult<()> {
        let mut state = self.state.lock();
        let target = self.resolve_one(&state, locator)?;
        debug!("sim: {} {}", action.name(), locator);
        state.perform(&target, action, &self.epochs)
    }

    async fn page_text(&self) -> E2eResult<String> {
        Ok(self.state.lock().render().page_text())
    }

    async fn read_region(&self, name: &str) -> E2eResult<Option<RegionData>> {
        let state = self.state.lock();
        Ok(state
            .page_regions()
            .into_iter()
            .find(|r| r.name == name)
            .map(SimRegion::data))
    }

    async fn region_command(&self, name: &str, command: &RegionCommand) -> E2eResult<()> {
        let mut state = self.state.lock();
        if !state.page_regions().iter().any(|r| r.name == name) {
            return Err(E2eError::RegionNotFound(name.to_string()));
        }
        let region = state
            .regions
            .get_mut(name)
            .ok_or_else(|| E2eError::RegionNotFound(name.to_string()))?;
        region.apply(command)?;
        if command.is_structural() {
            self.epochs.bump(name);
        }
        Ok(())
    }
}

fn not_found(what: &str) -> E2eError {
    E2eError::Api {
        status: 404,
        message: format!("{what} not found"),
    }
}

#[async_trait]
impl ControlPlane for SimDriver {
    async fn select_rows(
        &self,
        container: &str,
        schema: &str,
        query: &str,
        filters: &[Filter],
    ) -> E2eResult<Vec<Row>> {
        let state = self.state.lock();
        let key = (normalize(container), schema.to_string(), query.to_string());
        let rows = state.tables.get(&key).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|row| {
                filters.iter().all(|f| {
                    let cell = row.get(&f.column).map(cell_text).unwrap_or_default();
                    f.op.evaluate(&cell, f.value.as_deref())
                })
            })
            .collect())
    }

    async fn insert_rows(&self, container: &str, schema: &str, query: &str, rows: Vec<Row>) -> E2eResult<usize> {
        let mut state = self.state.lock();
        let key = (normalize(container), schema.to_string(), query.to_string());
        let count = rows.len();
        state.tables.entry(key).or_default().extend(rows);
        Ok(count)
    }

    async fn delete_rows(&self, container: &str, schema: &str, query: &str, rows: Vec<Row>) -> E2eResult<usize> {
        let mut state = self.state.lock();
        let key = (normalize(container), schema.to_string(), query.to_string());
        let Some(table) = state.tables.get_mut(&key) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|stored| {
            !rows
                .iter()
                .any(|keys| keys.iter().all(|(k, v)| stored.get(k) == Some(v)))
        });
        Ok(before - table.len())
    }

    async fn container_exists(&self, path: &str) -> E2eResult<bool> {
        Ok(self.state.lock().containers.contains(&normalize(path)))
    }

    async fn create_container(&self, parent: Option<&str>, name: &str, folder_type: FolderType) -> E2eResult<String> {
        let mut state = self.state.lock();
        let parent = parent.map(normalize).unwrap_or_default();
        if !parent.is_empty() && !state.containers.contains(&parent) {
            return Err(not_found(&format!("Container /{parent}")));
        }
        let path = join_path(&parent, name);
        if !state.containers.insert(path.clone()) {
            return Err(E2eError::Api {
                status: 400,
                message: format!("A folder named '{name}' already exists"),
            });
        }
        debug!("sim: created {} container /{}", folder_type.as_str(), path);
        Ok(path)
    }

    async fn delete_container(&self, path: &str) -> E2eResult<()> {
        let mut state = self.state.lock();
        let path = normalize(path);
        if state.undeletable.contains(&path) {
            return Err(E2eError::Api {
                status: 500,
                message: format!("Container /{path} is locked"),
            });
        }
        if !state.containers.contains(&path) {
            return Err(not_found(&format!("Container /{path}")));
        }
        let prefix = format!("{path}/");
        state
            .containers
            .retain(|c| *c != path && !c.starts_with(&prefix));
        state
            .tables
            .retain(|(c, _, _), _| *c != path && !c.starts_with(&prefix));
        Ok(())
    }

    async fn delete_user(&self, email: &str) -> E2eResult<bool> {
        Ok(self.state.lock().users.remove(email))
    }

    async fn list_jobs(&self, container: &str) -> E2eResult<Vec<JobInfo>> {
        let mut state = self.state.lock();
        let Some(jobs) = state.jobs.get_mut(&normalize(container)) else {
            return Ok(Vec::new());
        };
        Ok(jobs
            .iter_mut()
            .map(|job| {
                if job.polls_remaining > 0 {
                    job.polls_remaining -= 1;
                    job.info.status = JobStatus::Running;
                } else {
                    job.info.status = job.outcome;
                }
                job.info.clone()
            })
            .collect())
    }
}

/// Rows in the shape the control plane accepts, from (column, value) pairs
pub fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;

    fn specimens() -> SimRegion {
        SimRegion::new("SpecimenDetail", &["SpecimenID", "Visit", "Volume"])
            .row(&["AAA07XK5-05", "1", "10"])
            .row(&["AssayTestControl1", "2", "20"])
            .row(&["AssayTestControl2", "3", "14"])
            .aggregate("Volume", Aggregate::Sum)
    }

    #[test]
    fn region_filter_sort_and_paging() {
        let mut region = specimens();
        region
            .apply(&RegionCommand::SetFilter {
                column: "SpecimenID".into(),
                op: FilterOp::StartsWith,
                value: Some("AssayTestControl".into()),
            })
            .unwrap();
        let data = region.data();
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.summary.unwrap()["Volume"], "Sum: 34");
        assert_eq!(data.pagination.as_deref(), Some("1 - 2 of 2"));

        region
            .apply(&RegionCommand::Sort {
                column: "Volume".into(),
                descending: true,
            })
            .unwrap();
        region.apply(&RegionCommand::SetPageSize { size: 1 }).unwrap();
        region.apply(&RegionCommand::NextPage).unwrap();
        let data = region.data();
        assert_eq!(data.rows, vec![vec!["AssayTestControl2", "3", "14"]]);
        assert_eq!(data.pagination.as_deref(), Some("2 - 2 of 2"));
    }

    #[tokio::test]
    async fn reloading_a_page_resets_region_view_state() {
        let driver = SimDriver::new();
        driver.add_page("Study/specimens", SimPage::new("Specimens").region("SpecimenDetail"));
        driver.add_page("Study/begin", SimPage::new("Overview"));
        driver.add_region(specimens().page_size(2));
        driver.navigate("Study/specimens").await.unwrap();

        for command in [
            RegionCommand::SetFilter {
                column: "SpecimenID".into(),
                op: FilterOp::StartsWith,
                value: Some("AssayTestControl".into()),
            },
            RegionCommand::Sort {
                column: "Volume".into(),
                descending: true,
            },
            RegionCommand::ShowAll,
        ] {
            driver.region_command("SpecimenDetail", &command).await.unwrap();
        }
        let filtered = driver.read_region("SpecimenDetail").await.unwrap().unwrap();
        assert_eq!(filtered.rows.len(), 2);

        driver.navigate("Study/begin").await.unwrap();
        driver.navigate("Study/specimens").await.unwrap();
        let data = driver.read_region("SpecimenDetail").await.unwrap().unwrap();
        assert_eq!(data.rows[0][0], "AAA07XK5-05");
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.pagination.as_deref(), Some("1 - 2 of 3"));
    }

    #[test]
    fn structural_commands_clear_selection() {
        let mut region = specimens();
        region.apply(&RegionCommand::SetAllChecked { checked: true }).unwrap();
        assert_eq!(region.data().checked, vec![true, true, true]);
        region.apply(&RegionCommand::ShowAll).unwrap();
        assert_eq!(region.data().checked, vec![false, false, false]);
    }

    #[test]
    fn unknown_filter_column_is_rejected() {
        let err = specimens()
            .apply(&RegionCommand::SetFilter {
                column: "Clinic".into(),
                op: FilterOp::Equals,
                value: Some("A".into()),
            })
            .unwrap_err();
        assert!(matches!(err, E2eError::UnknownColumn { .. }));
    }

    #[test]
    fn empty_region_renders_placeholder() {
        let driver = SimDriver::new();
        driver.add_page("Study/begin", SimPage::new("Specimens").region("Empty"));
        driver.add_region(SimRegion::new("Empty", &["SpecimenID"]));
        driver.state.lock().path = "Study/begin".into();
        assert!(driver.document().page_text().contains("No data to show."));
    }

    #[test]
    fn numbers_format_without_trailing_zeros() {
        assert_eq!(format_number(44.0), "44");
        assert_eq!(format_number(12.5), "12.5");
        assert_eq!(format_number(1.0 / 3.0), "0.3333");
    }

    #[tokio::test]
    async fn jobs_settle_after_scripted_polls() {
        let driver = SimDriver::new();
        driver.add_job("Proj", SimJob::new("7", "Study import", 1, JobStatus::Complete));
        assert_eq!(driver.list_jobs("Proj").await.unwrap()[0].status, JobStatus::Running);
        assert_eq!(driver.list_jobs("Proj").await.unwrap()[0].status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn deleting_a_container_removes_children() {
        let driver = SimDriver::new();
        driver.create_container(None, "Proj", FolderType::Study).await.unwrap();
        driver
            .create_container(Some("Proj"), "Sub", FolderType::Study)
            .await
            .unwrap();
        driver.delete_container("Proj").await.unwrap();
        assert!(driver.containers().is_empty());
    }
}
