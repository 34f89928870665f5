//! Multi-page wizard flows
//!
//! A [`Wizard`] walks a [`WizardDefinition`] page by page. Each page is
//! recognised by its header title. Validation failures come back as
//! [`PageResult::ValidationFailed`] rather than an error, after the error
//! dialog is dismissed and the page's entered values are re-read from the
//! UI. Harness faults (a page that never renders, a value the UI dropped)
//! are errors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::locator::Locator;
use crate::page::Page;
use crate::wait::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    File,
    Checkbox,
    Choice,
    GridSelection,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldKind::Text => "text",
            FieldKind::File => "file",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Choice => "choice",
            FieldKind::GridSelection => "grid selection",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    File(PathBuf),
    Checkbox(bool),
    Choice(String),
    /// Labels of the selected grid rows
    GridSelection(Vec<String>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::File(_) => FieldKind::File,
            FieldValue::Checkbox(_) => FieldKind::Checkbox,
            FieldValue::Choice(_) => FieldKind::Choice,
            FieldValue::GridSelection(_) => FieldKind::GridSelection,
        }
    }

    /// Whether a value read back from the UI is the one that was entered.
    /// Browsers only report the file name of an upload, and grid selection
    /// order is not significant.
    fn same_as(&self, found: &FieldValue) -> bool {
        match (self, found) {
            (FieldValue::File(a), FieldValue::File(b)) => file_name(a) == file_name(b),
            (FieldValue::GridSelection(a), FieldValue::GridSelection(b)) => {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort();
                b.sort();
                a == b
            }
            _ => self == found,
        }
    }
}

fn file_name(path: &Path) -> String {
    let raw = path.to_string_lossy();
    raw.rsplit(['/', '\\']).next().unwrap_or_default().to_string()
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => write!(f, "{s:?}"),
            FieldValue::File(p) => write!(f, "{}", p.display()),
            FieldValue::Checkbox(b) => write!(f, "{b}"),
            FieldValue::GridSelection(rows) => write!(f, "{rows:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpec {
    pub title: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl PageSpec {
    pub fn new(title: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            title: title.into(),
            fields,
        }
    }

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WizardButtons {
    pub next: String,
    pub back: String,
    pub finish: String,
    pub cancel: String,
    /// Button that dismisses the error dialog
    pub dismiss: String,
}

impl Default for WizardButtons {
    fn default() -> Self {
        Self {
            next: "Next".to_string(),
            back: "Back".to_string(),
            finish: "Finish".to_string(),
            cancel: "Cancel".to_string(),
            dismiss: "OK".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WizardDefinition {
    pub name: String,
    pub pages: Vec<PageSpec>,
    #[serde(default)]
    pub buttons: WizardButtons,
    #[serde(default = "default_error_dialog")]
    pub error_dialog: String,
    /// Text field whose value names the resource a completed wizard creates
    #[serde(default)]
    pub result_field: Option<String>,
}

fn default_error_dialog() -> String {
    "Error".to_string()
}

impl WizardDefinition {
    pub fn new(name: impl Into<String>, pages: Vec<PageSpec>) -> Self {
        Self {
            name: name.into(),
            pages,
            buttons: WizardButtons::default(),
            error_dialog: default_error_dialog(),
            result_field: None,
        }
    }

    pub fn page_index(&self, title: &str) -> Option<usize> {
        self.pages.iter().position(|p| p.title == title)
    }

    /// The study publish wizard
    pub fn publish_study() -> Self {
        use FieldKind::*;
        let grid = |name: &str| vec![FieldSpec::new(name, GridSelection)];
        Self {
            result_field: Some("studyName".to_string()),
            ..Self::new(
                "Publish Study",
                vec![
                    PageSpec::new(
                        "General Setup",
                        vec![
                            FieldSpec::new("studyName", Text),
                            FieldSpec::new("studyDescription", Text),
                            FieldSpec::new("protocolDoc", File),
                        ],
                    ),
                    PageSpec::new(
                        "Mice",
                        vec![
                            FieldSpec::new("renderType", Choice),
                            FieldSpec::new("participantGroups", GridSelection),
                        ],
                    ),
                    PageSpec::new("Datasets", grid("datasets")),
                    PageSpec::new("Visits", grid("visits")),
                    PageSpec::new(
                        "Specimens",
                        vec![
                            FieldSpec::new("includeSpecimens", Checkbox),
                            FieldSpec::new("specimenRefresh", Choice),
                        ],
                    ),
                    PageSpec::new("Study Objects", grid("studyObjects")),
                    PageSpec::new("Lists", grid("lists")),
                    PageSpec::new("Views", grid("views")),
                    PageSpec::new("Reports", grid("reports")),
                    PageSpec::new("Folder Objects", grid("folderObjects")),
                    PageSpec::new("Publish Options", grid("publishOptions")),
                ],
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageResult {
    Advanced(String),
    ValidationFailed(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishOutcome {
    Completed(String),
    Rejected(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardState {
    Open,
    Completed,
    Rejected,
    Cancelled,
}

impl WizardState {
    pub fn is_terminal(&self) -> bool {
        *self != WizardState::Open
    }
}

/// Pages traversed, in order, plus where the wizard ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WizardTrail {
    pub wizard: String,
    pub pages: Vec<String>,
    pub state: WizardState,
}

pub struct Wizard {
    page: Page,
    definition: WizardDefinition,
    state: WizardState,
    current: usize,
    values: Vec<BTreeMap<String, FieldValue>>,
    trail: Vec<String>,
}

impl std::fmt::Debug for Wizard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wizard")
            .field("definition", &self.definition)
            .field("state", &self.state)
            .field("current", &self.current)
            .field("values", &self.values)
            .field("trail", &self.trail)
            .finish_non_exhaustive()
    }
}

impl Wizard {
    /// Click `trigger` and wait for the first page
    pub async fn open(page: &Page, definition: WizardDefinition, trigger: &Locator) -> E2eResult<Self> {
        Self::open_at(page, definition, trigger, 0).await
    }

    /// Click `trigger` and pick up at a later page, as when republishing
    /// from previous settings
    pub async fn resume(
        page: &Page,
        definition: WizardDefinition,
        trigger: &Locator,
        at: &str,
    ) -> E2eResult<Self> {
        let index = definition
            .page_index(at)
            .ok_or_else(|| E2eError::NoSuchPage {
                wizard: definition.name.clone(),
                page: at.to_string(),
            })?;
        Self::open_at(page, definition, trigger, index).await
    }

    async fn open_at(page: &Page, definition: WizardDefinition, trigger: &Locator, index: usize) -> E2eResult<Self> {
        let not_opened = |reason: String| E2eError::WizardNotOpened {
            wizard: definition.name.clone(),
            reason,
        };
        let title = match definition.pages.get(index) {
            Some(p) => p.title.clone(),
            None => return Err(not_opened("definition has no pages".to_string())),
        };

        page.click(trigger)
            .await
            .map_err(|e| not_opened(format!("trigger {trigger}: {e}")))?;
        page.wait_for(&Locator::page_header(&title))
            .await
            .map_err(|e| not_opened(e.to_string()))?;

        info!("Opened wizard '{}' at '{}'", definition.name, title);
        let pages = definition.pages.len();
        Ok(Self {
            page: page.clone(),
            definition,
            state: WizardState::Open,
            current: index,
            values: vec![BTreeMap::new(); pages],
            trail: vec![title],
        })
    }

    pub fn definition(&self) -> &WizardDefinition {
        &self.definition
    }

    pub fn state(&self) -> WizardState {
        self.state
    }

    pub fn current_title(&self) -> &str {
        &self.definition.pages[self.current].title
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// The harness's record of what was entered on a page
    pub fn recorded(&self, page_title: &str) -> Option<&BTreeMap<String, FieldValue>> {
        self.definition
            .page_index(page_title)
            .map(|i| &self.values[i])
    }

    pub fn trail(&self) -> WizardTrail {
        WizardTrail {
            wizard: self.definition.name.clone(),
            pages: self.trail.clone(),
            state: self.state,
        }
    }

    fn ensure_open(&self) -> E2eResult<()> {
        if self.state.is_terminal() {
            return Err(E2eError::WizardClosed(self.definition.name.clone()));
        }
        Ok(())
    }

    pub async fn set_field(&mut self, name: &str, value: FieldValue) -> E2eResult<()> {
        self.ensure_open()?;
        let spec = self.definition.pages[self.current]
            .field(name)
            .cloned()
            .ok_or_else(|| E2eError::UnknownField {
                field: name.to_string(),
                page: self.current_title().to_string(),
            })?;
        if spec.kind != value.kind() {
            return Err(E2eError::FieldTypeMismatch {
                field: name.to_string(),
                expected: spec.kind.to_string(),
                actual: value.kind().to_string(),
            });
        }

        debug!("{} / {}: {} = {}", self.definition.name, self.current_title(), name, value);
        write_field(&self.page, name, &value).await?;
        self.values[self.current].insert(name.to_string(), value);
        Ok(())
    }

    /// Current UI value of a field on the current page
    pub async fn read_field(&self, name: &str) -> E2eResult<FieldValue> {
        let spec = self.definition.pages[self.current]
            .field(name)
            .ok_or_else(|| E2eError::UnknownField {
                field: name.to_string(),
                page: self.current_title().to_string(),
            })?;
        read_field(&self.page, spec).await
    }

    /// Re-read every recorded field on the current page from the UI
    pub async fn verify_retained(&self) -> E2eResult<()> {
        self.ensure_open()?;
        let page_spec = &self.definition.pages[self.current];
        for (name, expected) in &self.values[self.current] {
            let Some(spec) = page_spec.field(name) else {
                continue;
            };
            let found = read_field(&self.page, spec).await?;
            if !expected.same_as(&found) {
                return Err(E2eError::StateLost {
                    page: page_spec.title.clone(),
                    field: name.clone(),
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }
        Ok(())
    }

    pub async fn advance(&mut self) -> E2eResult<PageResult> {
        self.ensure_open()?;
        let next = self.current + 1;
        let Some(next_title) = self.definition.pages.get(next).map(|p| p.title.clone()) else {
            return Err(E2eError::NoSuchPage {
                wizard: self.definition.name.clone(),
                page: format!("after '{}'", self.current_title()),
            });
        };

        let condition = Condition::AnyOf(vec![
            Condition::Present(Locator::page_header(&next_title)),
            Condition::Present(self.error_dialog()),
        ]);
        let branch = self
            .page
            .click_and_wait_for(&Locator::button(&self.definition.buttons.next), &condition)
            .await?;

        if branch == 0 {
            self.current = next;
            self.trail.push(next_title.clone());
            debug!("{}: advanced to '{}'", self.definition.name, next_title);
            return Ok(PageResult::Advanced(next_title));
        }

        let messages = self.dismiss_error().await?;
        warn!(
            "{}: '{}' rejected: {}",
            self.definition.name,
            self.current_title(),
            messages.join("; ")
        );
        self.verify_retained().await?;
        Ok(PageResult::ValidationFailed(messages))
    }

    /// Return to the previous page and check its recorded values survived
    pub async fn go_back(&mut self) -> E2eResult<()> {
        self.ensure_open()?;
        if self.current == 0 {
            return Err(E2eError::NoSuchPage {
                wizard: self.definition.name.clone(),
                page: format!("before '{}'", self.current_title()),
            });
        }
        let prev_title = self.definition.pages[self.current - 1].title.clone();
        self.page
            .click_and_wait_for(
                &Locator::button(&self.definition.buttons.back),
                &Condition::Present(Locator::page_header(&prev_title)),
            )
            .await?;
        self.current -= 1;
        self.trail.push(prev_title);
        self.verify_retained().await
    }

    pub async fn finish(&mut self) -> E2eResult<FinishOutcome> {
        self.ensure_open()?;
        let condition = Condition::AnyOf(vec![
            Condition::Absent(Locator::page_header(self.current_title())),
            Condition::Present(self.error_dialog()),
        ]);
        let branch = self
            .page
            .click_and_wait_for(&Locator::button(&self.definition.buttons.finish), &condition)
            .await?;

        if branch == 0 {
            self.state = WizardState::Completed;
            let resource = self
                .definition
                .result_field
                .as_ref()
                .and_then(|field| self.values.iter().find_map(|page| page.get(field)))
                .map(|v| match v {
                    FieldValue::Text(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| self.definition.name.clone());
            info!("{} completed: {}", self.definition.name, resource);
            return Ok(FinishOutcome::Completed(resource));
        }

        let messages = self.dismiss_error().await?;
        self.state = WizardState::Rejected;
        warn!("{} rejected: {}", self.definition.name, messages.join("; "));
        Ok(FinishOutcome::Rejected(messages))
    }

    /// Leave the wizard; a no-op once it is closed
    pub async fn cancel(&mut self) -> E2eResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.page
            .click_and_wait_for(
                &Locator::button(&self.definition.buttons.cancel),
                &Condition::Absent(Locator::page_header(self.current_title())),
            )
            .await?;
        self.state = WizardState::Cancelled;
        info!("{} cancelled at '{}'", self.definition.name, self.current_title());
        Ok(())
    }

    fn error_dialog(&self) -> Locator {
        Locator::dialog(&self.definition.error_dialog)
    }

    /// Collect the dialog's messages, press its dismiss button, and wait for
    /// it to go away
    async fn dismiss_error(&self) -> E2eResult<Vec<String>> {
        let dialog = self.error_dialog();
        let bodies = self
            .page
            .find_all(&Locator::css_class("x-window-body").within(dialog.clone()))
            .await?;
        let messages: Vec<String> = bodies
            .into_iter()
            .map(|b| b.text)
            .filter(|t| !t.is_empty())
            .collect();

        self.page
            .click_and_wait_for(
                &Locator::button(&self.definition.buttons.dismiss).within(dialog.clone()),
                &Condition::Absent(dialog),
            )
            .await?;
        Ok(messages)
    }
}

fn radio_group(name: &str) -> Locator {
    Locator::tag("input").attr("type", "radio").attr("name", name)
}

async fn write_field(page: &Page, name: &str, value: &FieldValue) -> E2eResult<()> {
    match value {
        FieldValue::Text(text) => page.fill(&Locator::by_name(name), text).await,
        FieldValue::File(path) => page.upload(&Locator::by_name(name), path).await,
        FieldValue::Checkbox(checked) => page.set_checked(&Locator::checkbox(name), *checked).await,
        FieldValue::Choice(choice) => {
            if page.is_present(&radio_group(name)).await? {
                page.set_checked(&Locator::radio(name, choice), true).await
            } else {
                page.select(&Locator::tag("select").attr("name", name), choice).await
            }
        }
        FieldValue::GridSelection(rows) => {
            page.wait_for(&Locator::checkbox(name)).await?;
            for row in page.find_all(&Locator::checkbox(name)).await? {
                let Some(label) = row.attr("value") else {
                    continue;
                };
                let wanted = rows.iter().any(|r| r == label);
                if row.checked != wanted {
                    page.set_checked(&Locator::checkbox(name).attr("value", label), wanted)
                        .await?;
                }
            }
            Ok(())
        }
    }
}

async fn read_field(page: &Page, spec: &FieldSpec) -> E2eResult<FieldValue> {
    let name = spec.name.as_str();
    Ok(match spec.kind {
        FieldKind::Text => FieldValue::Text(
            page.find_one(&Locator::by_name(name))
                .await?
                .value
                .unwrap_or_default(),
        ),
        FieldKind::File => FieldValue::File(PathBuf::from(
            page.find_one(&Locator::by_name(name))
                .await?
                .value
                .unwrap_or_default(),
        )),
        FieldKind::Checkbox => FieldValue::Checkbox(page.find_one(&Locator::checkbox(name)).await?.checked),
        FieldKind::Choice => {
            let radios = page.find_all(&radio_group(name)).await?;
            let chosen = if radios.is_empty() {
                page.find_one(&Locator::tag("select").attr("name", name))
                    .await?
                    .value
            } else {
                radios
                    .into_iter()
                    .find(|r| r.checked)
                    .and_then(|r| r.value)
            };
            FieldValue::Choice(chosen.unwrap_or_default())
        }
        FieldKind::GridSelection => FieldValue::GridSelection(
            page.find_all(&Locator::checkbox(name))
                .await?
                .into_iter()
                .filter(|r| r.checked)
                .filter_map(|r| r.value)
                .collect(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn publish_study_pages_are_in_wizard_order() {
        let def = WizardDefinition::publish_study();
        let titles: Vec<_> = def.pages.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles.first(), Some(&"General Setup"));
        assert_eq!(titles.last(), Some(&"Publish Options"));
        assert_eq!(def.page_index("Mice"), Some(1));
        assert_eq!(def.page_index("Visits"), Some(3));
        assert_eq!(def.page_index("Previous Settings"), None);
    }

    #[test_case(FieldValue::File("/tmp/data/Protocol.txt".into()), FieldValue::File("C:\\fakepath\\Protocol.txt".into()), true; "upload compares file names")]
    #[test_case(FieldValue::GridSelection(vec!["Group 1".into(), "Group 2".into()]), FieldValue::GridSelection(vec!["Group 2".into(), "Group 1".into()]), true; "selection order ignored")]
    #[test_case(FieldValue::Text("PublishedStudy".into()), FieldValue::Text("".into()), false; "cleared text")]
    #[test_case(FieldValue::Checkbox(false), FieldValue::Checkbox(false), true; "unchecked box")]
    fn retained_value_comparison(entered: FieldValue, found: FieldValue, same: bool) {
        assert_eq!(entered.same_as(&found), same);
    }

    #[test]
    fn definition_reads_from_yaml_with_defaults() {
        let yaml = r#"
name: Import Study
pages:
  - title: Source
    fields:
      - { name: archive, kind: file }
  - title: Confirm
"#;
        let def: WizardDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.buttons.next, "Next");
        assert_eq!(def.error_dialog, "Error");
        assert_eq!(def.pages[0].fields[0].kind, FieldKind::File);
        assert!(def.pages[1].fields.is_empty());
    }

    #[test]
    fn field_values_are_tagged_by_kind() {
        let json = serde_json::to_value(FieldValue::Checkbox(true)).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "checkbox", "value": true }));
    }
}
