//! Declarative YAML scenario plans

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::FolderType;
use crate::error::{E2eError, E2eResult};
use crate::filter::FilterOp;
use crate::locator::Locator;
use crate::runner::{Scenario, ScenarioContext};

/// A scenario described in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique name for this plan
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering plans
    #[serde(default)]
    pub tags: Vec<String>,

    /// Project created (or reset) before the steps run; `{project}` in
    /// step strings expands to it
    #[serde(default)]
    pub project: Option<String>,

    #[serde(default)]
    pub folder_type: FolderType,

    /// Steps to execute in order
    pub steps: Vec<PlanStep>,
}

/// Element reference in a plan; exactly one of the base fields is set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    pub link: Option<String>,
    pub link_containing: Option<String>,
    pub button: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
    pub text: Option<String>,
    pub header: Option<String>,
    /// Restrict the match to a data region
    pub within_region: Option<String>,
}

impl Target {
    pub fn to_locator(&self) -> E2eResult<Locator> {
        let candidates = [
            self.link.as_ref().map(Locator::link_with_text),
            self.link_containing.as_ref().map(Locator::link_containing_text),
            self.button.as_ref().map(Locator::button),
            self.name.as_ref().map(Locator::by_name),
            self.id.as_ref().map(Locator::by_id),
            self.class.as_ref().map(Locator::css_class),
            self.text.as_ref().map(Locator::text_anywhere),
            self.header.as_ref().map(Locator::page_header),
        ];
        let mut set = candidates.into_iter().flatten();
        let locator = match (set.next(), set.next()) {
            (Some(locator), None) => locator,
            (None, _) => return Err(E2eError::PlanParse("target names no element".to_string())),
            (Some(_), Some(_)) => {
                return Err(E2eError::PlanParse(format!(
                    "target names more than one element: {self:?}"
                )))
            }
        };
        Ok(match &self.within_region {
            Some(region) => locator.within(Locator::region(region)),
            None => locator,
        })
    }
}

/// A single step in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanStep {
    /// Navigate to a path relative to the base URL
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_text: Option<String>,
    },

    Click {
        target: Target,
        #[serde(default)]
        wait_for_text: Option<String>,
    },

    Fill {
        target: Target,
        value: String,
    },

    Check {
        target: Target,
    },

    Uncheck {
        target: Target,
    },

    /// Select an option from a dropdown
    Select {
        target: Target,
        value: String,
    },

    WaitFor {
        target: Target,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    WaitForText {
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    AssertText {
        texts: Vec<String>,
    },

    AssertNoText {
        texts: Vec<String>,
    },

    FilterGrid {
        region: String,
        column: String,
        op: FilterOp,
        #[serde(default)]
        value: Option<String>,
    },

    ClearFilter {
        region: String,
        column: String,
    },

    /// Assert on a fresh snapshot of a data region
    AssertGrid {
        region: String,
        #[serde(default)]
        row_count: Option<usize>,
        #[serde(default)]
        column: Option<String>,
        /// Exact column values in rendered order
        #[serde(default)]
        values: Option<Vec<String>>,
        #[serde(default)]
        contains: Option<String>,
        /// Footer aggregate text for `column`
        #[serde(default)]
        summary: Option<String>,
    },

    WaitForJobs {
        #[serde(default)]
        container: Option<String>,
        kind: String,
        expected: usize,
    },

    /// Log a message (for debugging)
    Log {
        message: String,
    },
}

impl PlanStep {
    fn label(&self) -> &'static str {
        match self {
            PlanStep::Navigate { .. } => "navigate",
            PlanStep::Click { .. } => "click",
            PlanStep::Fill { .. } => "fill",
            PlanStep::Check { .. } => "check",
            PlanStep::Uncheck { .. } => "uncheck",
            PlanStep::Select { .. } => "select",
            PlanStep::WaitFor { .. } => "wait_for",
            PlanStep::WaitForText { .. } => "wait_for_text",
            PlanStep::AssertText { .. } => "assert_text",
            PlanStep::AssertNoText { .. } => "assert_no_text",
            PlanStep::FilterGrid { .. } => "filter_grid",
            PlanStep::ClearFilter { .. } => "clear_filter",
            PlanStep::AssertGrid { .. } => "assert_grid",
            PlanStep::WaitForJobs { .. } => "wait_for_jobs",
            PlanStep::Log { .. } => "log",
        }
    }

    fn validate(&self) -> E2eResult<()> {
        match self {
            PlanStep::Click { target, .. }
            | PlanStep::Fill { target, .. }
            | PlanStep::Check { target }
            | PlanStep::Uncheck { target }
            | PlanStep::Select { target, .. }
            | PlanStep::WaitFor { target, .. } => target.to_locator().map(|_| ()),
            PlanStep::FilterGrid { op, value, .. } => {
                if !op.is_unary() && value.is_none() {
                    return Err(E2eError::PlanParse(format!("filter '{}' needs a value", op.label())));
                }
                Ok(())
            }
            PlanStep::AssertGrid {
                column,
                values,
                contains,
                summary,
                ..
            } => {
                let needs_column = values.is_some() || contains.is_some() || summary.is_some();
                if needs_column && column.is_none() {
                    return Err(E2eError::PlanParse(
                        "assert_grid with values, contains or summary needs a column".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Plan {
    /// Parse and validate a plan from YAML
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let plan: Self = serde_yaml::from_str(yaml)?;
        for (i, step) in plan.steps.iter().enumerate() {
            step.validate().map_err(|e| {
                E2eError::PlanParse(format!("{} step {} ({}): {}", plan.name, i + 1, step.label(), e))
            })?;
        }
        Ok(plan)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::PlanParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all plans under a directory, sorted by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut plans = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            plans.push(Self::from_file(entry.path())?);
        }

        Ok(plans)
    }

    pub fn filter_by_tag<'a>(plans: &'a [Self], tag: &str) -> Vec<&'a Self> {
        plans.iter().filter(|p| p.tags.iter().any(|t| t == tag)).collect()
    }

    fn expand(&self, text: &str) -> String {
        match &self.project {
            Some(project) => text.replace("{project}", project),
            None => text.to_string(),
        }
    }
}

/// Runs a [`Plan`] as a scenario
pub struct PlanScenario {
    plan: Plan,
}

impl PlanScenario {
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }

    async fn execute(&self, ctx: &mut ScenarioContext, step: &PlanStep) -> E2eResult<()> {
        let page = ctx.page.clone();
        let with_budget = |timeout_ms: &Option<u64>| match timeout_ms {
            Some(ms) => page.with_timeout(Duration::from_millis(*ms)),
            None => page.clone(),
        };

        match step {
            PlanStep::Navigate { url, wait_for_text } => {
                page.goto(&self.plan.expand(url)).await?;
                if let Some(text) = wait_for_text {
                    page.wait_for_text(&self.plan.expand(text)).await?;
                }
            }
            PlanStep::Click { target, wait_for_text } => {
                page.click(&target.to_locator()?).await?;
                if let Some(text) = wait_for_text {
                    page.wait_for_text(&self.plan.expand(text)).await?;
                }
            }
            PlanStep::Fill { target, value } => {
                page.fill(&target.to_locator()?, &self.plan.expand(value)).await?;
            }
            PlanStep::Check { target } => page.set_checked(&target.to_locator()?, true).await?,
            PlanStep::Uncheck { target } => page.set_checked(&target.to_locator()?, false).await?,
            PlanStep::Select { target, value } => {
                page.select(&target.to_locator()?, value).await?;
            }
            PlanStep::WaitFor { target, timeout_ms } => {
                with_budget(timeout_ms).wait_for(&target.to_locator()?).await?;
            }
            PlanStep::WaitForText { text, timeout_ms } => {
                with_budget(timeout_ms)
                    .wait_for_text(&self.plan.expand(text))
                    .await?;
            }
            PlanStep::AssertText { texts } => {
                let text = page.text().await?;
                let expected: Vec<String> = texts.iter().map(|t| self.plan.expand(t)).collect();
                let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
                ctx.checks.text_present(&text, &expected)?;
            }
            PlanStep::AssertNoText { texts } => {
                let text = page.text().await?;
                let unexpected: Vec<&str> = texts.iter().map(String::as_str).collect();
                ctx.checks.text_absent(&text, &unexpected)?;
            }
            PlanStep::FilterGrid {
                region,
                column,
                op,
                value,
            } => {
                ctx.snapshot(region)
                    .await?
                    .apply_filter(column, *op, value.as_deref())
                    .await?;
            }
            PlanStep::ClearFilter { region, column } => {
                ctx.snapshot(region).await?.clear_filter(column).await?;
            }
            PlanStep::AssertGrid {
                region,
                row_count,
                column,
                values,
                contains,
                summary,
            } => {
                let table = ctx.snapshot(region).await?;
                if let Some(expected) = row_count {
                    ctx.checks.row_count(&table, *expected)?;
                }
                if let Some(column) = column {
                    if let Some(values) = values {
                        let values: Vec<&str> = values.iter().map(String::as_str).collect();
                        ctx.checks.column_values(&table, column, &values)?;
                    }
                    if let Some(value) = contains {
                        ctx.checks.column_contains(&table, column, value)?;
                    }
                    if let Some(expected) = summary {
                        ctx.checks.summary_equals(&table, column, expected)?;
                    }
                }
            }
            PlanStep::WaitForJobs {
                container,
                kind,
                expected,
            } => {
                let container = match (container, &self.plan.project) {
                    (Some(c), _) => self.plan.expand(c),
                    (None, Some(project)) => project.clone(),
                    (None, None) => ctx.config.default_container.clone(),
                };
                ctx.wait_for_jobs(&container, kind, *expected).await?;
            }
            PlanStep::Log { message } => info!("[{}] {}", self.plan.name, self.plan.expand(message)),
        }
        Ok(())
    }
}

#[async_trait]
impl Scenario for PlanScenario {
    fn name(&self) -> &str {
        &self.plan.name
    }

    fn tags(&self) -> &[String] {
        &self.plan.tags
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        if let Some(project) = &self.plan.project {
            ctx.create_or_reset(project, self.plan.folder_type).await?;
        }
        Ok(())
    }

    async fn action(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        for (i, step) in self.plan.steps.iter().enumerate() {
            debug!("{} step {}: {}", self.plan.name, i + 1, step.label());
            if let Err(e) = self.execute(ctx, step).await {
                warn!("{} step {} ({}) failed", self.plan.name, i + 1, step.label());
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::runner::{ScenarioRunner, SuiteContext};
    use crate::sim::{SimDriver, SimPage, SimRegion};
    use std::sync::Arc;

    const SPECIMEN_PLAN: &str = r#"
name: specimen-filter
description: Filter the specimen grid down to the assay controls
tags:
  - specimens
  - smoke
project: PlanProject
steps:
  - action: navigate
    url: "{project}/specimens"
    wait_for_text: Specimens
  - action: filter_grid
    region: SpecimenDetail
    column: SpecimenID
    op: starts_with
    value: AssayTestControl
  - action: assert_grid
    region: SpecimenDetail
    row_count: 2
    column: SpecimenID
    values: [AssayTestControl1, AssayTestControl2]
  - action: assert_no_text
    texts: [AAA07XK5-05]
  - action: clear_filter
    region: SpecimenDetail
    column: SpecimenID
  - action: assert_grid
    region: SpecimenDetail
    row_count: 3
    column: Volume
    summary: "Sum: 44"
"#;

    #[test]
    fn parses_steps_and_targets() {
        let plan = Plan::from_yaml(SPECIMEN_PLAN).unwrap();
        assert_eq!(plan.steps.len(), 6);
        assert_eq!(plan.folder_type, FolderType::Study);
        assert_eq!(plan.expand("{project}/specimens"), "PlanProject/specimens");

        let target = Target {
            link: Some("Specimens".into()),
            ..Target::default()
        };
        assert_eq!(target.to_locator().unwrap(), Locator::link_with_text("Specimens"));
    }

    #[test]
    fn rejects_ambiguous_targets() {
        let yaml = r#"
name: bad
steps:
  - action: click
    target:
      link: Specimens
      button: Specimens
"#;
        let err = Plan::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, E2eError::PlanParse(m) if m.contains("step 1 (click)")));
    }

    #[test]
    fn rejects_grid_values_without_column() {
        let yaml = r#"
name: bad
steps:
  - action: assert_grid
    region: SpecimenDetail
    values: [a]
"#;
        assert!(Plan::from_yaml(yaml).is_err());
    }

    #[test]
    fn loads_directory_and_filters_by_tag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), SPECIMEN_PLAN).unwrap();
        std::fs::write(dir.path().join("b.yml"), "name: other\nsteps: []\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let plans = Plan::load_all(dir.path()).unwrap();
        assert_eq!(plans.len(), 2);
        let smoke = Plan::filter_by_tag(&plans, "smoke");
        assert_eq!(smoke.len(), 1);
        assert_eq!(smoke[0].name, "specimen-filter");
    }

    #[tokio::test]
    async fn plan_runs_against_simulated_app() {
        let sim = Arc::new(SimDriver::new());
        sim.add_page(
            "PlanProject/specimens",
            SimPage::new("Specimens").region("SpecimenDetail"),
        );
        sim.add_region(
            SimRegion::new("SpecimenDetail", &["SpecimenID", "Volume"])
                .row(&["AAA07XK5-05", "10"])
                .row(&["AssayTestControl1", "20"])
                .row(&["AssayTestControl2", "14"])
                .aggregate("Volume", crate::sim::Aggregate::Sum),
        );
        let suite = SuiteContext::new(HarnessConfig::default(), sim.clone(), sim.clone());

        let mut scenario = PlanScenario::new(Plan::from_yaml(SPECIMEN_PLAN).unwrap());
        let outcome = ScenarioRunner::run(&suite, &mut scenario).await;
        assert!(outcome.passed, "{:?}", outcome.error);
        assert_eq!(outcome.fixtures[0].name, "PlanProject");
        assert!(outcome.assertions.iter().all(|c| c.passed));
        assert!(sim.containers().is_empty());
    }
}
