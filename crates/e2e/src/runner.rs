//! Scenario runner: setup, action, verify and cleanup phases over a shared
//! suite context

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ControlPlane, FolderType, JobInfo};
use crate::config::HarnessConfig;
use crate::driver::Driver;
use crate::error::{E2eError, E2eResult};
use crate::fixture::{Fixture, FixtureManager, Freshness, TeardownReport};
use crate::jobs;
use crate::page::Page;
use crate::playwright::PlaywrightDriver;
use crate::region::TableSnapshot;
use crate::server;
use crate::verify::{CheckRecord, Checks};
use crate::wait::Waiter;
use crate::wizard::{Wizard, WizardTrail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Action,
    Verify,
    Cleanup,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::Action => "action",
            Phase::Verify => "verify",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// One end-to-end scenario. Only `action` is mandatory.
#[async_trait]
pub trait Scenario: Send {
    fn name(&self) -> &str;

    fn tags(&self) -> &[String] {
        &[]
    }

    async fn setup(&mut self, _ctx: &mut ScenarioContext) -> E2eResult<()> {
        Ok(())
    }

    async fn action(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()>;

    async fn verify(&mut self, _ctx: &mut ScenarioContext) -> E2eResult<()> {
        Ok(())
    }

    /// Runs exactly once, whichever phase failed
    async fn cleanup(&mut self, _ctx: &mut ScenarioContext) -> E2eResult<()> {
        Ok(())
    }
}

/// Everything a scenario phase can touch
pub struct ScenarioContext {
    pub page: Page,
    pub control: Arc<dyn ControlPlane>,
    /// Fixtures owned by this scenario, torn down after `cleanup`
    pub fixtures: FixtureManager,
    pub config: Arc<HarnessConfig>,
    pub checks: Checks,
    trails: Vec<WizardTrail>,
}

impl ScenarioContext {
    pub fn new(page: Page, control: Arc<dyn ControlPlane>, config: Arc<HarnessConfig>) -> Self {
        Self {
            page,
            fixtures: FixtureManager::new(control.clone()),
            control,
            config,
            checks: Checks::new(),
            trails: Vec::new(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.page.driver()
    }

    /// Delete `name` if it exists and create it again, owned by this scenario
    pub async fn create_or_reset(&mut self, name: &str, folder_type: FolderType) -> E2eResult<Fixture> {
        self.fixtures
            .ensure_project(name, folder_type, Freshness::Recreate)
            .await
    }

    pub async fn create_folder(&mut self, parent: &str, name: &str, folder_type: FolderType) -> E2eResult<Fixture> {
        self.fixtures.create_folder(parent, name, folder_type).await
    }

    /// Keep the wizard's path for the outcome report
    pub fn record_trail(&mut self, wizard: &Wizard) {
        self.trails.push(wizard.trail());
    }

    pub fn trails(&self) -> &[WizardTrail] {
        &self.trails
    }

    pub async fn page_text(&self) -> E2eResult<String> {
        self.page.text().await
    }

    /// Wait for a data region and snapshot it
    pub async fn snapshot(&self, region: &str) -> E2eResult<TableSnapshot> {
        TableSnapshot::wait_and_fetch(&self.page, region).await
    }

    /// Wait for pipeline jobs with the configured job budget
    pub async fn wait_for_jobs(&self, container: &str, kind: &str, expected: usize) -> E2eResult<Vec<JobInfo>> {
        let waiter = Waiter::new(self.config.jobs);
        jobs::wait_for_jobs(self.control.as_ref(), container, kind, expected, &waiter).await
    }
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    /// Cleanup failure reported alongside an earlier error
    pub cleanup_error: Option<String>,
    pub assertions: Vec<CheckRecord>,
    /// Fixtures the scenario created
    pub fixtures: Vec<Fixture>,
    pub teardown_failures: Vec<(String, String)>,
    pub wizard_trails: Vec<WizardTrail>,
    pub duration_ms: u64,
}

/// Result of running a list of scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioOutcome>,
}

impl SuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

pub struct ScenarioRunner;

impl ScenarioRunner {
    /// Run one scenario. Phases stop at the first failure; `cleanup` and
    /// fixture teardown always run.
    pub async fn run(suite: &SuiteContext, scenario: &mut dyn Scenario) -> ScenarioOutcome {
        let start = Instant::now();
        let name = scenario.name().to_string();
        debug!("Running scenario: {}", name);

        let mut ctx = suite.scenario_context();
        let mut failure: Option<(Phase, E2eError)> = None;

        for phase in [Phase::Setup, Phase::Action, Phase::Verify] {
            let result = match phase {
                Phase::Setup => guarded(phase, scenario.setup(&mut ctx)).await,
                Phase::Action => guarded(phase, scenario.action(&mut ctx)).await,
                _ => guarded(phase, scenario.verify(&mut ctx)).await,
            };
            if let Err(e) = result {
                debug!("{} failed in {}: {}", name, phase, e);
                failure = Some((phase, e));
                break;
            }
        }

        let cleanup_error = match guarded(Phase::Cleanup, scenario.cleanup(&mut ctx)).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Cleanup of {} failed: {}", name, e);
                Some(e.to_string())
            }
        };

        let fixtures = ctx.fixtures.owned().to_vec();
        let teardown = ctx.fixtures.teardown().await;

        let (failed_phase, error) = match failure {
            Some((phase, e)) => (Some(phase), Some(e.to_string())),
            None => match &cleanup_error {
                Some(e) => (Some(Phase::Cleanup), Some(e.clone())),
                None => (None, None),
            },
        };

        ScenarioOutcome {
            name,
            passed: error.is_none(),
            failed_phase,
            error,
            cleanup_error,
            assertions: ctx.checks.take_log(),
            fixtures,
            teardown_failures: teardown.failed,
            wizard_trails: ctx.trails,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Run scenarios in order; with a tag, scenarios without it are skipped
    pub async fn run_all(
        suite: &SuiteContext,
        scenarios: &mut [Box<dyn Scenario>],
        tag: Option<&str>,
    ) -> SuiteResult {
        let start = Instant::now();
        let mut results = Vec::new();
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;

        info!("Running {} scenario(s)...", scenarios.len());

        for scenario in scenarios.iter_mut() {
            if let Some(tag) = tag {
                if !scenario.tags().iter().any(|t| t == tag) {
                    skipped += 1;
                    continue;
                }
            }

            let outcome = Self::run(suite, scenario.as_mut()).await;
            if outcome.passed {
                passed += 1;
                info!("✓ {} ({} ms)", outcome.name, outcome.duration_ms);
            } else {
                failed += 1;
                error!(
                    "✗ {} - {}",
                    outcome.name,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
            results.push(outcome);
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        info!("");
        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        SuiteResult {
            total: scenarios.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
        }
    }

    /// Write suite results to `test-results.json` under `output_dir`
    pub fn write_results(output_dir: &Path, results: &SuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(output_dir)?;

        let path = output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Await a phase, turning a panic inside it into an error for that phase
async fn guarded(phase: Phase, fut: BoxFuture<'_, E2eResult<()>>) -> E2eResult<()> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(E2eError::Panicked {
            phase: phase.to_string(),
            message: panic_message(&*payload),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// State shared by every scenario of a run
pub struct SuiteContext {
    config: Arc<HarnessConfig>,
    driver: Arc<dyn Driver>,
    control: Arc<dyn ControlPlane>,
    shared: Mutex<FixtureManager>,
    torn_down: AtomicBool,
}

impl SuiteContext {
    pub fn new(config: HarnessConfig, driver: Arc<dyn Driver>, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            config: Arc::new(config),
            shared: Mutex::new(FixtureManager::new(control.clone())),
            driver,
            control,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Wait for the server, launch the browser and connect the control plane
    pub async fn init_once(config: HarnessConfig) -> E2eResult<Self> {
        server::wait_until_ready(&config.base_url, config.startup_timeout()).await?;
        let control = ApiClient::new(&config)?;
        let driver = PlaywrightDriver::launch(&config.playwright, &config.base_url).await?;
        Ok(Self::new(config, Arc::new(driver), Arc::new(control)))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    pub fn page(&self) -> Page {
        Page::new(self.driver.clone(), self.config.wait)
    }

    /// Fresh context with its own fixture manager
    pub fn scenario_context(&self) -> ScenarioContext {
        ScenarioContext::new(self.page(), self.control.clone(), self.config.clone())
    }

    /// Fixtures that outlive single scenarios, torn down by `teardown_once`
    pub async fn shared_fixtures(&self) -> MutexGuard<'_, FixtureManager> {
        self.shared.lock().await
    }

    /// Tear down shared fixtures and shut the driver down. Later calls are
    /// no-ops.
    pub async fn teardown_once(&self) -> E2eResult<TeardownReport> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(TeardownReport::default());
        }
        let report = self.shared.lock().await.teardown().await;
        self.driver.shutdown().await?;
        info!("Suite teardown complete ({} driver)", self.driver.name());
        Ok(report)
    }
}
