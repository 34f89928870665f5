//! StudyQA E2E Verification Harness
//!
//! This crate drives end-to-end checks of the study module:
//! - Finds page elements through composable, declarative locators
//! - Snapshots data-region grids and filters, sorts and pages them
//! - Steps through multi-page wizards and reports validation failures
//! - Runs scenarios with guaranteed cleanup over shared suite state
//! - Creates and tears down projects, folders and users through the HTTP API
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ScenarioRunner (Rust)                      │
//! │    run(suite, scenario) -> ScenarioOutcome                  │
//! │      setup -> action -> verify -> cleanup (always)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioContext                                            │
//! │    ├── Page        find_one / wait_for / click / fill       │
//! │    ├── Wizard      set_field / advance / finish / cancel    │
//! │    ├── TableSnapshot  cells / filter / sort / page          │
//! │    ├── Checks      recorded assertions                      │
//! │    └── FixtureManager  create / teardown                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Driver (trait)             ControlPlane (trait)            │
//! │    ├── PlaywrightDriver       ├── ApiClient (reqwest)       │
//! │    └── SimDriver              └── SimDriver                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod archive;
pub mod config;
pub mod dom;
pub mod driver;
pub mod error;
pub mod filter;
pub mod fixture;
pub mod jobs;
pub mod locator;
pub mod page;
pub mod phi;
pub mod plan;
pub mod playwright;
pub mod region;
pub mod runner;
pub mod server;
pub mod sim;
pub mod verify;
pub mod wait;
pub mod wizard;

pub use api::{ApiClient, ControlPlane, FolderType};
pub use config::HarnessConfig;
pub use driver::Driver;
pub use error::{E2eError, E2eResult};
pub use filter::FilterOp;
pub use fixture::{FixtureManager, Freshness};
pub use locator::Locator;
pub use page::Page;
pub use plan::{Plan, PlanScenario};
pub use region::{DataRegion, TableSnapshot};
pub use runner::{Scenario, ScenarioContext, ScenarioOutcome, ScenarioRunner, SuiteContext, SuiteResult};
pub use sim::SimDriver;
pub use wait::{Condition, Waiter};
pub use wizard::{FieldValue, Wizard, WizardDefinition};
