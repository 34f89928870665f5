//! Study module scenarios against the simulated server

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use studyqa_e2e::api::{ControlPlane, FolderType, JobStatus};
use studyqa_e2e::archive::ExportArchive;
use studyqa_e2e::config::WaitConfig;
use studyqa_e2e::error::E2eError;
use studyqa_e2e::fixture::FixtureManager;
use studyqa_e2e::phi::{self, FieldPhi, PhiLevel, PhiViolation};
use studyqa_e2e::runner::Phase;
use studyqa_e2e::sim::{self, Aggregate, SimEffect, SimJob, SimPage, SimRegion, SimWizard};
use studyqa_e2e::wizard::{FinishOutcome, PageResult, WizardState};
use studyqa_e2e::{
    DataRegion, E2eResult, FieldValue, FilterOp, HarnessConfig, Locator, Scenario, ScenarioContext, ScenarioRunner,
    SimDriver, SuiteContext, TableSnapshot, Wizard, WizardDefinition,
};

const PROJECT: &str = "StudyVerifyProject";
const STUDY_PAGE: &str = "StudyVerifyProject/My Study/begin";
const SPECIMEN_PAGE: &str = "StudyVerifyProject/My Study/specimens";
const MOUSE_GROUP_ERROR: &str = "You must select at least one Mouse group.";

fn specimen_grid() -> SimRegion {
    let mut region = SimRegion::new("SpecimenDetail", &["SpecimenID", "Visit", "Volume"])
        .aggregate("Volume", Aggregate::Sum);
    for (id, visit, volume) in [
        ("BAQ00051-01", "1", "2"),
        ("BAQ00051-02", "1", "2"),
        ("BAQ00051-03", "2", "4"),
        ("AAA07XK5-05", "2", "1"),
        ("BAQ00052-01", "3", "3"),
        ("BAQ00052-02", "3", "3"),
        ("BAQ00053-01", "4", "5"),
        ("BAQ00053-02", "4", "5"),
        ("AssayTestControl1", "5", "10"),
        ("AssayTestControl2", "5", "9"),
    ] {
        region = region.row(&[id, visit, volume]);
    }
    region
}

fn publish_wizard() -> SimWizard {
    SimWizard::new(WizardDefinition::publish_study())
        .options("renderType", &["Use existing groups", "Create new groups"])
        .options("participantGroups", &["Group 1", "Group 2"])
        .options("datasets", &["DEM-1: Demographics", "LLS-1: Lab Results"])
        .require_selection("Mice", "participantGroups", MOUSE_GROUP_ERROR)
        .on_finish(STUDY_PAGE)
}

fn study_app(wizard: SimWizard) -> Arc<SimDriver> {
    let sim = Arc::new(SimDriver::new());
    sim.add_page(
        STUDY_PAGE,
        SimPage::new("My Study")
            .text("Study tracks data in 12 datasets over 26 visits.")
            .link("Specimens", SPECIMEN_PAGE)
            .button(
                "Publish Study",
                SimEffect::OpenWizard {
                    wizard: "Publish Study".to_string(),
                    page: None,
                },
            ),
    );
    sim.add_page(SPECIMEN_PAGE, SimPage::new("Specimens").region("SpecimenDetail"));
    sim.add_region(specimen_grid());
    sim.add_wizard(wizard);
    sim
}

fn quick_config() -> HarnessConfig {
    HarnessConfig {
        wait: WaitConfig {
            timeout_ms: 500,
            poll_interval_ms: 5,
        },
        jobs: WaitConfig {
            timeout_ms: 1_000,
            poll_interval_ms: 5,
        },
        ..HarnessConfig::default()
    }
}

fn suite(sim: &Arc<SimDriver>) -> SuiteContext {
    SuiteContext::new(quick_config(), sim.clone(), sim.clone())
}

async fn open_publish_wizard(suite: &SuiteContext) -> E2eResult<Wizard> {
    let page = suite.page();
    page.goto(STUDY_PAGE).await?;
    Wizard::open(&page, WizardDefinition::publish_study(), &Locator::button("Publish Study")).await
}

async fn fill_general_setup(wizard: &mut Wizard) -> E2eResult<()> {
    wizard
        .set_field("studyName", FieldValue::Text("PublishedStudy".into()))
        .await?;
    wizard
        .set_field("studyDescription", FieldValue::Text("Subset of My Study".into()))
        .await?;
    wizard
        .set_field(
            "protocolDoc",
            FieldValue::File(PathBuf::from("sampledata/study/Protocol.txt")),
        )
        .await
}

struct SpecimenFilter;

#[async_trait]
impl Scenario for SpecimenFilter {
    fn name(&self) -> &str {
        "specimen-filter"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        ctx.create_or_reset(PROJECT, FolderType::Collaboration).await?;
        ctx.create_folder(PROJECT, "My Study", FolderType::Study).await?;
        Ok(())
    }

    async fn action(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        ctx.page.goto(STUDY_PAGE).await?;
        ctx.page.click(&Locator::link_with_text("Specimens")).await?;

        let grid = ctx.snapshot("SpecimenDetail").await?;
        ctx.checks.row_count(&grid, 10)?;

        let grid = grid
            .apply_filter("SpecimenID", FilterOp::StartsWith, Some("AssayTestControl"))
            .await?;
        ctx.checks.row_count(&grid, 2)?;
        ctx.checks
            .column_values(&grid, "SpecimenID", &["AssayTestControl1", "AssayTestControl2"])?;
        ctx.checks.summary_equals(&grid, "Volume", "Sum: 19")?;
        let text = ctx.page_text().await?;
        ctx.checks.text_absent(&text, &["AAA07XK5-05"])?;

        let grid = grid.clear_filter("SpecimenID").await?;
        ctx.checks.row_count(&grid, 10)?;
        ctx.checks.column_contains(&grid, "SpecimenID", "AAA07XK5-05")?;
        Ok(())
    }
}

#[tokio::test]
async fn starts_with_filter_narrows_specimens_and_clearing_restores_them() {
    let sim = study_app(publish_wizard());
    let suite = suite(&sim);

    let outcome = ScenarioRunner::run(&suite, &mut SpecimenFilter).await;
    assert!(outcome.passed, "{:?}", outcome.error);
    assert_eq!(outcome.assertions.len(), 7);
    assert_eq!(outcome.fixtures.len(), 2);
    assert!(sim.containers().is_empty());
}

#[tokio::test]
async fn empty_mouse_group_selection_is_rejected_in_place() {
    let sim = study_app(publish_wizard());
    let suite = suite(&sim);

    let mut wizard = open_publish_wizard(&suite).await.unwrap();
    fill_general_setup(&mut wizard).await.unwrap();
    assert_eq!(wizard.advance().await.unwrap(), PageResult::Advanced("Mice".into()));

    wizard
        .set_field("participantGroups", FieldValue::GridSelection(vec![]))
        .await
        .unwrap();
    let result = wizard.advance().await.unwrap();
    assert_eq!(result, PageResult::ValidationFailed(vec![MOUSE_GROUP_ERROR.to_string()]));
    assert_eq!(wizard.current_title(), "Mice");
    assert_eq!(
        wizard.read_field("participantGroups").await.unwrap(),
        FieldValue::GridSelection(vec![])
    );

    wizard
        .set_field("participantGroups", FieldValue::GridSelection(vec!["Group 2".into()]))
        .await
        .unwrap();
    assert_eq!(wizard.advance().await.unwrap(), PageResult::Advanced("Datasets".into()));
}

#[tokio::test]
async fn page_that_forgets_its_inputs_reports_lost_state() {
    let wizard = publish_wizard()
        .require_text("General Setup", "studyDescription", "Description is required.")
        .forget_values_on_error();
    let sim = study_app(wizard);
    let suite = suite(&sim);

    let mut wizard = open_publish_wizard(&suite).await.unwrap();
    wizard
        .set_field("studyName", FieldValue::Text("PublishedStudy".into()))
        .await
        .unwrap();
    let err = wizard.advance().await.unwrap_err();
    assert!(matches!(err, E2eError::StateLost { ref field, .. } if field == "studyName"), "{err}");
}

#[tokio::test]
async fn back_to_a_page_that_forgot_its_inputs_reports_lost_state() {
    let sim = study_app(publish_wizard().forget_values_on_back());
    let suite = suite(&sim);

    let mut wizard = open_publish_wizard(&suite).await.unwrap();
    fill_general_setup(&mut wizard).await.unwrap();
    assert_eq!(wizard.advance().await.unwrap(), PageResult::Advanced("Mice".into()));

    let err = wizard.go_back().await.unwrap_err();
    assert!(
        matches!(err, E2eError::StateLost { ref page, .. } if page == "General Setup"),
        "{err}"
    );
    assert_eq!(wizard.current_title(), "General Setup");
}

#[tokio::test]
async fn values_survive_back_and_forth_and_cancel_is_idempotent() {
    let sim = study_app(publish_wizard());
    let suite = suite(&sim);

    let mut wizard = open_publish_wizard(&suite).await.unwrap();
    fill_general_setup(&mut wizard).await.unwrap();
    wizard.advance().await.unwrap();
    wizard
        .set_field("renderType", FieldValue::Choice("Use existing groups".into()))
        .await
        .unwrap();
    wizard
        .set_field("participantGroups", FieldValue::GridSelection(vec!["Group 1".into()]))
        .await
        .unwrap();

    wizard.go_back().await.unwrap();
    assert_eq!(wizard.current_title(), "General Setup");
    wizard.verify_retained().await.unwrap();
    assert_eq!(
        wizard.read_field("protocolDoc").await.unwrap().to_string(),
        FieldValue::File(PathBuf::from("Protocol.txt")).to_string()
    );

    wizard.advance().await.unwrap();
    wizard.verify_retained().await.unwrap();

    wizard.cancel().await.unwrap();
    assert_eq!(wizard.state(), WizardState::Cancelled);
    assert!(!sim.wizard_open());
    wizard.cancel().await.unwrap();

    let err = wizard
        .set_field("studyName", FieldValue::Text("again".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, E2eError::WizardClosed(_)));
}

#[tokio::test]
async fn finishing_publish_records_the_submitted_values() {
    let sim = study_app(publish_wizard());
    let suite = suite(&sim);

    let mut wizard = open_publish_wizard(&suite).await.unwrap();
    fill_general_setup(&mut wizard).await.unwrap();
    wizard.advance().await.unwrap();
    wizard
        .set_field("participantGroups", FieldValue::GridSelection(vec!["Group 1".into()]))
        .await
        .unwrap();
    let last = wizard.definition().pages.len() - 1;
    while wizard.current_index() < last {
        assert!(matches!(wizard.advance().await.unwrap(), PageResult::Advanced(_)));
    }
    assert!(matches!(
        wizard.advance().await.unwrap_err(),
        E2eError::NoSuchPage { .. }
    ));

    let outcome = wizard.finish().await.unwrap();
    assert_eq!(outcome, FinishOutcome::Completed("PublishedStudy".into()));
    let trail = wizard.trail();
    assert_eq!(trail.pages.first().map(String::as_str), Some("General Setup"));
    assert_eq!(trail.pages.last().map(String::as_str), Some("Publish Options"));
    assert_eq!(trail.state, WizardState::Completed);

    let completed = sim.completed_wizards();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].values.get("studyName"),
        Some(&FieldValue::Text("PublishedStudy".into()))
    );
    wizard.cancel().await.unwrap();
}

#[tokio::test]
async fn resuming_starts_at_the_requested_page() {
    let sim = study_app(publish_wizard());
    sim.add_page(
        "StudyVerifyProject/republish",
        SimPage::new("Republish").button(
            "Republish",
            SimEffect::OpenWizard {
                wizard: "Publish Study".to_string(),
                page: Some("Datasets".to_string()),
            },
        ),
    );
    let suite = suite(&sim);
    let page = suite.page();
    page.goto("StudyVerifyProject/republish").await.unwrap();

    let wizard = Wizard::resume(
        &page,
        WizardDefinition::publish_study(),
        &Locator::button("Republish"),
        "Datasets",
    )
    .await
    .unwrap();
    assert_eq!(wizard.current_title(), "Datasets");

    let err = Wizard::resume(
        &page,
        WizardDefinition::publish_study(),
        &Locator::button("Republish"),
        "Cohorts",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, E2eError::NoSuchPage { .. }));
}

#[tokio::test]
async fn updating_a_snapshot_adds_the_new_source_row() {
    let sim = Arc::new(SimDriver::new());
    let control: Arc<dyn ControlPlane> = sim.clone();
    control
        .insert_rows(
            PROJECT,
            "study",
            "Demographics",
            vec![
                sim::row(&[("ParticipantId", "PT-101"), ("Country", "USA")]),
                sim::row(&[("ParticipantId", "PT-102"), ("Country", "Brazil")]),
                sim::row(&[("ParticipantId", "PT-103"), ("Country", "Ghana")]),
            ],
        )
        .await
        .unwrap();
    sim.add_page(
        "StudyVerifyProject/snapshot",
        SimPage::new("Demographics Snapshot")
            .region("DemSnapshot")
            .button("Update Snapshot", SimEffect::RefreshRegion("DemSnapshot".into())),
    );
    sim.add_region(SimRegion::new("DemSnapshot", &["ParticipantId", "Country"]).source(PROJECT, "study", "Demographics"));

    let suite = suite(&sim);
    let mut ctx = suite.scenario_context();
    ctx.page.goto("StudyVerifyProject/snapshot").await.unwrap();
    let before = ctx.snapshot("DemSnapshot").await.unwrap();
    assert_eq!(before.row_count().unwrap(), 3);

    control
        .insert_rows(
            PROJECT,
            "study",
            "Demographics",
            vec![sim::row(&[("ParticipantId", "PT-104"), ("Country", "Kenya")])],
        )
        .await
        .unwrap();
    ctx.page.click(&Locator::button("Update Snapshot")).await.unwrap();

    assert!(!before.is_current());
    assert!(matches!(before.row_count().unwrap_err(), E2eError::StaleSnapshot { .. }));

    let after = ctx.snapshot("DemSnapshot").await.unwrap();
    ctx.checks.row_count(&after, 4).unwrap();
    let text = ctx.page_text().await.unwrap();
    ctx.checks.text_present(&text, &["Kenya"]).unwrap();
}

#[tokio::test]
async fn restructuring_one_handle_stales_every_other_snapshot() {
    let sim = study_app(publish_wizard());
    let suite = suite(&sim);
    suite.page().goto(SPECIMEN_PAGE).await.unwrap();

    let held = DataRegion::fetch(suite.driver(), "SpecimenDetail").await.unwrap();
    let working = TableSnapshot::fetch(suite.driver(), "SpecimenDetail").await.unwrap();
    let sorted = working
        .sort("Volume", studyqa_e2e::region::SortDir::Descending)
        .await
        .unwrap();

    assert_eq!(sorted.cell(0, "SpecimenID").unwrap(), "AssayTestControl1");
    assert!(matches!(
        held.cell(0, "SpecimenID").unwrap_err(),
        E2eError::StaleSnapshot { .. }
    ));

    // Selection does not re-render rows
    let mut sorted = sorted;
    sorted.check_row(1).await.unwrap();
    assert_eq!(sorted.checked_rows().unwrap(), [1]);
    assert!(sorted.is_current());
}

struct BrokenVerify {
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl Scenario for BrokenVerify {
    fn name(&self) -> &str {
        "broken-verify"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        ctx.create_or_reset(PROJECT, FolderType::Study).await.map(|_| ())
    }

    async fn action(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        ctx.page.goto(STUDY_PAGE).await
    }

    async fn verify(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        let text = ctx.page_text().await?;
        ctx.checks.text_present(&text, &["24 datasets"])
    }

    async fn cleanup(&mut self, _ctx: &mut ScenarioContext) -> E2eResult<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn failed_verification_still_cleans_up_once() {
    let sim = study_app(publish_wizard());
    let suite = suite(&sim);
    let cleanups = Arc::new(AtomicUsize::new(0));

    let outcome = ScenarioRunner::run(
        &suite,
        &mut BrokenVerify {
            cleanups: cleanups.clone(),
        },
    )
    .await;

    assert_eq!(outcome.failed_phase, Some(Phase::Verify));
    assert!(outcome.error.unwrap().contains("24 datasets"));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.assertions.len(), 1);
    assert!(!outcome.assertions[0].passed);
    assert!(sim.containers().is_empty());
}

struct PanickingAction {
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl Scenario for PanickingAction {
    fn name(&self) -> &str {
        "panicking-action"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        ctx.create_or_reset(PROJECT, FolderType::Study).await.map(|_| ())
    }

    async fn action(&mut self, ctx: &mut ScenarioContext) -> E2eResult<()> {
        ctx.page.goto(STUDY_PAGE).await?;
        let text = ctx.page_text().await?;
        assert!(text.contains("24 datasets"), "study overview lists 24 datasets");
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &mut ScenarioContext) -> E2eResult<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn panicking_action_still_cleans_up_and_tears_down() {
    let sim = study_app(publish_wizard());
    let suite = suite(&sim);
    let cleanups = Arc::new(AtomicUsize::new(0));

    let outcome = ScenarioRunner::run(
        &suite,
        &mut PanickingAction {
            cleanups: cleanups.clone(),
        },
    )
    .await;

    assert!(!outcome.passed);
    assert_eq!(outcome.failed_phase, Some(Phase::Action));
    assert!(outcome.error.unwrap().contains("24 datasets"));
    assert!(outcome.cleanup_error.is_none());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.fixtures.len(), 1);
    assert!(sim.containers().is_empty());
}

#[tokio::test]
async fn a_deleted_fixture_name_can_be_created_again() {
    let sim = Arc::new(SimDriver::new());
    let mut fixtures = FixtureManager::new(sim.clone());

    fixtures.create_project(PROJECT, FolderType::Study).await.unwrap();
    assert!(matches!(
        fixtures.create_project(PROJECT, FolderType::Study).await.unwrap_err(),
        E2eError::FixtureCollision(_)
    ));
    assert!(fixtures.teardown().await.is_clean());
    fixtures.create_project(PROJECT, FolderType::Study).await.unwrap();
    assert_eq!(sim.containers(), [PROJECT]);
}

#[tokio::test]
async fn import_jobs_are_awaited_through_the_context() {
    let sim = study_app(publish_wizard());
    sim.add_job(PROJECT, SimJob::new("41", "Study import: My Study", 2, JobStatus::Complete));
    sim.add_job(PROJECT, SimJob::new("42", "Specimen import", 0, JobStatus::Complete));
    let suite = suite(&sim);
    let ctx = suite.scenario_context();

    let jobs = ctx.wait_for_jobs(PROJECT, "study import", 1).await.unwrap();
    assert_eq!(jobs[0].id, "41");

    let err = ctx.wait_for_jobs(PROJECT, "import", 1).await.unwrap_err();
    assert!(matches!(err, E2eError::JobCountExceeded { found: 2, .. }));
}

#[test]
fn restricted_export_keeps_only_lower_ranked_columns() {
    let fields = vec![
        FieldPhi::new("Country", PhiLevel::NotPhi),
        FieldPhi::new("Language", PhiLevel::Limited),
        FieldPhi::new("Birthdate", PhiLevel::Phi),
        FieldPhi::new("Genotype", PhiLevel::Restricted),
    ];
    let dir = tempfile::tempdir().unwrap();
    let datasets = dir.path().join("study/datasets");
    std::fs::create_dir_all(&datasets).unwrap();
    std::fs::write(
        datasets.join("dataset5001.tsv"),
        "ParticipantId\tSequenceNum\tCountry\tLanguage\tBirthdate\nPT-101\t1\tUSA\tEnglish\t1970-01-01\n",
    )
    .unwrap();
    std::fs::write(
        datasets.join("dataset5002.tsv"),
        "ParticipantId\tSequenceNum\tCountry\tGenotype\nPT-101\t1\tUSA\tAA\n",
    )
    .unwrap();

    let export = ExportArchive::open(dir.path()).unwrap();
    let clean = phi::verify_export(&export, "study/datasets/dataset5001.tsv", &fields, PhiLevel::Restricted).unwrap();
    assert!(clean.is_empty(), "{clean:?}");

    let leaky = phi::verify_export(&export, "study/datasets/dataset5002.tsv", &fields, PhiLevel::Restricted).unwrap();
    assert!(leaky.contains(&PhiViolation::Leaked {
        field: "Genotype".into(),
        level: PhiLevel::Restricted
    }));
}
