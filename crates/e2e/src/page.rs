//! Locator resolution with cardinality and waiting rules

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::WaitConfig;
use crate::driver::{Action, Driver, ElementInfo};
use crate::error::{E2eError, E2eResult};
use crate::locator::Locator;
use crate::wait::{retry, Condition, Waiter};

/// The current document, seen through a driver and a wait budget
#[derive(Clone)]
pub struct Page {
    driver: Arc<dyn Driver>,
    waiter: Waiter,
}

impl Page {
    pub fn new(driver: Arc<dyn Driver>, wait: WaitConfig) -> Self {
        Self {
            driver,
            waiter: Waiter::new(wait),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn waiter(&self) -> Waiter {
        self.waiter
    }

    /// Same page with a different wait budget
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            driver: self.driver.clone(),
            waiter: self.waiter.with_timeout(timeout),
        }
    }

    pub async fn goto(&self, path: &str) -> E2eResult<()> {
        debug!("Navigating to {}", path);
        self.driver.navigate(path).await
    }

    /// Immediate, possibly empty
    pub async fn find_all(&self, locator: &Locator) -> E2eResult<Vec<ElementInfo>> {
        self.driver.query(locator).await
    }

    pub async fn count(&self, locator: &Locator) -> E2eResult<usize> {
        Ok(self.find_all(locator).await?.len())
    }

    pub async fn is_present(&self, locator: &Locator) -> E2eResult<bool> {
        Ok(!self.find_all(locator).await?.is_empty())
    }

    /// Exactly one match, checked once without waiting
    pub async fn find_one_now(&self, locator: &Locator) -> E2eResult<ElementInfo> {
        exactly_one(locator, self.find_all(locator).await?)
    }

    /// Exactly one match, waiting for it to appear
    pub async fn find_one(&self, locator: &Locator) -> E2eResult<ElementInfo> {
        self.wait_for(locator).await?;
        self.find_one_now(locator).await
    }

    /// First of possibly many matches, waiting for at least one
    pub async fn find_first(&self, locator: &Locator) -> E2eResult<ElementInfo> {
        self.find_nth(locator, 0).await
    }

    pub async fn find_nth(&self, locator: &Locator, n: usize) -> E2eResult<ElementInfo> {
        self.find_one(&locator.clone().nth(n)).await
    }

    pub async fn wait_for(&self, locator: &Locator) -> E2eResult<()> {
        self.until(&Condition::Present(locator.clone())).await.map(|_| ())
    }

    pub async fn wait_for_absent(&self, locator: &Locator) -> E2eResult<()> {
        self.until(&Condition::Absent(locator.clone())).await.map(|_| ())
    }

    pub async fn wait_for_text(&self, text: &str) -> E2eResult<()> {
        self.until(&Condition::TextPresent(text.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn until(&self, condition: &Condition) -> E2eResult<usize> {
        self.waiter.until(self.driver.as_ref(), condition).await
    }

    pub async fn text(&self) -> E2eResult<String> {
        self.driver.page_text().await
    }

    /// Wait for a unique element, then act on it
    pub async fn act(&self, locator: &Locator, action: Action) -> E2eResult<()> {
        self.find_one(locator).await?;
        debug!("{} {}", action.name(), locator);
        self.driver.perform(locator, &action).await
    }

    pub async fn click(&self, locator: &Locator) -> E2eResult<()> {
        self.act(locator, Action::Click).await
    }

    /// Click that tolerates a re-render race; every retry is logged
    pub async fn click_with_retry(&self, locator: &Locator, attempts: usize) -> E2eResult<()> {
        let label = format!("click {locator}");
        retry(attempts, &label, move || self.click(locator)).await
    }

    pub async fn fill(&self, locator: &Locator, value: &str) -> E2eResult<()> {
        self.act(
            locator,
            Action::Fill {
                value: value.to_string(),
            },
        )
        .await
    }

    pub async fn set_checked(&self, locator: &Locator, checked: bool) -> E2eResult<()> {
        self.act(locator, Action::SetChecked { checked }).await
    }

    pub async fn select(&self, locator: &Locator, value: &str) -> E2eResult<()> {
        self.act(
            locator,
            Action::Select {
                value: value.to_string(),
            },
        )
        .await
    }

    pub async fn upload(&self, locator: &Locator, path: &Path) -> E2eResult<()> {
        self.act(
            locator,
            Action::Upload {
                path: path.to_path_buf(),
            },
        )
        .await
    }

    /// Current value of a unique form element
    pub async fn value_of(&self, locator: &Locator) -> E2eResult<Option<String>> {
        Ok(self.find_one_now(locator).await?.value)
    }

    /// Act, then wait for the condition the action should produce
    pub async fn perform_and_await(
        &self,
        locator: &Locator,
        action: Action,
        condition: &Condition,
    ) -> E2eResult<usize> {
        self.waiter
            .perform_and_await(self.driver.as_ref(), self.act(locator, action), condition)
            .await
    }

    pub async fn click_and_wait_for(&self, locator: &Locator, condition: &Condition) -> E2eResult<usize> {
        self.perform_and_await(locator, Action::Click, condition).await
    }
}

fn exactly_one(locator: &Locator, mut found: Vec<ElementInfo>) -> E2eResult<ElementInfo> {
    match found.len() {
        0 => Err(E2eError::NotFound(locator.to_string())),
        1 => Ok(found.remove(0)),
        count => Err(E2eError::AmbiguousMatch {
            locator: locator.to_string(),
            count,
        }),
    }
}
