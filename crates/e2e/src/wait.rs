//! Bounded waits
//!
//! Every suspension point in a scenario goes through [`Waiter`]: poll a
//! [`Condition`] until it holds or the budget runs out. Expiry is
//! [`E2eError::Timeout`], never `NotFound`.

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::WaitConfig;
use crate::driver::Driver;
use crate::error::{E2eError, E2eResult};
use crate::locator::Locator;

/// Something observable on the page
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Present(Locator),
    Absent(Locator),
    TextPresent(String),
    TextAbsent(String),
    RegionPresent(String),
    /// Satisfied by the first branch that holds; reports its index
    AnyOf(Vec<Condition>),
}

impl Condition {
    /// `Some(branch)` when satisfied, `None` otherwise
    pub fn check<'a>(&'a self, driver: &'a dyn Driver) -> BoxFuture<'a, E2eResult<Option<usize>>> {
        async move {
            let hit = match self {
                Condition::Present(loc) => !driver.query(loc).await?.is_empty(),
                Condition::Absent(loc) => driver.query(loc).await?.is_empty(),
                Condition::TextPresent(t) => driver.page_text().await?.contains(t.as_str()),
                Condition::TextAbsent(t) => !driver.page_text().await?.contains(t.as_str()),
                Condition::RegionPresent(name) => driver.read_region(name).await?.is_some(),
                Condition::AnyOf(branches) => {
                    for (i, branch) in branches.iter().enumerate() {
                        if branch.check(driver).await?.is_some() {
                            return Ok(Some(i));
                        }
                    }
                    false
                }
            };
            Ok::<_, E2eError>(hit.then_some(0))
        }
        .boxed()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Present(l) => write!(f, "present: {l}"),
            Condition::Absent(l) => write!(f, "absent: {l}"),
            Condition::TextPresent(t) => write!(f, "text present: {t:?}"),
            Condition::TextAbsent(t) => write!(f, "text absent: {t:?}"),
            Condition::RegionPresent(r) => write!(f, "region present: {r}"),
            Condition::AnyOf(branches) => {
                write!(f, "any of [")?;
                for (i, b) in branches.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{b}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Waiter {
    pub fn new(config: WaitConfig) -> Self {
        Self {
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll until the condition holds; returns the matching `AnyOf` branch
    pub async fn until(&self, driver: &dyn Driver, condition: &Condition) -> E2eResult<usize> {
        let what = condition.to_string();
        self.poll(&what, move || async move { condition.check(driver).await })
            .await
    }

    /// Run `action`, then wait for its visible effect
    pub async fn perform_and_await<Fut>(
        &self,
        driver: &dyn Driver,
        action: Fut,
        condition: &Condition,
    ) -> E2eResult<usize>
    where
        Fut: Future<Output = E2eResult<()>>,
    {
        action.await?;
        self.until(driver, condition).await
    }

    /// Generic bounded poll: `probe` returns `Some` once done
    pub async fn poll<T, F, Fut>(&self, what: &str, mut probe: F) -> E2eResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<Option<T>>>,
    {
        let start = Instant::now();
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            if let Some(value) = probe().await? {
                if attempts > 1 {
                    debug!("Satisfied after {} polls: {}", attempts, what);
                }
                return Ok(value);
            }
            if start.elapsed() >= self.timeout {
                return Err(E2eError::Timeout {
                    what: what.to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new(WaitConfig::default())
    }
}

/// Retry a known-flaky operation a fixed number of times, logging each retry
pub async fn retry<T, F, Fut>(attempts: usize, label: &str, mut op: F) -> E2eResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("Retrying '{}' (attempt {}/{}): {}", label, attempt + 1, attempts, e);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
