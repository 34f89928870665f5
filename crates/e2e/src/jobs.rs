//! Pipeline job polling

use tracing::{debug, info};

use crate::api::{ControlPlane, JobInfo, JobStatus};
use crate::error::{E2eError, E2eResult};
use crate::wait::Waiter;

/// Jobs whose description mentions `kind`, case-insensitively
pub fn jobs_of_kind<'a>(jobs: &'a [JobInfo], kind: &str) -> Vec<&'a JobInfo> {
    let kind = kind.to_lowercase();
    jobs.iter()
        .filter(|j| j.description.to_lowercase().contains(&kind))
        .collect()
}

/// Wait until exactly `expected` jobs of `kind` have completed.
///
/// More matching jobs than expected fails immediately, as does any
/// matching job in error.
pub async fn wait_for_jobs(
    control: &dyn ControlPlane,
    container: &str,
    kind: &str,
    expected: usize,
    waiter: &Waiter,
) -> E2eResult<Vec<JobInfo>> {
    let what = format!("{expected} '{kind}' job(s) in {container}");
    let done = waiter
        .poll(&what, move || async move {
            let all = control.list_jobs(container).await?;
            let matching = jobs_of_kind(&all, kind);

            if let Some(failed) = matching.iter().find(|j| j.status == JobStatus::Error) {
                return Err(E2eError::JobFailed(format!("{} ({})", failed.description, failed.id)));
            }
            if matching.len() > expected {
                return Err(E2eError::JobCountExceeded {
                    kind: kind.to_string(),
                    expected,
                    found: matching.len(),
                });
            }

            let complete = matching
                .iter()
                .filter(|j| j.status == JobStatus::Complete)
                .count();
            debug!("{}: {}/{} complete", kind, complete, expected);
            if matching.len() == expected && complete == expected {
                Ok(Some(matching.into_iter().cloned().collect::<Vec<_>>()))
            } else {
                Ok(None)
            }
        })
        .await?;
    info!("{} '{}' job(s) complete in {}", expected, kind, container);
    Ok(done)
}
