use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use tracksync_core::{Notification, NotificationDispatch, Result, SyncError};

use crate::infra::config::mask_secret;

/// Posts notifications as JSON to Apprise API style endpoints.
#[derive(Clone)]
pub struct AppriseDispatch {
    http: reqwest::Client,
}

impl fmt::Debug for AppriseDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppriseDispatch").finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct AppriseBody<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl AppriseDispatch {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Configuration(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl NotificationDispatch for AppriseDispatch {
    /// Every target is tried; the first failure is returned after the rest
    /// have been attempted.
    async fn dispatch(&self, targets: &[String], notification: &Notification) -> Result<()> {
        let body = AppriseBody {
            title: &notification.title,
            body: &notification.body,
            kind: "info",
        };
        let mut first_error = None;
        for target in targets {
            let outcome = self
                .http
                .post(target)
                .json(&body)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match outcome {
                Ok(_) => {
                    debug!(target: "tracksync::notify", url = %mask_secret(target), "notification delivered")
                }
                Err(err) => {
                    let url = mask_secret(target);
                    let err = err.without_url();
                    let status = err.status().map(|status| status.as_u16());
                    warn!(target: "tracksync::notify", %url, ?status, error = %err, "notification failed");
                    first_error.get_or_insert_with(|| {
                        SyncError::Transient(format!("notification to {url} failed: {err}"))
                    });
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
