//! [`Scheduler`] backed by an HTTP scheduling service.
//!
//! The job endpoints require `Authorization: Bearer <job_token>`. Immediate fires carry it
//! directly; schedules hand it to the service in `headers` for it to replay when the schedule fires.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::instrument;
use url::Url;

use super::{ScheduleEntry, ScheduleKind, SchedulePayload, Scheduler};
use crate::{
    config::SchedulerConfig,
    errors::{Error, Result},
};

/// One-off schedule registration sent to the scheduling service.
#[derive(Debug, Serialize)]
struct CreateScheduleRequest<'a> {
    name: String,
    schedule_expression: String,
    fire_at: chrono::DateTime<chrono::Utc>,
    target: &'a Url,
    /// Headers the service sends along with `input` when it fires
    headers: BTreeMap<&'static str, &'a str>,
    input: &'a SchedulePayload,
}

pub struct HttpScheduler {
    client: reqwest::Client,
    service_url: Url,
    batch_retry_target: Url,
    status_check_target: Url,
    authorization: String,
}

impl HttpScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            service_url: config.service_url.clone(),
            batch_retry_target: config.batch_retry_target.clone(),
            status_check_target: config.status_check_target.clone(),
            authorization: format!("Bearer {}", config.job_token),
        })
    }

    fn target(&self, kind: ScheduleKind) -> &Url {
        match kind {
            ScheduleKind::BatchRetry => &self.batch_retry_target,
            ScheduleKind::StatusCheck => &self.status_check_target,
        }
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &Url, body: &T, authorize: bool) -> Result<()> {
        let mut request = self.client.post(url.clone()).json(body);
        if authorize {
            request = request.header(AUTHORIZATION, self.authorization.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Scheduler {
                message: format!("{url} answered HTTP {status}: {body}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Scheduler for HttpScheduler {
    #[instrument(skip(self, entry), fields(kind = %entry.kind, batch_id = %entry.payload.batch_id), err)]
    async fn create_schedule(&self, entry: &ScheduleEntry) -> Result<()> {
        let request = CreateScheduleRequest {
            name: format!("{}-{}-{}", entry.kind, entry.payload.batch_id, entry.payload.retries),
            schedule_expression: format!("at({})", entry.fire_at.format("%Y-%m-%dT%H:%M:%S")),
            fire_at: entry.fire_at,
            target: self.target(entry.kind),
            headers: BTreeMap::from([("authorization", self.authorization.as_str())]),
            input: &entry.payload,
        };
        self.post_json(&self.service_url, &request, false).await
    }

    #[instrument(skip(self, entry), fields(kind = %entry.kind, batch_id = %entry.payload.batch_id), err)]
    async fn fire_now(&self, entry: &ScheduleEntry) -> Result<()> {
        self.post_json(self.target(entry.kind), &entry.payload, true).await
    }
}
