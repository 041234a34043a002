//! Reqwest-backed [`MessagingProvider`].

use async_trait::async_trait;
use reqwest::{
    StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use super::{
    API_KEY_HEADER, MessagingProvider, ProviderResponse,
    auth::AccessTokenProvider,
    models::{StatusesResponse, build_batch_request},
    signing::{SIGNATURE_HEADER, shared_secret, sign_payload},
};
use crate::{
    config::ProviderConfig,
    errors::{Error, Result},
    types::{MessageReference, QueueRecord},
};

const JSON_API: &str = "application/vnd.api+json";
const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Signed client for the communications management API.
pub struct CommsClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    secret: String,
    channel: String,
    auth: Option<AccessTokenProvider>,
}

impl CommsClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let auth = config
            .oauth
            .clone()
            .map(|oauth| AccessTokenProvider::new(client.clone(), oauth));

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            secret: shared_secret(&config.application_id, &config.api_key),
            channel: config.channel.clone(),
            auth,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let joined = format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|e| Error::Internal {
            operation: format!("build provider URL {joined}: {e}"),
        })
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        match &self.auth {
            Some(auth) => Ok(request.bearer_auth(auth.access_token().await?)),
            None => Ok(request),
        }
    }
}

#[async_trait]
impl MessagingProvider for CommsClient {
    #[instrument(skip(self, recipients), fields(recipients = recipients.len()), err)]
    async fn send_batch_message(&self, batch_id: &str, routing_plan_id: &str, recipients: &[QueueRecord]) -> Result<ProviderResponse> {
        let request = build_batch_request(routing_plan_id, batch_id, recipients)?;

        // Sign the exact bytes that go on the wire
        let body = serde_json::to_vec(&request)?;
        let signature = sign_payload(&body, &self.secret).ok_or_else(|| Error::Internal {
            operation: "sign batch request".to_string(),
        })?;
        let correlation_id = Uuid::new_v4().to_string();

        let request = self
            .client
            .post(self.endpoint("message/batch")?)
            .header(CONTENT_TYPE, JSON_API)
            .header(ACCEPT, JSON_API)
            .header(CORRELATION_ID_HEADER, correlation_id.as_str())
            .header(API_KEY_HEADER, self.api_key.as_str())
            .header(SIGNATURE_HEADER, signature)
            .body(body);

        let response = self.authorize(request).await?.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        debug!(status, %correlation_id, "Batch request completed");

        Ok(ProviderResponse {
            status,
            body,
            correlation_id,
        })
    }

    #[instrument(skip(self), err)]
    async fn fetch_read_references(&self, batch_id: &str) -> Result<Vec<MessageReference>> {
        let mut url = self.endpoint("statuses")?;
        url.query_pairs_mut()
            .append_pair("batchReference", batch_id)
            .append_pair("channel", &self.channel)
            .append_pair("supplierStatus", "read");

        let request = self.client.get(url).header(API_KEY_HEADER, self.api_key.as_str());
        let response = self.authorize(request).await?.send().await?;

        // The statuses endpoint answers 201 on success
        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let statuses: StatusesResponse = response.json().await?;
        Ok(statuses.data.into_iter().map(|entry| entry.message_reference).collect())
    }
}
