//! HTTP-boundary implementation of `PlannerAdapter` (§4.6).

use async_trait::async_trait;
use galaxy_common::error::{Error, Result};
use galaxy_core::constellation::EditBatch;
use galaxy_core::planner::{DagSpec, PlannerAdapter, ReplanContext};
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use tracing::instrument;

pub struct HttpPlannerAdapter {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<Secret<String>>,
}

impl HttpPlannerAdapter {
    pub fn new(endpoint: String, model: String, api_key: Option<Secret<String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            model,
            api_key,
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), path);
        let mut builder = self.client.post(url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        builder
    }
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    goal: &'a str,
    model: &'a str,
}

#[derive(Serialize)]
struct EditRequest<'a> {
    model: &'a str,
    #[serde(flatten)]
    context: &'a ReplanContext,
}

#[async_trait]
impl PlannerAdapter for HttpPlannerAdapter {
    #[instrument(skip(self))]
    async fn create(&self, goal: &str) -> Result<DagSpec> {
        let response = self
            .request("create")
            .json(&CreateRequest {
                goal,
                model: &self.model,
            })
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Planner(e.to_string()))?;

        response
            .json::<DagSpec>()
            .await
            .map_err(|e| Error::PlannerDag(e.to_string()))
    }

    #[instrument(skip(self, context))]
    async fn edit(&self, context: ReplanContext) -> Result<EditBatch> {
        let response = self
            .request("edit")
            .json(&EditRequest {
                model: &self.model,
                context: &context,
            })
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Planner(e.to_string()))?;

        response
            .json::<EditBatch>()
            .await
            .map_err(|e| Error::PlannerDag(e.to_string()))
    }
}
