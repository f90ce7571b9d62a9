//! `InfraProvider` over the provider's HTTP API.
//!
//! Every call is fire-and-forget: a 2xx only means the request was accepted.
//! The outcome arrives later on the event stream, correlated by `identifier`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use vdi_common::{InfraConfig, ProvisionMode};

use crate::application::ports::{InfraProvider, InfraSpec};

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    base_vol_id: &'a str,
    vol_size: u32,
    flavor_id: &'a str,
    vol_type: &'a str,
    count: u32,
}

pub struct HttpInfraProvider {
    client: Client,
    base_url: String,
}

impl HttpInfraProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &InfraConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build infra HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `{base}[/{region}]{endpoint}`
    fn url(&self, region: Option<&str>, endpoint: &str) -> String {
        match region.map(|r| r.trim().trim_matches('/')).filter(|r| !r.is_empty()) {
            Some(region) => format!("{}/{region}{endpoint}", self.base_url),
            None => format!("{}{endpoint}", self.base_url),
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<()> {
        let response = request
            .send()
            .await
            .with_context(|| format!("{what}: request failed"))?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(%status, what, "infra request accepted");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{what}: provider returned {status}: {}", body.trim())
    }
}

fn provision_endpoint(mode: ProvisionMode) -> &'static str {
    match mode {
        ProvisionMode::Personal => "/vdi/provision_infra/personal",
        ProvisionMode::Organization => "/vdi/provision_infra/organization",
        ProvisionMode::AddResourceOrganization | ProvisionMode::AddResourcePersonal => {
            "/vdi/add_resource"
        }
    }
}

#[async_trait]
impl InfraProvider for HttpInfraProvider {
    async fn submit(
        &self,
        mode: ProvisionMode,
        spec: &InfraSpec,
        task_id: &str,
        region: Option<&str>,
    ) -> Result<()> {
        let body = ProvisionBody {
            base_vol_id: &spec.base_vol_id,
            vol_size: spec.vol_size,
            flavor_id: &spec.flavor_id,
            vol_type: &spec.vol_type,
            count: spec.count.max(1),
        };
        let request = self
            .client
            .post(self.url(region, provision_endpoint(mode)))
            .query(&[
                ("identifier", task_id),
                ("user_id", spec.user_id.as_str()),
                ("project_id", spec.project_id.as_str()),
            ])
            .json(&body);
        tracing::info!(task_id, %mode, count = body.count, "submitting infra request");
        self.send(request, "provision").await
    }

    async fn delete_instance(
        &self,
        instance_id: &str,
        task_id: &str,
        region: Option<&str>,
    ) -> Result<()> {
        let endpoint = format!("/vdi/delete_resource/{instance_id}");
        let request = self
            .client
            .request(Method::DELETE, self.url(region, &endpoint))
            .query(&[("identifier", task_id)]);
        self.send(request, "delete_resource").await
    }

    async fn destroy_project(
        &self,
        project_id: &str,
        task_id: &str,
        region: Option<&str>,
    ) -> Result<()> {
        let request = self
            .client
            .post(self.url(region, "/vdi/destroy_infra"))
            .query(&[("identifier", task_id), ("project_id", project_id)]);
        self.send(request, "destroy_infra").await
    }
}
