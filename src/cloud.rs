//! Identity-provider client. Authenticates drones on connect and validates
//! operator credentials for the REST facade.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct DroneInfoResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub user: Value,
    #[serde(default)]
    pub drone: Value,
}

pub struct CloudClient {
    base_url: String,
    http: reqwest::Client,
}

impl CloudClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Asks the identity provider for drone + user metadata given the drone's
    /// link credentials. A non-200 response surfaces the provider's error text.
    pub async fn request_drone_info(
        &self,
        serial: &str,
        sim_id: &str,
        email: &str,
        password: &str,
    ) -> Result<DroneInfoResponse> {
        let body = serde_json::json!({
            "serialId": serial,
            "simId": sim_id,
            "email": email,
            "password": password,
        });

        let resp = self
            .http
            .post(format!("{}/rt/droneinfo", self.base_url))
            .json(&body)
            .send()
            .await
            .context("identity provider unreachable")?;

        if resp.status().is_success() {
            Ok(resp
                .json::<DroneInfoResponse>()
                .await
                .context("bad droneinfo response body")?)
        } else {
            Err(anyhow!(Self::error_text(resp).await))
        }
    }

    /// Authenticated GET against the provider's API. Used both to validate
    /// operator credentials and to fetch drone metadata in one call.
    pub async fn request_api_get(&self, path: &str, email: &str, key: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("User-Email", email)
            .header("User-Key", key)
            .send()
            .await
            .context("identity provider unreachable")?;

        if resp.status().is_success() {
            Ok(resp.json::<Value>().await.context("bad response body")?)
        } else {
            Err(anyhow!(Self::error_text(resp).await))
        }
    }

    async fn error_text(resp: reqwest::Response) -> String {
        match resp.json::<Value>().await {
            Ok(v) => v
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("identity provider rejected the request")
                .to_string(),
            Err(_) => "identity provider rejected the request".to_string(),
        }
    }
}
