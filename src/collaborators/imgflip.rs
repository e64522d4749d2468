//! Image rendering through Imgflip's caption API.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use memeloop_common::MemeSpec;
use serde::Deserialize;

use crate::config::ImgflipConfig;
use crate::pipeline::ImageRenderer;

pub struct ImgflipRenderer {
    client: reqwest::Client,
    api_url: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CaptionResponse {
    success: bool,
    #[serde(default)]
    data: Option<CaptionData>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CaptionData {
    url: String,
}

impl ImgflipRenderer {
    pub fn new(client: reqwest::Client, config: &ImgflipConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone().filter(|p| !p.is_empty()),
        }
    }
}

#[async_trait]
impl ImageRenderer for ImgflipRenderer {
    async fn render(&self, spec: &MemeSpec) -> Result<String> {
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            bail!("IMGFLIP credentials not set (IMGFLIP_USERNAME / IMGFLIP_PASSWORD)");
        };
        tracing::info!(template_id = spec.meme_template_id, "captioning image");

        let template_id = spec.meme_template_id.to_string();
        let form = [
            ("template_id", template_id.as_str()),
            ("username", username.as_str()),
            ("password", password.as_str()),
            ("text0", spec.top_text.as_str()),
            ("text1", spec.bottom_text.as_str()),
        ];
        let response = self
            .client
            .post(&self.api_url)
            .form(&form)
            .send()
            .await
            .context("Failed to reach Imgflip")?
            .error_for_status()
            .context("Imgflip returned an error status")?
            .json::<CaptionResponse>()
            .await
            .context("Failed to parse Imgflip response")?;

        let url = caption_url(response)?;
        tracing::info!(url = %url, "image rendered");
        Ok(url)
    }
}

fn caption_url(response: CaptionResponse) -> Result<String> {
    if !response.success {
        bail!(
            "Imgflip API error: {}",
            response
                .error_message
                .unwrap_or_else(|| "Unknown error".to_string())
        );
    }
    response
        .data
        .map(|d| d.url)
        .ok_or_else(|| anyhow!("Imgflip response missing image url"))
}
