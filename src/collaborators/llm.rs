//! Meme specification writing through an OpenAI-compatible chat endpoint.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use memeloop_common::{IterationContext, MemeSpec};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::pipeline::SpecWriter;

static CODE_FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());

/// A caption template known to the renderer.
#[derive(Debug, Clone, Copy)]
pub struct Template {
    pub name: &'static str,
    pub id: u64,
    pub logic: &'static str,
}

pub const TEMPLATES: &[Template] = &[
    Template { name: "Drake Hotline Bling", id: 181913649, logic: "Preference: reject the top thing, embrace the bottom thing" },
    Template { name: "Distracted Boyfriend", id: 112126428, logic: "Abandoning something reliable for something new and shiny" },
    Template { name: "Two Buttons", id: 87743020, logic: "Sweating over two mutually exclusive options" },
    Template { name: "Change My Mind", id: 129242436, logic: "A hot take stated as fact" },
    Template { name: "Expanding Brain", id: 93895088, logic: "Escalating from normal to absurdly over-engineered" },
    Template { name: "Left Exit 12 Off Ramp", id: 124822590, logic: "Swerving off the sensible path toward chaos" },
    Template { name: "Batman Slapping Robin", id: 438680, logic: "Shutting down a bad suggestion" },
    Template { name: "Mocking SpongeBob", id: 102156234, logic: "Repeating something dumb in a mocking voice" },
    Template { name: "Woman Yelling At Cat", id: 188390779, logic: "Angry accusation versus oblivious confusion" },
    Template { name: "This Is Fine", id: 55311130, logic: "Calm denial while everything burns" },
    Template { name: "One Does Not Simply", id: 61579, logic: "A task far harder than it looks" },
    Template { name: "Hard To Swallow Pills", id: 135256802, logic: "An uncomfortable truth" },
    Template { name: "Tuxedo Winnie The Pooh", id: 178591752, logic: "Plain version versus fancy version of the same thing" },
    Template { name: "Panik Kalm Panik", id: 222403160, logic: "Bad news, relief, then worse news" },
    Template { name: "Buff Doge vs. Cheems", id: 247375501, logic: "Strong past versus weak present" },
    Template { name: "Trade Offer", id: 309868304, logic: "A lopsided exchange" },
    Template { name: "Clown Applying Makeup", id: 195515965, logic: "Step-by-step descent into foolishness" },
    Template { name: "Is This A Pigeon", id: 100777631, logic: "Confidently misidentifying something" },
    Template { name: "Boardroom Meeting Suggestion", id: 444501, logic: "The voice of reason gets thrown out" },
    Template { name: "Epic Handshake", id: 135678846, logic: "Two unlikely groups agreeing on one thing" },
    Template { name: "Sad Pablo Escobar", id: 8072285, logic: "Lonely waiting and boredom" },
    Template { name: "Disaster Girl", id: 370867422, logic: "Smiling at chaos you caused" },
    Template { name: "Running Away Balloon", id: 131940431, logic: "Held back from a goal by an obstacle" },
    Template { name: "Uno Draw 25 Cards", id: 217743513, logic: "Doing anything to avoid a simple task" },
    Template { name: "Always Has Been", id: 252600902, logic: "Realizing it was true all along" },
    Template { name: "Waiting Skeleton", id: 4087833, logic: "Waiting forever" },
    Template { name: "They're The Same Picture", id: 180190441, logic: "Two supposedly different things that are identical" },
    Template { name: "Monkey Puppet", id: 161865971, logic: "Awkwardly looking away" },
    Template { name: "Anakin Padme 4 Panel", id: 322841258, logic: "A naive plan and a worried follow-up question" },
    Template { name: "Star Wars Yoda", id: 14371066, logic: "Wise but backwards advice" },
];

const SYSTEM_PROMPT: &str = "You write meme specifications. Reply with a single JSON object and nothing else.

The object has these fields:
  topics_searched: array of strings, the discussion topics you drew on
  insights: one or two sentences on what people are saying
  meme_template_id: numeric id from the template list
  template_name: name from the template list
  top_text: caption for the first slot
  bottom_text: caption for the second slot
  reasoning: why this template and text fit

Match the template to the emotional tone of the material, not just its subject.
Keep captions short enough to read at a glance.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

pub struct ChatSpecWriter {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
}

impl ChatSpecWriter {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Self {
        let api_key = config.api_key();
        if api_key.is_none() {
            tracing::warn!(env = %config.api_key_env, "no LLM API key set; requests go out unauthenticated");
        }
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl SpecWriter for ChatSpecWriter {
    async fn write_spec(
        &self,
        prompt: &str,
        mined: &str,
        ctx: &IterationContext,
    ) -> Result<MemeSpec> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: format!("{}\n\n{}", SYSTEM_PROMPT, template_catalogue()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_spec_prompt(prompt, mined, ctx),
                },
            ],
            temperature: self.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .context("Failed to reach the language model")?
            .error_for_status()
            .context("Language model returned an error status")?
            .json::<ChatResponse>()
            .await
            .context("Failed to parse chat completion response")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("Chat completion had no choices"))?;
        tracing::debug!(content = %content, "raw meme spec");

        let mut spec = parse_meme_spec(&content)?;
        resolve_template(&mut spec);
        Ok(spec)
    }
}

pub fn template_catalogue() -> String {
    let mut out = String::from("Available templates:\n");
    for t in TEMPLATES {
        out.push_str(&format!("- {} (id {}): {}\n", t.name, t.id, t.logic));
    }
    out
}

/// User message for one attempt: the topic, mined material and, after the
/// first iteration, what the reviewer disliked.
pub fn build_spec_prompt(prompt: &str, mined: &str, ctx: &IterationContext) -> String {
    let mut out = format!("Topic: {}\n\nReddit material:\n{}\n", prompt.trim(), mined.trim());
    if !ctx.is_empty() {
        out.push_str("\nPrevious attempts and reviewer feedback:\n");
        out.push_str(&ctx.render_history());
        out.push_str(
            "\nDo not repeat a rejected template and caption. Address the feedback directly.\n",
        );
    }
    out
}

/// Extract a [`MemeSpec`] from model output, tolerating code fences and
/// surrounding prose.
pub fn parse_meme_spec(text: &str) -> Result<MemeSpec> {
    let candidate = match CODE_FENCE_REGEX.captures(text) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()).trim(),
        None => text.trim(),
    };
    if let Ok(spec) = serde_json::from_str::<MemeSpec>(candidate) {
        return Ok(spec);
    }

    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if end > start => serde_json::from_str(&text[start..=end])
            .context("Model output contained malformed meme spec JSON"),
        _ => bail!("Model output did not contain a JSON meme spec"),
    }
}

/// Correct the template id when the model named a known template but
/// mismatched its id.
fn resolve_template(spec: &mut MemeSpec) {
    if TEMPLATES.iter().any(|t| t.id == spec.meme_template_id) {
        return;
    }
    let wanted = spec.template_name.trim().to_lowercase();
    if let Some(t) = TEMPLATES.iter().find(|t| t.name.to_lowercase() == wanted) {
        tracing::debug!(from = spec.meme_template_id, to = t.id, "corrected template id");
        spec.meme_template_id = t.id;
    }
}
