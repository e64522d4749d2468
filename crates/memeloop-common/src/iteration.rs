use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Meme specification produced by the specification stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemeSpec {
    #[serde(default)]
    pub topics_searched: Vec<String>,
    #[serde(default)]
    pub insights: String,
    #[serde(deserialize_with = "deserialize_template_id")]
    pub meme_template_id: u64,
    #[serde(default)]
    pub template_name: String,
    #[serde(default)]
    pub top_text: String,
    #[serde(default)]
    pub bottom_text: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TemplateId {
    Number(u64),
    Text(String),
}

/// Language models regularly quote numeric ids; accept both forms.
fn deserialize_template_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match TemplateId::deserialize(deserializer)? {
        TemplateId::Number(n) => Ok(n),
        TemplateId::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid meme_template_id '{}'", s))),
    }
}

/// How one iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationOutcome {
    Approved,
    Rejected,
    Errored,
}

impl std::fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationOutcome::Approved => write!(f, "approved"),
            IterationOutcome::Rejected => write!(f, "rejected"),
            IterationOutcome::Errored => write!(f, "errored"),
        }
    }
}

/// Immutable record of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub produced_spec: Option<MemeSpec>,
    pub artifact_reference: Option<String>,
    pub human_feedback: Option<String>,
    pub outcome: IterationOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// History of a single run, threaded through every stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationContext {
    pub initial_prompt: String,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
}

impl IterationContext {
    pub fn new(initial_prompt: impl Into<String>) -> Self {
        Self {
            initial_prompt: initial_prompt.into(),
            iterations: Vec::new(),
        }
    }

    pub fn push(&mut self, record: IterationRecord) {
        self.iterations.push(record);
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.iterations.last()
    }

    /// Non-empty reviewer feedback in the order it was given.
    pub fn feedback(&self) -> impl Iterator<Item = &str> {
        self.iterations
            .iter()
            .filter_map(|r| r.human_feedback.as_deref())
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }

    /// Plain-text digest of previous attempts for inclusion in prompts.
    ///
    /// Returns an empty string on the first iteration.
    pub fn render_history(&self) -> String {
        let mut out = String::new();
        for record in &self.iterations {
            let template = record
                .produced_spec
                .as_ref()
                .map(|s| s.template_name.as_str())
                .filter(|t| !t.is_empty())
                .unwrap_or("unknown");
            out.push_str(&format!(
                "- Iteration {} ({}): template {}",
                record.iteration, record.outcome, template
            ));
            if let Some(spec) = &record.produced_spec {
                out.push_str(&format!(
                    ", top \"{}\", bottom \"{}\"",
                    spec.top_text, spec.bottom_text
                ));
            }
            match record.human_feedback.as_deref().map(str::trim) {
                Some(f) if !f.is_empty() => out.push_str(&format!(", feedback: {}", f)),
                _ => out.push_str(", feedback: (none)"),
            }
            out.push('\n');
        }
        out
    }
}
