//! Client for the external mood-analysis service.
//!
//! The page text is sent to an OpenAI-compatible chat completion endpoint
//! together with the closed list of mood paths. The model answers with a JSON
//! object whose `sections` array carries verbatim start/end excerpts; those
//! are returned as [`MoodSpan`]s and mapped onto lines by
//! [`crate::mapping::map_spans`].

use std::{
    fmt,
    path::Path,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::{AnalysisConfig, MoodReaderError, Result};

/// Closed set of dot-delimited mood paths the model may choose from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoodCatalog {
    paths: Vec<String>,
}

impl MoodCatalog {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }

    /// Flattens a `{Category: {SubCategory: [Mood, ...]}}` tree into
    /// `Category.SubCategory.Mood` paths. Sub-categories given as objects
    /// contribute their keys as mood names.
    pub fn from_tree(tree: &Value) -> Self {
        let mut paths = Vec::new();
        let Some(categories) = tree.as_object() else {
            return Self::default();
        };

        for (category, sub_categories) in categories {
            let Some(sub_categories) = sub_categories.as_object() else {
                continue;
            };
            for (sub_category, moods) in sub_categories {
                match moods {
                    Value::Array(moods) => {
                        for mood in moods.iter().filter_map(Value::as_str) {
                            paths.push(format!("{category}.{sub_category}.{mood}"));
                        }
                    }
                    Value::Object(moods) => {
                        for mood in moods.keys() {
                            paths.push(format!("{category}.{sub_category}.{mood}"));
                        }
                    }
                    _ => {}
                }
            }
        }

        Self { paths }
    }

    /// Reads a mood tree from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let tree: Value = serde_json::from_str(&raw)?;
        Ok(Self::from_tree(&tree))
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Raw mood assertion as returned by the model. The excerpts are claimed to
/// be verbatim substrings of the analysed text but are not trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodSpan {
    #[serde(rename = "start", alias = "startExcerpt")]
    pub start_excerpt: String,
    #[serde(rename = "end", alias = "endExcerpt")]
    pub end_excerpt: String,
    #[serde(rename = "mood", alias = "moodPath")]
    pub mood_path: String,
    #[serde(
        default,
        rename = "audioRef",
        alias = "audioUrl",
        skip_serializing_if = "Option::is_none"
    )]
    pub audio_ref: Option<String>,
}

impl MoodSpan {
    pub fn new(
        start_excerpt: impl Into<String>,
        end_excerpt: impl Into<String>,
        mood_path: impl Into<String>,
    ) -> Self {
        Self {
            start_excerpt: start_excerpt.into(),
            end_excerpt: end_excerpt.into(),
            mood_path: mood_path.into(),
            audio_ref: None,
        }
    }
}

/// Transport seam: sends a prompt and returns the model's raw text answer.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Bearer-authenticated client for an OpenAI-compatible chat endpoint.
pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    api_key: RwLock<Option<String>>,
}

impl OpenAiBackend {
    pub fn new(config: &AnalysisConfig, api_key: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), config, api_key)
    }

    /// Useful for sharing a connection pool or pointing at a test server.
    pub fn with_client(
        client: reqwest::Client,
        config: &AnalysisConfig,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: RwLock::new(api_key),
        }
    }

    /// Replaces the credential after the user signed in again.
    pub fn set_api_key(&self, api_key: Option<String>) -> Result<()> {
        let mut slot = self
            .api_key
            .write()
            .map_err(|_| MoodReaderError::msg("credential has been poisoned"))?;
        *slot = api_key;
        Ok(())
    }

    fn credential(&self) -> Result<Option<String>> {
        let slot = self
            .api_key
            .read()
            .map_err(|_| MoodReaderError::msg("credential has been poisoned"))?;
        Ok(slot.clone())
    }
}

impl fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = self.credential()? {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(%status, "mood analysis response");

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %message, "mood analysis request rejected");
            return Err(MoodReaderError::from_status_code(status.as_u16(), message));
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(MoodReaderError::Parse(
                "no content received from the model".to_string(),
            ));
        }
        Ok(content)
    }
}

/// Stateless front end that turns page text into raw mood spans.
#[derive(Clone)]
pub struct MoodAnalyzer {
    backend: Arc<dyn CompletionBackend>,
    catalog: Arc<MoodCatalog>,
}

impl MoodAnalyzer {
    pub fn new(backend: Arc<dyn CompletionBackend>, catalog: MoodCatalog) -> Self {
        Self {
            backend,
            catalog: Arc::new(catalog),
        }
    }

    pub fn catalog(&self) -> &MoodCatalog {
        &self.catalog
    }

    pub fn build_prompt(&self, text: &str) -> String {
        let valid_paths = self.catalog.paths().join("\n");
        format!(
            "You are an expert literary mood analyst.\n\
             Your task is to divide the provided text into contiguous sections based on the shifting mood and tone.\n\n\
             For each section, you must choose EXACTLY ONE mood path from the list of valid paths provided below.\n\
             DO NOT create new paths. DO NOT misspell them.\n\n\
             Valid Mood Paths:\n{valid_paths}\n\n\
             Return a JSON object with a \"sections\" key containing an array of objects. Each object must have:\n\
             - \"start\": The exact starting sentence or phrase of the section.\n\
             - \"end\": The exact ending sentence or phrase of the section.\n\
             - \"mood\": The exact dot-notation path chosen from the list above.\n\n\
             The \"start\" and \"end\" values MUST be exact substrings from the provided text.\n\n\
             Text to Analyze (delimited by triple backticks):\n```\n{text}\n```\n\n\
             Return ONLY valid JSON.\n"
        )
    }

    /// Analyses one page worth of newline-joined text.
    ///
    /// Whitespace-only text never reaches the service. Spans naming a mood
    /// outside the catalog are kept (the resolver will find no audio for
    /// them) so positional order is preserved.
    pub async fn analyze(&self, text: &str) -> Result<Vec<MoodSpan>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let prompt = self.build_prompt(text);
        let raw = self.backend.complete(&prompt).await?;
        let spans = parse_sections(&raw)?;

        for span in spans.iter().filter(|s| !self.catalog.contains(&s.mood_path)) {
            warn!(mood = %span.mood_path, "model returned a mood outside the catalog");
        }
        debug!(sections = spans.len(), "mood analysis parsed");
        Ok(spans)
    }
}

impl fmt::Debug for MoodAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoodAnalyzer")
            .field("moods", &self.catalog.paths().len())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SectionsEnvelope {
    #[serde(default)]
    sections: Vec<MoodSpan>,
}

/// Parses the model answer, retrying once after stripping stray control
/// characters. The raw answer is logged when both attempts fail.
pub fn parse_sections(raw: &str) -> Result<Vec<MoodSpan>> {
    match serde_json::from_str::<SectionsEnvelope>(raw) {
        Ok(envelope) => Ok(envelope.sections),
        Err(first) => {
            warn!(error = %first, "mood analysis JSON rejected, sanitising control characters");
            let sanitised = strip_control_characters(raw);
            serde_json::from_str::<SectionsEnvelope>(&sanitised)
                .map(|envelope| envelope.sections)
                .map_err(|err| {
                    error!(error = %err, raw, "mood analysis response is not valid JSON");
                    MoodReaderError::Parse(err.to_string())
                })
        }
    }
}

/// Removes C0/C1 control characters except newline, carriage return and tab.
pub fn strip_control_characters(raw: &str) -> String {
    raw.chars().filter(|c| !is_stray_control(*c)).collect()
}

fn is_stray_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}'..='\u{9f}') && !matches!(c, '\n' | '\r' | '\t')
}
