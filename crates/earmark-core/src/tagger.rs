use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::Batch;
use crate::opportunity::{GrantRecord, TagRecord, TagSchema};

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Completion service error (HTTP {status}): {body}")]
    Service { status: u16, body: String },
    #[error("Completion response contained no choices")]
    EmptyChoices,
}

pub type CompletionResult<T> = Result<T, CompletionError>;

#[derive(Debug, Error)]
pub enum TaggingError {
    #[error("Batch {batch}: failed to encode records for the prompt: {source}")]
    Context {
        batch: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Batch {batch}: completion request failed: {source}")]
    Completion {
        batch: usize,
        #[source]
        source: CompletionError,
    },
    #[error("Batch {batch}: response contains no JSON array")]
    MissingArray { batch: usize, raw: String },
    #[error("Batch {batch}: response is not a JSON array of tag records: {source}")]
    UnparseableResponse {
        batch: usize,
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TaggingError {
    /// Index of the batch the error belongs to.
    #[must_use]
    pub fn batch(&self) -> usize {
        match self {
            Self::Context { batch, .. }
            | Self::Completion { batch, .. }
            | Self::MissingArray { batch, .. }
            | Self::UnparseableResponse { batch, .. } => *batch,
        }
    }
}

pub type TaggingResult<T> = Result<T, TaggingError>;

/// A chat completion backend. The pipeline needs one prompt in, one text
/// out, and nothing else.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> CompletionResult<String>;

    fn model_name(&self) -> &str;
}

/// Connection settings for an OpenAI-compatible chat completion service.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            model: "anthropic.claude-3-sonnet-20240229-v1:0".to_string(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

/// Client for vLLM, OpenAI, and compatible gateways.
pub struct HttpCompletionClient {
    http_client: reqwest::Client,
    config: CompletionConfig,
}

impl HttpCompletionClient {
    pub fn new(config: CompletionConfig) -> CompletionResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            config,
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str) -> CompletionResult<String> {
        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            temperature: f32,
            max_tokens: u32,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }

        #[derive(Deserialize)]
        struct ChatChoice {
            message: ResponseMessage,
        }

        #[derive(Deserialize)]
        struct ResponseMessage {
            content: String,
        }

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.config.url.trim_end_matches('/')
        );
        let mut req = self.http_client.post(&url).json(&request);
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Service { status, body });
        }

        let chat_response: ChatResponse = response.json().await?;
        chat_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(CompletionError::EmptyChoices)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

const PROMPT_HEADER: &str =
    "You are given a document containing grants information as context. \
     Use this context to perform the following tasks:";

const CLASSIFICATION_TASKS: &str = r#" Task 0: Get me the ID [OpportunityId]
 Task 1: Extract Research Type Tags
 Identify and categorize each grant based on the type of research it supports. Assign one or more of the following tags to each grant based on the descriptions provided:

 - Clinical: Grants supporting research involving direct clinical trials on humans.
 - Non-Clinical: Grants focused on theoretical research, technology development, or other research activities that do not involve preclinical or clinical studies.

 Task 2: Extract SBIR Tags
 Determine the SBIR tags of company or organization that each grant targets. Use the descriptions within the grants to assign one of the following tags:

 - SBIR: Small Business Innovation Research program grants targeted at small businesses.
 - STTR: Small Business Technology Transfer program grants designed to facilitate cooperation between small businesses and research institutions.
 - SBIR/STTR: Grants that are part of both SBIR and STTR programs.
 - Non-SBIR/STTR: Grants that are not part of the SBIR or STTR programs.

 Task 3: Identify the company type tags of each grant.
 - Academic
 - For Profit
 - Non Profit

 Task 4: Identify the country-based eligibility.
 Review the grant documentation to ascertain the geographic eligibility of applicants. Specify which countries or regions are allowed to apply, based on the legal registration and operational mandates mentioned in the grant.

 Task 5: Identify the country operation eligibility.
 Determine and list the countries in which the funded activities can be conducted. Check the grant details for any mention of specific geographic limitations or preferences regarding where the grant-funded projects or operations can take place."#;

const IDENTITY_TASKS: &str = r" Task 6: Get me the 'opportunityTitle'
 Task 7: Get me the 'agencyCode'";

const CORE_EXAMPLE: &str = r#"[{"id":"string","researchTypeTags":["string"],"sbirTags":["string"],"companyTypeTags":["string"],"countryBasedEligibility":["string"],"countryOperationEligibility":["string"]}]"#;

const EXTENDED_EXAMPLE: &str = r#"[{"id":"string","researchTypeTags":["string"],"sbirTags":["string"],"companyTypeTags":["string"],"countryBasedEligibility":["string"],"countryOperationEligibility":["string"],"opportunityTitle":"string","agencyCode":"string"}]"#;

/// Classifies batches of grant records through a completion service.
pub struct GrantTagger {
    client: Arc<dyn CompletionClient>,
    schema: TagSchema,
}

impl GrantTagger {
    #[must_use]
    pub fn new(client: Arc<dyn CompletionClient>, schema: TagSchema) -> Self {
        Self { client, schema }
    }

    /// Render the tagging prompt for one batch. The records are embedded as
    /// a JSON array holding only their projected fields.
    pub fn render_prompt(&self, records: &[GrantRecord]) -> serde_json::Result<String> {
        let context = serde_json::to_string(records)?;
        let mut prompt = format!("{PROMPT_HEADER}\n\nGrants: {context}\n\nFor every grant:\n");
        prompt.push_str(CLASSIFICATION_TASKS);
        if self.schema.includes_identity_fields() {
            prompt.push('\n');
            prompt.push_str(IDENTITY_TASKS);
        }
        let example = match self.schema {
            TagSchema::Core => CORE_EXAMPLE,
            TagSchema::Extended => EXTENDED_EXAMPLE,
        };
        prompt.push_str(&format!(
            "\n\nReturn your output as a JSON array with exactly one object per grant, \
             in the same order as the input. No explanation required.\n\
             Example Output: {example}"
        ));
        Ok(prompt)
    }

    /// Tag one batch of records. Returns the parsed tag records in response
    /// order; every error carries the batch index and, for response
    /// failures, the raw text for diagnosis.
    pub async fn tag_batch(&self, batch: &Batch<GrantRecord>) -> TaggingResult<Vec<TagRecord>> {
        let prompt = self
            .render_prompt(&batch.records)
            .map_err(|source| TaggingError::Context {
                batch: batch.index,
                source,
            })?;

        tracing::debug!(
            batch = batch.index,
            records = batch.records.len(),
            model = self.client.model_name(),
            "requesting tags"
        );

        let response =
            self.client
                .complete(&prompt)
                .await
                .map_err(|source| TaggingError::Completion {
                    batch: batch.index,
                    source,
                })?;

        parse_tag_response(batch.index, &response)
    }
}

/// Parse a completion response into tag records.
///
/// The response must contain one JSON array with one object per grant.
/// Markdown fences and surrounding prose are tolerated by extracting the
/// outermost bracketed span. A bare object is rejected rather than wrapped,
/// so a response that collapsed the whole batch into one record cannot
/// masquerade as a valid result.
pub fn parse_tag_response(batch: usize, response: &str) -> TaggingResult<Vec<TagRecord>> {
    let Some(array) = extract_json_array(response) else {
        return Err(TaggingError::MissingArray {
            batch,
            raw: response.to_string(),
        });
    };
    serde_json::from_str(array).map_err(|source| TaggingError::UnparseableResponse {
        batch,
        raw: response.to_string(),
        source,
    })
}

fn extract_json_array(response: &str) -> Option<&str> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    (start < end).then(|| &response[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticClient {
        response: String,
    }

    #[async_trait]
    impl CompletionClient for StaticClient {
        async fn complete(&self, _prompt: &str) -> CompletionResult<String> {
            Ok(self.response.clone())
        }

        fn model_name(&self) -> &str {
            "static-test-model"
        }
    }

    struct FailingClient;

    #[async_trait]
    impl CompletionClient for FailingClient {
        async fn complete(&self, _prompt: &str) -> CompletionResult<String> {
            Err(CompletionError::Service {
                status: 503,
                body: "overloaded".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "failing-test-model"
        }
    }

    fn record(id: &str) -> GrantRecord {
        GrantRecord::new(
            Some(id.to_string()),
            format!("Title for {id}"),
            "A synopsis.".to_string(),
        )
    }

    fn batch_of(ids: &[&str]) -> Batch<GrantRecord> {
        Batch {
            index: 3,
            records: ids.iter().map(|id| record(id)).collect(),
        }
    }

    fn tagger(client: impl CompletionClient + 'static, schema: TagSchema) -> GrantTagger {
        GrantTagger::new(Arc::new(client), schema)
    }

    #[test]
    fn prompt_embeds_records_and_tasks() {
        let t = tagger(
            StaticClient {
                response: String::new(),
            },
            TagSchema::Core,
        );
        let prompt = t
            .render_prompt(&[record("GRANT-1"), record("GRANT-2")])
            .unwrap();

        assert!(prompt.contains(r#""id":"GRANT-1""#));
        assert!(prompt.contains(r#""id":"GRANT-2""#));
        assert!(prompt.contains("Extract Research Type Tags"));
        assert!(prompt.contains("countryOperationEligibility"));
        assert!(prompt.contains("JSON array with exactly one object per grant"));
        assert!(!prompt.contains("opportunityTitle\":\"string\""));
    }

    #[test]
    fn extended_prompt_requests_identity_fields() {
        let t = tagger(
            StaticClient {
                response: String::new(),
            },
            TagSchema::Extended,
        );
        let prompt = t.render_prompt(&[record("GRANT-1")]).unwrap();

        assert!(prompt.contains("Get me the 'opportunityTitle'"));
        assert!(prompt.contains("Get me the 'agencyCode'"));
        assert!(prompt.contains(r#""opportunityTitle":"string""#));
    }

    #[test]
    fn prompt_omits_internal_bookkeeping() {
        let t = tagger(
            StaticClient {
                response: String::new(),
            },
            TagSchema::Core,
        );
        let prompt = t.render_prompt(&[record("GRANT-1")]).unwrap();

        assert!(!prompt.contains("internal"));
        assert!(!prompt.contains("provenance"));
    }

    #[tokio::test]
    async fn tags_a_batch_from_an_array_response() {
        let response = r#"[
            {"id": "GRANT-1", "researchTypeTags": ["Non-Clinical"], "sbirTags": ["SBIR"]},
            {"id": "GRANT-2", "researchTypeTags": ["Clinical"]}
        ]"#;
        let t = tagger(
            StaticClient {
                response: response.to_string(),
            },
            TagSchema::Core,
        );

        let tags = t.tag_batch(&batch_of(&["GRANT-1", "GRANT-2"])).await.unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].business_id, "GRANT-1");
        assert!(tags[0].research_type_tags.contains("Non-Clinical"));
        assert!(tags[1].research_type_tags.contains("Clinical"));
    }

    #[tokio::test]
    async fn tolerates_markdown_fences() {
        let response = "```json\n[{\"id\": \"GRANT-1\"}]\n```";
        let t = tagger(
            StaticClient {
                response: response.to_string(),
            },
            TagSchema::Core,
        );

        let tags = t.tag_batch(&batch_of(&["GRANT-1"])).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].business_id, "GRANT-1");
    }

    #[tokio::test]
    async fn rejects_a_bare_object_response() {
        let response = r#"{"id": "GRANT-1"}"#;
        let t = tagger(
            StaticClient {
                response: response.to_string(),
            },
            TagSchema::Core,
        );

        let err = t.tag_batch(&batch_of(&["GRANT-1"])).await.unwrap_err();
        match err {
            TaggingError::MissingArray { batch, raw } => {
                assert_eq!(batch, 3);
                assert_eq!(raw, response);
            }
            other => panic!("expected MissingArray, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_an_object_with_array_fields() {
        // A collapsed batch: one object whose arrays lure the extractor.
        let response = r#"{"id": "GRANT-1", "researchTypeTags": ["Clinical"]}"#;
        let t = tagger(
            StaticClient {
                response: response.to_string(),
            },
            TagSchema::Core,
        );

        let err = t.tag_batch(&batch_of(&["GRANT-1"])).await.unwrap_err();
        match err {
            TaggingError::UnparseableResponse { raw, .. } => assert_eq!(raw, response),
            other => panic!("expected UnparseableResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_failures_carry_the_batch_index() {
        let t = tagger(FailingClient, TagSchema::Core);

        let err = t.tag_batch(&batch_of(&["GRANT-1"])).await.unwrap_err();
        assert_eq!(err.batch(), 3);
        assert!(matches!(err, TaggingError::Completion { .. }));
    }

    #[test]
    fn extracts_outermost_array_span() {
        assert_eq!(extract_json_array("noise [1, 2] noise"), Some("[1, 2]"));
        assert_eq!(extract_json_array("no brackets"), None);
        assert_eq!(extract_json_array("] reversed ["), None);
    }
}
