//! Embedding generation
//!
//! Providers turn text into fixed-length, L2-normalized vectors so that
//! cosine similarity reduces to a dot product.

use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use sluice_core::config::{EmbeddingProviderKind, SemanticConfig};

use super::SemanticError;

/// Trait for embedding providers
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>, SemanticError>;

    /// Generate embeddings for multiple texts (batch)
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name/identifier
    fn model_name(&self) -> &str;

    /// Cheap, in-process providers are called inline instead of on the
    /// blocking pool
    fn is_local(&self) -> bool {
        false
    }
}

/// Build the provider selected in `config`
pub fn provider_from_config(
    config: &SemanticConfig,
) -> Result<Arc<dyn EmbeddingProvider>, SemanticError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.embedding_provider {
        EmbeddingProviderKind::Keyword => Arc::new(KeywordProvider::new(config.embedding_dim)),
        EmbeddingProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
            config.embedding_api_key.clone(),
            config.embedding_endpoint.clone(),
            Duration::from_secs(config.embedding_timeout_secs),
        )?),
    };
    Ok(provider)
}

/// Scale `v` to unit length in place; zero vectors are left alone
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

// ============================================================================
// Keyword provider
// ============================================================================

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").expect("valid word regex"));

/// Hash-trick bag-of-words embedder.
///
/// Each word token increments the bucket chosen by a stable hash of the
/// token. Works with no external dependency and gives the same vectors in
/// every process, so persisted indexes stay valid across restarts.
pub struct KeywordProvider {
    dimension: usize,
}

impl KeywordProvider {
    /// Default dimension
    pub const DEFAULT_DIMENSION: usize = 256;

    /// Create a provider with `dimension` buckets
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a, 64 bit
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.dimension as u64) as usize
    }
}

impl Default for KeywordProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

impl EmbeddingProvider for KeywordProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, SemanticError> {
        let lowered = text.to_lowercase();
        let mut embedding = vec![0.0f32; self.dimension];
        for token in WORD.find_iter(&lowered) {
            embedding[self.bucket(token.as_str())] += 1.0;
        }
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "keyword-hash"
    }

    fn is_local(&self) -> bool {
        true
    }
}

// ============================================================================
// OpenAI provider
// ============================================================================

/// OpenAI-compatible embeddings endpoint
pub struct OpenAiProvider {
    api_key: String,
    endpoint: String,
    model: String,
    dimension: usize,
    client: reqwest::blocking::Client,
}

/// OpenAI API request format
#[derive(serde::Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    encoding_format: &'static str,
}

/// OpenAI API response format
#[derive(serde::Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(serde::Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI API error response
#[derive(serde::Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIErrorDetail,
}

#[derive(serde::Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

impl OpenAiProvider {
    const DEFAULT_ENDPOINT: &'static str = "https://api.openai.com/v1/embeddings";
    const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    /// Create a provider; the key falls back to `OPENAI_API_KEY`
    pub fn new(
        api_key: Option<String>,
        endpoint: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SemanticError> {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| SemanticError::ConfigError("OpenAI API key required".to_string()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                SemanticError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            api_key,
            endpoint: endpoint.unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string()),
            model: Self::DEFAULT_MODEL.to_string(),
            dimension: 1536,
            client,
        })
    }

    fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        let request = OpenAIRequest {
            model: &self.model,
            input: texts.to_vec(),
            encoding_format: "float",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .map_err(|e| SemanticError::EmbeddingFailed(format!("Request failed: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SemanticError::EmbeddingFailed(
                "Rate limited by embeddings API".to_string(),
            ));
        }

        if !status.is_success() {
            let error_body = response.text().unwrap_or_default();
            if let Ok(error_response) = serde_json::from_str::<OpenAIErrorResponse>(&error_body) {
                return Err(SemanticError::EmbeddingFailed(error_response.error.message));
            }
            return Err(SemanticError::EmbeddingFailed(format!(
                "HTTP {}: {}",
                status, error_body
            )));
        }

        let mut api_response: OpenAIResponse = response.json().map_err(|e| {
            SemanticError::EmbeddingFailed(format!("Failed to parse response: {}", e))
        })?;

        if api_response.data.len() != texts.len() {
            return Err(SemanticError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                api_response.data.len()
            )));
        }
        api_response.data.sort_by_key(|d| d.index);

        Ok(api_response
            .data
            .into_iter()
            .map(|d| {
                let mut v = d.embedding;
                l2_normalize(&mut v);
                v
            })
            .collect())
    }
}

impl EmbeddingProvider for OpenAiProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, SemanticError> {
        self.request(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| SemanticError::EmbeddingFailed("Empty response from API".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "openai-text-embedding-3-small"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_embedding_is_normalized() {
        let provider = KeywordProvider::new(64);
        let v = provider.embed("how many users are there").unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_keyword_embedding_is_deterministic() {
        let a = KeywordProvider::default().embed("Top 5 products").unwrap();
        let b = KeywordProvider::default().embed("top 5 PRODUCTS").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_keyword_similarity_orders_sensibly() {
        let provider = KeywordProvider::default();
        let q = provider.embed("how many users are there").unwrap();
        let near = provider.embed("how many users are registered").unwrap();
        let far = provider.embed("average order total by month").unwrap();
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_empty_text_gives_zero_vector() {
        let v = KeywordProvider::new(8).embed("   ").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_provider_from_config() {
        let config = SemanticConfig {
            embedding_dim: 32,
            ..Default::default()
        };
        let provider = provider_from_config(&config).unwrap();
        assert_eq!(provider.dimension(), 32);
        assert!(provider.is_local());
    }
}
