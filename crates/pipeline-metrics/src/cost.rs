//! Credit pricing for language-model and speech-synthesis usage.
//!
//! Vendor prices are quoted in dollars; the service bills in credits. Every
//! conversion rounds up so a request is never undercharged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{CostInfo, RetrievalMetrics, TokenUsage, TtsMetrics, UserRequest};

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// System prompt and template overhead assumed for every request.
pub const ESTIMATED_BASE_PROMPT_TOKENS: u64 = 300;
const ESTIMATED_CHARS_PER_TOKEN: u64 = 3;
const ESTIMATED_TOKENS_PER_MEMORY: u64 = 50;
const ESTIMATED_TOKENS_PER_DOCUMENT: u64 = 100;
/// Assumed spoken length of one synthesized sentence.
pub const ESTIMATED_SENTENCE_AUDIO_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    /// Dollars per million prompt tokens.
    pub input_per_million: f64,
    /// Dollars per million completion tokens.
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingPrice {
    pub per_million: f64,
    pub batch_per_million: f64,
}

/// Read-only vendor pricing supplied through configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingTable {
    pub credits_per_dollar: f64,
    pub tts_price_per_100ms: f64,
    /// Tier used for models missing from `models`.
    pub default_price: ModelPrice,
    pub models: HashMap<String, ModelPrice>,
    pub embedding_models: HashMap<String, EmbeddingPrice>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let models = [
            ("gpt-5.2", ModelPrice::new(1.75, 14.00)),
            ("gpt-5.1", ModelPrice::new(1.25, 10.00)),
            ("gpt-5", ModelPrice::new(1.25, 10.00)),
            ("gpt-5-mini", ModelPrice::new(0.25, 2.00)),
            ("gpt-5-nano", ModelPrice::new(0.05, 0.40)),
            ("gpt-4.1", ModelPrice::new(2.00, 8.00)),
            ("gpt-4.1-mini", ModelPrice::new(0.40, 1.60)),
            ("gpt-4.1-nano", ModelPrice::new(0.10, 0.40)),
            ("gpt-4o-2024-05-13", ModelPrice::new(5.00, 15.00)),
            ("gpt-4o-mini", ModelPrice::new(0.150, 0.600)),
            ("gpt-4o", ModelPrice::new(2.50, 10.00)),
            ("gpt-4-turbo", ModelPrice::new(10.00, 30.00)),
            ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50)),
        ]
        .into_iter()
        .map(|(model, price)| (model.to_string(), price))
        .collect();

        let embedding_models = [
            ("text-embedding-3-small", 0.020, 0.010),
            ("text-embedding-3-large", 0.130, 0.065),
            ("text-embedding-ada-002", 0.100, 0.050),
        ]
        .into_iter()
        .map(|(model, per_million, batch_per_million)| {
            (
                model.to_string(),
                EmbeddingPrice {
                    per_million,
                    batch_per_million,
                },
            )
        })
        .collect();

        Self {
            credits_per_dollar: 10_000.0,
            tts_price_per_100ms: 0.00015,
            default_price: ModelPrice::new(0.150, 0.600),
            models,
            embedding_models,
        }
    }
}

impl PricingTable {
    /// Rejects negative or non-finite prices so the cost functions can only
    /// ever produce non-negative credits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_price("credits_per_dollar", self.credits_per_dollar)?;
        check_price("tts", self.tts_price_per_100ms)?;
        check_price("default", self.default_price.input_per_million)?;
        check_price("default", self.default_price.output_per_million)?;

        for (model, price) in &self.models {
            check_price(model, price.input_per_million)?;
            check_price(model, price.output_per_million)?;
        }
        for (model, price) in &self.embedding_models {
            check_price(model, price.per_million)?;
            check_price(model, price.batch_per_million)?;
        }
        Ok(())
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.models
            .get(model)
            .copied()
            .unwrap_or(self.default_price)
    }
}

fn check_price(model: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidPrice {
            model: model.to_string(),
            value,
        })
    }
}

/// Stateless credit calculator over a validated [`PricingTable`].
#[derive(Debug, Clone)]
pub struct CostModel {
    pricing: PricingTable,
}

impl CostModel {
    /// Validates `pricing` before accepting it.
    pub fn new(pricing: PricingTable) -> Result<Self, ConfigError> {
        pricing.validate()?;
        Ok(Self { pricing })
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Credits for one completion. Unknown models are billed at the default tier.
    pub fn llm_credits(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> u64 {
        let price = self.pricing.price_for(model);
        let dollars = (prompt_tokens as f64 / TOKENS_PER_MILLION) * price.input_per_million
            + (completion_tokens as f64 / TOKENS_PER_MILLION) * price.output_per_million;
        self.to_credits(dollars)
    }

    /// Credits for `audio_millis` of synthesized speech.
    pub fn tts_credits(&self, audio_millis: u64) -> u64 {
        let dollars = (audio_millis as f64 / 100.0) * self.pricing.tts_price_per_100ms;
        self.to_credits(dollars)
    }

    /// Unknown embedding models are free rather than billed at a guessed tier.
    pub fn embedding_credits(&self, model: &str, tokens: u64, batch: bool) -> u64 {
        let Some(price) = self.pricing.embedding_models.get(model) else {
            return 0;
        };
        let per_million = if batch {
            price.batch_per_million
        } else {
            price.per_million
        };
        self.to_credits((tokens as f64 / TOKENS_PER_MILLION) * per_million)
    }

    /// LLM and TTS credits for one pipeline; no audio means no TTS charge.
    pub fn cost_info(
        &self,
        model: &str,
        usage: TokenUsage,
        audio_millis: Option<u64>,
    ) -> CostInfo {
        let llm = self.llm_credits(model, usage.prompt_tokens(), usage.completion_tokens());
        let tts = audio_millis.map_or(0, |millis| self.tts_credits(millis));
        CostInfo::new(llm, tts)
    }

    /// Prompt size guessed from the request and its retrieved context, for
    /// pipelines whose vendor reported no token usage.
    pub fn estimate_prompt_tokens(
        &self,
        request: &UserRequest,
        retrieval: &RetrievalMetrics,
    ) -> u64 {
        ESTIMATED_BASE_PROMPT_TOKENS
            .saturating_add(request.input_length / ESTIMATED_CHARS_PER_TOKEN)
            .saturating_add(retrieval.memory_count.saturating_mul(ESTIMATED_TOKENS_PER_MEMORY))
            .saturating_add(
                retrieval
                    .document_count
                    .saturating_mul(ESTIMATED_TOKENS_PER_DOCUMENT),
            )
    }

    /// Audio length guessed from the number of synthesized sentences.
    pub fn estimate_audio_ms(&self, tts: &TtsMetrics) -> u64 {
        tts.sentence_count.saturating_mul(ESTIMATED_SENTENCE_AUDIO_MS)
    }

    fn to_credits(&self, dollars: f64) -> u64 {
        let credits = (dollars * self.pricing.credits_per_dollar).ceil();
        debug_assert!(credits >= 0.0, "validated pricing produced negative credits");
        // Float-to-int `as` saturates, so huge inputs clamp to u64::MAX.
        credits as u64
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            pricing: PricingTable::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_cost_nothing() {
        let model = CostModel::default();
        assert_eq!(model.llm_credits("gpt-4o", 0, 0), 0);
        assert_eq!(model.tts_credits(0), 0);
    }

    #[test]
    fn llm_credits_round_up() {
        let model = CostModel::default();
        // 1000 * 0.15 / 1e6 = 0.00015 dollars = 1.5 credits
        assert_eq!(model.llm_credits("gpt-4o-mini", 1_000, 0), 2);
        // 1e6 * 2.50 / 1e6 + 1e6 * 10.0 / 1e6 = 12.5 dollars
        assert_eq!(model.llm_credits("gpt-4o", 1_000_000, 1_000_000), 125_000);
    }

    #[test]
    fn unknown_models_use_default_tier() {
        let model = CostModel::default();
        assert_eq!(
            model.llm_credits("some-future-model", 10_000, 2_000),
            model.llm_credits("gpt-4o-mini", 10_000, 2_000)
        );
    }

    #[test]
    fn llm_credits_are_monotonic_in_both_token_counts() {
        let model = CostModel::default();
        let steps = [0_u64, 1, 7, 99, 1_000, 12_345, 250_000, 1_000_000];
        for name in ["gpt-5", "gpt-4o-mini", "unknown"] {
            for &prompt in &steps {
                for window in steps.windows(2) {
                    assert!(
                        model.llm_credits(name, prompt, window[0])
                            <= model.llm_credits(name, prompt, window[1])
                    );
                    assert!(
                        model.llm_credits(name, window[0], prompt)
                            <= model.llm_credits(name, window[1], prompt)
                    );
                }
            }
        }
    }

    #[test]
    fn tts_credits_are_monotonic() {
        let model = CostModel::default();
        let mut previous = 0;
        for millis in (0..20_000).step_by(37) {
            let credits = model.tts_credits(millis);
            assert!(credits >= previous);
            previous = credits;
        }
        // 3000ms = 30 * 0.00015 dollars = 45 credits
        assert_eq!(model.tts_credits(3_000), 45);
    }

    #[test]
    fn embedding_credits_ignore_unknown_models() {
        let model = CostModel::default();
        assert_eq!(model.embedding_credits("mystery", 1_000_000, false), 0);
        let small = "text-embedding-3-small";
        assert_eq!(model.embedding_credits(small, 1_000_000, false), 200);
        assert_eq!(model.embedding_credits(small, 1_000_000, true), 100);
    }

    #[test]
    fn cost_info_totals_llm_and_tts() {
        let model = CostModel::default();
        let cost = model.cost_info("gpt-4o", TokenUsage::new(1_000_000, 0), Some(3_000));
        assert_eq!(cost.llm_credits(), 25_000);
        assert_eq!(cost.tts_credits(), 45);
        assert_eq!(cost.total_credits(), 25_045);
    }

    #[test]
    fn prompt_estimate_counts_input_and_context() {
        let model = CostModel::default();
        let request = UserRequest {
            input_length: 90,
            input_preview: None,
        };
        let retrieval = RetrievalMetrics {
            memory_count: 2,
            document_count: 3,
            retrieval_time_ms: 0,
        };
        // 300 + 90 / 3 + 2 * 50 + 3 * 100
        assert_eq!(model.estimate_prompt_tokens(&request, &retrieval), 730);
        assert_eq!(
            model.estimate_prompt_tokens(&UserRequest::default(), &RetrievalMetrics::default()),
            ESTIMATED_BASE_PROMPT_TOKENS
        );
    }

    #[test]
    fn audio_estimate_is_three_seconds_per_sentence() {
        let model = CostModel::default();
        let tts = TtsMetrics {
            sentence_count: 4,
            ..TtsMetrics::default()
        };
        assert_eq!(model.estimate_audio_ms(&tts), 12_000);
        assert_eq!(model.estimate_audio_ms(&TtsMetrics::default()), 0);
    }

    #[test]
    fn negative_prices_are_rejected() {
        let mut pricing = PricingTable::default();
        pricing
            .models
            .insert("broken".to_string(), ModelPrice::new(-1.0, 2.0));
        assert!(CostModel::new(pricing).is_err());

        let pricing = PricingTable {
            tts_price_per_100ms: f64::NAN,
            ..PricingTable::default()
        };
        assert!(CostModel::new(pricing).is_err());
    }
}
