//! Per-request state tracked across scheduling iterations.

use fornax::{SamplingParams, SequenceCache};

/// Lifecycle states of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Waiting in the pending queue.
    Pending,
    /// Consuming prompt tokens.
    Prefilling,
    /// Generating output tokens.
    Decoding,
    /// Reached a terminal condition successfully.
    Finished,
    /// Terminated by a runtime failure.
    Failed,
}

/// Why a request reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Still running.
    None,
    /// The model produced the end-of-sequence token.
    Eos,
    /// Hit the request's `max_tokens` limit.
    MaxTokens,
    /// Hit the model's maximum sequence length.
    MaxSeqLen,
    /// The block pool was exhausted mid-step.
    Oom,
}

impl FinishReason {
    /// Stable uppercase name used in reports and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Eos => "EOS",
            Self::MaxTokens => "MAX_TOKENS",
            Self::MaxSeqLen => "MAX_SEQ_LEN",
            Self::Oom => "OOM",
        }
    }
}

/// A single generation request and its progress cursors.
pub struct Request {
    /// Unique id, assigned at submission.
    pub id: u64,
    /// Prompt text; tokenized on registration when `prompt_tokens` is empty.
    pub prompt: String,
    /// Tokenized prompt (BOS included).
    pub prompt_tokens: Vec<u32>,
    pub sampling: SamplingParams,

    pub status: RequestStatus,
    /// Next sequence position to feed the model.
    pub current_pos: usize,
    /// Total tokens processed so far (prompt + generated); monotonic.
    pub num_computed_tokens: usize,
    /// Prompt tokens already consumed by chunked prefill.
    pub prefill_cursor: usize,
    /// Most recent input/output token id.
    pub last_token: u32,
    pub finish_reason: FinishReason,
    pub generated_tokens: Vec<u32>,

    /// Per-layer block tables for the paged KV cache.
    pub kv: SequenceCache,

    /// Decoded output text.
    pub output_text: String,

    pub prefill_time_ms: f64,
    pub decode_time_ms: f64,
    /// Delay before this request "arrives", for staggered submission.
    pub arrival_delay_ms: u64,
}

impl Request {
    /// Create a pending request for a model with `n_layers` layers.
    #[must_use]
    pub fn new(id: u64, prompt: impl Into<String>, sampling: SamplingParams, n_layers: usize) -> Self {
        Self {
            id,
            prompt: prompt.into(),
            prompt_tokens: Vec::new(),
            sampling,
            status: RequestStatus::Pending,
            current_pos: 0,
            num_computed_tokens: 0,
            prefill_cursor: 0,
            last_token: 0,
            finish_reason: FinishReason::None,
            generated_tokens: Vec::new(),
            kv: SequenceCache::new(id, n_layers),
            output_text: String::new(),
            prefill_time_ms: 0.0,
            decode_time_ms: 0.0,
            arrival_delay_ms: 0,
        }
    }

    /// Set a simulated arrival delay.
    #[must_use]
    pub fn with_arrival_delay(mut self, delay_ms: u64) -> Self {
        self.arrival_delay_ms = delay_ms;
        self
    }

    /// Use pre-tokenized prompt ids instead of tokenizing `prompt`.
    #[must_use]
    pub fn with_prompt_tokens(mut self, tokens: Vec<u32>) -> Self {
        self.prompt_tokens = tokens;
        self
    }

    #[must_use]
    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_tokens.len()
    }

    #[must_use]
    pub fn num_generated_tokens(&self) -> usize {
        self.generated_tokens.len()
    }

    /// Whether prompt tokens remain to be consumed.
    #[must_use]
    pub fn is_prefill(&self) -> bool {
        self.prefill_cursor < self.prompt_tokens.len()
    }

    /// Prompt tokens not yet consumed.
    #[must_use]
    pub fn remaining_prompt(&self) -> usize {
        self.prompt_tokens.len() - self.prefill_cursor
    }

    /// Whether the request may emit another token.
    #[must_use]
    pub fn can_generate_more(&self) -> bool {
        self.generated_tokens.len() < self.sampling.max_tokens
    }

    /// Whether the request reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.status, RequestStatus::Finished | RequestStatus::Failed)
    }
}
