//! Aggregate benchmark metrics for a batched run.

use std::fmt;

use crate::request::Request;

/// Per-request outcome line for the final report.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub id: u64,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub finish_reason: &'static str,
}

/// Totals accumulated over all requests of a run.
#[derive(Debug, Default, Clone)]
pub struct BenchmarkMetrics {
    pub total_requests: usize,
    pub total_prompt_tokens: usize,
    pub total_generated_tokens: usize,
    pub total_prefill_time_ms: f64,
    pub total_decode_time_ms: f64,
    pub total_time_ms: f64,
    pub summaries: Vec<RequestSummary>,
}

impl BenchmarkMetrics {
    /// Fold one terminal request into the totals.
    pub fn add_request(&mut self, request: &Request) {
        self.total_requests += 1;
        self.total_prompt_tokens += request.num_prompt_tokens();
        self.total_generated_tokens += request.num_generated_tokens();
        self.total_prefill_time_ms += request.prefill_time_ms;
        self.total_decode_time_ms += request.decode_time_ms;
        self.summaries.push(RequestSummary {
            id: request.id,
            prompt_tokens: request.num_prompt_tokens(),
            generated_tokens: request.num_generated_tokens(),
            finish_reason: request.finish_reason.as_str(),
        });
    }

    #[must_use]
    pub fn prefill_tokens_per_sec(&self) -> f64 {
        per_second(self.total_prompt_tokens, self.total_prefill_time_ms)
    }

    #[must_use]
    pub fn decode_tokens_per_sec(&self) -> f64 {
        per_second(self.total_generated_tokens, self.total_decode_time_ms)
    }

    #[must_use]
    pub fn overall_tokens_per_sec(&self) -> f64 {
        per_second(
            self.total_prompt_tokens + self.total_generated_tokens,
            self.total_time_ms,
        )
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_second(tokens: usize, time_ms: f64) -> f64 {
    if time_ms > 0.0 {
        tokens as f64 * 1000.0 / time_ms
    } else {
        0.0
    }
}

impl fmt::Display for BenchmarkMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "========================================")?;
        writeln!(f, "         BENCHMARK RESULTS")?;
        writeln!(f, "========================================")?;
        writeln!(f, "Total requests:         {}", self.total_requests)?;
        writeln!(f, "Total prompt tokens:    {}", self.total_prompt_tokens)?;
        writeln!(f, "Total generated tokens: {}", self.total_generated_tokens)?;
        writeln!(f, "----------------------------------------")?;
        writeln!(f, "Prefill time:           {:.2} ms", self.total_prefill_time_ms)?;
        writeln!(f, "Decode time:            {:.2} ms", self.total_decode_time_ms)?;
        writeln!(f, "Total time:             {:.2} ms", self.total_time_ms)?;
        writeln!(f, "----------------------------------------")?;
        writeln!(
            f,
            "Prefill throughput:     {:.2} tokens/sec",
            self.prefill_tokens_per_sec()
        )?;
        writeln!(
            f,
            "Decode throughput:      {:.2} tokens/sec",
            self.decode_tokens_per_sec()
        )?;
        writeln!(
            f,
            "Overall throughput:     {:.2} tokens/sec",
            self.overall_tokens_per_sec()
        )?;
        writeln!(f, "----------------------------------------")?;
        for s in &self.summaries {
            writeln!(
                f,
                "Request {:>3}: {:>4} prompt + {:>4} generated ({})",
                s.id, s.prompt_tokens, s.generated_tokens, s.finish_reason
            )?;
        }
        write!(f, "========================================")
    }
}
