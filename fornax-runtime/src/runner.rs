//! Continuous-batching execution loop.
//!
//! One iteration: drain newly arrived requests into the scheduler, form a
//! batch, execute it by stepping each member through the single-sequence
//! engine (a prompt chunk for prefill batches, one sampled token for decode
//! batches), then retire requests that hit a termination condition. The
//! loop exits once the intake producer is done and the scheduler is idle.
//!
//! Failures are isolated per request: a step that runs out of KV blocks
//! marks only that request as failed (`Oom`), frees its blocks, and the
//! remaining requests continue.

use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use fornax::{Error, Result, Sampler, StepEngine, Tokenizer};

use crate::intake::RequestIntake;
use crate::metrics::BenchmarkMetrics;
use crate::request::{FinishReason, Request, RequestStatus};
use crate::scheduler::{BatchKind, ScheduledBatch, Scheduler, SchedulerConfig};

/// How long the runner sleeps on the intake when it has nothing to do.
const IDLE_WAIT: Duration = Duration::from_millis(10);

enum StepOutcome {
    Ok,
    Oom,
    Overflow,
}

/// Drives many requests through one step engine with continuous batching.
pub struct BatchedRunner<'a> {
    engine: &'a mut StepEngine,
    tokenizer: Option<&'a Tokenizer>,
    scheduler: Scheduler,
    /// All requests ever registered, keyed by id; terminal requests stay
    /// here for the final report.
    requests: HashMap<u64, Request>,
    /// One sampler per in-flight request, seeded `base_seed + request_id`.
    samplers: HashMap<u64, Sampler>,
    base_seed: u64,
    streaming: bool,
}

impl<'a> BatchedRunner<'a> {
    /// Create a runner over an engine.
    #[must_use]
    pub fn new(engine: &'a mut StepEngine, config: SchedulerConfig, base_seed: u64) -> Self {
        Self {
            engine,
            tokenizer: None,
            scheduler: Scheduler::new(config),
            requests: HashMap::new(),
            samplers: HashMap::new(),
            base_seed,
            streaming: false,
        }
    }

    /// Attach a tokenizer. Without one, every request must arrive with
    /// `prompt_tokens` pre-filled and no output text is produced.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: &'a Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Stream generated pieces to stdout as they are sampled.
    #[must_use]
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Run until the intake producer is done and every admitted request has
    /// reached a terminal state.
    ///
    /// # Errors
    /// Returns an error only for setup problems (a request needing
    /// tokenization with no tokenizer attached); per-request step failures
    /// are folded into that request's finish reason instead.
    pub fn run(&mut self, intake: &RequestIntake) -> Result<BenchmarkMetrics> {
        self.engine.reset_cache();
        let run_start = Instant::now();
        let mut iteration = 0usize;

        loop {
            for request in intake.drain() {
                self.register(request)?;
            }

            let batch = self.scheduler.schedule(&mut self.requests);
            if batch.is_empty() {
                if intake.is_done() && self.scheduler.is_idle() {
                    break;
                }
                intake.wait(IDLE_WAIT);
                continue;
            }

            debug!(
                iteration,
                kind = ?batch.kind,
                requests = batch.len(),
                tokens = batch.total_tokens(),
                "executing batch"
            );
            match batch.kind {
                BatchKind::Prefill => self.run_prefill_batch(&batch),
                BatchKind::Decode => self.run_decode_batch(&batch),
            }
            iteration += 1;
        }

        let mut metrics = BenchmarkMetrics {
            total_time_ms: run_start.elapsed().as_secs_f64() * 1000.0,
            ..BenchmarkMetrics::default()
        };
        let mut ids: Vec<u64> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            metrics.add_request(&self.requests[id]);
        }
        Ok(metrics)
    }

    /// Consume the runner and hand back all requests, ordered by id.
    #[must_use]
    pub fn into_requests(self) -> Vec<Request> {
        let mut requests: Vec<Request> = self.requests.into_values().collect();
        requests.sort_by_key(|r| r.id);
        requests
    }

    fn register(&mut self, mut request: Request) -> Result<()> {
        if request.prompt_tokens.is_empty() {
            let tokenizer = self.tokenizer.ok_or_else(|| {
                Error::Config(format!(
                    "request {} needs tokenization but no tokenizer is attached",
                    request.id
                ))
            })?;
            request.prompt_tokens = tokenizer.encode(&request.prompt, true);
        }

        if !self.engine.is_paged() {
            let in_flight = self
                .requests
                .values()
                .filter(|r| !r.is_finished())
                .count();
            if in_flight > 0 {
                warn!(
                    "contiguous KV cache has no per-request isolation; \
                     concurrent requests will interfere"
                );
            }
        }

        let seed = self.base_seed.wrapping_add(request.id);
        self.samplers.insert(
            request.id,
            Sampler::new(request.sampling.temperature, request.sampling.top_p, seed),
        );
        info!(
            request_id = request.id,
            prompt_tokens = request.prompt_tokens.len(),
            "request registered"
        );
        self.scheduler.add_request(request.id);
        self.requests.insert(request.id, request);
        Ok(())
    }

    /// Advance each batch member through its scheduled prompt chunk.
    fn run_prefill_batch(&mut self, batch: &ScheduledBatch) {
        for entry in &batch.entries {
            let id = entry.request_id;
            let chunk_start = Instant::now();

            let mut outcome = StepOutcome::Ok;
            {
                let req = self
                    .requests
                    .get_mut(&id)
                    .expect("scheduled requests are registered");
                for _ in 0..entry.num_tokens {
                    if req.prefill_cursor >= req.prompt_tokens.len() {
                        break;
                    }
                    let token = req.prompt_tokens[req.prefill_cursor];
                    match self.engine.step(token, req.current_pos, &mut req.kv) {
                        Ok(()) => {
                            req.prefill_cursor += 1;
                            req.current_pos += 1;
                            req.num_computed_tokens += 1;
                        }
                        Err(Error::NoFreeBlocks) => {
                            outcome = StepOutcome::Oom;
                            break;
                        }
                        Err(e) => {
                            warn!(request_id = id, error = %e, "prefill step failed");
                            outcome = StepOutcome::Overflow;
                            break;
                        }
                    }
                }
                req.prefill_time_ms += chunk_start.elapsed().as_secs_f64() * 1000.0;
            }

            match outcome {
                StepOutcome::Oom => {
                    self.fail_request(id, FinishReason::Oom);
                    continue;
                }
                StepOutcome::Overflow => {
                    self.finish_request(id, FinishReason::MaxSeqLen);
                    continue;
                }
                StepOutcome::Ok => {}
            }

            let req = self.requests.get_mut(&id).expect("request still live");
            if !req.is_prefill() {
                req.last_token = *req
                    .prompt_tokens
                    .last()
                    .expect("prompts are non-empty");
                req.status = RequestStatus::Decoding;
                info!(
                    request_id = id,
                    prompt_tokens = req.num_prompt_tokens(),
                    "prefill complete"
                );
                if self.streaming {
                    print!("\n[{id}] ");
                    let _ = std::io::stdout().flush();
                }
            }
        }
    }

    /// Generate one token for each batch member and check termination.
    fn run_decode_batch(&mut self, batch: &ScheduledBatch) {
        let eos_token_id = self.engine.config().eos_token_id;
        let max_seq_len = self.engine.config().max_seq_len;

        for entry in &batch.entries {
            let id = entry.request_id;
            let step_start = Instant::now();

            let req = self
                .requests
                .get_mut(&id)
                .expect("scheduled requests are registered");

            match self.engine.step(req.last_token, req.current_pos, &mut req.kv) {
                Ok(()) => {}
                Err(Error::NoFreeBlocks) => {
                    self.fail_request(id, FinishReason::Oom);
                    continue;
                }
                Err(e) => {
                    warn!(request_id = id, error = %e, "decode step failed");
                    self.finish_request(id, FinishReason::MaxSeqLen);
                    continue;
                }
            }

            let sampler = self
                .samplers
                .get_mut(&id)
                .expect("one sampler per admission");
            let next = sampler.sample(self.engine.logits_mut());

            req.generated_tokens.push(next);
            req.current_pos += 1;
            req.num_computed_tokens += 1;
            req.last_token = next;

            if let Some(tokenizer) = self.tokenizer {
                let piece = tokenizer.decode_token(next);
                req.output_text.push_str(&piece);
                if self.streaming {
                    print!("{piece}");
                    let _ = std::io::stdout().flush();
                }
            }
            req.decode_time_ms += step_start.elapsed().as_secs_f64() * 1000.0;

            let reason = if next == eos_token_id {
                Some(FinishReason::Eos)
            } else if !req.can_generate_more() {
                Some(FinishReason::MaxTokens)
            } else if req.current_pos >= max_seq_len {
                Some(FinishReason::MaxSeqLen)
            } else {
                None
            };
            if let Some(reason) = reason {
                self.finish_request(id, reason);
            }
        }
    }

    fn finish_request(&mut self, id: u64, reason: FinishReason) {
        if let Some(req) = self.requests.get_mut(&id) {
            req.status = RequestStatus::Finished;
            req.finish_reason = reason;
            info!(
                request_id = id,
                reason = reason.as_str(),
                generated = req.num_generated_tokens(),
                "request finished"
            );
        }
        self.retire(id);
    }

    fn fail_request(&mut self, id: u64, reason: FinishReason) {
        if let Some(req) = self.requests.get_mut(&id) {
            req.status = RequestStatus::Failed;
            req.finish_reason = reason;
            warn!(request_id = id, reason = reason.as_str(), "request failed");
        }
        self.retire(id);
    }

    /// Release the request's blocks and drop its scheduler and sampler
    /// entries. The request itself stays in the map for reporting.
    fn retire(&mut self, id: u64) {
        if let Some(pool) = self.engine.pool() {
            pool.free_request(id);
        }
        self.scheduler.finish_request(id);
        self.samplers.remove(&id);
        if self.streaming {
            println!();
        }
    }
}
