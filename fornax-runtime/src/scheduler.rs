//! Iteration-level scheduler for continuous batching.
//!
//! Every iteration produces one batch that is either pure decode or pure
//! prefill, never mixed. Decode-phase requests always win: a single decode
//! step per running request keeps latency low, while prompt consumption is
//! admitted in budgeted chunks ("chunked prefill") so a long prompt cannot
//! starve token generation.
//!
//! The scheduler holds request *ids* only. The runner owns the `Request`
//! values and lends them to [`Scheduler::schedule`] for inspection; the
//! scheduler never frees KV blocks (that is the runner's job on
//! retirement).

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::request::{Request, RequestStatus};

/// Batch formation limits.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum requests per batch.
    pub max_batch_size: usize,
    /// Maximum total scheduled tokens per batch.
    pub max_tokens_per_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_tokens_per_batch: 512,
        }
    }
}

/// Which phase a batch executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Prefill,
    Decode,
}

/// One request's share of a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchEntry {
    pub request_id: u64,
    /// Tokens to process this iteration: a prompt chunk for prefill,
    /// always 1 for decode.
    pub num_tokens: usize,
}

/// Output of one scheduling step.
#[derive(Debug)]
pub struct ScheduledBatch {
    pub kind: BatchKind,
    pub entries: Vec<BatchEntry>,
}

impl ScheduledBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total tokens scheduled across all entries.
    #[must_use]
    pub fn total_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.num_tokens).sum()
    }
}

/// Decode-first batch former over a FIFO pending queue and a running set.
pub struct Scheduler {
    config: SchedulerConfig,
    pending: VecDeque<u64>,
    /// Admission order is preserved; prefill continuation walks this list.
    running: Vec<u64>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            running: Vec::new(),
        }
    }

    /// Enqueue a request id. The request must be in `Pending` status.
    pub fn add_request(&mut self, request_id: u64) {
        debug!(request_id, "request queued");
        self.pending.push_back(request_id);
    }

    /// Form the next batch.
    ///
    /// Decode pass first: every running `Decoding` request contributes one
    /// token until the batch or token budget fills. If that yields anything
    /// the batch is pure decode. Otherwise the prefill pass schedules prompt
    /// chunks: first for already-admitted `Prefilling` requests (admission
    /// order), then for pending requests in FIFO order, each receiving
    /// `min(remaining_prompt, budget)` tokens. Newly admitted requests
    /// transition `Pending -> Prefilling` and join the running set.
    pub fn schedule(&mut self, requests: &mut HashMap<u64, Request>) -> ScheduledBatch {
        let max_requests = self.config.max_batch_size;
        let max_tokens = self.config.max_tokens_per_batch;

        // Decode pass.
        let mut entries = Vec::new();
        let mut tokens = 0usize;
        for &id in &self.running {
            if entries.len() >= max_requests || tokens + 1 > max_tokens {
                break;
            }
            let Some(req) = requests.get(&id) else {
                continue;
            };
            if req.status == RequestStatus::Decoding {
                entries.push(BatchEntry {
                    request_id: id,
                    num_tokens: 1,
                });
                tokens += 1;
            }
        }
        if !entries.is_empty() {
            return ScheduledBatch {
                kind: BatchKind::Decode,
                entries,
            };
        }

        // Prefill pass: continue partially-prefilled running requests first.
        for &id in &self.running {
            if entries.len() >= max_requests || tokens >= max_tokens {
                break;
            }
            let Some(req) = requests.get(&id) else {
                continue;
            };
            if req.status != RequestStatus::Prefilling || req.remaining_prompt() == 0 {
                continue;
            }
            let chunk = req.remaining_prompt().min(max_tokens - tokens);
            entries.push(BatchEntry {
                request_id: id,
                num_tokens: chunk,
            });
            tokens += chunk;
        }

        // Then admit from the pending queue, FIFO.
        while entries.len() < max_requests && tokens < max_tokens {
            let Some(&id) = self.pending.front() else {
                break;
            };
            let Some(req) = requests.get_mut(&id) else {
                self.pending.pop_front();
                continue;
            };
            let chunk = req.remaining_prompt().min(max_tokens - tokens);
            if chunk == 0 {
                break;
            }

            self.pending.pop_front();
            req.status = RequestStatus::Prefilling;
            self.running.push(id);
            debug!(request_id = id, chunk, "request admitted to prefill");

            entries.push(BatchEntry {
                request_id: id,
                num_tokens: chunk,
            });
            tokens += chunk;
        }

        ScheduledBatch {
            kind: BatchKind::Prefill,
            entries,
        }
    }

    /// Remove a terminated request from the running set.
    ///
    /// Block release is the runner's responsibility.
    pub fn finish_request(&mut self, request_id: u64) {
        self.running.retain(|&id| id != request_id);
        debug!(request_id, "request retired from scheduler");
    }

    /// Whether no request is pending or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.is_idle()
    }

    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn num_running(&self) -> usize {
        self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fornax::SamplingParams;

    fn make_request(id: u64, prompt_len: usize) -> Request {
        Request::new(id, "test", SamplingParams::default(), 1)
            .with_prompt_tokens((0..prompt_len as u32).collect())
    }

    fn add(sched: &mut Scheduler, requests: &mut HashMap<u64, Request>, id: u64, len: usize) {
        requests.insert(id, make_request(id, len));
        sched.add_request(id);
    }

    fn config(max_batch: usize, max_tokens: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_batch_size: max_batch,
            max_tokens_per_batch: max_tokens,
        }
    }

    #[test]
    fn idle_when_empty() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        let mut requests = HashMap::new();
        assert!(sched.is_idle());
        assert!(sched.schedule(&mut requests).is_empty());
    }

    #[test]
    fn admission_moves_pending_to_prefilling() {
        let mut sched = Scheduler::new(config(4, 64));
        let mut requests = HashMap::new();
        add(&mut sched, &mut requests, 0, 5);

        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.kind, BatchKind::Prefill);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries[0].num_tokens, 5);
        assert_eq!(requests[&0].status, RequestStatus::Prefilling);
        assert_eq!(sched.num_pending(), 0);
        assert_eq!(sched.num_running(), 1);
    }

    #[test]
    fn decode_has_priority_over_prefill() {
        let mut sched = Scheduler::new(config(4, 64));
        let mut requests = HashMap::new();

        // Request 0 has finished prefilling and is decoding.
        add(&mut sched, &mut requests, 0, 3);
        let _ = sched.schedule(&mut requests);
        requests.get_mut(&0).unwrap().prefill_cursor = 3;
        requests.get_mut(&0).unwrap().status = RequestStatus::Decoding;

        // Request 1 is waiting with a long prompt.
        add(&mut sched, &mut requests, 1, 40);

        // Every batch while 0 decodes must be decode-only.
        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.kind, BatchKind::Decode);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries[0].request_id, 0);
        assert_eq!(requests[&1].status, RequestStatus::Pending);

        // Once 0 retires, 1 resumes prefill.
        requests.get_mut(&0).unwrap().status = RequestStatus::Finished;
        sched.finish_request(0);
        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.kind, BatchKind::Prefill);
        assert_eq!(batch.entries[0].request_id, 1);
    }

    #[test]
    fn batches_are_never_mixed() {
        let mut sched = Scheduler::new(config(8, 64));
        let mut requests = HashMap::new();

        add(&mut sched, &mut requests, 0, 4);
        let _ = sched.schedule(&mut requests);
        requests.get_mut(&0).unwrap().prefill_cursor = 4;
        requests.get_mut(&0).unwrap().status = RequestStatus::Decoding;

        add(&mut sched, &mut requests, 1, 4);

        let batch = sched.schedule(&mut requests);
        let all_one_token = batch.entries.iter().all(|e| e.num_tokens == 1);
        match batch.kind {
            BatchKind::Decode => assert!(all_one_token),
            BatchKind::Prefill => panic!("decode request present, batch must be decode"),
        }
    }

    #[test]
    fn chunked_prefill_partitions_long_prompt() {
        let mut sched = Scheduler::new(config(8, 32));
        let mut requests = HashMap::new();
        add(&mut sched, &mut requests, 0, 100);

        let mut chunks = Vec::new();
        loop {
            let batch = sched.schedule(&mut requests);
            if batch.is_empty() {
                break;
            }
            assert_eq!(batch.kind, BatchKind::Prefill);
            assert!(batch.total_tokens() <= 32);
            let n = batch.entries[0].num_tokens;
            chunks.push(n);

            // Simulate the runner consuming the chunk.
            let req = requests.get_mut(&0).unwrap();
            req.prefill_cursor += n;
            if req.prefill_cursor == req.num_prompt_tokens() {
                req.status = RequestStatus::Decoding;
                break;
            }
        }

        assert_eq!(chunks, vec![32, 32, 32, 4]);
    }

    #[test]
    fn token_budget_bounds_admission() {
        let mut sched = Scheduler::new(config(8, 10));
        let mut requests = HashMap::new();
        add(&mut sched, &mut requests, 0, 6);
        add(&mut sched, &mut requests, 1, 6);
        add(&mut sched, &mut requests, 2, 6);

        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.kind, BatchKind::Prefill);
        // 6 + 4 = 10 tokens: request 1 gets a partial chunk, request 2 waits.
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.entries[0].num_tokens, 6);
        assert_eq!(batch.entries[1].num_tokens, 4);
        assert_eq!(batch.total_tokens(), 10);
        assert_eq!(sched.num_pending(), 1);
    }

    #[test]
    fn batch_size_limit() {
        let mut sched = Scheduler::new(config(2, 512));
        let mut requests = HashMap::new();
        for id in 0..4 {
            add(&mut sched, &mut requests, id, 2);
        }

        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.len(), 2);
        assert_eq!(sched.num_running(), 2);
        assert_eq!(sched.num_pending(), 2);
    }

    #[test]
    fn admission_is_fifo() {
        let mut sched = Scheduler::new(config(1, 512));
        let mut requests = HashMap::new();
        add(&mut sched, &mut requests, 7, 2);
        add(&mut sched, &mut requests, 3, 2);

        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.entries[0].request_id, 7);

        requests.get_mut(&7).unwrap().status = RequestStatus::Finished;
        sched.finish_request(7);

        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.entries[0].request_id, 3);
    }

    #[test]
    fn decode_batch_respects_max_batch_size() {
        let mut sched = Scheduler::new(config(2, 512));
        let mut requests = HashMap::new();
        for id in 0..3 {
            add(&mut sched, &mut requests, id, 1);
        }
        // Admit all three across two iterations.
        let _ = sched.schedule(&mut requests);
        for id in 0..2 {
            let req = requests.get_mut(&id).unwrap();
            req.prefill_cursor = 1;
            req.status = RequestStatus::Decoding;
        }

        let batch = sched.schedule(&mut requests);
        assert_eq!(batch.kind, BatchKind::Decode);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.total_tokens(), 2);
    }

    #[test]
    fn no_request_appears_twice() {
        let mut sched = Scheduler::new(config(8, 512));
        let mut requests = HashMap::new();
        add(&mut sched, &mut requests, 0, 4);
        let batch = sched.schedule(&mut requests);

        let mut ids: Vec<u64> = batch.entries.iter().map(|e| e.request_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), batch.len());

        // Continuing the same prefill later never duplicates it either.
        let batch = sched.schedule(&mut requests);
        let count = batch
            .entries
            .iter()
            .filter(|e| e.request_id == 0)
            .count();
        assert!(count <= 1);
    }

    #[test]
    fn finish_request_removes_from_running() {
        let mut sched = Scheduler::new(config(4, 64));
        let mut requests = HashMap::new();
        add(&mut sched, &mut requests, 0, 2);
        let _ = sched.schedule(&mut requests);
        assert_eq!(sched.num_running(), 1);

        sched.finish_request(0);
        assert_eq!(sched.num_running(), 0);
        assert!(sched.is_idle());
    }
}
