//! Thread-safe staging of newly arriving requests.
//!
//! A producer thread submits requests (possibly on a wall-clock schedule)
//! while the runner thread drains them between iterations. All coordination
//! between the two goes through [`RequestIntake`]'s mutex and condition
//! variable; once drained, a request is owned by the runner until it
//! reaches a terminal state. Mid-flight cancellation is not supported.

use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::info;

use crate::request::Request;

struct IntakeState {
    queue: Vec<Request>,
    all_submitted: bool,
}

/// Condition-variable-protected FIFO between producer and runner.
pub struct RequestIntake {
    state: Mutex<IntakeState>,
    arrived: Condvar,
}

impl Default for RequestIntake {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIntake {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IntakeState {
                queue: Vec::new(),
                all_submitted: false,
            }),
            arrived: Condvar::new(),
        }
    }

    /// Publish a request (non-blocking). Wakes a waiting runner.
    pub fn submit(&self, request: Request) {
        {
            let mut state = self.lock();
            state.queue.push(request);
        }
        self.arrived.notify_one();
    }

    /// Take every staged request, in submission order.
    #[must_use]
    pub fn drain(&self) -> Vec<Request> {
        std::mem::take(&mut self.lock().queue)
    }

    /// Block until a request arrives, the producer completes, or `timeout`
    /// expires. Returns true when woken by arrival or completion.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _timeout_result) = self
            .arrived
            .wait_timeout_while(state, timeout, |s| {
                s.queue.is_empty() && !s.all_submitted
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !state.queue.is_empty() || state.all_submitted
    }

    /// Signal that the producer will submit nothing further.
    pub fn mark_all_submitted(&self) {
        self.lock().all_submitted = true;
        self.arrived.notify_all();
    }

    /// Whether the producer announced completion.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.lock().all_submitted
    }

    /// Whether staged requests are waiting to be drained.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.lock().queue.is_empty()
    }

    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Clear staged requests and the completion flag for reuse.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.all_submitted = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IntakeState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Producer that submits requests on their arrival schedule.
///
/// Each request is submitted once `arrival_delay_ms` has elapsed from the
/// producer's start; afterwards the intake is marked complete.
pub struct RequestSubmitter;

impl RequestSubmitter {
    /// Spawn the producer thread. The intake must outlive the thread, so it
    /// is borrowed through an owning handle (`Arc`) at the call site.
    pub fn spawn(
        requests: Vec<Request>,
        intake: std::sync::Arc<RequestIntake>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let start = Instant::now();
            let total = requests.len();
            for request in requests {
                let target = Duration::from_millis(request.arrival_delay_ms);
                let elapsed = start.elapsed();
                if target > elapsed {
                    thread::sleep(target - elapsed);
                }
                info!(
                    request_id = request.id,
                    delay_ms = request.arrival_delay_ms,
                    "request arrived"
                );
                intake.submit(request);
            }
            intake.mark_all_submitted();
            info!(total, "all requests submitted");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fornax::SamplingParams;
    use std::sync::Arc;

    fn make_request(id: u64) -> Request {
        Request::new(id, "test", SamplingParams::default(), 1)
    }

    #[test]
    fn drain_preserves_submission_order() {
        let intake = RequestIntake::new();
        intake.submit(make_request(0));
        intake.submit(make_request(1));
        intake.submit(make_request(2));

        let drained = intake.drain();
        let ids: Vec<u64> = drained.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(!intake.has_pending());
    }

    #[test]
    fn wait_returns_immediately_when_work_is_staged() {
        let intake = RequestIntake::new();
        intake.submit(make_request(0));
        assert!(intake.wait(Duration::from_millis(1)));
    }

    #[test]
    fn wait_times_out_when_idle() {
        let intake = RequestIntake::new();
        let start = Instant::now();
        assert!(!intake.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_is_woken_by_submit() {
        let intake = Arc::new(RequestIntake::new());
        let producer = {
            let intake = Arc::clone(&intake);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                intake.submit(make_request(0));
            })
        };

        // Far larger timeout than the submit delay: must return early.
        assert!(intake.wait(Duration::from_secs(5)));
        producer.join().unwrap();
    }

    #[test]
    fn wait_is_woken_by_completion() {
        let intake = Arc::new(RequestIntake::new());
        let producer = {
            let intake = Arc::clone(&intake);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                intake.mark_all_submitted();
            })
        };

        assert!(intake.wait(Duration::from_secs(5)));
        assert!(intake.is_done());
        producer.join().unwrap();
    }

    #[test]
    fn submitter_respects_arrival_schedule() {
        let intake = Arc::new(RequestIntake::new());
        let requests = vec![
            make_request(0),
            make_request(1).with_arrival_delay(30),
        ];

        let start = Instant::now();
        let producer = RequestSubmitter::spawn(requests, Arc::clone(&intake));

        // First request arrives immediately.
        assert!(intake.wait(Duration::from_secs(5)));
        let first = intake.drain();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, 0);
        assert!(!intake.is_done());

        // Second arrives only after its delay.
        producer.join().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        let second = intake.drain();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, 1);
        assert!(intake.is_done());
    }

    #[test]
    fn reset_clears_state() {
        let intake = RequestIntake::new();
        intake.submit(make_request(0));
        intake.mark_all_submitted();

        intake.reset();
        assert!(!intake.has_pending());
        assert!(!intake.is_done());
    }
}
