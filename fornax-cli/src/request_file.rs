//! JSON request-file ingestion.
//!
//! ```json
//! {
//!   "requests": [
//!     {"prompt": "Once upon a time", "temperature": 0.8, "max_tokens": 64},
//!     {"prompt": "The quick brown fox", "arrival_delay_ms": 50}
//!   ]
//! }
//! ```
//!
//! Request ids are assigned in array order starting at 0. Unspecified
//! fields take the same defaults as the CLI flags.

use std::path::Path;

use serde::Deserialize;

use fornax::{Error, Result, SamplingParams};
use fornax_runtime::Request;

#[derive(Debug, Deserialize)]
struct RequestFile {
    requests: Vec<RequestEntry>,
}

#[derive(Debug, Deserialize)]
struct RequestEntry {
    prompt: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_top_p")]
    top_p: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: usize,
    #[serde(default)]
    arrival_delay_ms: u64,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    0.9
}

fn default_max_tokens() -> usize {
    256
}

/// Parse a request file into runtime requests for a model with `n_layers`
/// layers.
///
/// # Errors
/// Returns an error for unreadable files, malformed JSON, or an empty
/// prompt.
pub fn load_requests(path: &Path, n_layers: usize) -> Result<Vec<Request>> {
    let text = std::fs::read_to_string(path)?;
    parse_requests(&text, n_layers)
}

fn parse_requests(text: &str, n_layers: usize) -> Result<Vec<Request>> {
    let file: RequestFile = serde_json::from_str(text)
        .map_err(|e| Error::Config(format!("invalid request file: {e}")))?;

    file.requests
        .into_iter()
        .enumerate()
        .map(|(id, entry)| {
            if entry.prompt.is_empty() {
                return Err(Error::Config(format!("request {id} has an empty prompt")));
            }
            let params = SamplingParams {
                temperature: entry.temperature,
                top_p: entry.top_p,
                max_tokens: entry.max_tokens,
            };
            Ok(Request::new(id as u64, entry.prompt, params, n_layers)
                .with_arrival_delay(entry.arrival_delay_ms))
        })
        .collect()
}
