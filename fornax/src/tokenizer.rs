//! llama2.c binary tokenizer (`tokenizer.bin`).
//!
//! File layout: `i32 max_token_length`, then `vocab_size` records of
//! `{f32 score, i32 len, byte[len] utf8}`. Token 1 is BOS, token 2 is EOS,
//! and raw byte tokens appear as `<0xHH>` strings starting at id 3.
//!
//! Encoding is the sentencepiece-style merge loop: look up each codepoint
//! (falling back to raw byte tokens), then repeatedly merge the adjacent
//! pair whose concatenation has the highest vocabulary score.

use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// Beginning-of-sequence token id.
pub const BOS_TOKEN_ID: u32 = 1;
/// End-of-sequence token id.
pub const EOS_TOKEN_ID: u32 = 2;

/// Id of the raw-byte token for byte `b` (`<0x00>` starts at id 3).
const BYTE_FALLBACK_BASE: u32 = 3;

/// Binary BPE tokenizer for llama2.c models.
pub struct Tokenizer {
    vocab: Vec<String>,
    scores: Vec<f32>,
    /// `(token string, id)` sorted by string for binary-search lookup.
    sorted_vocab: Vec<(String, u32)>,
    max_token_length: usize,
}

impl Tokenizer {
    /// Load a tokenizer file. `vocab_size` comes from the model config.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is truncated.
    pub fn load(path: impl AsRef<Path>, vocab_size: usize) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes, vocab_size)
    }

    /// Parse a tokenizer from raw file bytes.
    ///
    /// # Errors
    /// Returns [`Error::Tokenizer`] on truncated input.
    pub fn from_bytes(bytes: &[u8], vocab_size: usize) -> Result<Self> {
        let mut reader = TokenizerReader { bytes, pos: 0 };

        let max_token_length = reader.read_i32()?;
        if max_token_length <= 0 {
            return Err(Error::Tokenizer(format!(
                "invalid max_token_length {max_token_length}"
            )));
        }

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        for _ in 0..vocab_size {
            let score = reader.read_f32()?;
            let len = reader.read_i32()?;
            if len < 0 {
                return Err(Error::Tokenizer(format!("negative token length {len}")));
            }
            #[allow(clippy::cast_sign_loss)]
            let word = String::from_utf8_lossy(reader.take(len as usize)?).into_owned();
            scores.push(score);
            vocab.push(word);
        }

        #[allow(clippy::cast_possible_truncation)]
        let mut sorted_vocab: Vec<(String, u32)> = vocab
            .iter()
            .enumerate()
            .map(|(id, word)| (word.clone(), id as u32))
            .collect();
        sorted_vocab.sort();

        #[allow(clippy::cast_sign_loss)]
        let max_token_length = max_token_length as usize;

        Ok(Self {
            vocab,
            scores,
            sorted_vocab,
            max_token_length,
        })
    }

    /// Encode text into token ids.
    ///
    /// A leading space token is inserted before non-empty text (dummy
    /// prefix), matching how the vocabulary was trained.
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<u32> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS_TOKEN_ID);
        }

        if !text.is_empty() {
            if let Some(space) = self.lookup(" ") {
                tokens.push(space);
            }
        }

        // One token per codepoint, with raw-byte fallback.
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let piece = ch.encode_utf8(&mut buf);
            if let Some(id) = self.lookup(piece) {
                tokens.push(id);
            } else {
                for &byte in piece.as_bytes() {
                    let id = BYTE_FALLBACK_BASE + u32::from(byte);
                    if (id as usize) < self.vocab.len() {
                        tokens.push(id);
                    }
                }
            }
        }

        // Greedy merging: always merge the adjacent pair with the highest
        // score until no merge is possible.
        loop {
            let mut best: Option<(f32, u32, usize)> = None;
            for i in 0..tokens.len().saturating_sub(1) {
                let merged = format!(
                    "{}{}",
                    self.vocab[tokens[i] as usize],
                    self.vocab[tokens[i + 1] as usize]
                );
                if merged.len() > self.max_token_length {
                    continue;
                }
                if let Some(id) = self.lookup(&merged) {
                    let score = self.scores[id as usize];
                    if best.is_none_or(|(s, _, _)| score > s) {
                        best = Some((score, id, i));
                    }
                }
            }

            let Some((_, id, i)) = best else { break };
            tokens[i] = id;
            tokens.remove(i + 1);
        }

        tokens
    }

    /// Decode a single token id to its text piece.
    ///
    /// Raw byte tokens (`<0xHH>`) decode to the corresponding byte; ids
    /// outside the vocabulary decode to the empty string.
    #[must_use]
    pub fn decode_token(&self, id: u32) -> String {
        let Some(piece) = self.vocab.get(id as usize) else {
            return String::new();
        };
        if let Some(byte) = parse_byte_token(piece) {
            return char::from(byte).to_string();
        }
        piece.clone()
    }

    /// Decode a token sequence, skipping BOS/EOS markers.
    #[must_use]
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut out = String::new();
        for &id in ids {
            if id == BOS_TOKEN_ID || id == EOS_TOKEN_ID {
                continue;
            }
            out.push_str(&self.decode_token(id));
        }
        out
    }

    /// Beginning-of-sequence token id.
    #[must_use]
    pub fn bos_token_id(&self) -> u32 {
        BOS_TOKEN_ID
    }

    /// End-of-sequence token id.
    #[must_use]
    pub fn eos_token_id(&self) -> u32 {
        EOS_TOKEN_ID
    }

    /// Number of entries in the vocabulary.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn lookup(&self, piece: &str) -> Option<u32> {
        self.sorted_vocab
            .binary_search_by(|(word, _)| word.as_str().cmp(piece))
            .ok()
            .map(|idx| self.sorted_vocab[idx].1)
    }
}

/// Sequential little-endian reader over the tokenizer file.
struct TokenizerReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> TokenizerReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() - self.pos < len {
            return Err(Error::Tokenizer(format!(
                "tokenizer file truncated at byte {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(
            self.take(4)?.try_into().expect("4-byte slice"),
        ))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(
            self.take(4)?.try_into().expect("4-byte slice"),
        ))
    }
}

/// Parse `<0xHH>` byte-token strings.
fn parse_byte_token(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}
