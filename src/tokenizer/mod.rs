//! CLIP byte-level BPE tokenizer.
//!
//! Text is cleaned and lower-cased, split by a unicode-aware pattern, mapped
//! byte-wise into printable characters, and merged with the CLIP merges list.
//! Sequences are framed with start/end tokens and padded to 77 positions.

mod bpe;
pub mod text;

use ndarray::Array2;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{ClipError, Result};
pub use bpe::{parse_merges, END_OF_TEXT, MAX_MERGES, START_OF_TEXT};
use bpe::{bytes_to_unicode, Vocabulary, END_OF_WORD};

/// Maximum number of tokens per sequence, including start/end tokens.
pub const CONTEXT_LENGTH: usize = 77;

const PATTERN: &str = r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|\p{L}+|\p{N}|[^\s\p{L}\p{N}]+";

pub struct Tokenizer {
    vocab: Vocabulary,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    pattern: Regex,
    cache: Mutex<HashMap<String, Vec<u32>>>,
    sot: u32,
    eot: u32,
}

impl Tokenizer {
    pub fn from_merges_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_merges_str(&content)
    }

    pub fn from_merges_str(content: &str) -> Result<Self> {
        let merges = parse_merges(content)?;
        let byte_chars = bytes_to_unicode();

        let mut byte_encoder = ['\0'; 256];
        for (b, c) in &byte_chars {
            byte_encoder[*b as usize] = *c;
        }
        let byte_decoder = byte_chars.iter().map(|(b, c)| (*c, *b)).collect();

        let vocab = Vocabulary::build(&byte_chars, merges)?;
        let sot = special_id(&vocab, START_OF_TEXT)?;
        let eot = special_id(&vocab, END_OF_TEXT)?;

        let pattern =
            Regex::new(PATTERN).map_err(|e| ClipError::Tokenizer(format!("bad pattern: {e}")))?;

        tracing::debug!(vocab_size = vocab.len(), "Tokenizer loaded");

        Ok(Self {
            vocab,
            byte_encoder,
            byte_decoder,
            pattern,
            cache: Mutex::new(HashMap::new()),
            sot,
            eot,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn start_token(&self) -> u32 {
        self.sot
    }

    pub fn end_token(&self) -> u32 {
        self.eot
    }

    /// BPE token ids for `text`, without start/end tokens.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let cleaned = text::normalize(text);
        let mut ids = Vec::new();

        for m in self.pattern.find_iter(&cleaned) {
            ids.extend(self.encode_word(m.as_str()));
        }

        ids
    }

    fn encode_word(&self, word: &str) -> Vec<u32> {
        match word {
            START_OF_TEXT => return vec![self.sot],
            END_OF_TEXT => return vec![self.eot],
            _ => {}
        }

        if let Ok(cache) = self.cache.lock() {
            if let Some(ids) = cache.get(word) {
                return ids.clone();
            }
        }

        let mapped: String = word.bytes().map(|b| self.byte_encoder[b as usize]).collect();
        let ids: Vec<u32> = self
            .vocab
            .bpe(&mapped)
            .iter()
            .filter_map(|symbol| self.vocab.encoder.get(symbol).copied())
            .collect();

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(word.to_string(), ids.clone());
        }

        ids
    }

    /// Turn token ids back into text. Unknown ids are skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        let joined: String = ids
            .iter()
            .filter_map(|id| self.vocab.decoder.get(*id as usize))
            .map(String::as_str)
            .collect();

        let mut bytes = Vec::with_capacity(joined.len());
        let mut rest = joined.as_str();
        while let Some(ch) = rest.chars().next() {
            if let Some(after) = rest.strip_prefix(END_OF_WORD) {
                bytes.push(b' ');
                rest = after;
                continue;
            }
            match self.byte_decoder.get(&ch) {
                Some(b) => bytes.push(*b),
                None => bytes.extend_from_slice(ch.to_string().as_bytes()),
            }
            rest = &rest[ch.len_utf8()..];
        }

        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// `[sot] + encode(text) + [eot]`, failing when it exceeds the context.
    pub fn encode_text(&self, text: &str) -> Result<Vec<i32>> {
        let tokens = self.framed(text);
        if tokens.len() > CONTEXT_LENGTH {
            return Err(ClipError::TextTooLong {
                text: text.to_string(),
                context_length: CONTEXT_LENGTH,
            });
        }
        Ok(tokens)
    }

    /// Encode a batch into a zero padded `[n, 77]` array.
    ///
    /// With `truncate`, over-long sequences are cut and end with the end
    /// token; otherwise they are an error.
    pub fn tokenize<S: AsRef<str>>(&self, texts: &[S], truncate: bool) -> Result<Array2<i32>> {
        let mut result = Array2::<i32>::zeros((texts.len(), CONTEXT_LENGTH));

        for (i, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            let mut tokens = self.framed(text);

            if tokens.len() > CONTEXT_LENGTH {
                if !truncate {
                    return Err(ClipError::TextTooLong {
                        text: text.to_string(),
                        context_length: CONTEXT_LENGTH,
                    });
                }
                tokens.truncate(CONTEXT_LENGTH);
                tokens[CONTEXT_LENGTH - 1] = self.eot as i32;
            }

            for (j, token) in tokens.into_iter().enumerate() {
                result[[i, j]] = token;
            }
        }

        Ok(result)
    }

    pub fn encode_text_with_padding<S: AsRef<str>>(&self, texts: &[S]) -> Result<Array2<i32>> {
        self.tokenize(texts, false)
    }

    fn framed(&self, text: &str) -> Vec<i32> {
        let mut tokens = Vec::with_capacity(CONTEXT_LENGTH);
        tokens.push(self.sot as i32);
        tokens.extend(self.encode(text).into_iter().map(|id| id as i32));
        tokens.push(self.eot as i32);
        tokens
    }
}

fn special_id(vocab: &Vocabulary, token: &str) -> Result<u32> {
    vocab
        .encoder
        .get(token)
        .copied()
        .ok_or_else(|| ClipError::Tokenizer(format!("missing special token {token}")))
}
