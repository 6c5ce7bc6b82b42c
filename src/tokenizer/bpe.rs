//! Byte-level BPE vocabulary and merge application.

use std::collections::HashMap;

use crate::error::{ClipError, Result};

pub const START_OF_TEXT: &str = "<|startoftext|>";
pub const END_OF_TEXT: &str = "<|endoftext|>";
pub const END_OF_WORD: &str = "</w>";

/// Merges beyond this count are ignored so the vocabulary tops out at 49408.
pub const MAX_MERGES: usize = 49152 - 256 - 2;

/// Reversible mapping from bytes to printable unicode characters.
///
/// Printable Latin-1 bytes map to themselves and come first; the remaining
/// bytes are shifted to U+0100 and above in ascending order.
pub fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut bs: Vec<u32> = (u32::from('!')..=u32::from('~'))
        .chain(u32::from('¡')..=u32::from('¬'))
        .chain(u32::from('®')..=u32::from('ÿ'))
        .collect();
    let mut cs = bs.clone();

    let mut n = 0;
    for b in 0..256u32 {
        if !bs.contains(&b) {
            bs.push(b);
            cs.push(256 + n);
            n += 1;
        }
    }

    bs.into_iter()
        .zip(cs)
        .filter_map(|(b, c)| Some((b as u8, char::from_u32(c)?)))
        .collect()
}

/// Parse a merges file: one space separated pair per line, optional
/// `#version` header.
pub fn parse_merges(content: &str) -> Result<Vec<(String, String)>> {
    let mut merges = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        if line_no == 0 && line.starts_with("#version") {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        if merges.len() == MAX_MERGES {
            break;
        }

        let mut parts = line.split(' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => {
                merges.push((a.to_string(), b.to_string()));
            }
            _ => {
                return Err(ClipError::Tokenizer(format!(
                    "malformed merge on line {}: {:?}",
                    line_no + 1,
                    line
                )))
            }
        }
    }

    Ok(merges)
}

pub struct Vocabulary {
    pub encoder: HashMap<String, u32>,
    pub decoder: Vec<String>,
    pub ranks: HashMap<(String, String), usize>,
}

impl Vocabulary {
    pub fn build(byte_chars: &[(u8, char)], merges: Vec<(String, String)>) -> Result<Self> {
        let mut decoder: Vec<String> = byte_chars.iter().map(|(_, c)| c.to_string()).collect();
        let word_ends: Vec<String> = decoder.iter().map(|s| format!("{s}{END_OF_WORD}")).collect();
        decoder.extend(word_ends);

        for (a, b) in &merges {
            decoder.push(format!("{a}{b}"));
        }
        decoder.push(START_OF_TEXT.to_string());
        decoder.push(END_OF_TEXT.to_string());

        let mut encoder = HashMap::with_capacity(decoder.len());
        for (id, token) in decoder.iter().enumerate() {
            let id = u32::try_from(id)
                .map_err(|_| ClipError::Tokenizer("vocabulary too large".to_string()))?;
            encoder.insert(token.clone(), id);
        }

        let ranks = merges.into_iter().enumerate().map(|(rank, pair)| (pair, rank)).collect();

        Ok(Self {
            encoder,
            decoder,
            ranks,
        })
    }

    pub fn len(&self) -> usize {
        self.decoder.len()
    }

    /// Apply merges to one pre-tokenized word (already byte-mapped).
    /// Returns the resulting symbols; the last one carries `</w>`.
    pub fn bpe(&self, token: &str) -> Vec<String> {
        let mut chars: Vec<String> = token.chars().map(String::from).collect();
        match chars.last_mut() {
            Some(last) => last.push_str(END_OF_WORD),
            None => return Vec::new(),
        }

        let mut word = chars;
        while word.len() > 1 {
            let best = word
                .windows(2)
                .filter_map(|pair| {
                    self.ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|rank| (*rank, pair[0].clone(), pair[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);

            let Some((_, first, second)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        word
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_unicode() {
        let table = bytes_to_unicode();
        assert_eq!(table.len(), 256);

        let map: HashMap<u8, char> = table.iter().copied().collect();
        assert_eq!(map[&b'a'], 'a');
        assert_eq!(map[&b'!'], '!');
        // Space is the 33rd non-printable byte, shifted to U+0120
        assert_eq!(map[&b' '], '\u{120}');
        assert_eq!(map[&0u8], '\u{100}');

        // Order: printable bytes first
        assert_eq!(table[0], (b'!', '!'));
    }

    #[test]
    fn test_parse_merges_skips_header() {
        let merges = parse_merges("#version: 0.2\nh e\nhe l\n\n").unwrap();
        assert_eq!(
            merges,
            vec![
                ("h".to_string(), "e".to_string()),
                ("he".to_string(), "l".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_merges_rejects_garbage() {
        assert!(parse_merges("a b c\n").is_err());
        assert!(parse_merges("lonely\n").is_err());
    }

    #[test]
    fn test_parse_merges_stops_at_limit() {
        let mut content = String::from("#version: 0.2\n");
        for i in 0..MAX_MERGES + 3 {
            content.push_str(&format!("m{i} n\n"));
        }
        // Lines past the limit aren't even validated
        content.push_str("not a merge line at all\n");

        let merges = parse_merges(&content).unwrap();
        assert_eq!(merges.len(), MAX_MERGES);
        assert_eq!(
            merges.last().unwrap(),
            &(format!("m{}", MAX_MERGES - 1), "n".to_string())
        );
    }

    #[test]
    fn test_vocabulary_layout() {
        let merges = vec![("h".to_string(), "i</w>".to_string())];
        let vocab = Vocabulary::build(&bytes_to_unicode(), merges).unwrap();

        assert_eq!(vocab.len(), 512 + 1 + 2);
        assert_eq!(vocab.encoder["!"], 0);
        assert_eq!(vocab.encoder["!</w>"], 256);
        assert_eq!(vocab.encoder["hi</w>"], 512);
        assert_eq!(vocab.encoder[START_OF_TEXT], 513);
        assert_eq!(vocab.encoder[END_OF_TEXT], 514);
    }

    #[test]
    fn test_bpe_applies_lowest_rank_first() {
        let merges = vec![
            ("l".to_string(), "o</w>".to_string()),
            ("h".to_string(), "e".to_string()),
            ("he".to_string(), "l".to_string()),
            ("hel".to_string(), "lo</w>".to_string()),
        ];
        let vocab = Vocabulary::build(&bytes_to_unicode(), merges).unwrap();

        assert_eq!(vocab.bpe("hello"), vec!["hello</w>".to_string()]);
        assert_eq!(vocab.bpe("help"), vec!["hel".to_string(), "p</w>".to_string()]);
        assert_eq!(vocab.bpe("x"), vec!["x</w>".to_string()]);
        assert!(vocab.bpe("").is_empty());
    }
}
