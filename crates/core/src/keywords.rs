//! Prompt keyword extraction for the preference engine.
//!
//! A prompt is split on whitespace and prompt punctuation, lowercased,
//! filtered against a fixed stop-word list and a minimum length, and capped
//! at the first ten distinct keywords.

/// Words too generic to carry preference signal.
const STOP_WORDS: &[&str] = &[
    "the",
    "and",
    "with",
    "for",
    "very",
    "best",
    "high",
    "quality",
    "detailed",
    "masterpiece",
    "professional",
    "realistic",
];

/// Minimum keyword length in characters.
const MIN_LEN: usize = 3;

/// At most this many keywords are taken from one prompt.
const MAX_KEYWORDS: usize = 10;

/// Punctuation commonly used as prompt syntax, treated as separators.
const SEPARATORS: &[char] = &[',', '.', '!', '?', ';', ':', '(', ')', '[', ']'];

/// Extract the keyword set of a prompt, preserving first-occurrence order.
pub fn extract(prompt: &str) -> Vec<String> {
    let lowered = prompt.to_lowercase();
    let mut keywords: Vec<String> = Vec::new();

    for token in lowered.split(|c: char| c.is_whitespace() || SEPARATORS.contains(&c)) {
        if token.chars().count() < MIN_LEN {
            continue;
        }
        if STOP_WORDS.contains(&token) {
            continue;
        }
        if keywords.iter().any(|k| k == token) {
            continue;
        }
        keywords.push(token.to_string());
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }

    keywords
}
