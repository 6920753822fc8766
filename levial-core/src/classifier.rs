//! Control-phrase classification of finalised transcripts.
//!
//! Matching is case-insensitive phrase matching on word boundaries. When a
//! transcript contains several configured phrases, the one that starts
//! earliest wins; at the same position the longer phrase wins.

use serde::{Deserialize, Serialize};

/// Control phrases the session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPhrase {
    Wake,
    StopSpeaking,
    Pause,
    EndSession,
}

/// Result of classifying a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Control {
        phrase: ControlPhrase,
        /// The configured phrase text that matched.
        matched: String,
    },
    Content,
}

/// Phrase lists per control kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhraseSet {
    pub wake: Vec<String>,
    pub stop_speaking: Vec<String>,
    pub pause: Vec<String>,
    pub end_session: Vec<String>,
}

impl Default for PhraseSet {
    fn default() -> Self {
        Self {
            wake: vec!["hey levial".into(), "hey jarvis".into()],
            stop_speaking: vec!["stop speaking".into(), "thank you".into()],
            pause: vec!["pause".into(), "alexa".into()],
            end_session: vec!["end session".into(), "goodbye".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandClassifier {
    /// (normalised phrase, kind, original text)
    phrases: Vec<(String, ControlPhrase, String)>,
}

impl CommandClassifier {
    pub fn new(set: &PhraseSet) -> Self {
        let groups = [
            (ControlPhrase::Wake, &set.wake),
            (ControlPhrase::StopSpeaking, &set.stop_speaking),
            (ControlPhrase::Pause, &set.pause),
            (ControlPhrase::EndSession, &set.end_session),
        ];
        let phrases = groups
            .into_iter()
            .flat_map(|(kind, list)| {
                list.iter().filter_map(move |raw| {
                    let normalized = normalize(raw);
                    (!normalized.is_empty()).then(|| (normalized, kind, raw.trim().to_string()))
                })
            })
            .collect();
        Self { phrases }
    }

    /// Classify a finalised transcript.
    pub fn classify(&self, transcript: &str) -> Classification {
        let haystack = normalize(transcript);
        let mut best: Option<(usize, usize, ControlPhrase, &str)> = None;

        for (needle, kind, original) in &self.phrases {
            let Some(pos) = find_phrase(&haystack, needle) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((best_pos, best_len, _, _)) => {
                    pos < best_pos || (pos == best_pos && needle.len() > best_len)
                }
            };
            if better {
                best = Some((pos, needle.len(), *kind, original.as_str()));
            }
        }

        match best {
            Some((_, _, phrase, matched)) => Classification::Control {
                phrase,
                matched: matched.to_string(),
            },
            None => Classification::Content,
        }
    }
}

/// Lowercase, turn punctuation into spaces, collapse whitespace.
fn normalize(text: &str) -> String {
    let lowered: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Byte offset of the first word-aligned occurrence of `needle`.
fn find_phrase(haystack: &str, needle: &str) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = haystack[start..].find(needle) {
        let pos = start + rel;
        let end = pos + needle.len();
        let left_ok = pos == 0 || haystack.as_bytes()[pos - 1] == b' ';
        let right_ok = end == haystack.len() || haystack.as_bytes()[end] == b' ';
        if left_ok && right_ok {
            return Some(pos);
        }
        start = pos + haystack[pos..].chars().next().map_or(1, char::len_utf8);
    }
    None
}
