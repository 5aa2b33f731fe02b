// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Panic keyword detection over recognised speech.

use tracing::{debug, warn};

use crate::services::PanicSignal;

/// One detection: the keyword that fired and the text it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicCue {
    pub keyword: String,
    pub transcript: String,
}

/// Matches transcripts against the configured panic keywords.
pub struct KeywordDetector {
    keywords: Vec<String>,
    tx: async_channel::Sender<PanicCue>,
    rx: async_channel::Receiver<PanicCue>,
}

impl KeywordDetector {
    pub fn new(keywords: &[String]) -> Self {
        let keywords = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let (tx, rx) = async_channel::unbounded();
        Self { keywords, tx, rx }
    }

    /// Lowercase and strip everything but letters.
    fn normalize_word(word: &str) -> String {
        word.chars()
            .filter(|c| c.is_alphabetic())
            .flat_map(|c| c.to_lowercase())
            .collect()
    }

    /// First keyword present in `transcript`, either as a whole word or,
    /// for multi-word keywords, as a phrase.
    pub fn find_keyword(&self, transcript: &str) -> Option<&str> {
        let text = transcript.to_lowercase();

        for word in text.split_whitespace() {
            let clean = Self::normalize_word(word);
            if let Some(keyword) = self.keywords.iter().find(|k| **k == clean) {
                return Some(keyword);
            }
        }

        self.keywords
            .iter()
            .filter(|k| k.contains(' '))
            .find(|k| text.contains(k.as_str()))
            .map(String::as_str)
    }

    /// Check a transcript and raise at most one cue for it.
    pub fn feed(&self, transcript: &str) -> bool {
        let Some(keyword) = self.find_keyword(transcript) else {
            debug!("No panic keyword in '{}'", transcript);
            return false;
        };

        warn!("Panic keyword '{}' detected in '{}'", keyword, transcript);
        let _ = self.tx.try_send(PanicCue {
            keyword: keyword.to_string(),
            transcript: transcript.to_string(),
        });
        true
    }
}

impl PanicSignal for KeywordDetector {
    fn cues(&self) -> async_channel::Receiver<PanicCue> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> KeywordDetector {
        let keywords: Vec<String> = ["help", "fire", "call police"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        KeywordDetector::new(&keywords)
    }

    #[test]
    fn test_word_match_ignores_case_and_punctuation() {
        let detector = detector();
        assert_eq!(detector.find_keyword("Somebody HELP!"), Some("help"));
        assert_eq!(detector.find_keyword("there's a fire, run"), Some("fire"));
        assert_eq!(detector.find_keyword("helpful people"), None);
    }

    #[test]
    fn test_phrase_match() {
        let detector = detector();
        assert_eq!(
            detector.find_keyword("please call police now"),
            Some("call police")
        );
    }

    #[tokio::test]
    async fn test_feed_raises_one_cue() {
        let detector = detector();
        let cues = detector.cues();

        assert!(detector.feed("help fire"));
        assert!(!detector.feed("all good"));

        let cue = cues.recv().await.unwrap();
        assert_eq!(cue.keyword, "help");
        assert_eq!(cue.transcript, "help fire");
        assert!(cues.try_recv().is_err());
    }
}
