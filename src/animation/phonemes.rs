//! # Text to Viseme Conversion
//!
//! Feeds the discrete scheduling mode. Transcript text is turned into an
//! ARPAbet-style phoneme list, each phoneme is mapped to a viseme, and each
//! viseme becomes one `ScheduledVisemeEvent` of fixed duration.
//!
//! ## Conversion Steps:
//! 1. Lowercase and split the text on whitespace
//! 2. Look each word up in a small pronunciation dictionary
//! 3. Fall back to letter-by-letter approximation for unknown words
//! 4. Map phonemes to visemes (`viseme_sil` for anything unmapped)
//! 5. Lay the events end to end at `phoneme_duration` spacing

use crate::animation::viseme::{ScheduledVisemeEvent, Viseme, VisemeWeightSet};
use std::time::Duration;

/// Phoneme → viseme table.
const PHONEME_VISEMES: &[(&str, Viseme)] = &[
    // Vowels
    ("AA", Viseme::Aa), // hot
    ("AE", Viseme::Aa), // cat
    ("AH", Viseme::Aa), // but
    ("AO", Viseme::O),  // caught
    ("AW", Viseme::O),  // cow
    ("AY", Viseme::Aa), // hide
    ("EH", Viseme::E),  // red
    ("ER", Viseme::RR), // bird
    ("EY", Viseme::E),  // say
    ("IH", Viseme::I),  // sit
    ("IY", Viseme::I),  // see
    ("OW", Viseme::O),  // show
    ("OY", Viseme::O),  // toy
    ("UH", Viseme::U),  // could
    ("UW", Viseme::U),  // too
    // Consonants
    ("B", Viseme::PP),
    ("CH", Viseme::CH),
    ("D", Viseme::DD),
    ("DH", Viseme::TH),
    ("F", Viseme::FF),
    ("G", Viseme::Kk),
    ("HH", Viseme::Aa),
    ("JH", Viseme::CH),
    ("K", Viseme::Kk),
    ("L", Viseme::Nn),
    ("M", Viseme::PP),
    ("N", Viseme::DD),
    ("NG", Viseme::Kk),
    ("P", Viseme::PP),
    ("R", Viseme::RR),
    ("S", Viseme::SS),
    ("SH", Viseme::CH),
    ("T", Viseme::DD),
    ("TH", Viseme::TH),
    ("V", Viseme::FF),
    ("W", Viseme::O),
    ("Y", Viseme::I),
    ("Z", Viseme::SS),
    ("ZH", Viseme::CH),
];

/// Known pronunciations. Everything else goes through the letter fallback.
const PRONUNCIATIONS: &[(&str, &[&str])] = &[
    ("hello", &["HH", "EH", "L", "OW"]),
    ("world", &["W", "ER", "L", "D"]),
    ("how", &["HH", "AW"]),
    ("are", &["AA", "R"]),
    ("you", &["Y", "UW"]),
];

/// Viseme for a phoneme, `viseme_sil` when the phoneme is not in the table.
pub fn phoneme_viseme(phoneme: &str) -> Viseme {
    PHONEME_VISEMES
        .iter()
        .find(|(name, _)| *name == phoneme)
        .map(|(_, viseme)| *viseme)
        .unwrap_or(Viseme::Sil)
}

fn is_known_phoneme(phoneme: &str) -> bool {
    PHONEME_VISEMES.iter().any(|(name, _)| *name == phoneme)
}

/// Convert free text into a phoneme sequence.
pub fn text_to_phonemes(text: &str) -> Vec<String> {
    let mut phonemes = Vec::new();

    for word in text.to_lowercase().split_whitespace() {
        if let Some((_, pronunciation)) = PRONUNCIATIONS.iter().find(|(known, _)| *known == word) {
            phonemes.extend(pronunciation.iter().map(|p| p.to_string()));
            continue;
        }

        for letter in word.chars() {
            match letter {
                'a' => phonemes.push("AH".to_string()),
                'e' => phonemes.push("EH".to_string()),
                'i' => phonemes.push("IH".to_string()),
                'o' => phonemes.push("OW".to_string()),
                'u' => phonemes.push("UH".to_string()),
                other => {
                    let upper = other.to_ascii_uppercase().to_string();
                    if is_known_phoneme(&upper) {
                        phonemes.push(upper);
                    }
                }
            }
        }
    }

    phonemes
}

/// Convert text into back-to-back viseme events starting at `start`.
pub fn text_to_events(text: &str, start: Duration, phoneme_duration: Duration) -> Vec<ScheduledVisemeEvent> {
    text_to_phonemes(text)
        .iter()
        .enumerate()
        .map(|(index, phoneme)| {
            ScheduledVisemeEvent::new(
                VisemeWeightSet::single(phoneme_viseme(phoneme)),
                start + phoneme_duration * index as u32,
                phoneme_duration,
            )
        })
        .collect()
}

/// Incremental converter for streamed transcript deltas.
///
/// Deltas split words at arbitrary points (`"Hel"`, `"lo wor"`, `"ld"`), so
/// the trailing fragment is held back until whitespace arrives or the
/// transcript is finished. Event offsets keep counting across deltas.
#[derive(Debug)]
pub struct TranscriptVisemes {
    partial: String,
    cursor: Duration,
    phoneme_duration: Duration,
}

impl TranscriptVisemes {
    pub fn new(phoneme_duration: Duration) -> Self {
        Self {
            partial: String::new(),
            cursor: Duration::ZERO,
            phoneme_duration,
        }
    }

    /// Append a transcript delta and return events for every completed word.
    pub fn push_delta(&mut self, delta: &str) -> Vec<ScheduledVisemeEvent> {
        self.partial.push_str(delta);

        let split_at = match self.partial.rfind(char::is_whitespace) {
            Some(index) => index,
            None => return Vec::new(),
        };

        let remainder = self.partial.split_off(split_at);
        let complete = std::mem::replace(&mut self.partial, remainder.trim_start().to_string());
        self.emit(&complete)
    }

    /// Flush whatever is buffered and restart offsets at zero.
    pub fn finish(&mut self) -> Vec<ScheduledVisemeEvent> {
        let rest = std::mem::take(&mut self.partial);
        let events = self.emit(&rest);
        self.cursor = Duration::ZERO;
        events
    }

    /// Drop buffered text without emitting anything.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.cursor = Duration::ZERO;
    }

    fn emit(&mut self, text: &str) -> Vec<ScheduledVisemeEvent> {
        let events = text_to_events(text, self.cursor, self.phoneme_duration);
        self.cursor += self.phoneme_duration * events.len() as u32;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_words_use_known_pronunciation() {
        assert_eq!(text_to_phonemes("Hello world"), vec!["HH", "EH", "L", "OW", "W", "ER", "L", "D"]);
    }

    #[test]
    fn test_letter_fallback_skips_unmapped_letters() {
        // 'c' and 'h' have no single-letter phoneme
        assert_eq!(text_to_phonemes("chat"), vec!["AH", "T"]);
    }

    #[test]
    fn test_unknown_phoneme_maps_to_silence() {
        assert_eq!(phoneme_viseme("QQ"), Viseme::Sil);
        assert_eq!(phoneme_viseme("M"), Viseme::PP);
    }

    #[test]
    fn test_events_are_laid_end_to_end() {
        let step = Duration::from_millis(100);
        let events = text_to_events("how", Duration::ZERO, step);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start, Duration::ZERO);
        assert_eq!(events[1].start, step);
        assert_eq!(events[0].weights.dominant().map(|(v, _)| v), Some(Viseme::Aa));
        assert_eq!(events[1].weights.dominant().map(|(v, _)| v), Some(Viseme::O));
    }

    #[test]
    fn test_transcript_deltas_wait_for_word_boundaries() {
        let step = Duration::from_millis(100);
        let mut transcript = TranscriptVisemes::new(step);

        assert!(transcript.push_delta("Hel").is_empty());
        let first = transcript.push_delta("lo wor");
        assert_eq!(first.len(), 4);

        // "wor" goes through the letter fallback: W, OW, R
        let rest = transcript.finish();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].start, step * 4);
    }
}
