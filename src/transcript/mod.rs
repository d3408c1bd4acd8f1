//! Ordered, mergeable store of transcribed utterances for one meeting.
//!
//! Transcription events arrive out of strict lockstep: the recognizer
//! emits interim results for a segment before its final form, and the
//! delivery path may duplicate or reorder them. The buffer resolves all
//! of that with one rule — finality never regresses. A final utterance
//! is immutable; an interim one may only be replaced by its final form
//! or by a strictly more complete interim form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One transcribed speech segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    /// Monotonic sequence number within the session.
    pub seq: u64,
    /// Speaker label, if the recognizer resolved one.
    pub speaker: Option<String>,
    pub text: String,
    pub is_final: bool,
    /// Offsets relative to session start, in seconds.
    pub start_secs: f64,
    pub end_secs: f64,
}

/// What `ingest` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Replaced,
    /// Late/duplicate event that lost to the finality-monotonicity rule.
    Rejected,
}

#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    utterances: BTreeMap<u64, Utterance>,
    high_water_mark: u64,
    final_count: usize,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one utterance into the buffer.
    ///
    /// For a sequence number already present, final beats interim and a
    /// longer interim beats a shorter one; anything else is a no-op
    /// recorded as a late/duplicate event.
    pub fn ingest(&mut self, utterance: Utterance) -> IngestOutcome {
        let seq = utterance.seq;
        let outcome = match self.utterances.get(&seq) {
            None => {
                if utterance.is_final {
                    self.final_count += 1;
                }
                self.utterances.insert(seq, utterance);
                IngestOutcome::Inserted
            }
            Some(existing) => {
                if existing.is_final {
                    debug!(seq, "Dropping late event for finalized utterance");
                    IngestOutcome::Rejected
                } else if utterance.is_final {
                    self.final_count += 1;
                    self.utterances.insert(seq, utterance);
                    IngestOutcome::Replaced
                } else if utterance.text.len() > existing.text.len() {
                    self.utterances.insert(seq, utterance);
                    IngestOutcome::Replaced
                } else {
                    debug!(seq, "Dropping interim event with no new content");
                    IngestOutcome::Rejected
                }
            }
        };

        if seq > self.high_water_mark {
            self.high_water_mark = seq;
        }

        outcome
    }

    /// Highest sequence number seen so far.
    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    /// Ordered copy of all utterances. Cheap enough for meeting-sized
    /// transcripts; callers get a view that cannot tear under ingestion.
    pub fn snapshot(&self) -> Vec<Utterance> {
        self.utterances.values().cloned().collect()
    }

    /// Concatenated final-only text for sequence numbers greater than
    /// `mark`. Interim utterances never feed briefing input.
    pub fn text_since(&self, mark: u64) -> String {
        let mut out = String::new();
        for u in self.utterances.values() {
            if u.seq <= mark || !u.is_final {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            if let Some(speaker) = &u.speaker {
                out.push_str(speaker);
                out.push_str(": ");
            }
            out.push_str(&u.text);
        }
        out
    }

    /// Tail of the final-only transcript, budgeted in characters, used as
    /// composition context.
    pub fn tail_text(&self, max_chars: usize) -> String {
        let full = self.text_since(0);
        if full.len() <= max_chars {
            return full;
        }
        // Cut on a char boundary near the budget.
        let mut start = full.len() - max_chars;
        while !full.is_char_boundary(start) {
            start += 1;
        }
        full[start..].to_string()
    }

    /// Distinct speaker labels among finalized utterances, in order of
    /// first appearance.
    pub fn speakers(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for u in self.utterances.values() {
            if !u.is_final {
                continue;
            }
            if let Some(speaker) = &u.speaker {
                if !seen.contains(speaker) {
                    seen.push(speaker.clone());
                }
            }
        }
        seen
    }

    /// Seconds of meeting audio covered by finalized utterances.
    pub fn covered_secs(&self) -> f64 {
        self.utterances
            .values()
            .filter(|u| u.is_final)
            .map(|u| u.end_secs)
            .fold(0.0, f64::max)
    }

    /// Number of finalized utterances. Interim-only buffers count zero,
    /// which keeps the briefing sentinel in place until real transcript
    /// text exists.
    pub fn final_count(&self) -> usize {
        self.final_count
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utt(seq: u64, text: &str, is_final: bool) -> Utterance {
        Utterance {
            seq,
            speaker: None,
            text: text.to_string(),
            is_final,
            start_secs: seq as f64,
            end_secs: seq as f64 + 1.0,
        }
    }

    #[test]
    fn test_ingest_orders_by_seq() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(3, "third", true));
        buf.ingest(utt(1, "first", true));
        buf.ingest(utt(2, "second", true));

        let snapshot = buf.snapshot();
        let texts: Vec<_> = snapshot.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(buf.high_water_mark(), 3);
    }

    #[test]
    fn test_final_replaces_interim() {
        let mut buf = TranscriptBuffer::new();
        assert_eq!(
            buf.ingest(utt(1, "we should", false)),
            IngestOutcome::Inserted
        );
        assert_eq!(
            buf.ingest(utt(1, "we should approve the budget", true)),
            IngestOutcome::Replaced
        );

        let snapshot = buf.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "we should approve the budget");
        assert!(snapshot[0].is_final);
    }

    #[test]
    fn test_final_never_regresses_to_interim() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(1, "we should approve the budget", true));
        assert_eq!(
            buf.ingest(utt(1, "we should", false)),
            IngestOutcome::Rejected
        );

        let snapshot = buf.snapshot();
        assert!(snapshot[0].is_final);
        assert_eq!(snapshot[0].text, "we should approve the budget");
    }

    #[test]
    fn test_longer_interim_replaces_shorter() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(1, "we", false));
        assert_eq!(
            buf.ingest(utt(1, "we should", false)),
            IngestOutcome::Replaced
        );
        assert_eq!(buf.ingest(utt(1, "we", false)), IngestOutcome::Rejected);
        assert_eq!(buf.snapshot()[0].text, "we should");
    }

    #[test]
    fn test_duplicate_final_rejected() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(1, "hello", true));
        assert_eq!(buf.ingest(utt(1, "hello", true)), IngestOutcome::Rejected);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_monotonicity_under_any_interleaving() {
        // Every permutation of the same-seq event set converges to the
        // final form.
        let events = [
            utt(1, "we", false),
            utt(1, "we should", false),
            utt(1, "we should approve the budget", true),
        ];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut buf = TranscriptBuffer::new();
            for &i in &order {
                buf.ingest(events[i].clone());
            }
            let snapshot = buf.snapshot();
            assert_eq!(snapshot.len(), 1, "order {:?}", order);
            assert!(snapshot[0].is_final, "order {:?}", order);
            assert_eq!(
                snapshot[0].text, "we should approve the budget",
                "order {:?}",
                order
            );
        }
    }

    #[test]
    fn test_text_since_excludes_interim() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(1, "final one", true));
        buf.ingest(utt(2, "still interim", false));
        buf.ingest(utt(3, "final three", true));

        assert_eq!(buf.text_since(0), "final one\nfinal three");
        assert_eq!(buf.text_since(1), "final three");
        assert_eq!(buf.text_since(3), "");
    }

    #[test]
    fn test_text_since_includes_speaker_labels() {
        let mut buf = TranscriptBuffer::new();
        let mut u = utt(1, "morning everyone", true);
        u.speaker = Some("Alice".to_string());
        buf.ingest(u);

        assert_eq!(buf.text_since(0), "Alice: morning everyone");
    }

    #[test]
    fn test_speakers_in_first_appearance_order() {
        let mut buf = TranscriptBuffer::new();
        for (seq, name) in [(1, "Bob"), (2, "Alice"), (3, "Bob")] {
            let mut u = utt(seq, "hi", true);
            u.speaker = Some(name.to_string());
            buf.ingest(u);
        }
        assert_eq!(buf.speakers(), vec!["Bob", "Alice"]);
    }

    #[test]
    fn test_covered_secs_ignores_interim() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(1, "a", true));
        buf.ingest(utt(5, "b", false));
        assert_eq!(buf.covered_secs(), 2.0);
    }

    #[test]
    fn test_tail_text_respects_budget() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(1, "aaaaaaaaaa", true));
        buf.ingest(utt(2, "bbbbbbbbbb", true));

        let tail = buf.tail_text(12);
        assert!(tail.len() <= 12);
        assert!(tail.ends_with("bbbbbbbbbb"));

        assert_eq!(buf.tail_text(1000), "aaaaaaaaaa\nbbbbbbbbbb");
    }

    #[test]
    fn test_final_count_ignores_interim() {
        let mut buf = TranscriptBuffer::new();
        assert_eq!(buf.final_count(), 0);

        buf.ingest(utt(1, "we", false));
        buf.ingest(utt(2, "maybe", false));
        assert_eq!(buf.final_count(), 0, "interim utterances do not count");

        buf.ingest(utt(1, "we should approve", true));
        assert_eq!(buf.final_count(), 1, "interim promoted to final counts");

        buf.ingest(utt(3, "done", true));
        assert_eq!(buf.final_count(), 2);

        // Duplicates of an already-final seq do not inflate the count.
        buf.ingest(utt(3, "done", true));
        buf.ingest(utt(3, "d", false));
        assert_eq!(buf.final_count(), 2);
    }

    #[test]
    fn test_high_water_mark_tracks_rejected_events() {
        let mut buf = TranscriptBuffer::new();
        buf.ingest(utt(7, "hello", true));
        assert_eq!(buf.high_water_mark(), 7);
        // A rejected duplicate does not lower it.
        buf.ingest(utt(7, "h", false));
        assert_eq!(buf.high_water_mark(), 7);
    }
}
