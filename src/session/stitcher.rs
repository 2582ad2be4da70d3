use crate::stt::WordTiming;
use std::collections::BTreeMap;

/// Merges overlapping partial word lists from a streaming recognizer.
///
/// Words are keyed by `(start_ms, duration_ms)`, so repeated partials collapse
/// and the merged list stays sorted by start time.
#[derive(Debug, Default)]
pub struct WordStitcher {
    words: BTreeMap<(i64, i64), WordTiming>,
    max_end: f64,
    last_bucket: Option<i64>,
}

impl WordStitcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a partial result. A later word with the same key replaces the
    /// earlier text, since recognizers refine hypotheses in place.
    pub fn merge(&mut self, partial: Vec<WordTiming>) {
        for word in partial {
            if !word.start.is_finite() || !word.duration.is_finite() {
                continue;
            }
            self.max_end = self.max_end.max(word.end());
            self.words.insert(word.dedup_key(), word);
        }
    }

    pub fn max_end(&self) -> f64 {
        self.max_end
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Progress fraction to publish, only when the whole-second bucket of the
    /// furthest recognized point advanced since the last report.
    pub fn progress_update(&mut self, total_duration: Option<f64>) -> Option<f64> {
        let total = total_duration.filter(|d| *d > 0.0)?;
        let bucket = self.max_end.floor() as i64;
        if self.last_bucket.map_or(false, |last| bucket <= last) {
            return None;
        }
        self.last_bucket = Some(bucket);
        Some((self.max_end / total).clamp(0.0, 1.0))
    }

    pub fn words(&self) -> Vec<WordTiming> {
        self.words.values().cloned().collect()
    }

    pub fn into_words(self) -> Vec<WordTiming> {
        self.words.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(text: &str, start: f64, duration: f64) -> WordTiming {
        WordTiming::new(text, start, duration)
    }

    #[test]
    fn deduplicates_and_sorts() {
        let mut stitcher = WordStitcher::new();
        stitcher.merge(vec![w("two", 1.0, 0.4), w("one", 0.0, 0.5)]);
        stitcher.merge(vec![w("one", 0.0, 0.5), w("three", 2.0, 0.3)]);

        let texts: Vec<_> = stitcher.words().into_iter().map(|w| w.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!((stitcher.max_end() - 2.3).abs() < 1e-9);
    }

    #[test]
    fn later_hypothesis_replaces_text() {
        let mut stitcher = WordStitcher::new();
        stitcher.merge(vec![w("there", 0.0, 0.5)]);
        stitcher.merge(vec![w("their", 0.0, 0.5)]);

        assert_eq!(stitcher.len(), 1);
        assert_eq!(stitcher.words()[0].text, "their");
    }

    #[test]
    fn progress_throttled_per_second() {
        let mut stitcher = WordStitcher::new();
        stitcher.merge(vec![w("a", 0.0, 0.2)]);
        let first = stitcher.progress_update(Some(10.0)).unwrap();
        assert!((first - 0.02).abs() < 1e-9);

        stitcher.merge(vec![w("b", 0.3, 0.4)]);
        assert_eq!(stitcher.progress_update(Some(10.0)), None);

        stitcher.merge(vec![w("c", 1.5, 0.5)]);
        let second = stitcher.progress_update(Some(10.0)).unwrap();
        assert!((second - 0.2).abs() < 1e-9);
    }

    #[test]
    fn no_progress_without_duration() {
        let mut stitcher = WordStitcher::new();
        stitcher.merge(vec![w("a", 0.0, 2.0)]);
        assert_eq!(stitcher.progress_update(None), None);
    }
}
