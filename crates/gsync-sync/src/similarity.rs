//! Approximate string similarity on a 0–100 scale.

use strsim::normalized_levenshtein;

pub trait SimilarityScorer: Send + Sync {
    /// Whole-string similarity.
    fn ratio(&self, a: &str, b: &str) -> f64;

    /// Best similarity of the shorter string against any same-length window
    /// of the longer one.
    fn partial_ratio(&self, a: &str, b: &str) -> f64;
}

/// Edit-distance scorer on top of `strsim`. Case sensitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinScorer;

impl SimilarityScorer for LevenshteinScorer {
    fn ratio(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() && b.is_empty() {
            return 100.0;
        }
        normalized_levenshtein(a, b) * 100.0
    }

    fn partial_ratio(&self, a: &str, b: &str) -> f64 {
        let (short, long) = if a.chars().count() <= b.chars().count() {
            (a, b)
        } else {
            (b, a)
        };
        if short.is_empty() {
            return 0.0;
        }

        let long_chars: Vec<char> = long.chars().collect();
        let width = short.chars().count();
        long_chars
            .windows(width)
            .map(|window| {
                let window: String = window.iter().collect();
                normalized_levenshtein(short, &window) * 100.0
            })
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_full_for_identical_strings() {
        let scorer = LevenshteinScorer;
        assert_eq!(scorer.ratio("Maria Papadopoulou", "Maria Papadopoulou"), 100.0);
        assert!(scorer.ratio("M Papadopoulou", "Maria Papadopoulou") > 70.0);
        assert!(scorer.ratio("John Smith", "Jane Doe") < 50.0);
    }

    #[test]
    fn partial_ratio_finds_embedded_name() {
        let scorer = LevenshteinScorer;
        assert_eq!(scorer.partial_ratio("Smith", "John Smith"), 100.0);
        assert_eq!(scorer.partial_ratio("John Smith", "Smith"), 100.0);
        assert!(scorer.partial_ratio("J Smith", "J. Smith") > 80.0);
        assert_eq!(scorer.partial_ratio("", "anything"), 0.0);
    }
}
