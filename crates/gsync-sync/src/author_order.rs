use crate::similarity::SimilarityScorer;

pub const AUTHOR_DELIMITER: &str = ", ";

/// Finds a subject's 1-based position in an author list.
#[derive(Debug, Clone, Copy)]
pub struct AuthorOrderResolver {
    /// A candidate matches when its partial score is strictly above this.
    pub threshold: f64,
}

impl Default for AuthorOrderResolver {
    fn default() -> Self {
        Self { threshold: 60.0 }
    }
}

impl AuthorOrderResolver {
    /// Returns 0 when nobody matches. When several authors match, the last
    /// one in list order wins.
    pub fn resolve(&self, scorer: &dyn SimilarityScorer, name: &str, authors: &str) -> i32 {
        if authors.trim().is_empty() {
            return 0;
        }
        let mut position = 0;
        for (index, candidate) in authors.split(AUTHOR_DELIMITER).enumerate() {
            if scorer.partial_ratio(name, candidate) > self.threshold {
                position = index as i32 + 1;
            }
        }
        position
    }
}
