//! Product matchers score how likely a raw record is an existing product.

use std::collections::HashSet;

use async_trait::async_trait;

use super::MatchingError;
use crate::models::CanonicalProduct;
use crate::storage::{brand_key, name_tokens};

/// Scores candidate products for a raw record's name and brand.
///
/// Returned confidences must lie in `[0, 1]`. Candidates may be omitted.
#[async_trait]
pub trait ProductMatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn score(
        &self,
        name: &str,
        brand: Option<&str>,
        candidates: &[CanonicalProduct],
    ) -> Result<Vec<(String, f64)>, MatchingError>;
}

const BRAND_BONUS: f64 = 0.1;
const BRAND_MISMATCH_FACTOR: f64 = 0.5;

fn tokens(s: &str) -> HashSet<String> {
    name_tokens(s).into_iter().collect()
}

/// Dice coefficient over the two token sets.
fn dice(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    2.0 * shared / (a.len() + b.len()) as f64
}

/// Token-overlap matcher with a brand agreement bonus.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSimilarityMatcher;

impl TokenSimilarityMatcher {
    pub fn similarity(&self, name: &str, brand: Option<&str>, candidate: &CanonicalProduct) -> f64 {
        let base = dice(&tokens(name), &tokens(&candidate.name));
        let score = match (brand, candidate.brand.as_deref()) {
            (Some(a), Some(b)) if brand_key(a) == brand_key(b) => base + BRAND_BONUS,
            (Some(_), Some(_)) => base * BRAND_MISMATCH_FACTOR,
            _ => base,
        };
        score.clamp(0.0, 1.0)
    }
}

#[async_trait]
impl ProductMatcher for TokenSimilarityMatcher {
    fn name(&self) -> &str {
        "token-similarity"
    }

    async fn score(
        &self,
        name: &str,
        brand: Option<&str>,
        candidates: &[CanonicalProduct],
    ) -> Result<Vec<(String, f64)>, MatchingError> {
        Ok(candidates
            .iter()
            .map(|c| (c.id.clone(), self.similarity(name, brand, c)))
            .filter(|(_, s)| *s > 0.0)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn product(name: &str, brand: Option<&str>) -> CanonicalProduct {
        CanonicalProduct {
            id: name.to_string(),
            name: name.to_string(),
            brand: brand.map(|b| b.to_string()),
            category: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn identical_names_with_same_brand_score_one() {
        let m = TokenSimilarityMatcher;
        let p = product("Del Maguey Vida Mezcal 750 ml", Some("Del Maguey"));
        assert_eq!(
            m.similarity("del maguey VIDA mezcal, 750 ml", Some("del  maguey"), &p),
            1.0
        );
    }

    #[test]
    fn brand_mismatch_halves_the_score() {
        let m = TokenSimilarityMatcher;
        let p = product("Reposado Tequila", Some("Fortaleza"));
        let unbranded = m.similarity("Reposado Tequila", None, &p);
        let other = m.similarity("Reposado Tequila", Some("Siete Leguas"), &p);
        assert_eq!(unbranded, 1.0);
        assert_eq!(other, 0.5);
    }

    #[tokio::test]
    async fn unrelated_candidates_are_dropped() {
        let m = TokenSimilarityMatcher;
        let candidates = vec![product("Gin", None), product("Rye Whiskey", None)];
        let scores = m.score("Rye", None, &candidates).await.unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].0, "Rye Whiskey");
    }
}
