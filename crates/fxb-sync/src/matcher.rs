//! Candidate-to-broker fuzzy matching.
//!
//! Scores: 1.0 for case-insensitive equality, 0.8 for containment in either
//! direction, otherwise shared tokens (longer than two characters) over the
//! larger token count.

use std::collections::{HashMap, HashSet};

use fxb_adapters::{slugify, SourceItem};
use fxb_core::{Broker, MatchCandidate, MatchType};
use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    pub threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

pub fn score_strings(candidate: &str, target: &str) -> f64 {
    let a = candidate.trim().to_lowercase();
    let b = target.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 0.8;
    }

    let tokens_a = a.split_whitespace().collect::<Vec<_>>();
    let tokens_b = b.split_whitespace().collect::<Vec<_>>();
    let significant_b = tokens_b
        .iter()
        .copied()
        .filter(|t| t.len() > 2)
        .collect::<HashSet<_>>();
    let shared = tokens_a
        .iter()
        .copied()
        .filter(|t| t.len() > 2)
        .collect::<HashSet<_>>()
        .intersection(&significant_b)
        .count();
    shared as f64 / tokens_a.len().max(tokens_b.len()) as f64
}

/// Slug with separators turned into spaces and a trailing year token dropped.
pub fn readable_slug(slug: &str) -> String {
    let mut tokens = slug
        .split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    if tokens.len() > 1 {
        if let Some(last) = tokens.last() {
            if last.len() == 4 && last.chars().all(|c| c.is_ascii_digit()) {
                tokens.pop();
            }
        }
    }
    tokens.join(" ")
}

/// Best of the name score and the readable-slug score; a tie records `Name`.
pub fn score_broker(candidate: &str, broker: &Broker) -> (f64, MatchType) {
    let by_name = score_strings(candidate, &broker.name);
    let by_slug = score_strings(candidate, &readable_slug(&broker.slug));
    if by_slug > by_name {
        (by_slug, MatchType::Slug)
    } else {
        (by_name, MatchType::Name)
    }
}

pub struct FuzzyMatcher {
    config: MatchConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedMatch {
    pub item: SourceItem,
    pub candidate: MatchCandidate,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMatch {
    pub item: SourceItem,
    pub candidate: MatchCandidate,
    pub canonical_item_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnmatchedItem {
    pub item: SourceItem,
    /// Closest broker even though it fell below the threshold.
    pub best: Option<MatchCandidate>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchBatch {
    pub accepted: Vec<AcceptedMatch>,
    pub duplicates: Vec<DuplicateMatch>,
    pub unmatched: Vec<UnmatchedItem>,
}

impl FuzzyMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> MatchConfig {
        self.config
    }

    /// Highest-scoring broker regardless of threshold.
    ///
    /// Equal scores are settled by, in order: the broker whose slug equals the
    /// candidate's slug, a `name` match over a `slug` match, then input order.
    pub fn rank(&self, candidate: &str, brokers: &[Broker]) -> Option<MatchCandidate> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return None;
        }
        let candidate_slug = slugify(candidate);

        let mut best: Option<(f64, bool, bool, usize, MatchType)> = None;
        for (index, broker) in brokers.iter().enumerate() {
            let (score, match_type) = score_broker(candidate, broker);
            let exact_slug = !candidate_slug.is_empty() && broker.slug == candidate_slug;
            let by_name = match_type == MatchType::Name;
            let better = match &best {
                None => true,
                Some((best_score, best_exact, best_by_name, _, _)) => {
                    (score, exact_slug, by_name) > (*best_score, *best_exact, *best_by_name)
                }
            };
            if better {
                best = Some((score, exact_slug, by_name, index, match_type));
            }
        }

        best.filter(|(score, ..)| *score > 0.0)
            .map(|(score, _, _, index, match_type)| MatchCandidate {
                extracted_name: candidate.to_string(),
                broker: brokers[index].reference(),
                broker_index: index,
                score,
                match_type,
            })
    }

    /// Best match at or above the threshold, or `None`.
    pub fn best_match(&self, candidate: &str, brokers: &[Broker]) -> Option<MatchCandidate> {
        self.rank(candidate, brokers)
            .filter(|m| m.score >= self.config.threshold)
    }

    /// Matches every item; the first item to claim a broker is canonical and
    /// later claims are kept as duplicates for review.
    pub fn match_batch(&self, items: &[SourceItem], brokers: &[Broker]) -> MatchBatch {
        let mut batch = MatchBatch::default();
        let mut claimed: HashMap<usize, Uuid> = HashMap::new();

        for item in items {
            let ranked = self.rank(&item.extracted_name, brokers);
            match ranked {
                Some(candidate) if candidate.score >= self.config.threshold => {
                    if let Some(canonical) = claimed.get(&candidate.broker_index) {
                        batch.duplicates.push(DuplicateMatch {
                            item: item.clone(),
                            candidate,
                            canonical_item_id: *canonical,
                        });
                    } else {
                        claimed.insert(candidate.broker_index, item.item_id);
                        batch.accepted.push(AcceptedMatch {
                            item: item.clone(),
                            candidate,
                        });
                    }
                }
                best => batch.unmatched.push(UnmatchedItem {
                    item: item.clone(),
                    best,
                }),
            }
        }
        batch
    }
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(name: &str, slug: &str) -> Broker {
        Broker::new(name, slug)
    }

    #[test]
    fn identical_names_score_one_regardless_of_case() {
        for (a, b) in [("Pepperstone", "pepperstone"), ("IG MARKETS", "ig markets"), ("FxPro", "FXPRO")] {
            assert_eq!(score_strings(a, b), 1.0);
        }
    }

    #[test]
    fn containment_scores_point_eight_both_ways() {
        assert_eq!(score_strings("Pepperstone Review", "Pepperstone"), 0.8);
        assert_eq!(score_strings("IG", "IG Markets"), 0.8);
        assert_eq!(score_strings("markets", "Admiral Markets"), 0.8);
    }

    #[test]
    fn token_overlap_ignores_short_tokens() {
        // "markets" shared; "fx" is too short to count.
        assert_eq!(score_strings("FX Global Markets", "Admiral Markets FX"), 1.0 / 3.0);
        assert_eq!(score_strings("Go FX", "FX Go"), 0.0);
        assert_eq!(score_strings("", "anything"), 0.0);
    }

    #[test]
    fn readable_slug_drops_trailing_year() {
        assert_eq!(readable_slug("ig-markets-2024"), "ig markets");
        assert_eq!(readable_slug("plus500"), "plus500");
        assert_eq!(readable_slug("2024"), "2024");
        assert_eq!(readable_slug("fp_markets"), "fp markets");
    }

    #[test]
    fn slug_score_wins_when_name_is_unhelpful() {
        let b = broker("Acme Holdings Ltd", "nova-fx-2023");
        let (score, kind) = score_broker("Nova FX", &b);
        assert_eq!(score, 1.0);
        assert_eq!(kind, MatchType::Slug);
    }

    #[test]
    fn review_label_matches_broker_by_name() {
        let brokers = vec![broker("IG Markets", "ig-markets"), broker("Pepperstone", "pepperstone")];
        let matched = FuzzyMatcher::default()
            .best_match("Pepperstone Review", &brokers)
            .unwrap();
        assert_eq!(matched.broker.slug, "pepperstone");
        assert_eq!(matched.match_type, MatchType::Name);
        assert!(matched.score >= 0.8);
        assert_eq!(
            serde_json::to_value(&matched).unwrap()["matchType"],
            serde_json::json!("name")
        );
    }

    #[test]
    fn below_threshold_is_no_match() {
        let brokers = vec![broker("Admiral Markets FX", "admiral-markets")];
        let matcher = FuzzyMatcher::default();
        assert!(matcher.rank("FX Global Markets", &brokers).is_some());
        assert!(matcher.best_match("FX Global Markets", &brokers).is_none());
        assert!(matcher.best_match("Zenith Capital", &brokers).is_none());
        assert!(matcher.best_match("", &brokers).is_none());
    }

    #[test]
    fn threshold_is_configurable() {
        let brokers = vec![broker("Admiral Markets FX", "admiral-markets")];
        let matcher = FuzzyMatcher::new(MatchConfig { threshold: 0.3 });
        assert!(matcher.best_match("FX Global Markets", &brokers).is_some());
    }

    #[test]
    fn ties_prefer_exact_slug_then_name_then_first() {
        let matcher = FuzzyMatcher::default();

        // Both score 1.0; only the second carries the candidate's slug.
        let brokers = vec![
            broker("Alpha Markets", "alpha-markets-ltd"),
            broker("Alpha Markets Limited", "alpha-markets"),
        ];
        let m = matcher.best_match("Alpha Markets", &brokers).unwrap();
        assert_eq!(m.broker_index, 1);
        assert_eq!(m.match_type, MatchType::Slug);

        // Equal 0.8 scores, first via slug, second via name.
        let brokers = vec![
            broker("Zeta Holdings", "alpha-trade-group"),
            broker("Alpha Trade Pro", "zeta"),
        ];
        let m = matcher.best_match("Alpha Trade", &brokers).unwrap();
        assert_eq!(m.broker_index, 1);
        assert_eq!(m.match_type, MatchType::Name);

        // Nothing else separates them.
        let brokers = vec![broker("Alpha One", "a-one"), broker("Alpha Two", "a-two")];
        let m = matcher.best_match("Alpha", &brokers).unwrap();
        assert_eq!(m.broker_index, 0);
    }

    #[test]
    fn batch_keeps_first_claim_and_reports_the_rest() {
        let brokers = vec![broker("Pepperstone", "pepperstone"), broker("OANDA", "oanda")];
        let items = vec![
            SourceItem::new("test", "pepperstone-logo.png"),
            SourceItem::new("test", "Pepperstone (1).png"),
            SourceItem::new("test", "oanda.svg"),
            SourceItem::new("test", "imgi_3_.png"),
            SourceItem::new("test", "zenith-capital.png"),
        ];
        let batch = FuzzyMatcher::default().match_batch(&items, &brokers);

        assert_eq!(batch.accepted.len(), 2);
        assert_eq!(batch.accepted[0].item.raw_label, "pepperstone-logo.png");
        assert_eq!(batch.duplicates.len(), 1);
        assert_eq!(batch.duplicates[0].canonical_item_id, items[0].item_id);
        assert_eq!(batch.unmatched.len(), 2);
        assert!(batch.unmatched.iter().all(|u| u.best.is_none()));
    }
}
