//! Near-duplicate broker detection over names and slugs.

use fxb_core::{Broker, BrokerRef};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use crate::matcher::readable_slug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateReviewItem {
    pub broker_a: BrokerRef,
    pub broker_b: BrokerRef,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub cluster_id: String,
    pub confidence_score: f64,
    pub members: Vec<BrokerRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub clusters: Vec<DuplicateCluster>,
    pub review_items: Vec<DuplicateReviewItem>,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub auto_cluster_threshold: f64,
    pub review_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            auto_cluster_threshold: 0.95,
            review_threshold: 0.88,
        }
    }
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn similarity(&self, a: &Broker, b: &Broker) -> f64 {
        let name_a = Self::normalize_key_fragment(&a.name);
        let name_b = Self::normalize_key_fragment(&b.name);
        let slug_a = Self::normalize_key_fragment(&readable_slug(&a.slug));
        let slug_b = Self::normalize_key_fragment(&readable_slug(&b.slug));
        let name_score = jaro_winkler(&name_a, &name_b);
        let slug_score = jaro_winkler(&slug_a, &slug_b);
        (name_score * 0.7) + (slug_score * 0.3)
    }

    /// Pairs above the auto threshold become clusters; pairs between the two
    /// thresholds go to the review queue. Nothing is merged automatically.
    pub fn detect(&self, brokers: &[Broker]) -> DuplicateReport {
        let mut report = DuplicateReport::default();

        for i in 0..brokers.len() {
            for j in (i + 1)..brokers.len() {
                let score = self.similarity(&brokers[i], &brokers[j]);
                if score >= self.config.auto_cluster_threshold {
                    report.clusters.push(DuplicateCluster {
                        cluster_id: format!("cluster-{}-{}", brokers[i].slug, brokers[j].slug),
                        confidence_score: score,
                        members: vec![brokers[i].reference(), brokers[j].reference()],
                    });
                } else if score >= self.config.review_threshold {
                    report.review_items.push(DuplicateReviewItem {
                        broker_a: brokers[i].reference(),
                        broker_b: brokers[j].reference(),
                        confidence_score: score,
                    });
                }
            }
        }

        report
    }
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(name: &str, slug: &str) -> Broker {
        Broker::new(name, slug)
    }

    #[test]
    fn true_match_clusters() {
        let report = DedupEngine::default().detect(&[
            mk("Pepperstone", "pepperstone"),
            mk("Peperstone", "peperstone"),
            mk("IG Markets", "ig-markets"),
            mk("IG Markets", "ig-markets-2024"),
        ]);
        assert_eq!(report.clusters.len(), 2);
        assert!(report.review_items.is_empty());
        assert!(report.clusters.iter().all(|c| c.confidence_score >= 0.95));
        assert_eq!(report.clusters[1].cluster_id, "cluster-ig-markets-ig-markets-2024");
    }

    #[test]
    fn false_positive_does_not_cluster() {
        let report = DedupEngine::default().detect(&[
            mk("Pepperstone", "pepperstone"),
            mk("OANDA", "oanda"),
            mk("XM Group", "xm-group"),
            mk("XM Global", "xm-global"),
        ]);
        assert!(report.clusters.is_empty());
        assert!(report.review_items.is_empty());
    }

    #[test]
    fn borderline_pair_goes_to_review_queue() {
        let report = DedupEngine::default().detect(&[
            mk("Admiral Markets", "admiral-markets"),
            mk("Admirals Markets", "admirals-markets"),
        ]);
        assert!(report.clusters.is_empty());
        assert_eq!(report.review_items.len(), 1);
        assert!(report.review_items[0].confidence_score >= 0.88);
        assert_eq!(report.review_items[0].broker_b.slug, "admirals-markets");
    }
}
