//! Candidate scoring
//!
//! Eligible candidates are ranked by a weighted blend of completion rate,
//! rating and reliability before the top-K are invited.

use crate::types::WholesalerProfile;
use serde::{Deserialize, Serialize};
use store_core::WholesalerId;

/// Allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// How many of the best-ranked eligible candidates get invited
    pub top_k: usize,

    /// Weight of the completion rate in the blend
    pub weight_completion: f64,

    /// Weight of the (normalised) rating in the blend
    pub weight_rating: f64,

    /// Weight of reliability in the blend
    pub weight_reliability: f64,

    /// Whether a timeout sweep on an unlocked routing may lock the best
    /// current acceptor
    pub auto_select_on_timeout: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            weight_completion: 0.40,
            weight_rating: 0.30,
            weight_reliability: 0.30,
            auto_select_on_timeout: true,
        }
    }
}

impl AllocationConfig {
    /// Blended score for one profile.
    ///
    /// Ratings live on a 0-5 scale and are normalised into [0, 1] so the
    /// weights are comparable.
    pub fn score(&self, profile: &WholesalerProfile) -> f64 {
        self.weight_completion * profile.completion_rate.clamp(0.0, 1.0)
            + self.weight_rating * (profile.rating / 5.0).clamp(0.0, 1.0)
            + self.weight_reliability * profile.reliability.clamp(0.0, 1.0)
    }
}

/// Rank profiles best-first. Ties break on wholesaler id so ordering is
/// deterministic across runs.
pub fn rank_candidates(
    config: &AllocationConfig,
    profiles: &[WholesalerProfile],
) -> Vec<(WholesalerId, f64)> {
    let mut scored: Vec<(WholesalerId, f64)> = profiles
        .iter()
        .map(|p| (p.wholesaler_id, config.score(p)))
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.as_uuid().cmp(&b.0.as_uuid()))
    });

    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn profile(completion: f64, rating: f64, reliability: f64) -> WholesalerProfile {
        WholesalerProfile {
            wholesaler_id: WholesalerId::generate(),
            active: true,
            service_areas: vec!["area".to_string()],
            stock_available: 100,
            open_capacity: 10,
            min_order_total: Decimal::ZERO,
            completion_rate: completion,
            rating,
            reliability,
        }
    }

    #[test]
    fn test_default_weights_blend() {
        let config = AllocationConfig::default();
        let perfect = profile(1.0, 5.0, 1.0);
        assert!((config.score(&perfect) - 1.0).abs() < 1e-9);

        let middling = profile(0.5, 2.5, 0.5);
        assert!((config.score(&middling) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_inputs_clamped() {
        let config = AllocationConfig::default();
        let overdriven = profile(1.7, 9.0, 1.2);
        assert!(config.score(&overdriven) <= 1.0 + 1e-9);
    }

    #[test]
    fn test_ranking_orders_best_first() {
        let config = AllocationConfig::default();
        let strong = profile(0.95, 4.8, 0.99);
        let weak = profile(0.40, 3.0, 0.50);
        let mid = profile(0.75, 4.0, 0.80);

        let ranked = rank_candidates(&config, &[weak.clone(), strong.clone(), mid.clone()]);

        assert_eq!(ranked[0].0, strong.wholesaler_id);
        assert_eq!(ranked[1].0, mid.wholesaler_id);
        assert_eq!(ranked[2].0, weak.wholesaler_id);
    }

    #[test]
    fn test_ties_break_on_id() {
        let config = AllocationConfig::default();
        let a = profile(0.8, 4.0, 0.9);
        let b = profile(0.8, 4.0, 0.9);

        let first = rank_candidates(&config, &[a.clone(), b.clone()]);
        let second = rank_candidates(&config, &[b, a]);
        assert_eq!(
            first.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            second.iter().map(|(id, _)| *id).collect::<Vec<_>>()
        );
    }
}
