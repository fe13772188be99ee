//! Multi-factor provider scoring.
//!
//! A provider's score is a weighted sum of four sub-scores in `[0, 1]`:
//! capability match, performance, cost and availability. Weights come from a
//! named priority profile.

use super::providers::ProviderInfo;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Totals are compared at this resolution; totals in the same step are tied.
const TIE_RESOLUTION: f64 = 1e-9;

/// Quality of a capability match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    /// Every required capability is advertised.
    Perfect,
    /// At least three quarters are advertised.
    Good,
    /// At least half are advertised.
    Partial,
    /// Some are advertised.
    Minimal,
    /// None are advertised.
    None,
}

impl MatchQuality {
    /// Maps the fraction of matched requirements onto the quality scale.
    #[must_use]
    pub fn from_fraction(fraction: f64) -> Self {
        if fraction >= 1.0 {
            Self::Perfect
        } else if fraction >= 0.75 {
            Self::Good
        } else if fraction >= 0.5 {
            Self::Partial
        } else if fraction > 0.0 {
            Self::Minimal
        } else {
            Self::None
        }
    }

    /// Score of this quality.
    #[must_use]
    pub fn score(self) -> f64 {
        match self {
            Self::Perfect => 1.0,
            Self::Good => 0.8,
            Self::Partial => 0.6,
            Self::Minimal => 0.3,
            Self::None => 0.0,
        }
    }
}

/// Named weight profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityProfile {
    /// Favor latency, throughput and reliability.
    Performance,
    /// Favor cheap providers.
    Cost,
    /// Favor healthy, lightly loaded providers.
    Reliability,
    /// Default weights.
    #[default]
    Balanced,
}

impl PriorityProfile {
    /// Weights of this profile.
    #[must_use]
    pub fn weights(self) -> ScoreWeights {
        match self {
            Self::Balanced => ScoreWeights { capability: 0.4, performance: 0.3, cost: 0.2, availability: 0.1 },
            Self::Performance => ScoreWeights { capability: 0.3, performance: 0.5, cost: 0.1, availability: 0.1 },
            Self::Cost => ScoreWeights { capability: 0.3, performance: 0.2, cost: 0.4, availability: 0.1 },
            Self::Reliability => ScoreWeights { capability: 0.3, performance: 0.2, cost: 0.1, availability: 0.4 },
        }
    }
}

/// Weights of the four sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Capability match weight.
    pub capability: f64,
    /// Performance weight.
    pub performance: f64,
    /// Cost weight.
    pub cost: f64,
    /// Availability weight.
    pub availability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        PriorityProfile::Balanced.weights()
    }
}

impl ScoreWeights {
    fn sum(&self) -> f64 {
        self.capability + self.performance + self.cost + self.availability
    }
}

/// What a request needs from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Required capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Pre-computed match quality in `[0, 1]`, used instead of matching capabilities.
    #[serde(default)]
    pub capability_match: Option<f64>,
    /// Latency target.
    pub target_latency_ms: f64,
    /// Required throughput; zero means any.
    #[serde(default)]
    pub min_throughput_rps: f64,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            capability_match: None,
            target_latency_ms: 2_000.0,
            min_throughput_rps: 0.0,
        }
    }
}

impl Requirements {
    /// Requirements for the given capabilities with default targets.
    #[must_use]
    pub fn for_capabilities(capabilities: &[&str]) -> Self {
        Self { capabilities: capabilities.iter().map(ToString::to_string).collect(), ..Self::default() }
    }
}

/// Scoring options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringOptions {
    /// Weights applied to the sub-scores.
    pub weights: ScoreWeights,
    /// Price per 1000 tokens that scores 0.5 on price.
    pub reference_cost_per_1k: f64,
}

impl Default for ScoringOptions {
    fn default() -> Self {
        Self::for_profile(PriorityProfile::Balanced)
    }
}

impl ScoringOptions {
    /// Options using a profile's weights.
    #[must_use]
    pub fn for_profile(profile: PriorityProfile) -> Self {
        Self { weights: profile.weights(), reference_cost_per_1k: 0.01 }
    }
}

/// A provider's score and its components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderScore {
    /// Provider id.
    pub provider: String,
    /// Weighted total in `[0, 1]`.
    pub total: f64,
    /// Capability sub-score.
    pub capability: f64,
    /// Performance sub-score.
    pub performance: f64,
    /// Cost sub-score.
    pub cost: f64,
    /// Availability sub-score.
    pub availability: f64,
    /// Raw price, used to break ties.
    pub cost_per_1k_tokens: f64,
}

/// Scores the match between advertised and required capabilities.
#[must_use]
pub fn capability_score(info: &ProviderInfo, requirements: &Requirements) -> f64 {
    if let Some(quality) = requirements.capability_match.filter(|q| (0.0..=1.0).contains(q)) {
        return quality;
    }
    if requirements.capabilities.is_empty() {
        return MatchQuality::Perfect.score();
    }
    let matched = requirements.capabilities.iter().filter(|c| info.supports(c)).count();
    #[allow(clippy::cast_precision_loss)] // Capability lists are small
    let fraction = matched as f64 / requirements.capabilities.len() as f64;
    MatchQuality::from_fraction(fraction).score()
}

/// Blends latency against target, throughput against requirement and reliability.
#[must_use]
pub fn performance_score(info: &ProviderInfo, requirements: &Requirements) -> f64 {
    let meta = &info.metadata;

    let target = requirements.target_latency_ms.max(1.0);
    let latency = if meta.avg_latency_ms <= target {
        1.0
    } else {
        (-(meta.avg_latency_ms - target) / target).exp()
    };

    let throughput = if requirements.min_throughput_rps <= 0.0 {
        1.0
    } else {
        (meta.throughput_rps / requirements.min_throughput_rps).clamp(0.0, 1.0)
    };

    let uptime = (meta.uptime_percentage / 100.0).clamp(0.0, 1.0);
    let error_penalty = meta.error_rate.clamp(0.0, 1.0);
    let reliability = 0.7 * uptime + 0.3 * (1.0 - error_penalty);

    (0.4 * latency + 0.3 * throughput + 0.3 * reliability).clamp(0.0, 1.0)
}

/// Blends inverse normalized price with rate-limit headroom and volume discount.
#[must_use]
pub fn cost_score(info: &ProviderInfo, options: &ScoringOptions) -> f64 {
    let meta = &info.metadata;
    let reference = options.reference_cost_per_1k.max(f64::EPSILON);
    let price = 1.0 / (1.0 + meta.cost_per_1k_tokens.max(0.0) / reference);
    let discount = meta.volume_discount.clamp(0.0, 1.0);

    (0.6 * price + 0.25 * rate_limit_headroom(info) + 0.15 * discount).clamp(0.0, 1.0)
}

/// Blends health with current load and rate-limit headroom.
#[must_use]
pub fn availability_score(info: &ProviderInfo) -> f64 {
    let load = info.current_load.clamp(0.0, 1.0);
    (0.5 * info.health.score() + 0.3 * (1.0 - load) + 0.2 * rate_limit_headroom(info)).clamp(0.0, 1.0)
}

/// Unused share of the provider's requests-per-minute cap.
#[must_use]
pub fn rate_limit_headroom(info: &ProviderInfo) -> f64 {
    match info.metadata.rate_limit_rpm {
        Some(limit) if limit > 0 => 1.0 - (f64::from(info.current_usage_rpm) / f64::from(limit)).min(1.0),
        _ => 1.0,
    }
}

/// Scores and ranks providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderScorer {
    options: ScoringOptions,
}

impl ProviderScorer {
    /// Creates a scorer.
    #[must_use]
    pub fn new(options: ScoringOptions) -> Self {
        Self { options }
    }

    /// Creates a scorer using a profile's weights.
    #[must_use]
    pub fn for_profile(profile: PriorityProfile) -> Self {
        Self::new(ScoringOptions::for_profile(profile))
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &ScoringOptions {
        &self.options
    }

    /// Scores one provider.
    #[must_use]
    pub fn score(&self, info: &ProviderInfo, requirements: &Requirements) -> ProviderScore {
        let weights = &self.options.weights;
        let capability = capability_score(info, requirements);
        let performance = performance_score(info, requirements);
        let cost = cost_score(info, &self.options);
        let availability = availability_score(info);

        let weighted = weights.capability * capability
            + weights.performance * performance
            + weights.cost * cost
            + weights.availability * availability;
        let sum = weights.sum();
        let total = if sum > 0.0 { (weighted / sum).clamp(0.0, 1.0) } else { 0.0 };

        ProviderScore {
            provider: info.id.clone(),
            total,
            capability,
            performance,
            cost,
            availability,
            cost_per_1k_tokens: info.metadata.cost_per_1k_tokens,
        }
    }

    /// Scores providers and orders them best first.
    ///
    /// Ties go to the better capability match, then to the cheaper provider.
    #[must_use]
    pub fn rank(&self, providers: &[ProviderInfo], requirements: &Requirements) -> Vec<ProviderScore> {
        let mut scores: Vec<ProviderScore> = providers.iter().map(|p| self.score(p, requirements)).collect();
        scores.sort_by(compare_scores);
        scores
    }

    /// The best-scoring provider, if any.
    #[must_use]
    pub fn best(&self, providers: &[ProviderInfo], requirements: &Requirements) -> Option<ProviderScore> {
        self.rank(providers, requirements).into_iter().next()
    }
}

#[allow(clippy::cast_possible_truncation)] // Totals lie in [0, 1]
fn tie_step(total: f64) -> i64 {
    (total / TIE_RESOLUTION).round() as i64
}

fn compare_scores(a: &ProviderScore, b: &ProviderScore) -> Ordering {
    tie_step(b.total)
        .cmp(&tie_step(a.total))
        .then_with(|| b.capability.total_cmp(&a.capability))
        .then_with(|| a.cost_per_1k_tokens.total_cmp(&b.cost_per_1k_tokens))
        .then_with(|| a.provider.cmp(&b.provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::providers::{ProviderHealth, ProviderMetadata};

    fn provider(id: &str) -> ProviderInfo {
        ProviderInfo::new(id, &["chat", "code"])
    }

    #[test]
    fn test_match_quality_scale() {
        assert_eq!(MatchQuality::from_fraction(1.0), MatchQuality::Perfect);
        assert_eq!(MatchQuality::from_fraction(0.75), MatchQuality::Good);
        assert_eq!(MatchQuality::from_fraction(0.5), MatchQuality::Partial);
        assert_eq!(MatchQuality::from_fraction(0.25), MatchQuality::Minimal);
        assert_eq!(MatchQuality::from_fraction(0.0), MatchQuality::None);
    }

    #[test]
    fn test_capability_score() {
        let info = provider("p");
        assert!((capability_score(&info, &Requirements::for_capabilities(&["chat"])) - 1.0).abs() < 1e-9);
        assert!((capability_score(&info, &Requirements::for_capabilities(&["chat", "vision"])) - 0.6).abs() < 1e-9);
        assert!(capability_score(&info, &Requirements::for_capabilities(&["vision"])).abs() < 1e-9);
    }

    #[test]
    fn test_precomputed_match_passes_through() {
        let requirements = Requirements { capability_match: Some(0.42), ..Requirements::for_capabilities(&["vision"]) };
        assert!((capability_score(&provider("p"), &requirements) - 0.42).abs() < 1e-9);

        let out_of_range = Requirements { capability_match: Some(3.0), ..Requirements::for_capabilities(&["chat"]) };
        assert!((capability_score(&provider("p"), &out_of_range) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_decays_past_target() {
        let requirements = Requirements::default();
        let mut fast = provider("fast");
        fast.metadata.avg_latency_ms = 500.0;
        let mut slow = provider("slow");
        slow.metadata.avg_latency_ms = 6_000.0;
        assert!(performance_score(&fast, &requirements) > performance_score(&slow, &requirements));
    }

    #[test]
    fn test_performance_monotonic_in_uptime() {
        let requirements = Requirements::default();
        let mut previous = f64::MIN;
        for uptime in [0.0, 50.0, 90.0, 99.0, 99.9, 100.0] {
            let mut info = provider("p");
            info.metadata.uptime_percentage = uptime;
            let score = performance_score(&info, &requirements);
            assert!(score >= previous, "uptime {uptime} lowered the score");
            previous = score;
        }
    }

    #[test]
    fn test_cost_monotonic_in_price() {
        let options = ScoringOptions::default();
        let mut previous = f64::MAX;
        for cost in [0.0, 0.001, 0.01, 0.05, 1.0, 100.0] {
            let mut info = provider("p");
            info.metadata.cost_per_1k_tokens = cost;
            let score = cost_score(&info, &options);
            assert!(score <= previous, "cost {cost} raised the score");
            previous = score;
        }
    }

    #[test]
    fn test_availability_reflects_health_and_load() {
        let healthy = provider("p");
        let degraded = provider("p").with_health(ProviderHealth::Degraded);
        let mut busy = provider("p");
        busy.current_load = 0.9;
        assert!(availability_score(&healthy) > availability_score(&degraded));
        assert!(availability_score(&healthy) > availability_score(&busy));
    }

    #[test]
    fn test_headroom() {
        let mut info = provider("p");
        info.metadata.rate_limit_rpm = Some(100);
        info.current_usage_rpm = 25;
        assert!((rate_limit_headroom(&info) - 0.75).abs() < 1e-9);
        info.current_usage_rpm = 500;
        assert!(rate_limit_headroom(&info).abs() < 1e-9);
    }

    #[test]
    fn test_scores_stay_in_range() {
        let scorer = ProviderScorer::default();
        let mut extreme = provider("p");
        extreme.metadata = ProviderMetadata {
            avg_latency_ms: 1e9,
            throughput_rps: -5.0,
            uptime_percentage: 500.0,
            error_rate: 3.0,
            cost_per_1k_tokens: -1.0,
            rate_limit_rpm: Some(0),
            volume_discount: 7.0,
        };
        extreme.current_load = 12.0;
        let score = scorer.score(&extreme, &Requirements { min_throughput_rps: 10.0, ..Requirements::default() });
        for value in [score.total, score.capability, score.performance, score.cost, score.availability] {
            assert!((0.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_profiles_sum_to_one() {
        for profile in [PriorityProfile::Balanced, PriorityProfile::Performance, PriorityProfile::Cost, PriorityProfile::Reliability] {
            assert!((profile.weights().sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cost_profile_prefers_cheap_provider() {
        let mut cheap = provider("cheap");
        cheap.metadata.cost_per_1k_tokens = 0.001;
        cheap.metadata.avg_latency_ms = 3_000.0;
        let mut fast = provider("fast");
        fast.metadata.cost_per_1k_tokens = 0.1;
        fast.metadata.avg_latency_ms = 200.0;
        let providers = [cheap, fast];
        let requirements = Requirements::for_capabilities(&["chat"]);

        assert_eq!(ProviderScorer::for_profile(PriorityProfile::Cost).best(&providers, &requirements).unwrap().provider, "cheap");
        assert_eq!(
            ProviderScorer::for_profile(PriorityProfile::Performance).best(&providers, &requirements).unwrap().provider,
            "fast"
        );
    }

    #[test]
    fn test_ties_prefer_capability_then_price() {
        let a = ProviderScore {
            provider: "a".into(),
            total: 0.5,
            capability: 0.6,
            performance: 0.0,
            cost: 0.0,
            availability: 0.0,
            cost_per_1k_tokens: 0.01,
        };
        let b = ProviderScore { provider: "b".into(), capability: 0.8, ..a.clone() };
        let c = ProviderScore { provider: "c".into(), capability: 0.8, cost_per_1k_tokens: 0.001, ..a.clone() };

        let mut scores = vec![a, b, c];
        scores.sort_by(compare_scores);
        let order: Vec<&str> = scores.iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(order, ["c", "b", "a"]);
    }

    #[test]
    fn test_near_equal_totals_sort_consistently() {
        let score = |provider: &str, total: f64, capability: f64| ProviderScore {
            provider: provider.into(),
            total,
            capability,
            performance: 0.0,
            cost: 0.0,
            availability: 0.0,
            cost_per_1k_tokens: 0.01,
        };
        let scores = vec![
            score("a", 0.5, 0.9),
            score("b", 0.5 + 0.6e-9, 0.1),
            score("c", 0.5 + 1.2e-9, 0.5),
            score("d", 0.5 + 0.4e-9, 0.7),
            score("e", 0.5 + 1.6e-9, 0.3),
        ];

        for x in &scores {
            for y in &scores {
                assert_eq!(compare_scores(x, y), compare_scores(y, x).reverse());
                for z in &scores {
                    if compare_scores(x, y) != Ordering::Greater && compare_scores(y, z) != Ordering::Greater {
                        assert_ne!(compare_scores(x, z), Ordering::Greater, "{} {} {}", x.provider, y.provider, z.provider);
                    }
                }
            }
        }

        let mut forward = scores.clone();
        forward.sort_by(compare_scores);
        let mut backward: Vec<ProviderScore> = scores.into_iter().rev().collect();
        backward.sort_by(compare_scores);
        let order = |v: &[ProviderScore]| v.iter().map(|s| s.provider.clone()).collect::<Vec<_>>();
        assert_eq!(order(&forward), order(&backward));
    }
}
