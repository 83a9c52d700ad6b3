//! # Stage: Inference Engine
//!
//! ## Responsibility
//! Pure functions that turn per-variant view / conversion counts into Wilson
//! score intervals, a two-proportion z-test confidence, and a full
//! experiment [`Analysis`].
//!
//! ## Guarantees
//! - Stateless and storage-free
//! - Non-panicking: zero views, zero variance and conversions exceeding views
//!   all have defined results
//! - Interval bounds always lie in `[0, 1]`
//!
//! ## NOT Responsible For
//! - Fetching counts (see `store::EventLedger::aggregate`)
//! - Stopping or completing experiments

use serde::{Deserialize, Serialize};

use crate::model::{Experiment, VariantStat};

/// Confidence at or above which a result is reported as significant.
pub const SIGNIFICANCE_THRESHOLD: f64 = 0.95;

/// Confidence at or above which a result is reported as trending.
pub const TRENDING_THRESHOLD: f64 = 0.90;

/// Interval level used by [`analyze`].
pub const INTERVAL_CONFIDENCE: f64 = 0.95;

/// Standard two-sided z values for common confidence levels.
const Z_TABLE: [(f64, f64); 5] = [
    (0.80, 1.28),
    (0.85, 1.44),
    (0.90, 1.645),
    (0.95, 1.96),
    (0.99, 2.576),
];

// ---------------------------------------------------------------------------
// Normal distribution helpers
// ---------------------------------------------------------------------------

/// Two-sided z value for `confidence` (e.g. 0.95 → 1.96).
///
/// Table levels return the textbook values exactly; anything else goes
/// through [`inverse_normal_cdf`]. Levels outside `(0, 1)` are clamped just
/// inside the interval.
pub fn z_score(confidence: f64) -> f64 {
    if let Some(&(_, z)) = Z_TABLE.iter().find(|(c, _)| (confidence - c).abs() < 1e-9) {
        return z;
    }
    let c = confidence.clamp(1e-12, 1.0 - 1e-12);
    inverse_normal_cdf((1.0 + c) / 2.0)
}

/// Inverse of the standard normal CDF (Acklam's rational approximation,
/// relative error about 1.15e-9).
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;
    const P_HIGH: f64 = 1.0 - P_LOW;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= P_HIGH {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Standard normal CDF via Abramowitz & Stegun 7.1.26 (max error < 1.5e-7).
///
/// Odd-symmetric by construction: `normal_cdf(-x) == 1 - normal_cdf(x)`.
pub fn normal_cdf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    0.5 * (1.0 + sign * y)
}

// ---------------------------------------------------------------------------
// Wilson interval / z-test
// ---------------------------------------------------------------------------

/// Wilson score interval for `successes` out of `trials`.
///
/// Returns `(0, 0)` for zero trials. Successes above `trials` are capped at
/// `trials`.
pub fn wilson_interval(successes: u64, trials: u64, confidence: f64) -> (f64, f64) {
    if trials == 0 {
        return (0.0, 0.0);
    }

    let z = z_score(confidence);
    let n = trials as f64;
    let p = successes.min(trials) as f64 / n;
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let spread = (z / denom) * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();

    (
        (center - spread).clamp(0.0, 1.0),
        (center + spread).clamp(0.0, 1.0),
    )
}

/// Two-proportion z-test. Returns the confidence (0–1) that A's true
/// conversion rate exceeds B's; 0.5 means no evidence either way.
pub fn significance_test(a_conv: u64, a_views: u64, b_conv: u64, b_views: u64) -> f64 {
    if a_views == 0 || b_views == 0 {
        return 0.5;
    }
    let a_conv = a_conv.min(a_views);
    let b_conv = b_conv.min(b_views);

    let p_a = a_conv as f64 / a_views as f64;
    let p_b = b_conv as f64 / b_views as f64;

    let pooled = (a_conv + b_conv) as f64 / (a_views + b_views) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / a_views as f64 + 1.0 / b_views as f64)).sqrt();

    if se == 0.0 {
        return if p_a > p_b {
            1.0
        } else if p_a < p_b {
            0.0
        } else {
            0.5
        };
    }

    normal_cdf((p_a - p_b) / se)
}

/// Conversion rate with conversions capped at views; 0 when unviewed.
pub fn conversion_rate(conversions: u64, views: u64) -> f64 {
    if views == 0 {
        0.0
    } else {
        conversions.min(views) as f64 / views as f64
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Per-variant row of an [`Analysis`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub index: usize,
    pub label: String,
    pub views: u64,
    pub conversions: u64,
    pub rate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Summary of how far the evidence goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Confidence ≥ 0.95.
    Significant,
    /// Confidence ≥ 0.90.
    Trending,
    InsufficientData,
}

/// Statistical summary of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub variants: Vec<VariantResult>,
    pub leading_variant: usize,
    /// Confidence that the leading variant beats its comparison arm.
    pub confidence: f64,
    pub confident: bool,
}

impl Analysis {
    pub fn verdict(&self) -> Verdict {
        if self.variants.len() < 2 {
            Verdict::InsufficientData
        } else if self.confidence >= SIGNIFICANCE_THRESHOLD {
            Verdict::Significant
        } else if self.confidence >= TRENDING_THRESHOLD {
            Verdict::Trending
        } else {
            Verdict::InsufficientData
        }
    }

    pub fn leader(&self) -> Option<&VariantResult> {
        self.variants.get(self.leading_variant)
    }
}

/// Analyze `experiment` given its aggregated counts.
///
/// Variants with no recorded events count as zero. The leading variant is the
/// first one with the highest rate. When the control (index 0) leads it is
/// compared against the best challenger; otherwise the leader is compared
/// against the control.
pub fn analyze(experiment: &Experiment, stats: &[VariantStat]) -> Analysis {
    let mut variants = Vec::with_capacity(experiment.variants.len());
    let mut leading = 0usize;
    let mut max_rate = 0.0f64;

    for (index, label) in experiment.variants.iter().enumerate() {
        let stat = stats
            .iter()
            .find(|s| s.variant == index)
            .copied()
            .unwrap_or(VariantStat { variant: index, ..Default::default() });

        let rate = conversion_rate(stat.conversions, stat.views);
        let (ci_lower, ci_upper) = wilson_interval(stat.conversions, stat.views, INTERVAL_CONFIDENCE);

        if rate > max_rate {
            max_rate = rate;
            leading = index;
        }

        variants.push(VariantResult {
            index,
            label: label.clone(),
            views: stat.views,
            conversions: stat.conversions,
            rate,
            ci_lower,
            ci_upper,
        });
    }

    let confidence = if variants.len() < 2 {
        0.0
    } else if leading == 0 {
        let mut challenger = 1usize;
        let mut best = 0.0f64;
        for v in &variants[1..] {
            if v.rate > best {
                best = v.rate;
                challenger = v.index;
            }
        }
        compare(&variants[0], &variants[challenger])
    } else {
        compare(&variants[leading], &variants[0])
    };

    Analysis {
        variants,
        leading_variant: leading,
        confidence,
        confident: confidence >= SIGNIFICANCE_THRESHOLD,
    }
}

fn compare(a: &VariantResult, b: &VariantResult) -> f64 {
    significance_test(a.conversions, a.views, b.conversions, b.views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExperimentState, Provenance, Targeting};
    use rstest::rstest;

    fn experiment(labels: &[&str]) -> Experiment {
        Experiment {
            id: 1,
            name: "hero".into(),
            variants: labels.iter().map(|s| s.to_string()).collect(),
            weights: None,
            goal: None,
            state: ExperimentState::Running,
            winner: None,
            provenance: Provenance::Server,
            has_conflict: false,
            targeting: Targeting::default(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn stat(variant: usize, views: u64, conversions: u64) -> VariantStat {
        VariantStat { variant, views, conversions }
    }

    #[rstest]
    #[case(0.80, 1.28)]
    #[case(0.85, 1.44)]
    #[case(0.90, 1.645)]
    #[case(0.95, 1.96)]
    #[case(0.99, 2.576)]
    fn test_z_score_table_exact(#[case] c: f64, #[case] z: f64) {
        assert_eq!(z_score(c), z);
    }

    #[rstest]
    #[case(0.50, 0.674_489_750)]
    #[case(0.68, 0.994_457_883)]
    #[case(0.975, 2.241_402_728)]
    #[case(0.999, 3.290_526_731)]
    fn test_z_score_off_table_uses_inverse_cdf(#[case] c: f64, #[case] z: f64) {
        assert!((z_score(c) - z).abs() < 1e-6, "z_score({c}) = {}", z_score(c));
    }

    #[test]
    fn test_inverse_cdf_tails_and_center() {
        assert!(inverse_normal_cdf(0.5).abs() < 1e-12);
        assert!((inverse_normal_cdf(0.01) + 2.326_347_874).abs() < 1e-6);
        assert!((inverse_normal_cdf(0.99) - 2.326_347_874).abs() < 1e-6);
        assert_eq!(inverse_normal_cdf(0.0), f64::NEG_INFINITY);
        assert_eq!(inverse_normal_cdf(1.0), f64::INFINITY);
    }

    #[test]
    fn test_normal_cdf_known_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-4);
        assert!(normal_cdf(8.0) > 0.999_999);
    }

    #[test]
    fn test_wilson_half() {
        let (lo, hi) = wilson_interval(50, 100, 0.95);
        assert!((0.38..=0.42).contains(&lo), "lower {lo}");
        assert!((0.58..=0.62).contains(&hi), "upper {hi}");
    }

    #[test]
    fn test_wilson_zero_trials() {
        assert_eq!(wilson_interval(0, 0, 0.95), (0.0, 0.0));
    }

    #[test]
    fn test_wilson_extremes() {
        let (lo, hi) = wilson_interval(0, 100, 0.95);
        assert!(lo < 1e-12);
        assert!((0.01..=0.05).contains(&hi));
        let (lo, hi) = wilson_interval(100, 100, 0.95);
        assert!((0.95..=0.99).contains(&lo));
        assert!(hi <= 1.0 && hi >= 0.99);
    }

    #[test]
    fn test_wilson_small_sample_is_wide() {
        let (lo, hi) = wilson_interval(5, 10, 0.95);
        assert!(hi - lo > 0.3);
    }

    #[test]
    fn test_wilson_caps_successes() {
        assert_eq!(wilson_interval(150, 100, 0.95), wilson_interval(100, 100, 0.95));
    }

    #[test]
    fn test_significance_clear_winner() {
        assert!(significance_test(100, 1000, 50, 1000) >= 0.95);
        assert!(significance_test(50, 1000, 100, 1000) <= 0.05);
    }

    #[test]
    fn test_significance_no_data_is_half() {
        assert_eq!(significance_test(0, 0, 0, 0), 0.5);
        assert_eq!(significance_test(5, 10, 0, 0), 0.5);
        assert_eq!(significance_test(0, 0, 5, 10), 0.5);
    }

    #[test]
    fn test_significance_zero_variance() {
        assert_eq!(significance_test(0, 10, 0, 10), 0.5);
        assert_eq!(significance_test(10, 10, 10, 10), 0.5);
    }

    #[test]
    fn test_significance_equal_rates_is_half() {
        assert!((significance_test(10, 100, 10, 100) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_analyze_leading_challenger() {
        let exp = experiment(&["A", "B"]);
        let a = analyze(&exp, &[stat(0, 100, 10), stat(1, 100, 20)]);
        assert_eq!(a.leading_variant, 1);
        assert!((a.variants[0].rate - 0.10).abs() < 1e-12);
        assert!((a.variants[1].rate - 0.20).abs() < 1e-12);
        assert!(a.variants[1].ci_lower > a.variants[0].ci_lower);
        assert!(a.variants[1].ci_upper > a.variants[0].ci_upper);
        assert!(a.confidence > 0.95);
        assert!(a.confident);
        assert_eq!(a.verdict(), Verdict::Significant);
    }

    #[test]
    fn test_analyze_control_leads_against_best_challenger() {
        let exp = experiment(&["A", "B", "C"]);
        let stats = [stat(0, 1000, 100), stat(1, 1000, 20), stat(2, 1000, 80)];
        let a = analyze(&exp, &stats);
        assert_eq!(a.leading_variant, 0);
        let expected = significance_test(100, 1000, 80, 1000);
        assert!((a.confidence - expected).abs() < 1e-12);
    }

    #[test]
    fn test_analyze_ties_go_to_lowest_index() {
        let exp = experiment(&["A", "B", "C"]);
        let a = analyze(&exp, &[stat(0, 100, 5), stat(1, 100, 10), stat(2, 100, 10)]);
        assert_eq!(a.leading_variant, 1);
    }

    #[test]
    fn test_analyze_fills_missing_variants() {
        let exp = experiment(&["A", "B", "C"]);
        let a = analyze(&exp, &[stat(2, 10, 1)]);
        assert_eq!(a.variants.len(), 3);
        assert_eq!(a.variants[0].views, 0);
        assert_eq!(a.variants[1].ci_upper, 0.0);
        assert_eq!(a.leading_variant, 2);
        assert_eq!(a.confidence, 0.5);
        assert_eq!(a.verdict(), Verdict::InsufficientData);
    }

    #[test]
    fn test_analyze_no_data_defaults_to_control() {
        let exp = experiment(&["A", "B"]);
        let a = analyze(&exp, &[]);
        assert_eq!(a.leading_variant, 0);
        assert_eq!(a.confidence, 0.5);
        assert!(!a.confident);
    }

    #[test]
    fn test_analyze_single_variant_has_zero_confidence() {
        let exp = experiment(&["only"]);
        let a = analyze(&exp, &[stat(0, 100, 50)]);
        assert_eq!(a.confidence, 0.0);
        assert!(!a.confident);
        assert_eq!(a.leader().map(|v| v.label.as_str()), Some("only"));
    }

    #[test]
    fn test_analyze_ignores_stats_for_unknown_variants() {
        let exp = experiment(&["A", "B"]);
        let a = analyze(&exp, &[stat(0, 10, 1), stat(7, 10, 9)]);
        assert_eq!(a.variants.len(), 2);
        assert_eq!(a.leading_variant, 0);
    }

    #[test]
    fn test_verdict_trending_band() {
        let a = Analysis {
            variants: vec![],
            leading_variant: 0,
            confidence: 0.92,
            confident: false,
        };
        assert_eq!(a.verdict(), Verdict::InsufficientData);
        let exp = experiment(&["A", "B"]);
        let mut a = analyze(&exp, &[]);
        a.confidence = 0.92;
        assert_eq!(a.verdict(), Verdict::Trending);
    }
}
