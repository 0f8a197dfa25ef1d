//! Left/right correspondence on rectified detections.
//!
//! For each in-range left candidate the right candidates are scored by
//! relative area difference plus a vertical (epipolar) penalty. The best
//! score below the threshold wins. Matching is greedy per left candidate and
//! not exclusive: two left candidates may claim the same right candidate.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::{AreaRange, DetectionCandidate};

/// Default maximum vertical offset between matched centroids, in pixels.
pub const MAX_Y_DIFF: f64 = 10.0;
/// Default acceptance threshold on the match score.
pub const MATCH_THRESHOLD: f64 = 0.5;
/// Weight of the vertical offset in the match score.
pub const Y_DIFF_WEIGHT: f64 = 0.1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatcherParams {
    pub max_y_diff: f64,
    pub match_threshold: f64,
    pub area: AreaRange,
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self {
            max_y_diff: MAX_Y_DIFF,
            match_threshold: MATCH_THRESHOLD,
            area: AreaRange::default(),
        }
    }
}

impl MatcherParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_y_diff >= 0.0) {
            return Err(anyhow!("epipolar tolerance must be non-negative"));
        }
        if !(self.match_threshold > 0.0) {
            return Err(anyhow!("match threshold must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StereoMatch {
    pub left: DetectionCandidate,
    pub right: DetectionCandidate,
    /// `left.cx - right.cx`, always positive.
    pub disparity: f64,
    pub score: f64,
    /// `1 / (1 + score)`.
    pub depth_confidence: f64,
}

/// Score of a left/right pair, or `None` when the pair violates the epipolar
/// tolerance or the positive-disparity ordering.
pub fn pair_score(left: &DetectionCandidate, right: &DetectionCandidate, max_y_diff: f64) -> Option<f64> {
    let y_diff = (left.cy - right.cy).abs();
    if y_diff > max_y_diff {
        return None;
    }
    if right.cx >= left.cx {
        return None;
    }
    let larger = left.area.max(right.area);
    if larger <= 0.0 {
        return None;
    }
    Some((left.area - right.area).abs() / larger + Y_DIFF_WEIGHT * y_diff)
}

#[derive(Clone, Debug, Default)]
pub struct StereoMatcher {
    params: MatcherParams,
}

impl StereoMatcher {
    pub fn new(params: MatcherParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &MatcherParams {
        &self.params
    }

    pub fn match_candidates(
        &self,
        left: &[DetectionCandidate],
        right: &[DetectionCandidate],
    ) -> Vec<StereoMatch> {
        let area = self.params.area;
        let mut matches = Vec::new();
        for l in left.iter().filter(|c| area.contains(c.area)) {
            let mut best: Option<(f64, &DetectionCandidate)> = None;
            for r in right.iter().filter(|c| area.contains(c.area)) {
                let Some(score) = pair_score(l, r, self.params.max_y_diff) else {
                    continue;
                };
                if best.map_or(true, |(s, _)| score < s) {
                    best = Some((score, r));
                }
            }
            let Some((score, r)) = best else {
                continue;
            };
            if score >= self.params.match_threshold {
                continue;
            }
            let disparity = l.cx - r.cx;
            if disparity <= 0.0 {
                continue;
            }
            matches.push(StereoMatch {
                left: *l,
                right: *r,
                disparity,
                score,
                depth_confidence: 1.0 / (1.0 + score),
            });
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::candidate;

    #[test]
    fn accepts_close_pair_with_expected_score() {
        let m = StereoMatcher::default();
        let found = m.match_candidates(&[candidate(100.0, 50.0, 20.0)], &[candidate(90.0, 52.0, 21.0)]);
        assert_eq!(found.len(), 1);
        let s = found[0];
        assert!((s.score - (1.0 / 21.0 + 0.2)).abs() < 1e-12);
        assert!((s.score - 0.2476).abs() < 1e-4);
        assert_eq!(s.disparity, 10.0);
        assert!((s.depth_confidence - 1.0 / (1.0 + s.score)).abs() < 1e-12);
    }

    #[test]
    fn rejects_epipolar_violation_and_wrong_order() {
        let m = StereoMatcher::default();
        let left = [candidate(100.0, 50.0, 20.0)];
        assert!(m.match_candidates(&left, &[candidate(90.0, 61.0, 20.0)]).is_empty());
        assert!(m.match_candidates(&left, &[candidate(100.0, 50.0, 20.0)]).is_empty());
        assert!(m.match_candidates(&left, &[candidate(110.0, 50.0, 20.0)]).is_empty());
    }

    #[test]
    fn rejects_score_at_threshold() {
        let m = StereoMatcher::default();
        // Area term 0.5 alone reaches the threshold.
        let found = m.match_candidates(&[candidate(100.0, 50.0, 40.0)], &[candidate(90.0, 50.0, 20.0)]);
        assert!(found.is_empty());
    }

    #[test]
    fn picks_lowest_score_and_allows_shared_right() {
        let m = StereoMatcher::default();
        let left = [candidate(100.0, 50.0, 20.0), candidate(105.0, 50.0, 20.0)];
        let right = [candidate(90.0, 55.0, 20.0), candidate(92.0, 50.0, 20.0)];
        let found = m.match_candidates(&left, &right);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.right.cx == 92.0));
        assert_eq!(found[0].disparity, 8.0);
        assert_eq!(found[1].disparity, 13.0);
    }

    #[test]
    fn ignores_out_of_range_areas() {
        let m = StereoMatcher::default();
        assert!(m
            .match_candidates(&[candidate(100.0, 50.0, 150.0)], &[candidate(90.0, 50.0, 150.0)])
            .is_empty());
        assert!(m
            .match_candidates(&[candidate(100.0, 50.0, 20.0)], &[candidate(90.0, 50.0, 5.0)])
            .is_empty());
    }
}
