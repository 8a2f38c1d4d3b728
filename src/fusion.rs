//! Weighted consensus over local and mirror votes.
//!
//! Fusion is pure: the same inputs always produce the same consensus. Local
//! analyzer results and mirror network scores become votes (`score ≥ 0.5`
//! reads as "authentic"); the consensus threshold sits at a positive ratio
//! of 0.6. Degraded or timed-out remote envelopes contribute no votes and
//! never block a verdict. The superior network does not vote either — on
//! disagreement with the local consensus it forces the confidence level to
//! `review_required` while the consensus decision stands.

use smallvec::SmallVec;

use crate::analyzers::runner::AnalyzerAggregate;
use crate::verdict::{
    Confidence, ConfidenceLevel, LocalConsensus, MirrorEnvelope, PerformanceClass,
    SuperiorEnvelope, VoteKind, VoteSource,
};

/// Score at or above which a vote reads as "authentic".
const VOTE_THRESHOLD: f64 = 0.5;

/// Positive ratio at or above which the consensus is "authentic".
const CONSENSUS_THRESHOLD: f64 = 0.6;

struct Vote {
    positive: bool,
    confidence: Confidence,
    score: f64,
}

/// Fuses local analyzer results with the mirror envelope into a consensus.
pub fn fuse(local: &AnalyzerAggregate, mirror: &MirrorEnvelope) -> LocalConsensus {
    let mut votes: Vec<Vote> = Vec::new();
    let mut sources: SmallVec<[VoteSource; 8]> = SmallVec::new();

    // Deterministic order regardless of map iteration: sort local by name.
    let mut local_results: Vec<_> = local.results.values().collect();
    local_results.sort_by(|a, b| a.analyzer.cmp(&b.analyzer));
    for result in local_results {
        if !result.ok {
            continue;
        }
        let Some(score) = result.score else { continue };
        votes.push(Vote {
            positive: score >= VOTE_THRESHOLD,
            confidence: result.confidence,
            score,
        });
        sources.push(VoteSource { kind: VoteKind::Local, name: result.analyzer.clone() });
    }

    if let MirrorEnvelope::Ok { networks } = mirror {
        for network in networks {
            votes.push(Vote {
                positive: network.score >= VOTE_THRESHOLD,
                confidence: network.confidence,
                score: network.score,
            });
            sources.push(VoteSource { kind: VoteKind::Mirror, name: network.name.clone() });
        }
    }

    let total = votes.len();
    let positives = votes.iter().filter(|v| v.positive).count();
    let positive_ratio = if total == 0 {
        0.5
    } else {
        positives as f64 / total as f64
    };
    let weighted_confidence = if total == 0 {
        0.0
    } else {
        votes.iter().map(|v| v.confidence.weight()).sum::<f64>() / total as f64
    };

    let level = classify(&votes, positive_ratio, weighted_confidence);

    LocalConsensus {
        votes: total,
        positives,
        positive_ratio,
        weighted_confidence,
        level,
        is_authentic: positive_ratio >= CONSENSUS_THRESHOLD,
        sources,
    }
}

/// Confidence classification over the vote set.
///
/// A single vote can reach `high` only through the documented tie-break: a
/// high-confidence vote with an extreme score (≥ 0.8 or ≤ 0.2). Multi-vote
/// sets use the ratio/weight rules directly.
fn classify(votes: &[Vote], ratio: f64, weighted: f64) -> ConfidenceLevel {
    if votes.len() == 1 {
        let vote = &votes[0];
        return if vote.confidence == Confidence::High && !(0.2..0.8).contains(&vote.score) {
            ConfidenceLevel::High
        } else if weighted >= 0.6 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        };
    }
    let decisive = |edge: f64| ratio >= edge || ratio <= 1.0 - edge;
    if weighted >= 0.8 && decisive(0.8) {
        ConfidenceLevel::High
    } else if weighted >= 0.6 && decisive(0.6) {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    }
}

/// Applies the superior override: disagreement on authenticity forces
/// `review_required`; everything else keeps the consensus level.
pub fn final_confidence(consensus: &LocalConsensus, superior: &SuperiorEnvelope) -> ConfidenceLevel {
    match superior.decision() {
        Some(decision) if decision.is_authentic != consensus.is_authentic => {
            ConfidenceLevel::ReviewRequired
        }
        _ => consensus.level,
    }
}

/// Buckets a request's total latency against its targets.
pub fn classify_performance(total_ms: u64, p95_target_ms: u64, p99_target_ms: u64) -> PerformanceClass {
    if total_ms <= p95_target_ms {
        PerformanceClass::Optimal
    } else if total_ms <= p99_target_ms {
        PerformanceClass::Acceptable
    } else {
        PerformanceClass::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::{AnalyzerResult, NetworkScore, SuperiorDecision};
    use std::collections::HashMap;

    fn local_result(name: &str, score: Option<f64>, confidence: Confidence, ok: bool) -> AnalyzerResult {
        AnalyzerResult {
            analyzer: name.into(),
            version: "1".into(),
            score,
            confidence,
            detail: serde_json::Map::new(),
            duration_ms: 5,
            ok,
            error: None,
        }
    }

    fn aggregate(results: Vec<AnalyzerResult>) -> AnalyzerAggregate {
        let mut map = HashMap::new();
        let total = results.len();
        let success = results.iter().filter(|r| r.ok).count();
        for r in results {
            map.insert(r.analyzer.clone(), r);
        }
        AnalyzerAggregate {
            results: map,
            errors: vec![],
            total_duration_ms: 10,
            success_count: success,
            total_count: total,
        }
    }

    fn mirror_one(score: f64, confidence: Confidence) -> MirrorEnvelope {
        MirrorEnvelope::Ok {
            networks: vec![NetworkScore {
                name: "m1".into(),
                score,
                confidence,
                duration_ms: 12,
            }],
        }
    }

    #[test]
    fn unanimous_high_confidence_is_high() {
        let consensus = fuse(
            &aggregate(vec![local_result("exif", Some(0.9), Confidence::High, true)]),
            &mirror_one(0.85, Confidence::High),
        );
        assert_eq!(consensus.votes, 2);
        assert_eq!(consensus.positives, 2);
        assert!(consensus.is_authentic);
        assert_eq!(consensus.level, ConfidenceLevel::High);
        assert_eq!(consensus.sources.len(), 2);
    }

    #[test]
    fn no_votes_falls_back_to_unknown() {
        let consensus = fuse(&aggregate(vec![]), &MirrorEnvelope::Timeout);
        assert_eq!(consensus.votes, 0);
        assert_eq!(consensus.positive_ratio, 0.5);
        assert!(!consensus.is_authentic);
        assert_eq!(consensus.level, ConfidenceLevel::Low);
    }

    #[test]
    fn failed_analyzers_do_not_vote() {
        let consensus = fuse(
            &aggregate(vec![
                local_result("exif", Some(0.9), Confidence::High, true),
                local_result("noise", None, Confidence::Error, false),
            ]),
            &MirrorEnvelope::Degraded,
        );
        assert_eq!(consensus.votes, 1);
        assert_eq!(consensus.sources.len(), 1);
    }

    #[test]
    fn single_vote_tie_break() {
        // high confidence, extreme score: high
        let strong = fuse(
            &aggregate(vec![local_result("exif", Some(0.9), Confidence::High, true)]),
            &MirrorEnvelope::Timeout,
        );
        assert_eq!(strong.level, ConfidenceLevel::High);

        // high confidence, middling score: medium
        let middling = fuse(
            &aggregate(vec![local_result("exif", Some(0.7), Confidence::High, true)]),
            &MirrorEnvelope::Timeout,
        );
        assert_eq!(middling.level, ConfidenceLevel::Medium);

        // low confidence single vote: low
        let weak = fuse(
            &aggregate(vec![local_result("exif", Some(0.9), Confidence::Low, true)]),
            &MirrorEnvelope::Timeout,
        );
        assert_eq!(weak.level, ConfidenceLevel::Low);
    }

    #[test]
    fn unanimous_negative_is_decisive_too() {
        let consensus = fuse(
            &aggregate(vec![
                local_result("exif", Some(0.1), Confidence::High, true),
                local_result("noise", Some(0.2), Confidence::High, true),
            ]),
            &MirrorEnvelope::Timeout,
        );
        assert!(!consensus.is_authentic);
        assert_eq!(consensus.level, ConfidenceLevel::High);
    }

    #[test]
    fn split_votes_are_low_confidence() {
        let consensus = fuse(
            &aggregate(vec![
                local_result("a", Some(0.9), Confidence::High, true),
                local_result("b", Some(0.1), Confidence::High, true),
            ]),
            &MirrorEnvelope::Timeout,
        );
        assert_eq!(consensus.positive_ratio, 0.5);
        assert!(!consensus.is_authentic);
        assert_eq!(consensus.level, ConfidenceLevel::Low);
    }

    #[test]
    fn superior_disagreement_forces_review() {
        let consensus = fuse(
            &aggregate(vec![
                local_result("a", Some(0.9), Confidence::High, true),
                local_result("b", Some(0.8), Confidence::High, true),
            ]),
            &mirror_one(0.9, Confidence::High),
        );
        assert!(consensus.is_authentic);

        let disagreeing = SuperiorEnvelope::Ok(SuperiorDecision {
            is_authentic: false,
            confidence: 0.95,
            details: None,
        });
        assert_eq!(
            final_confidence(&consensus, &disagreeing),
            ConfidenceLevel::ReviewRequired
        );

        let agreeing = SuperiorEnvelope::Ok(SuperiorDecision {
            is_authentic: true,
            confidence: 0.9,
            details: None,
        });
        assert_eq!(final_confidence(&consensus, &agreeing), consensus.level);

        // timeout and degraded keep the consensus level
        assert_eq!(
            final_confidence(&consensus, &SuperiorEnvelope::Timeout),
            consensus.level
        );
        assert_eq!(
            final_confidence(&consensus, &SuperiorEnvelope::Degraded),
            consensus.level
        );
    }

    #[test]
    fn fusion_is_deterministic() {
        let agg = aggregate(vec![
            local_result("a", Some(0.9), Confidence::High, true),
            local_result("b", Some(0.4), Confidence::Medium, true),
            local_result("c", Some(0.7), Confidence::Low, true),
        ]);
        let mirror = mirror_one(0.6, Confidence::Medium);
        let first = fuse(&agg, &mirror);
        for _ in 0..10 {
            let again = fuse(&agg, &mirror);
            assert_eq!(again.positive_ratio, first.positive_ratio);
            assert_eq!(again.weighted_confidence, first.weighted_confidence);
            assert_eq!(again.level, first.level);
            assert_eq!(
                again.sources.iter().map(|s| &s.name).collect::<Vec<_>>(),
                first.sources.iter().map(|s| &s.name).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn performance_classification_boundaries() {
        assert_eq!(classify_performance(100, 200, 500), PerformanceClass::Optimal);
        assert_eq!(classify_performance(200, 200, 500), PerformanceClass::Optimal);
        assert_eq!(classify_performance(201, 200, 500), PerformanceClass::Acceptable);
        assert_eq!(classify_performance(500, 200, 500), PerformanceClass::Acceptable);
        assert_eq!(classify_performance(501, 200, 500), PerformanceClass::Degraded);
    }
}
