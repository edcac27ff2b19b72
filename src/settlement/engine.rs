//! Settlement Engine
//!
//! Pure computation: scores -> competition rankings -> tie-block payout
//! allocation. No I/O. The transactional wrapper lives in `service.rs`.

use serde::{Deserialize, Serialize};

use crate::models::{ParticipantScore, PayoutStructure};

/// Platform rake, deducted from the raw entry-fee pool before allocation.
pub const RAKE_PCT: f64 = 10.0;

/// One ranked participant. `position` is the 1-based ordinal in the sorted
/// sequence; `rank` is the competition rank (ties share it, the next
/// distinct score takes its ordinal, so ranks can skip).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub participant_id: String,
    pub position: u32,
    pub rank: u32,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutAllocation {
    pub participant_id: String,
    pub rank: u32,
    pub amount_cents: i64,
}

/// The immutable settlement result, serialized into the settlement record
/// and hashed canonically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementResults {
    pub rankings: Vec<RankingEntry>,
    pub payouts: Vec<PayoutAllocation>,
    pub total_pool_cents: i64,
    pub rake_cents: i64,
    pub distributable_cents: i64,
    pub platform_remainder_cents: i64,
}

/// Competition ranking: score descending, participant id ascending as the
/// stable secondary key. Ties share a rank; e.g. scores [100, 100, 90]
/// rank as [1, 1, 3].
pub fn compute_rankings(scores: &[ParticipantScore]) -> Vec<RankingEntry> {
    let mut sorted: Vec<&ParticipantScore> = scores.iter().collect();
    sorted.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });

    let mut rankings = Vec::with_capacity(sorted.len());
    let mut current_rank = 0u32;
    let mut prev_score = f64::NAN;
    for (i, entry) in sorted.iter().enumerate() {
        let position = (i + 1) as u32;
        if entry.total_score != prev_score {
            current_rank = position;
            prev_score = entry.total_score;
        }
        rankings.push(RankingEntry {
            participant_id: entry.participant_id.clone(),
            position,
            rank: current_rank,
            score: entry.total_score,
        });
    }
    rankings
}

/// Tie-block payout allocation over the distributable pool.
///
/// For each maximal run of entries sharing a rank, the percentages of the
/// ordinal positions it occupies are summed and converted to cents once at
/// block granularity, then floor-split across the tied participants. The
/// split residue, plus any cents the structure never allocated, accrues to
/// the platform remainder, so `sum(payouts) + remainder == distributable`
/// holds exactly and no rounding can over-allocate.
pub fn allocate_payouts(
    rankings: &[RankingEntry],
    structure: &PayoutStructure,
    distributable_cents: i64,
) -> (Vec<PayoutAllocation>, i64) {
    let mut payouts = Vec::new();
    let mut total_paid = 0i64;

    let mut i = 0usize;
    while i < rankings.len() {
        let rank = rankings[i].rank;
        let mut j = i;
        while j < rankings.len() && rankings[j].rank == rank {
            j += 1;
        }
        let block = &rankings[i..j];
        let block_len = block.len() as i64;

        let block_pct: f64 = block
            .iter()
            .map(|e| structure.pct_for_position(e.position))
            .sum();

        if block_pct > 0.0 {
            // Rounded once per block, clamped to what the pool has left so
            // accumulated rounding can never pay out more than distributable.
            let rounded = (distributable_cents as f64 * block_pct / 100.0).round() as i64;
            let block_cents = rounded.min(distributable_cents - total_paid).max(0);
            let share = block_cents / block_len;
            for entry in block {
                payouts.push(PayoutAllocation {
                    participant_id: entry.participant_id.clone(),
                    rank,
                    amount_cents: share,
                });
                total_paid += share;
            }
        }

        i = j;
    }

    (payouts, distributable_cents - total_paid)
}

/// Full settlement math for one contest.
pub fn compute_settlement(
    scores: &[ParticipantScore],
    structure: &PayoutStructure,
    total_pool_cents: i64,
) -> SettlementResults {
    let rake_cents = (total_pool_cents as f64 * RAKE_PCT / 100.0).round() as i64;
    let distributable_cents = total_pool_cents - rake_cents;

    let rankings = compute_rankings(scores);
    let (payouts, platform_remainder_cents) =
        allocate_payouts(&rankings, structure, distributable_cents);

    SettlementResults {
        rankings,
        payouts,
        total_pool_cents,
        rake_cents,
        distributable_cents,
        platform_remainder_cents,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(id: &str, s: f64) -> ParticipantScore {
        ParticipantScore {
            participant_id: id.to_string(),
            total_score: s,
        }
    }

    fn top3() -> PayoutStructure {
        PayoutStructure::new([(1, 70.0), (2, 20.0), (3, 10.0)]).unwrap()
    }

    #[test]
    fn competition_ranking_skips_after_ties() {
        let rankings = compute_rankings(&[score("a", 100.0), score("b", 100.0), score("c", 90.0)]);
        assert_eq!(
            rankings.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 1, 3]
        );
        assert_eq!(
            rankings.iter().map(|r| r.position).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn rankings_are_order_independent() {
        let base = vec![
            score("p3", 90.0),
            score("p1", 100.0),
            score("p2", 100.0),
            score("p4", 80.0),
        ];
        let expected = compute_rankings(&base);
        // Every rotation of the input produces the identical ranking.
        for shift in 0..base.len() {
            let mut permuted = base.clone();
            permuted.rotate_left(shift);
            assert_eq!(compute_rankings(&permuted), expected);
        }
    }

    #[test]
    fn tied_participants_break_by_id_ascending() {
        let rankings = compute_rankings(&[score("zz", 50.0), score("aa", 50.0)]);
        assert_eq!(rankings[0].participant_id, "aa");
        assert_eq!(rankings[1].participant_id, "zz");
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[1].rank, 1);
    }

    #[test]
    fn two_way_tie_splits_combined_block() {
        // Spec worked example: [100,100,90], {1:70,2:20,3:10}, 10000c
        // distributable. Positions 1-2 combine to 90% = 9000c, floor-split
        // 4500/4500; position 3 keeps its 10% = 1000c.
        let rankings = compute_rankings(&[score("a", 100.0), score("b", 100.0), score("c", 90.0)]);
        let (payouts, remainder) = allocate_payouts(&rankings, &top3(), 10_000);
        assert_eq!(
            payouts.iter().map(|p| p.amount_cents).collect::<Vec<_>>(),
            vec![4500, 4500, 1000]
        );
        assert_eq!(remainder, 0);
    }

    #[test]
    fn three_way_tie_accrues_split_residue_to_remainder() {
        // All three tie: block pct 100%, 10000c / 3 = 3333 each, 1c residue.
        let rankings = compute_rankings(&[score("a", 50.0), score("b", 50.0), score("c", 50.0)]);
        let (payouts, remainder) = allocate_payouts(&rankings, &top3(), 10_000);
        assert!(payouts.iter().all(|p| p.amount_cents == 3333));
        assert_eq!(remainder, 1);
    }

    #[test]
    fn conservation_holds_across_shapes() {
        let cases: Vec<(Vec<ParticipantScore>, i64)> = vec![
            (vec![score("a", 10.0)], 777),
            (vec![score("a", 10.0), score("b", 10.0)], 10_001),
            (
                vec![score("a", 3.0), score("b", 2.0), score("c", 2.0), score("d", 1.0)],
                9_999,
            ),
            (
                vec![score("a", 5.0), score("b", 5.0), score("c", 5.0), score("d", 5.0)],
                12_345,
            ),
        ];
        for (scores, distributable) in cases {
            let rankings = compute_rankings(&scores);
            let (payouts, remainder) = allocate_payouts(&rankings, &top3(), distributable);
            let paid: i64 = payouts.iter().map(|p| p.amount_cents).sum();
            assert_eq!(paid + remainder, distributable);
            assert!(remainder >= 0);
        }
    }

    #[test]
    fn unpaid_percentage_accrues_to_remainder() {
        // Only one participant; positions 2 and 3 are never occupied, so
        // their 30% stays with the platform.
        let rankings = compute_rankings(&[score("solo", 42.0)]);
        let (payouts, remainder) = allocate_payouts(&rankings, &top3(), 10_000);
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].amount_cents, 7000);
        assert_eq!(remainder, 3000);
    }

    #[test]
    fn full_settlement_deducts_ten_percent_rake() {
        let results = compute_settlement(
            &[score("a", 100.0), score("b", 90.0)],
            &top3(),
            10_000,
        );
        assert_eq!(results.rake_cents, 1000);
        assert_eq!(results.distributable_cents, 9000);
        let paid: i64 = results.payouts.iter().map(|p| p.amount_cents).sum();
        assert_eq!(paid + results.platform_remainder_cents, 9000);
    }

    #[test]
    fn empty_scores_settle_to_all_remainder() {
        let results = compute_settlement(&[], &top3(), 0);
        assert!(results.rankings.is_empty());
        assert!(results.payouts.is_empty());
        assert_eq!(results.platform_remainder_cents, 0);
    }
}
