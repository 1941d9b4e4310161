use std::cmp::Ordering;

use crate::models::FoodCandidate;

/// Pick the best search candidate: standard survey/legacy records first, then
/// branded, then the rest; within a category the higher FDC score wins.
/// The sort is stable, so equal candidates keep search order.
pub fn pick_best(candidates: &[FoodCandidate]) -> Option<&FoodCandidate> {
    let mut ranked: Vec<&FoodCandidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| {
        a.kind
            .rank()
            .cmp(&b.kind.rank())
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
    });
    ranked.into_iter().next()
}
