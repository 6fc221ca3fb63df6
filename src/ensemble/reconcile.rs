//! Winner selection and event merging.
//!
//! Predictions are ranked by `(tier, priority, max confidence)`, highest
//! first:
//! - tier 2: predictions that do not depend on user input,
//! - tier 1: end-to-end predictions,
//! - tier 0: everything else.
//!
//! Comparison is strict, so on a full tie the prediction queried first (the
//! lowest ensemble index) wins.

use std::cmp::Ordering;

use crate::event::Event;
use crate::prediction::PolicyPrediction;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rank {
    tier: u8,
    priority: i32,
    confidence: f64,
}

impl Rank {
    fn of(prediction: &PolicyPrediction) -> Self {
        let tier = if prediction.is_no_user_prediction {
            2
        } else if prediction.is_end_to_end_prediction {
            1
        } else {
            0
        };
        Self {
            tier,
            priority: prediction.policy_priority,
            confidence: prediction.max_confidence(),
        }
    }

    fn outranks(&self, other: &Self) -> bool {
        self.tier
            .cmp(&other.tier)
            .then(self.priority.cmp(&other.priority))
            .then(
                self.confidence
                    .partial_cmp(&other.confidence)
                    .unwrap_or(Ordering::Equal),
            )
            == Ordering::Greater
    }
}

/// Abstentions, all-zero vectors and predictions of a suppressed action
/// cannot win.
fn can_win(prediction: &PolicyPrediction, suppressed_action: Option<usize>) -> bool {
    if prediction.is_abstention() || prediction.max_confidence() <= 0.0 {
        return false;
    }
    match suppressed_action {
        Some(index) => prediction.max_confidence_index() != Some(index),
        None => true,
    }
}

/// Sets the score of a rejected action to zero in every non-empty
/// prediction.
pub(crate) fn zero_rejected_action(predictions: &mut [PolicyPrediction], index: usize) {
    for prediction in predictions.iter_mut() {
        if let Some(score) = prediction.probabilities.get_mut(index) {
            *score = 0.0;
        }
    }
}

/// Outcome of ranking one round of predictions.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reconciliation {
    pub(crate) winner: Option<PolicyPrediction>,
    /// Must-have events of every policy, in ensemble order.
    pub(crate) must_have_events: Vec<Event>,
}

impl Reconciliation {
    /// Picks the best prediction. `predictions` must be in ensemble order.
    pub(crate) fn pick(predictions: Vec<PolicyPrediction>, suppressed_action: Option<usize>) -> Self {
        let must_have_events = predictions
            .iter()
            .flat_map(|p| p.events.iter().cloned())
            .collect();

        let mut best: Option<(usize, Rank)> = None;
        for (index, prediction) in predictions.iter().enumerate() {
            if !can_win(prediction, suppressed_action) {
                continue;
            }
            let rank = Rank::of(prediction);
            if best.as_ref().map_or(true, |(_, b)| rank.outranks(b)) {
                best = Some((index, rank));
            }
        }

        let winner = best.and_then(|(index, _)| predictions.into_iter().nth(index));
        Self {
            winner,
            must_have_events,
        }
    }

    /// Replaces the winner; its optional events are those of the
    /// replacement.
    pub(crate) fn replace_winner(&mut self, prediction: PolicyPrediction) {
        self.winner = Some(prediction);
    }

    /// Final prediction: the winner's scores and flags with all must-have
    /// events followed by the winner's optional events.
    pub(crate) fn finish(self) -> PolicyPrediction {
        let mut events = self.must_have_events;
        match self.winner {
            Some(mut winner) => {
                events.append(&mut winner.optional_events);
                winner.events = events;
                winner
            }
            None => PolicyPrediction::new(Vec::new(), None, 0).with_events(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(name: &str, priority: i32, index: usize, confidence: f64) -> PolicyPrediction {
        let mut probabilities = vec![0.0; 4];
        probabilities[index] = confidence;
        PolicyPrediction::new(probabilities, Some(name.to_string()), priority)
    }

    fn winner_name(reconciliation: &Reconciliation) -> Option<&str> {
        reconciliation
            .winner
            .as_ref()
            .and_then(|w| w.policy_name.as_deref())
    }

    #[test]
    fn priority_beats_confidence() {
        let picked = Reconciliation::pick(
            vec![prediction("a", 1, 0, 1.0), prediction("b", 2, 1, 0.4)],
            None,
        );
        assert_eq!(winner_name(&picked), Some("b"));
    }

    #[test]
    fn confidence_breaks_priority_ties() {
        let picked = Reconciliation::pick(
            vec![prediction("a", 2, 0, 0.4), prediction("b", 2, 1, 0.9)],
            None,
        );
        assert_eq!(winner_name(&picked), Some("b"));
    }

    #[test]
    fn full_tie_keeps_earliest() {
        let picked = Reconciliation::pick(
            vec![prediction("a", 2, 0, 0.9), prediction("b", 2, 1, 0.9)],
            None,
        );
        assert_eq!(winner_name(&picked), Some("a"));
    }

    #[test]
    fn tiers_dominate_priority() {
        let e2e = prediction("e2e", 1, 1, 0.5).end_to_end(true);
        let no_user = prediction("no_user", 0, 2, 0.2).no_user(true);
        let picked = Reconciliation::pick(
            vec![prediction("a", 100, 0, 1.0), e2e.clone()],
            None,
        );
        assert_eq!(winner_name(&picked), Some("e2e"));

        let picked = Reconciliation::pick(vec![prediction("a", 100, 0, 1.0), e2e, no_user], None);
        assert_eq!(winner_name(&picked), Some("no_user"));
    }

    #[test]
    fn abstentions_and_zero_vectors_cannot_win() {
        let picked = Reconciliation::pick(
            vec![
                PolicyPrediction::abstain(10),
                PolicyPrediction::new(vec![0.0; 4], Some("zero".to_string()), 9),
                prediction("low", 1, 3, 0.1),
            ],
            None,
        );
        assert_eq!(winner_name(&picked), Some("low"));
    }

    #[test]
    fn suppressed_action_falls_through() {
        let picked = Reconciliation::pick(
            vec![prediction("unlikely", 5, 2, 1.0), prediction("next", 1, 1, 0.7)],
            Some(2),
        );
        assert_eq!(winner_name(&picked), Some("next"));
    }

    #[test]
    fn merges_must_have_and_winner_optional_events() {
        let must_a = Event::slot_set("a", 1);
        let must_b = Event::slot_set("b", 2);
        let optional_a = Event::action_executed("optional_a");
        let optional_b = Event::action_executed("optional_b");
        let picked = Reconciliation::pick(
            vec![
                prediction("a", 2, 0, 1.0)
                    .with_events(vec![must_a.clone()])
                    .with_optional_events(vec![optional_a.clone()]),
                prediction("b", 1, 1, 1.0)
                    .with_events(vec![must_b.clone()])
                    .with_optional_events(vec![optional_b]),
            ],
            None,
        );
        let finished = picked.finish();
        assert_eq!(finished.events, vec![must_a, must_b, optional_a]);
        assert!(finished.optional_events.is_empty());
    }

    #[test]
    fn no_winner_still_carries_must_have_events() {
        let must = Event::slot_set("k", "v");
        let finished = Reconciliation::pick(
            vec![PolicyPrediction::abstain(1).with_events(vec![must.clone()])],
            None,
        )
        .finish();
        assert!(finished.is_abstention());
        assert_eq!(finished.policy_name, None);
        assert_eq!(finished.events, vec![must]);
    }

    #[test]
    fn zeroing_skips_abstentions() {
        let mut predictions = vec![prediction("a", 1, 2, 0.8), PolicyPrediction::abstain(1)];
        zero_rejected_action(&mut predictions, 2);
        assert_eq!(predictions[0].max_confidence(), 0.0);
        assert!(predictions[1].is_abstention());
    }
}
