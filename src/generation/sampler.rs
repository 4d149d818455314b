//! Repetition penalty and greedy token selection

use crate::engine::Token;
use crate::generation::history::TokenHistory;

/// Starting point of the arg-max scan; any real logit beats it.
const SCORE_FLOOR: f32 = -1e9;

/// Pushes the logit of every token in `history` toward zero.
///
/// Applied once per occurrence, so a token seen three times is penalized
/// three times. Ids outside `logits` are skipped.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &TokenHistory, penalty: f32) {
    for token in history.iter() {
        let Some(score) = token.index().and_then(|i| logits.get_mut(i)) else {
            continue;
        };
        if *score > 0.0 {
            *score /= penalty;
        } else {
            *score *= penalty;
        }
    }
}

/// Arg-max over `logits`. Ties go to the lowest id; `None` for an empty vector.
pub fn greedy(logits: &[f32]) -> Option<Token> {
    if logits.is_empty() {
        return None;
    }

    let mut best = 0;
    let mut max = SCORE_FLOOR;
    for (id, &score) in logits.iter().enumerate() {
        if score > max {
            max = score;
            best = id;
        }
    }
    i32::try_from(best).ok().map(Token)
}

/// Greedy sampler with a repetition penalty
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    penalty: f32,
}

impl Sampler {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }

    /// Penalizes `logits` in place and picks the next token.
    pub fn sample(&self, logits: &mut [f32], history: &TokenHistory) -> Option<Token> {
        apply_repetition_penalty(logits, history, self.penalty);
        greedy(logits)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(1.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(tokens: &[i32]) -> TokenHistory {
        let mut h = TokenHistory::new(64);
        h.extend(tokens.iter().copied().map(Token));
        h
    }

    #[test]
    fn test_penalty_moves_scores_toward_zero() {
        let mut logits = vec![2.4, -1.0, 0.0, 5.0];
        apply_repetition_penalty(&mut logits, &history(&[0, 1, 2]), 1.2);

        assert!((logits[0] - 2.0).abs() < 1e-6);
        assert!((logits[1] + 1.2).abs() < 1e-6);
        assert_eq!(logits[2], 0.0);
        assert_eq!(logits[3], 5.0);
    }

    #[test]
    fn test_penalty_compounds_per_occurrence() {
        let mut logits = vec![1.44];
        apply_repetition_penalty(&mut logits, &history(&[0, 0]), 1.2);
        assert!((logits[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_penalty_skips_out_of_range_ids() {
        let mut logits = vec![1.0, 1.0];
        apply_repetition_penalty(&mut logits, &history(&[-1, 7]), 1.2);
        assert_eq!(logits, vec![1.0, 1.0]);
    }

    #[test]
    fn test_greedy_lowest_id_wins_ties() {
        assert_eq!(greedy(&[0.5, 3.0, 1.0, 3.0]), Some(Token(1)));
    }

    #[test]
    fn test_greedy_all_negative() {
        assert_eq!(greedy(&[-7.0, -2.5, -3.0]), Some(Token(1)));
    }

    #[test]
    fn test_greedy_below_floor_defaults_to_first() {
        assert_eq!(greedy(&[-1e10, -2e10]), Some(Token(0)));
    }

    #[test]
    fn test_greedy_empty() {
        assert_eq!(greedy(&[]), None);
    }

    #[test]
    fn test_penalty_changes_winner() {
        let sampler = Sampler::default();
        let mut logits = vec![1.0, 1.1];
        assert_eq!(sampler.sample(&mut logits, &history(&[1])), Some(Token(0)));
    }

    #[test]
    fn test_sampler_deterministic() {
        let sampler = Sampler::new(1.2);
        let base = vec![0.3, 2.0, -1.0, 2.0, 1.9];
        let h = history(&[1, 4, 4]);

        let picks: Vec<_> = (0..5)
            .map(|_| {
                let mut logits = base.clone();
                sampler.sample(&mut logits, &h)
            })
            .collect();
        assert!(picks.iter().all(|p| *p == Some(Token(3))));
    }
}
