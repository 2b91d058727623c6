use anyhow::{anyhow, Result};

use crate::config::GenerationConfig;

#[derive(Debug, Clone)]
struct Hypothesis {
    /// Start token followed by generated tokens.
    tokens: Vec<u32>,
    log_prob: f32,
}

impl Hypothesis {
    fn generated_len(&self) -> usize {
        self.tokens.len() - 1
    }
}

/// Beam search over a scoring function.
///
/// `num_beams == 1` degenerates to greedy decoding.
pub struct BeamSearch {
    max_new_tokens: usize,
    num_beams: usize,
    min_length: usize,
    length_penalty: f32,
    early_stopping: bool,
    start_token: u32,
    end_token: u32,
}

impl BeamSearch {
    pub fn new(config: &GenerationConfig, start_token: u32, end_token: u32) -> Self {
        let config = config.clamped();
        Self {
            max_new_tokens: config.max_new_tokens,
            num_beams: config.num_beams,
            min_length: config.min_length,
            length_penalty: config.length_penalty,
            early_stopping: config.early_stopping,
            start_token,
            end_token,
        }
    }

    /// Log-probabilities for the next token, with the end token masked while
    /// the sequence is shorter than `min_length`.
    fn next_log_probs(&self, row: &[f32], generated_len: usize) -> Vec<f32> {
        let mut log_probs = log_softmax(row);
        if generated_len < self.min_length {
            if let Some(lp) = log_probs.get_mut(self.end_token as usize) {
                *lp = f32::NEG_INFINITY;
            }
        }
        log_probs
    }

    fn normalized(&self, log_prob: f32, generated_len: usize) -> f32 {
        log_prob / (generated_len.max(1) as f32).powf(self.length_penalty)
    }

    /// Runs the search. `step` receives the token sequences of the live beams
    /// (all the same length, each starting with the start token) and returns
    /// next-token logits for each of them, in the same order.
    ///
    /// Returns the best sequence without start and end tokens.
    pub fn run<F>(&self, mut step: F) -> Result<Vec<u32>>
    where
        F: FnMut(&[Vec<u32>]) -> Result<Vec<Vec<f32>>>,
    {
        if self.num_beams == 1 {
            return self.run_greedy(step);
        }

        let mut beams = vec![Hypothesis {
            tokens: vec![self.start_token],
            log_prob: 0.0,
        }];
        // (normalized score, generated tokens)
        let mut finished: Vec<(f32, Vec<u32>)> = Vec::with_capacity(self.num_beams + 1);
        let mut done = false;

        for _ in 0..self.max_new_tokens {
            let sequences: Vec<Vec<u32>> = beams.iter().map(|b| b.tokens.clone()).collect();
            let logits = step(&sequences)?;
            check_rows(&logits, beams.len())?;

            let per_beam = 2 * self.num_beams;
            let mut candidates: Vec<(usize, u32, f32)> = Vec::with_capacity(beams.len() * per_beam);
            for (beam_idx, (beam, row)) in beams.iter().zip(&logits).enumerate() {
                let log_probs = self.next_log_probs(row, beam.generated_len());
                for (token, lp) in top_k(&log_probs, per_beam) {
                    if lp.is_finite() {
                        candidates.push((beam_idx, token, beam.log_prob + lp));
                    }
                }
            }
            candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
            candidates.truncate(per_beam);

            let mut next_beams = Vec::with_capacity(self.num_beams);
            for (rank, (beam_idx, token, log_prob)) in candidates.into_iter().enumerate() {
                let parent = &beams[beam_idx];
                if token == self.end_token {
                    if rank >= self.num_beams {
                        continue;
                    }
                    let generated = parent.tokens[1..].to_vec();
                    let score = self.normalized(log_prob, generated.len());
                    self.keep_best(&mut finished, score, generated);
                } else {
                    let mut tokens = parent.tokens.clone();
                    tokens.push(token);
                    next_beams.push(Hypothesis { tokens, log_prob });
                }
                if next_beams.len() == self.num_beams {
                    break;
                }
            }

            done = next_beams.is_empty() || self.is_done(&finished, &next_beams);
            beams = next_beams;
            if done {
                break;
            }
        }

        // Out of steps: live beams compete with the finished ones.
        if !done {
            for beam in &beams {
                let score = self.normalized(beam.log_prob, beam.generated_len());
                self.keep_best(&mut finished, score, beam.tokens[1..].to_vec());
            }
        }

        finished
            .into_iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, tokens)| tokens)
            .ok_or_else(|| anyhow!("Beam search produced no hypothesis"))
    }

    /// Top-1 decoding: one scorer call per token, stopping at the end token.
    fn run_greedy<F>(&self, mut step: F) -> Result<Vec<u32>>
    where
        F: FnMut(&[Vec<u32>]) -> Result<Vec<Vec<f32>>>,
    {
        let mut tokens = vec![self.start_token];
        for _ in 0..self.max_new_tokens {
            let logits = step(std::slice::from_ref(&tokens))?;
            check_rows(&logits, 1)?;

            let log_probs = self.next_log_probs(&logits[0], tokens.len() - 1);
            let Some((token, lp)) = top_k(&log_probs, 1).into_iter().next() else {
                break;
            };
            if !lp.is_finite() || token == self.end_token {
                break;
            }
            tokens.push(token);
        }
        Ok(tokens.split_off(1))
    }

    fn keep_best(&self, finished: &mut Vec<(f32, Vec<u32>)>, score: f32, tokens: Vec<u32>) {
        finished.push((score, tokens));
        if finished.len() > self.num_beams {
            finished.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            finished.truncate(self.num_beams);
        }
    }

    fn is_done(&self, finished: &[(f32, Vec<u32>)], running: &[Hypothesis]) -> bool {
        if finished.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        let worst = finished
            .iter()
            .map(|(score, _)| *score)
            .fold(f32::INFINITY, f32::min);
        let best_running = running
            .iter()
            .map(|b| self.normalized(b.log_prob, b.generated_len()))
            .fold(f32::NEG_INFINITY, f32::max);
        worst >= best_running
    }
}

fn check_rows(logits: &[Vec<f32>], beams: usize) -> Result<()> {
    if logits.len() != beams {
        return Err(anyhow!(
            "Scorer returned {} rows for {} beams",
            logits.len(),
            beams
        ));
    }
    Ok(())
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    let log_sum = sum.ln() + max;
    logits.iter().map(|&l| l - log_sum).collect()
}

fn top_k(values: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as u32, v))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 0;
    const A: u32 = 1;
    const B: u32 = 2;
    const C: u32 = 3;
    const D: u32 = 4;
    const BOS: u32 = 5;

    fn logits(probs: &[(u32, f32)]) -> Vec<f32> {
        let mut row = vec![f32::NEG_INFINITY; 6];
        for &(token, p) in probs {
            row[token as usize] = p.ln();
        }
        row
    }

    /// Greedy picks A then C (0.55 * 0.4), beam search finds B then C
    /// (0.45 * 0.9).
    fn scripted(seq: &[u32]) -> Vec<f32> {
        match &seq[1..] {
            [] => logits(&[(A, 0.55), (B, 0.45)]),
            [A] => logits(&[(C, 0.4), (D, 0.3), (EOS, 0.3)]),
            [B] => logits(&[(C, 0.9), (EOS, 0.1)]),
            _ => logits(&[(EOS, 0.97), (D, 0.03)]),
        }
    }

    fn run(config: GenerationConfig) -> Vec<u32> {
        BeamSearch::new(&config, BOS, EOS)
            .run(|beams| Ok(beams.iter().map(|b| scripted(b)).collect()))
            .unwrap()
    }

    fn config(num_beams: usize) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: 16,
            num_beams,
            min_length: 1,
            length_penalty: 1.0,
            early_stopping: true,
        }
    }

    #[test]
    fn test_greedy_follows_argmax() {
        assert_eq!(run(config(1)), vec![A, C]);
    }

    #[test]
    fn test_beam_search_finds_better_sequence() {
        assert_eq!(run(config(2)), vec![B, C]);
        assert_eq!(run(config(3)), vec![B, C]);
    }

    #[test]
    fn test_without_early_stopping_same_answer() {
        let mut cfg = config(2);
        cfg.early_stopping = false;
        assert_eq!(run(cfg), vec![B, C]);
    }

    #[test]
    fn test_min_length_suppresses_end_token() {
        let mut cfg = config(1);
        cfg.min_length = 4;
        let tokens = run(cfg);
        assert_eq!(tokens.len(), 4);
        assert_eq!(&tokens[..3], &[A, C, D]);
        assert!(!tokens.contains(&EOS));
    }

    #[test]
    fn test_max_new_tokens_bounds_output() {
        let search = BeamSearch::new(
            &GenerationConfig {
                max_new_tokens: 8,
                ..config(2)
            },
            BOS,
            EOS,
        );
        // Never ends on its own.
        let tokens = search
            .run(|beams| Ok(beams.iter().map(|_| logits(&[(A, 0.6), (B, 0.4)])).collect()))
            .unwrap();
        assert_eq!(tokens.len(), 8);
        assert!(tokens.iter().all(|&t| t == A));
    }

    #[test]
    fn test_single_beam_stops_at_first_end_token() {
        // A is the argmax, then the end token is. Lookahead would prefer A C.
        let search = BeamSearch::new(
            &GenerationConfig {
                early_stopping: false,
                ..config(1)
            },
            BOS,
            EOS,
        );
        let tokens = search
            .run(|beams| {
                Ok(beams
                    .iter()
                    .map(|b| match &b[1..] {
                        [] => logits(&[(A, 0.55), (B, 0.45)]),
                        [A] => logits(&[(EOS, 0.6), (C, 0.4)]),
                        _ => logits(&[(EOS, 0.99), (D, 0.01)]),
                    })
                    .collect())
            })
            .unwrap();
        assert_eq!(tokens, vec![A]);
    }

    #[test]
    fn test_live_beams_scored_when_steps_run_out() {
        // Two short captions finish at step 2; the B branch keeps going with
        // near-certain A tokens and scores better once length is normalized.
        let search = BeamSearch::new(
            &GenerationConfig {
                max_new_tokens: 8,
                early_stopping: false,
                ..config(2)
            },
            BOS,
            EOS,
        );
        let tokens = search
            .run(|beams| {
                Ok(beams
                    .iter()
                    .map(|b| match &b[1..] {
                        [] => logits(&[(A, 0.5), (B, 0.5)]),
                        [A] => logits(&[(EOS, 0.55), (A, 0.45)]),
                        [B] => logits(&[(EOS, 0.5), (A, 0.5)]),
                        _ => logits(&[(A, 0.999), (EOS, 0.001)]),
                    })
                    .collect())
            })
            .unwrap();
        assert_eq!(tokens, vec![B, A, A, A, A, A, A, A]);
    }

    #[test]
    fn test_out_of_range_config_is_clamped() {
        let search = BeamSearch::new(
            &GenerationConfig {
                max_new_tokens: 0,
                num_beams: 0,
                ..config(1)
            },
            BOS,
            EOS,
        );
        assert_eq!(search.num_beams, 1);
        assert_eq!(search.max_new_tokens, 8);

        let tokens = search
            .run(|beams| Ok(beams.iter().map(|_| logits(&[(A, 1.0)])).collect()))
            .unwrap();
        assert_eq!(tokens, vec![A; 8]);
    }

    #[test]
    fn test_scorer_errors_propagate() {
        let err = BeamSearch::new(&config(2), BOS, EOS)
            .run(|_| Err(anyhow!("decoder failed")))
            .unwrap_err();
        assert!(err.to_string().contains("decoder failed"));
    }

    #[test]
    fn test_scorer_row_count_is_checked() {
        for beams in [1, 2] {
            let err = BeamSearch::new(&config(beams), BOS, EOS)
                .run(|_| Ok(Vec::new()))
                .unwrap_err();
            assert!(err.to_string().contains("rows"));
        }
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(lp[2] > lp[1] && lp[1] > lp[0]);
    }
}
