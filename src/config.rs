use std::ops::RangeInclusive;

pub const MAX_NEW_TOKENS: RangeInclusive<usize> = 8..=64;
pub const NUM_BEAMS: RangeInclusive<usize> = 1..=8;
pub const MIN_LENGTH: RangeInclusive<usize> = 1..=16;
pub const LENGTH_PENALTY: RangeInclusive<f32> = 0.5..=2.0;

/// Decoding parameters for one caption request.
///
/// Fields are public so front-ends can fill them straight from their controls.
/// [`GenerationConfig::new`] clamps every field into its bound, and
/// [`GenerationConfig::clamped`] re-applies the bounds to a value that was
/// assembled by hand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub num_beams: usize,
    pub min_length: usize,
    pub length_penalty: f32,
    pub early_stopping: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            num_beams: 3,
            min_length: 1,
            length_penalty: 1.0,
            early_stopping: true,
        }
    }
}

impl GenerationConfig {
    pub fn new(
        max_new_tokens: i64,
        num_beams: i64,
        min_length: i64,
        length_penalty: f32,
        early_stopping: bool,
    ) -> Self {
        Self {
            max_new_tokens: clamp_int(max_new_tokens, &MAX_NEW_TOKENS),
            num_beams: clamp_int(num_beams, &NUM_BEAMS),
            min_length: clamp_int(min_length, &MIN_LENGTH),
            length_penalty: clamp_penalty(length_penalty),
            early_stopping,
        }
    }

    pub fn clamped(self) -> Self {
        Self {
            max_new_tokens: self
                .max_new_tokens
                .clamp(*MAX_NEW_TOKENS.start(), *MAX_NEW_TOKENS.end()),
            num_beams: self.num_beams.clamp(*NUM_BEAMS.start(), *NUM_BEAMS.end()),
            min_length: self.min_length.clamp(*MIN_LENGTH.start(), *MIN_LENGTH.end()),
            length_penalty: clamp_penalty(self.length_penalty),
            early_stopping: self.early_stopping,
        }
    }

    pub fn is_within_bounds(&self) -> bool {
        MAX_NEW_TOKENS.contains(&self.max_new_tokens)
            && NUM_BEAMS.contains(&self.num_beams)
            && MIN_LENGTH.contains(&self.min_length)
            && LENGTH_PENALTY.contains(&self.length_penalty)
    }
}

fn clamp_int(value: i64, bound: &RangeInclusive<usize>) -> usize {
    value.clamp(*bound.start() as i64, *bound.end() as i64) as usize
}

fn clamp_penalty(value: f32) -> f32 {
    if value.is_nan() {
        return 1.0;
    }
    value.clamp(*LENGTH_PENALTY.start(), *LENGTH_PENALTY.end())
}
