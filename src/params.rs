//! Sampling parameters shared by generation and chat requests.

use std::ops::RangeInclusive;

use crate::error::{Error, Result};

/// Accepted range for the number of generated steps per request.
pub const MAX_NEW_TOKENS: RangeInclusive<usize> = 1..=384;
pub const TEMPERATURE: RangeInclusive<f32> = 0.0..=1.0;
pub const TOP_P: RangeInclusive<f32> = 0.0..=1.0;
pub const END_ADJUSTMENT: RangeInclusive<f32> = -999.0..=0.0;

/// Lowest temperature handed to the model. Zero would divide the logits by
/// zero, so accepted values below this are raised to it.
pub const TEMPERATURE_FLOOR: f32 = 0.05;

/// Sampling parameters as supplied by a caller, before any checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// Added to the end-of-text logit; negative values make the model less
    /// likely to finish early.
    pub end_adjustment: f32,
}

impl SamplingParams {
    pub fn new(max_new_tokens: usize, temperature: f32, top_p: f32, end_adjustment: f32) -> Self {
        Self {
            max_new_tokens,
            temperature,
            top_p,
            end_adjustment,
        }
    }

    /// Checks every bound and applies the temperature floor.
    ///
    /// NaN fails every range check.
    pub fn validate(self) -> Result<Sampling> {
        if !MAX_NEW_TOKENS.contains(&self.max_new_tokens) {
            return Err(out_of_range("max_new_tokens", self.max_new_tokens, &MAX_NEW_TOKENS));
        }
        if !TEMPERATURE.contains(&self.temperature) {
            return Err(out_of_range("temperature", self.temperature, &TEMPERATURE));
        }
        if !TOP_P.contains(&self.top_p) {
            return Err(out_of_range("top_p", self.top_p, &TOP_P));
        }
        if !END_ADJUSTMENT.contains(&self.end_adjustment) {
            return Err(out_of_range("end_adjustment", self.end_adjustment, &END_ADJUSTMENT));
        }

        Ok(Sampling {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature.max(TEMPERATURE_FLOOR),
            top_p: self.top_p,
            end_adjustment: self.end_adjustment,
        })
    }
}

fn out_of_range<T: std::fmt::Display>(name: &str, value: T, range: &RangeInclusive<T>) -> Error {
    Error::Validation(format!(
        "{name} must be within [{}, {}], got {value}",
        range.start(),
        range.end()
    ))
}

/// Parameters that passed validation. Only [`SamplingParams::validate`]
/// constructs this.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    max_new_tokens: usize,
    temperature: f32,
    top_p: f32,
    end_adjustment: f32,
}

impl Sampling {
    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Temperature after the floor was applied.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn end_adjustment(&self) -> f32 {
        self.end_adjustment
    }
}
