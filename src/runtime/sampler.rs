use burn::{
    prelude::*,
    tensor::{DType, Tensor, activation},
};
use rand::{prelude::*, rngs::StdRng};

use crate::error::{Error, Result};

/// Token id of `<|endoftext|>` in the World vocabulary.
pub const END_OF_TEXT_TOKEN: u16 = 0;

/// Picks the next token from a logit vector.
///
/// Applies the end-of-text adjustment, temperature, top-k and top-p
/// filtering, then draws from what is left.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// 0 disables top-k filtering.
    top_k: usize,
    rng: StdRng,
}

impl Sampler {
    pub fn new(top_k: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { top_k, rng }
    }

    /// Samples a token from `logits`, shape `[vocab_size]`.
    pub fn sample<B: Backend>(
        &mut self,
        logits: Tensor<B, 1>,
        temperature: f32,
        top_p: f32,
        end_adjustment: f32,
    ) -> Result<u16> {
        let [vocab_size] = logits.dims();
        let mut logits = logits;

        if end_adjustment != 0.0 {
            let eot = END_OF_TEXT_TOKEN as usize;
            let adjusted = logits.clone().slice([eot..eot + 1]).add_scalar(end_adjustment);
            logits = logits.slice_assign([eot..eot + 1], adjusted);
        }

        let probs = activation::softmax(logits.div_scalar(temperature), 0);

        let k = match self.top_k {
            0 => vocab_size,
            k => k.min(vocab_size),
        };
        let (probs, indices) = probs.topk_with_indices(k, 0);

        let mut tokens = indices
            .to_data()
            .convert_dtype(DType::U16)
            .to_vec::<u16>()
            .map_err(|err| Error::Model(format!("reading sampled token ids: {err:?}")))?;
        let mut probs = probs
            .to_data()
            .convert_dtype(DType::F32)
            .to_vec::<f32>()
            .map_err(|err| Error::Model(format!("reading token probabilities: {err:?}")))?;

        // Smallest prefix of the sorted candidates whose mass stays within
        // top_p; always at least the most likely one.
        if top_p < 1.0 {
            let mut acc: f32 = 0.0;
            let boundary = probs
                .iter()
                .map(|p| {
                    acc += p;
                    acc
                })
                .take_while(|&cumsum| cumsum <= top_p)
                .count()
                .max(1);

            tokens.truncate(boundary);
            probs.truncate(boundary);
        }

        let items: Vec<(u16, f32)> = tokens.into_iter().zip(probs).collect();
        let choice = items
            .choose_weighted(&mut self.rng, |item| item.1)
            .ok()
            .or(items.first());

        choice
            .map(|(token, _)| *token)
            .ok_or_else(|| Error::Model("no candidate token to sample".into()))
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type B = NdArray;

    fn logits<const N: usize>(values: [f32; N]) -> Tensor<B, 1> {
        Tensor::from_floats(values, &Default::default())
    }

    #[test]
    fn zero_top_p_is_greedy() {
        let mut sampler = Sampler::new(0, Some(7));
        for _ in 0..5 {
            let token = sampler.sample(logits([0.0, 1.0, 6.0, 2.0]), 1.0, 0.0, 0.0).unwrap();
            assert_eq!(token, 2);
        }
    }

    #[test]
    fn end_adjustment_suppresses_end_of_text() {
        let mut sampler = Sampler::new(0, Some(7));
        let token = sampler
            .sample(logits([8.0, 1.0, 5.0, 2.0]), 1.0, 0.0, 0.0)
            .unwrap();
        assert_eq!(token, END_OF_TEXT_TOKEN);

        let token = sampler
            .sample(logits([8.0, 1.0, 5.0, 2.0]), 1.0, 0.0, -999.0)
            .unwrap();
        assert_eq!(token, 2);
    }

    #[test]
    fn top_k_limits_candidates() {
        let mut sampler = Sampler::new(1, Some(3));
        for _ in 0..5 {
            let token = sampler.sample(logits([1.0, 1.1, 0.9]), 1.0, 1.0, 0.0).unwrap();
            assert_eq!(token, 1);
        }
    }

    #[test]
    fn seeded_samplers_agree() {
        let mut first = Sampler::new(0, Some(11));
        let mut second = Sampler::new(0, Some(11));
        for _ in 0..10 {
            let a = first.sample(logits([1.0, 1.0, 1.0, 1.0]), 1.0, 1.0, 0.0).unwrap();
            let b = second.sample(logits([1.0, 1.0, 1.0, 1.0]), 1.0, 1.0, 0.0).unwrap();
            assert_eq!(a, b);
        }
    }
}
