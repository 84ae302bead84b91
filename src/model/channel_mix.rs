use burn::{
    module::Param,
    nn::Linear,
    prelude::*,
    tensor::{Tensor, activation},
};

use super::load_from_safetensors::Weights;
use crate::error::Result;

/// Feed-forward block: a squared-ReLU MLP over the input blended with the
/// previous token's input.
#[derive(Module, Debug)]
pub struct ChannelMix<B: Backend> {
    /// Blend between the current and previous input, `[d_model]`.
    pub x_k: Param<Tensor<B, 1>>,
    /// `d_model -> dim_ffn`.
    pub key: Linear<B>,
    /// `dim_ffn -> d_model`.
    pub value: Linear<B>,
}

impl<B: Backend> ChannelMix<B> {
    pub(crate) fn from_weights(
        weights: &Weights<'_>,
        prefix: &str,
        device: &B::Device,
    ) -> Result<ChannelMix<B>> {
        Ok(ChannelMix {
            x_k: weights.vector(&format!("{prefix}.x_k"), device)?,
            key: weights.linear(&format!("{prefix}.key.weight"), device)?,
            value: weights.linear(&format!("{prefix}.value.weight"), device)?,
        })
    }

    pub fn forward_rnn(&self, x: Tensor<B, 1>, x_prev: Tensor<B, 1>) -> Tensor<B, 1> {
        let k = x.clone() + (x_prev - x).mul(self.x_k.val());
        let k = activation::relu(self.key.forward(k)).powf_scalar(2.0);

        self.value.forward(k)
    }
}
