use burn::{nn::LayerNorm, prelude::*, tensor::Tensor};

use super::{RWKVv7Config, channel_mix::ChannelMix, load_from_safetensors::Weights, time_mix::TimeMix};
use crate::error::Result;

/// Recurrent state carried by one layer from token to token.
#[derive(Debug, Clone)]
pub struct LayerState<B: Backend> {
    /// Normalized input the time mixing saw at the previous token.
    pub tmix_x_prev: Tensor<B, 1>,
    /// Per-head key-value state, `[n_heads, head_size, head_size]`.
    pub tmix_kv: Tensor<B, 3>,
    /// Normalized input the channel mixing saw at the previous token.
    pub cmix_x_prev: Tensor<B, 1>,
}

/// One RWKVv7 block: time mixing followed by channel mixing, each behind a
/// pre-norm and a residual connection.
#[derive(Module, Debug)]
pub struct Layer<B: Backend> {
    pub layer_id: usize,
    pub layer_norm_1: LayerNorm<B>,
    pub tmix: TimeMix<B>,
    pub layer_norm_2: LayerNorm<B>,
    pub cmix: ChannelMix<B>,
}

impl<B: Backend> Layer<B> {
    pub(crate) fn from_weights(
        weights: &Weights<'_>,
        layer_id: usize,
        config: &RWKVv7Config,
        device: &B::Device,
    ) -> Result<Layer<B>> {
        let prefix = format!("blocks.{layer_id}");

        Ok(Layer {
            layer_id,
            layer_norm_1: weights.layer_norm(&format!("{prefix}.ln1"), device)?,
            tmix: TimeMix::from_weights(weights, &format!("{prefix}.att"), config, device)?,
            layer_norm_2: weights.layer_norm(&format!("{prefix}.ln2"), device)?,
            cmix: ChannelMix::from_weights(weights, &format!("{prefix}.ffn"), device)?,
        })
    }

    /// Processes one token.
    ///
    /// `v_first` is the value vector of layer 0 for this token; layer 0
    /// produces it and the later layers blend it into their own values.
    pub fn forward_rnn(
        &self,
        x: Tensor<B, 1>,
        v_first: Option<Tensor<B, 1>>,
        state: LayerState<B>,
    ) -> (Tensor<B, 1>, Option<Tensor<B, 1>>, LayerState<B>) {
        let x_att = self.layer_norm_1.forward(x.clone());
        let (att, tmix_kv, v_first) =
            self.tmix
                .forward_rnn(x_att.clone(), state.tmix_x_prev, v_first, state.tmix_kv);
        let x = x + att;

        let x_ffn = self.layer_norm_2.forward(x.clone());
        let x = x + self.cmix.forward_rnn(x_ffn.clone(), state.cmix_x_prev);

        (
            x,
            v_first,
            LayerState {
                tmix_x_prev: x_att,
                tmix_kv,
                cmix_x_prev: x_ffn,
            },
        )
    }
}
