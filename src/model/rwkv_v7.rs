use burn::{
    config::Config,
    nn::{Embedding, EmbeddingConfig, LayerNorm, Linear},
    module::Param,
    prelude::*,
    tensor::Tensor,
};

use super::layer::{Layer, LayerState};
use super::load_from_safetensors::Weights;

/// Dimensions of an RWKVv7 model.
///
/// Normally derived from the weight file; the LoRA widths default to the
/// values of the small published checkpoints.
#[derive(Config, Debug)]
pub struct RWKVv7Config {
    /// Hidden width.
    pub d_model: usize,

    pub n_heads: usize,

    /// `d_model / n_heads`.
    pub head_size: usize,

    pub n_layer: usize,

    pub vocab_size: usize,

    #[config(default = 64)]
    pub d_decay_lora: usize,

    #[config(default = 64)]
    pub d_aaa_lora: usize,

    #[config(default = 32)]
    pub d_mv_lora: usize,

    #[config(default = 128)]
    pub d_gate_lora: usize,
}

/// The RWKVv7 network, run one token at a time.
#[derive(Module, Debug)]
pub struct RWKVv7<B: Backend> {
    d_model: usize,
    n_heads: usize,
    head_size: usize,

    pub embed: Embedding<B>,
    /// Normalization applied to the embedding before the first layer.
    pub layer_norm_in: LayerNorm<B>,

    pub layers: Vec<Layer<B>>,

    pub layer_norm_out: LayerNorm<B>,
    /// Projection from the hidden state to vocabulary logits.
    pub unembed: Linear<B>,
}

impl<B: Backend> RWKVv7<B> {
    /// Assembles the network from loaded weights.
    pub(crate) fn from_weights(
        weights: &Weights<'_>,
        config: &RWKVv7Config,
        device: &B::Device,
    ) -> crate::error::Result<RWKVv7<B>> {
        let mut embed = EmbeddingConfig::new(config.vocab_size, config.d_model).init::<B>(device);
        embed.weight = Param::from_tensor(weights.matrix("emb.weight", device)?);

        let layers = (0..config.n_layer)
            .map(|layer_id| Layer::from_weights(weights, layer_id, config, device))
            .collect::<crate::error::Result<Vec<_>>>()?;

        Ok(RWKVv7 {
            d_model: config.d_model,
            n_heads: config.n_heads,
            head_size: config.head_size,
            embed,
            layer_norm_in: weights.layer_norm("blocks.0.ln0", device)?,
            layers,
            layer_norm_out: weights.layer_norm("ln_out", device)?,
            unembed: weights.linear("head.weight", device)?,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.embed.weight.val().dims()[0]
    }

    pub fn device(&self) -> B::Device {
        self.embed.weight.device()
    }

    /// Advances the recurrent state by one token.
    ///
    /// # Returns
    ///
    /// Logits for the next token, shape `[vocab_size]`, and the updated
    /// per-layer states.
    pub fn forward_rnn(
        &self,
        token: usize,
        state: Vec<LayerState<B>>,
    ) -> (Tensor<B, 1>, Vec<LayerState<B>>) {
        let x = self
            .embed
            .weight
            .val()
            .slice([token..token + 1])
            .reshape([self.d_model]);
        let mut x = self.layer_norm_in.forward(x);
        let mut v_first: Option<Tensor<B, 1>> = None;
        let mut next_state = Vec::with_capacity(state.len());

        for (layer, layer_state) in self.layers.iter().zip(state) {
            let (out, first, updated) = layer.forward_rnn(x, v_first, layer_state);
            x = out;
            v_first = first;
            next_state.push(updated);
        }

        (self.unembed.forward(self.layer_norm_out.forward(x)), next_state)
    }

    /// Zeroed state for every layer.
    pub fn init_state(&self) -> Vec<LayerState<B>> {
        let device = self.device();
        (0..self.layers.len())
            .map(|_| LayerState {
                tmix_x_prev: Tensor::<B, 1>::zeros([self.d_model], &device),
                tmix_kv: Tensor::<B, 3>::zeros(
                    [self.n_heads, self.head_size, self.head_size],
                    &device,
                ),
                cmix_x_prev: Tensor::<B, 1>::zeros([self.d_model], &device),
            })
            .collect()
    }
}
