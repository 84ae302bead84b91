use burn::{
    module::Param,
    nn::{GroupNorm, Linear},
    prelude::*,
    tensor::{Tensor, activation},
};

use super::{RWKVv7Config, load_from_safetensors::Weights};
use crate::error::Result;

/// Blending of layer 0's values into a later layer's values. Layer 0 has
/// none.
#[derive(Module, Debug)]
pub struct ValueResidual<B: Backend> {
    pub v0: Param<Tensor<B, 1>>,
    pub v1: Linear<B>,
    pub v2: Linear<B>,
}

/// The attention replacement of an RWKVv7 block, evaluated in its recurrent
/// form: every head keeps a `[head_size, head_size]` key-value state that
/// decays and is updated once per token.
///
/// All per-channel coefficients are stored flat as `[d_model]`.
#[derive(Module, Debug)]
pub struct TimeMix<B: Backend> {
    pub d_model: usize,
    pub n_heads: usize,
    pub head_size: usize,

    pub x_r: Param<Tensor<B, 1>>,
    pub x_w: Param<Tensor<B, 1>>,
    pub x_k: Param<Tensor<B, 1>>,
    pub x_v: Param<Tensor<B, 1>>,
    pub x_a: Param<Tensor<B, 1>>,
    pub x_g: Param<Tensor<B, 1>>,

    pub w0: Param<Tensor<B, 1>>,
    pub w1: Linear<B>,
    pub w2: Linear<B>,

    pub a0: Param<Tensor<B, 1>>,
    pub a1: Linear<B>,
    pub a2: Linear<B>,

    pub value_residual: Option<ValueResidual<B>>,

    pub g1: Linear<B>,
    pub g2: Linear<B>,

    pub k_k: Param<Tensor<B, 1>>,
    pub k_a: Param<Tensor<B, 1>>,
    pub r_k: Param<Tensor<B, 1>>,

    pub receptance: Linear<B>,
    pub key: Linear<B>,
    pub value: Linear<B>,
    pub output: Linear<B>,
    pub group_norm: GroupNorm<B>,
}

impl<B: Backend> TimeMix<B> {
    pub(crate) fn from_weights(
        weights: &Weights<'_>,
        prefix: &str,
        config: &RWKVv7Config,
        device: &B::Device,
    ) -> Result<TimeMix<B>> {
        let vector = |name: &str| weights.vector::<B>(&format!("{prefix}.{name}"), device);
        let lora = |name: &str| weights.lora::<B>(&format!("{prefix}.{name}"), device);
        let linear = |name: &str| weights.linear::<B>(&format!("{prefix}.{name}.weight"), device);

        let value_residual = if weights.contains(&format!("{prefix}.v0")) {
            Some(ValueResidual {
                v0: vector("v0")?,
                v1: lora("v1")?,
                v2: lora("v2")?,
            })
        } else {
            None
        };

        Ok(TimeMix {
            d_model: config.d_model,
            n_heads: config.n_heads,
            head_size: config.head_size,
            x_r: vector("x_r")?,
            x_w: vector("x_w")?,
            x_k: vector("x_k")?,
            x_v: vector("x_v")?,
            x_a: vector("x_a")?,
            x_g: vector("x_g")?,
            w0: vector("w0")?,
            w1: lora("w1")?,
            w2: lora("w2")?,
            a0: vector("a0")?,
            a1: lora("a1")?,
            a2: lora("a2")?,
            value_residual,
            g1: lora("g1")?,
            g2: lora("g2")?,
            k_k: vector("k_k")?,
            k_a: vector("k_a")?,
            r_k: vector("r_k")?,
            receptance: linear("receptance")?,
            key: linear("key")?,
            value: linear("value")?,
            output: linear("output")?,
            group_norm: weights.group_norm(&format!("{prefix}.ln_x"), config.n_heads, device)?,
        })
    }

    /// Processes one token.
    ///
    /// # Arguments
    /// * `x` - Normalized input, `[d_model]`.
    /// * `x_prev` - Normalized input of the previous token.
    /// * `v_first` - Value vector of layer 0, `None` when this is layer 0.
    /// * `kv` - Key-value state, `[n_heads, head_size, head_size]`.
    ///
    /// # Returns
    /// The output, the updated key-value state and `v_first` for the next
    /// layer.
    pub fn forward_rnn(
        &self,
        x: Tensor<B, 1>,
        x_prev: Tensor<B, 1>,
        v_first: Option<Tensor<B, 1>>,
        kv: Tensor<B, 3>,
    ) -> (Tensor<B, 1>, Tensor<B, 3>, Option<Tensor<B, 1>>) {
        let [h, n, d] = [self.n_heads, self.head_size, self.d_model];

        let xx = x_prev - x.clone();
        let shift = |mix: &Param<Tensor<B, 1>>| x.clone() + xx.clone().mul(mix.val());

        let xv = shift(&self.x_v);
        let r = self.receptance.forward(shift(&self.x_r));
        let w = self.w2.forward(activation::tanh(self.w1.forward(shift(&self.x_w))));
        let k = self.key.forward(shift(&self.x_k));
        let mut v = self.value.forward(xv.clone());
        let a = activation::sigmoid(self.a0.val() + self.a2.forward(self.a1.forward(shift(&self.x_a))));
        let g = self.g2.forward(activation::sigmoid(self.g1.forward(shift(&self.x_g))));

        // Per-head L2-normalized removal key.
        let kk = k.clone().mul(self.k_k.val()).reshape([h, n]);
        let norm = kk.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
        let kk = kk.div(norm).reshape([d]);
        let k = k.mul((a.clone() - 1).mul(self.k_a.val()).add_scalar(1.0));

        let v_first = match (v_first, &self.value_residual) {
            (Some(first), Some(residual)) => {
                let gate = activation::sigmoid(
                    residual.v0.val() + residual.v2.forward(residual.v1.forward(xv)),
                );
                v = v.clone() + (first.clone() - v).mul(gate);
                Some(first)
            }
            (Some(first), None) => Some(first),
            (None, _) => Some(v.clone()),
        };

        let decay = activation::sigmoid(w + self.w0.val())
            .mul_scalar(-0.606531)
            .exp();

        let vk = v
            .clone()
            .reshape([h, n, 1])
            .matmul(k.clone().reshape([h, 1, n]));
        let ab = (-kk.clone())
            .reshape([h, n, 1])
            .matmul(kk.mul(a).reshape([h, 1, n]));
        let kv = kv.clone().mul(decay.reshape([h, 1, n])) + kv.matmul(ab) + vk;

        let out = kv.clone().matmul(r.clone().reshape([h, n, 1]));
        let out = self
            .group_norm
            .forward(out.reshape([1, d]))
            .reshape([d]);

        let bonus = r
            .mul(k)
            .mul(self.r_k.val())
            .reshape([h, n])
            .sum_dim(1)
            .mul(v.reshape([h, n]))
            .reshape([d]);

        (self.output.forward((out + bonus).mul(g)), kv, v_first)
    }
}
