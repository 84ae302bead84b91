use std::{fs, path::Path};

use burn::{
    module::Param,
    nn::{GroupNorm, GroupNormConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::{DType, Shape, TensorData},
};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{RWKVv7, RWKVv7Config};

impl<B: Backend> RWKVv7<B> {
    /// Loads a model from a `.safetensors` file, inferring its dimensions
    /// from the stored tensor shapes.
    pub fn new_from_safetensors(path: impl AsRef<Path>, device: &B::Device) -> Result<RWKVv7<B>> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|err| Error::WeightLoad(format!("{}: {err}", path.display())))?;
        let weights = Weights::parse(&data)?;

        let config = weights.config()?;
        debug!(
            n_layer = config.n_layer,
            d_model = config.d_model,
            n_heads = config.n_heads,
            vocab_size = config.vocab_size,
            d_decay_lora = config.d_decay_lora,
            d_aaa_lora = config.d_aaa_lora,
            d_mv_lora = config.d_mv_lora,
            d_gate_lora = config.d_gate_lora,
            "loading RWKVv7 weights from {}",
            path.display()
        );

        RWKVv7::from_weights(&weights, &config, device)
    }
}

/// Named tensors of a deserialized weight file.
///
/// Tensors may be stored as `BF16`, `F16` or `F32`; all of them are
/// converted to `F32` on load.
pub struct Weights<'data> {
    tensors: SafeTensors<'data>,
}

impl<'data> Weights<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(data)
            .map_err(|err| Error::WeightLoad(format!("not a safetensors file: {err}")))?;
        Ok(Self { tensors })
    }

    fn view(&self, name: &str) -> Result<TensorView<'data>> {
        self.tensors
            .tensor(name)
            .map_err(|_| Error::WeightLoad(format!("missing tensor '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.tensor(name).is_ok()
    }

    pub fn shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.view(name)?.shape().to_vec())
    }

    /// Derives the model configuration from tensor shapes.
    pub fn config(&self) -> Result<RWKVv7Config> {
        let [vocab_size, d_model] = self.dims("emb.weight")?;
        let [n_heads, head_size] = self.dims("blocks.0.att.r_k")?;
        let n_layer = self.block_count();
        if n_layer == 0 {
            return Err(Error::WeightLoad("weight file has no blocks".into()));
        }

        let [_, d_decay_lora] = self.dims("blocks.0.att.w1")?;
        let [_, d_aaa_lora] = self.dims("blocks.0.att.a1")?;
        let [_, d_gate_lora] = self.dims("blocks.0.att.g1")?;

        let mut config = RWKVv7Config::new(d_model, n_heads, head_size, n_layer, vocab_size)
            .with_d_decay_lora(d_decay_lora)
            .with_d_aaa_lora(d_aaa_lora)
            .with_d_gate_lora(d_gate_lora);
        // Block 0 has no value residual, so its width comes from block 1.
        if self.contains("blocks.1.att.v1") {
            let [_, d_mv_lora] = self.dims("blocks.1.att.v1")?;
            config = config.with_d_mv_lora(d_mv_lora);
        }

        Ok(config)
    }

    fn dims<const D: usize>(&self, name: &str) -> Result<[usize; D]> {
        let shape = self.shape(name)?;
        shape.as_slice().try_into().map_err(|_| {
            Error::WeightLoad(format!("tensor '{name}' has shape {shape:?}, expected rank {D}"))
        })
    }

    fn block_count(&self) -> usize {
        self.tensors
            .names()
            .into_iter()
            .filter_map(|name| name.strip_prefix("blocks.")?.split('.').next()?.parse::<usize>().ok())
            .max()
            .map_or(0, |id| id + 1)
    }

    /// Reads a tensor as `F32` data laid out as `shape`.
    fn data(&self, name: &str, shape: Vec<usize>) -> Result<TensorData> {
        let view = self.view(name)?;
        let numel: usize = view.shape().iter().product();
        if numel != shape.iter().product::<usize>() {
            return Err(Error::WeightLoad(format!(
                "tensor '{name}' has shape {:?}, cannot view it as {shape:?}",
                view.shape()
            )));
        }

        let dtype = match view.dtype() {
            Dtype::BF16 => DType::BF16,
            Dtype::F16 => DType::F16,
            Dtype::F32 => DType::F32,
            other => {
                return Err(Error::WeightLoad(format!(
                    "tensor '{name}' has unsupported dtype {other:?}"
                )));
            }
        };

        Ok(TensorData::from_bytes(view.data().to_vec(), Shape::from(shape), dtype)
            .convert_dtype(DType::F32))
    }

    /// A 2D tensor in its stored layout.
    pub fn matrix<B: Backend>(&self, name: &str, device: &B::Device) -> Result<Tensor<B, 2>> {
        let [rows, cols] = self.dims(name)?;
        Ok(Tensor::from_data(self.data(name, vec![rows, cols])?, device))
    }

    /// Any tensor flattened to one dimension, e.g. the `[1, 1, d_model]`
    /// mixing coefficients.
    pub fn vector<B: Backend>(&self, name: &str, device: &B::Device) -> Result<Param<Tensor<B, 1>>> {
        let numel = self.shape(name)?.iter().product();
        Ok(Param::from_tensor(Tensor::from_data(
            self.data(name, vec![numel])?,
            device,
        )))
    }

    /// A bias-free projection from a PyTorch `[out, in]` weight.
    pub fn linear<B: Backend>(&self, name: &str, device: &B::Device) -> Result<Linear<B>> {
        self.projection(self.matrix(name, device)?.transpose(), device)
    }

    /// A bias-free projection from a weight already stored as `[in, out]`,
    /// as the LoRA factors are.
    pub fn lora<B: Backend>(&self, name: &str, device: &B::Device) -> Result<Linear<B>> {
        self.projection(self.matrix(name, device)?, device)
    }

    fn projection<B: Backend>(&self, weight: Tensor<B, 2>, device: &B::Device) -> Result<Linear<B>> {
        let [d_input, d_output] = weight.dims();
        let mut linear = LinearConfig::new(d_input, d_output)
            .with_bias(false)
            .init::<B>(device);
        linear.weight = Param::from_tensor(weight);
        Ok(linear)
    }

    /// `{prefix}.weight` and `{prefix}.bias` as a layer norm.
    pub fn layer_norm<B: Backend>(&self, prefix: &str, device: &B::Device) -> Result<LayerNorm<B>> {
        let gamma = self.vector::<B>(&format!("{prefix}.weight"), device)?;
        let beta = self.vector::<B>(&format!("{prefix}.bias"), device)?;

        let [d_model] = gamma.val().dims();
        let mut norm = LayerNormConfig::new(d_model).init::<B>(device);
        norm.gamma = gamma;
        norm.beta = beta;
        Ok(norm)
    }

    /// `{prefix}.weight` and `{prefix}.bias` as the per-head group norm of
    /// the time mixing output.
    pub fn group_norm<B: Backend>(
        &self,
        prefix: &str,
        n_heads: usize,
        device: &B::Device,
    ) -> Result<GroupNorm<B>> {
        let gamma = self.vector::<B>(&format!("{prefix}.weight"), device)?;
        let beta = self.vector::<B>(&format!("{prefix}.bias"), device)?;

        let [d_model] = gamma.val().dims();
        let mut norm = GroupNormConfig::new(n_heads, d_model)
            .with_epsilon(64e-5)
            .init::<B>(device);
        norm.gamma = Some(gamma);
        norm.beta = Some(beta);
        Ok(norm)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;
    use crate::model::fixture::{D, Fixture, HEADS, LORA, tiny_model};

    type B = NdArray;

    const VOCAB: usize = 8;

    fn to_vec(tensor: Tensor<B, 1>) -> Vec<f32> {
        tensor.into_data().convert_dtype(DType::F32).to_vec::<f32>().unwrap()
    }

    #[test]
    fn infers_dimensions_from_shapes() {
        let data = tiny_model(VOCAB, 3);
        let config = Weights::parse(&data).unwrap().config().unwrap();

        assert_eq!(config.n_layer, 3);
        assert_eq!(config.d_model, D);
        assert_eq!(config.n_heads, HEADS);
        assert_eq!(config.head_size, D / HEADS);
        assert_eq!(config.vocab_size, VOCAB);
        assert_eq!(config.d_decay_lora, LORA);
        assert_eq!(config.d_mv_lora, LORA);
        assert_eq!(config.d_gate_lora, LORA);
    }

    #[test]
    fn converts_bf16_to_f32() {
        let data = tiny_model(VOCAB, 1);
        let weights = Weights::parse(&data).unwrap();
        let emb = weights.matrix::<B>("emb.weight", &Default::default()).unwrap();

        assert_eq!(emb.dims(), [VOCAB, D]);
        let first = to_vec(emb.reshape([VOCAB * D]));
        assert_eq!(first[3], 0.0);
        assert!((first[0] + 0.15).abs() < 1e-3);
    }

    #[test]
    fn steps_one_token_at_a_time() {
        let data = tiny_model(VOCAB, 2);
        let weights = Weights::parse(&data).unwrap();
        let config = weights.config().unwrap();
        let model = RWKVv7::<B>::from_weights(&weights, &config, &Default::default()).unwrap();

        let (logits, state) = model.forward_rnn(1, model.init_state());
        assert_eq!(logits.dims(), [VOCAB]);
        assert!(to_vec(logits.clone()).iter().all(|v| v.is_finite()));
        assert_eq!(state.len(), 2);
        assert_eq!(state[0].tmix_kv.dims(), [HEADS, D / HEADS, D / HEADS]);

        // Same token from the same state gives the same logits.
        let (again, _) = model.forward_rnn(1, model.init_state());
        assert_eq!(to_vec(logits), to_vec(again));
    }

    #[test]
    fn missing_tensor_is_reported() {
        let mut f = Fixture::default();
        f.f32("emb.weight", &[VOCAB, D]);
        let data = f.bytes();

        let err = Weights::parse(&data).unwrap().config().err().unwrap();
        assert!(matches!(err, Error::WeightLoad(msg) if msg.contains("blocks.0.att.r_k")));
    }

    #[test]
    fn rejects_files_that_are_not_safetensors() {
        assert!(matches!(
            Weights::parse(b"definitely not a weight file"),
            Err(Error::WeightLoad(_))
        ));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");
        fs::write(&path, tiny_model(VOCAB, 2)).unwrap();

        let model = RWKVv7::<B>::new_from_safetensors(&path, &Default::default()).unwrap();
        assert_eq!(model.vocab_size(), VOCAB);
        assert_eq!(model.layers.len(), 2);

        let missing = RWKVv7::<B>::new_from_safetensors(dir.path().join("nope"), &Default::default());
        assert!(matches!(missing, Err(Error::WeightLoad(_))));
    }
}
