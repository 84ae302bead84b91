//! Small RWKVv7 weight files assembled in memory for tests.

/// Hidden width of the fixture models.
pub const D: usize = 4;
pub const HEADS: usize = 2;
pub const LORA: usize = 2;
pub const FFN: usize = 8;

/// Hand-assembled safetensors file: u64 header length, JSON header, data.
#[derive(Default)]
pub struct Fixture {
    entries: Vec<String>,
    data: Vec<u8>,
}

impl Fixture {
    fn push(&mut self, name: &str, dtype: &str, shape: &[usize], bytes: Vec<u8>) {
        let start = self.data.len();
        self.data.extend(bytes);
        self.entries.push(format!(
            "\"{name}\":{{\"dtype\":\"{dtype}\",\"shape\":{shape:?},\"data_offsets\":[{start},{}]}}",
            self.data.len()
        ));
    }

    fn pattern(shape: &[usize]) -> Vec<f32> {
        let numel: usize = shape.iter().product();
        (0..numel).map(|i| ((i % 7) as f32 - 3.0) * 0.05).collect()
    }

    pub fn values(&mut self, name: &str, shape: &[usize], values: Vec<f32>) {
        assert_eq!(values.len(), shape.iter().product::<usize>(), "{name}");
        let bytes = values.into_iter().flat_map(f32::to_le_bytes).collect();
        self.push(name, "F32", shape, bytes);
    }

    pub fn f32(&mut self, name: &str, shape: &[usize]) {
        self.values(name, shape, Self::pattern(shape));
    }

    pub fn bf16(&mut self, name: &str, shape: &[usize]) {
        let bytes = Self::pattern(shape)
            .into_iter()
            .flat_map(|v| ((v.to_bits() >> 16) as u16).to_le_bytes())
            .collect();
        self.push(name, "BF16", shape, bytes);
    }

    pub fn norm(&mut self, prefix: &str) {
        self.f32(&format!("{prefix}.weight"), &[D]);
        self.f32(&format!("{prefix}.bias"), &[D]);
    }

    pub fn bytes(self) -> Vec<u8> {
        let header = format!("{{{}}}", self.entries.join(","));
        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend(header.as_bytes());
        out.extend(self.data);
        out
    }
}

fn blocks(f: &mut Fixture, vocab: usize, n_layer: usize) {
    f.bf16("emb.weight", &[vocab, D]);
    f.norm("blocks.0.ln0");

    for layer in 0..n_layer {
        let p = format!("blocks.{layer}");
        f.norm(&format!("{p}.ln1"));
        f.norm(&format!("{p}.ln2"));

        for name in ["x_r", "x_w", "x_k", "x_v", "x_a", "x_g", "w0", "a0", "k_k", "k_a"] {
            f.f32(&format!("{p}.att.{name}"), &[1, 1, D]);
        }
        for name in ["w", "a", "g"] {
            f.f32(&format!("{p}.att.{name}1"), &[D, LORA]);
            f.f32(&format!("{p}.att.{name}2"), &[LORA, D]);
        }
        if layer > 0 {
            f.f32(&format!("{p}.att.v0"), &[1, 1, D]);
            f.f32(&format!("{p}.att.v1"), &[D, LORA]);
            f.f32(&format!("{p}.att.v2"), &[LORA, D]);
        }
        f.f32(&format!("{p}.att.r_k"), &[HEADS, D / HEADS]);
        for name in ["receptance", "key", "value", "output"] {
            f.f32(&format!("{p}.att.{name}.weight"), &[D, D]);
        }
        f.norm(&format!("{p}.att.ln_x"));

        f.f32(&format!("{p}.ffn.x_k"), &[1, 1, D]);
        f.f32(&format!("{p}.ffn.key.weight"), &[FFN, D]);
        f.f32(&format!("{p}.ffn.value.weight"), &[D, FFN]);
    }
}

/// A model with `vocab` tokens and patterned weights everywhere.
pub fn tiny_model(vocab: usize, n_layer: usize) -> Vec<u8> {
    let mut f = Fixture::default();
    blocks(&mut f, vocab, n_layer);
    f.norm("ln_out");
    f.f32("head.weight", &[vocab, D]);
    f.bytes()
}

/// A model that always predicts `token`, whatever its input.
///
/// The output norm ignores its input (zero gain, unit bias) and only the
/// head row of `token` is non-zero, so that token gets logit `10 * D` and
/// every other token 0. That dominates even a full-vocabulary softmax.
pub fn pinned_model(vocab: usize, n_layer: usize, token: usize) -> Vec<u8> {
    let mut f = Fixture::default();
    blocks(&mut f, vocab, n_layer);
    f.values("ln_out.weight", &[D], vec![0.0; D]);
    f.values("ln_out.bias", &[D], vec![1.0; D]);

    let mut head = vec![0.0; vocab * D];
    head[token * D..(token + 1) * D].fill(10.0);
    f.values("head.weight", &[vocab, D], head);
    f.bytes()
}
