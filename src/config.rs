use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Compute backend the network runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    NdArray,
    Wgpu,
    LibTorch,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::NdArray => f.write_str("ndarray"),
            BackendKind::Wgpu => f.write_str("wgpu"),
            BackendKind::LibTorch => f.write_str("libtorch"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_lowercase().as_str() {
            "ndarray" | "cpu" => Ok(BackendKind::NdArray),
            "wgpu" => Ok(BackendKind::Wgpu),
            "libtorch" | "tch" | "torch" => Ok(BackendKind::LibTorch),
            other => Err(Error::Config(format!(
                "unknown backend '{other}', expected ndarray, wgpu or libtorch"
            ))),
        }
    }
}

/// Where the weights live and how to run them.
///
/// Saved and loaded as JSON through [`Config::save`] and [`Config::load`].
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Path to the RWKV-v7 `.safetensors` weight file.
    pub weights: String,

    /// Path to the World tokenizer vocabulary.
    #[config(default = "String::from(\"rwkv_vocab_v20230424.txt\")")]
    pub vocab_path: String,

    #[config(default = "BackendKind::NdArray")]
    pub backend: BackendKind,

    /// Prefer an accelerator when the backend offers one.
    #[config(default = true)]
    pub use_gpu: bool,

    /// Keep only the k most likely tokens when sampling; 0 keeps all.
    #[config(default = 0)]
    pub top_k: usize,

    /// Fixed sampling seed for reproducible output.
    #[config(default = "None")]
    pub seed: Option<u64>,
}

impl ModelConfig {
    /// Reads a JSON config file.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        Self::load(path).map_err(|err| Error::Config(format!("{path}: {err:?}")))
    }

    /// Writes the config as JSON.
    pub fn to_file(&self, path: &str) -> crate::error::Result<()> {
        self.save(path)?;
        Ok(())
    }
}
