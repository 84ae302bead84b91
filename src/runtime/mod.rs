//! [`RecurrentModel`] implementation backed by the burn RWKVv7 network and
//! the World tokenizer.

mod sampler;

pub use sampler::{END_OF_TEXT_TOKEN, Sampler};

use std::marker::PhantomData;

use burn::prelude::*;
use rwkv_tokenizer::WorldTokenizer;
use tracing::{debug, info};

use crate::chat::END_OF_TEXT;
use crate::config::ModelConfig;
use crate::engine::{ForwardOutput, ForwardRequest, ModelFactory, RecurrentModel};
use crate::error::{Error, Result};
use crate::model::{LayerState, RWKVv7};

/// Snapshot of the runtime's recurrent state.
///
/// Besides the per-layer tensors it holds the logits predicted from the last
/// token fed in and the sampled tokens that do not yet decode to complete
/// UTF-8, so generation resumes exactly where the snapshot was taken.
#[derive(Debug, Clone)]
pub struct RwkvState<B: Backend> {
    layers: Vec<LayerState<B>>,
    logits: Option<Tensor<B, 1>>,
    pending: Vec<u16>,
}

impl<B: Backend> RwkvState<B> {
    fn new(layers: Vec<LayerState<B>>) -> Self {
        Self {
            layers,
            logits: None,
            pending: Vec::new(),
        }
    }
}

/// An RWKVv7 model with its tokenizer, sampler and live state.
pub struct RwkvRuntime<B: Backend> {
    model: RWKVv7<B>,
    tokenizer: WorldTokenizer,
    sampler: Sampler,
    state: RwkvState<B>,
}

impl<B: Backend> RwkvRuntime<B> {
    pub fn new(model: RWKVv7<B>, tokenizer: WorldTokenizer, sampler: Sampler) -> Self {
        let state = RwkvState::new(model.init_state());
        Self {
            model,
            tokenizer,
            sampler,
            state,
        }
    }

    /// Loads weights and tokenizer as described by `config`.
    pub fn load(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        let model = RWKVv7::<B>::new_from_safetensors(&config.weights, device)?;
        info!(
            layers = model.layers.len(),
            vocab_size = model.vocab_size(),
            "loaded {}",
            config.weights
        );
        let tokenizer = WorldTokenizer::new(Some(&config.vocab_path)).map_err(|err| {
            Error::Tokenizer(format!("loading vocabulary {}: {err}", config.vocab_path))
        })?;

        Ok(Self::new(model, tokenizer, Sampler::new(config.top_k, config.seed)))
    }

    /// Feeds one token and keeps the logits it predicts.
    fn feed(&mut self, token: u16) {
        let layers = std::mem::take(&mut self.state.layers);
        let (logits, layers) = self.model.forward_rnn(token as usize, layers);
        self.state.layers = layers;
        self.state.logits = Some(logits);
    }

    /// Logits for the next token. Without any context yet, the end-of-text
    /// token is fed first so there is something to predict from.
    fn next_logits(&mut self) -> Option<Tensor<B, 1>> {
        if self.state.logits.is_none() {
            self.feed(END_OF_TEXT_TOKEN);
        }
        self.state.logits.take()
    }
}

impl<B: Backend> RecurrentModel for RwkvRuntime<B> {
    type State = RwkvState<B>;

    fn reset_state(&mut self) {
        self.state = self.empty_state();
    }

    fn empty_state(&self) -> RwkvState<B> {
        RwkvState::new(self.model.init_state())
    }

    fn load_context(&mut self, text: &str) -> Result<()> {
        let tokens = self.tokenizer.encode(text);
        debug!(tokens = tokens.len(), "loading context");
        for token in tokens {
            self.feed(token);
        }
        Ok(())
    }

    fn forward(&mut self, request: &ForwardRequest<'_>) -> Result<ForwardOutput<RwkvState<B>>> {
        let mut output = String::new();

        for _ in 0..request.number {
            let logits = self
                .next_logits()
                .ok_or_else(|| Error::Model("no logits after feeding a token".into()))?;
            let token = self.sampler.sample(
                logits,
                request.temperature,
                request.top_p,
                request.end_adjustment,
            )?;
            self.feed(token);

            if token == END_OF_TEXT_TOKEN {
                if !self.state.pending.is_empty() {
                    debug!(tokens = ?self.state.pending, "dropping incomplete UTF-8 at end of text");
                    self.state.pending.clear();
                }
                debug!("end of text sampled");
                output.push_str(END_OF_TEXT);
                break;
            }

            // Tokens may split a character; hold them until the bytes are
            // complete, across calls if need be.
            self.state.pending.push(token);
            if let Ok(text) = self.tokenizer.decode(self.state.pending.clone()) {
                output.push_str(&text);
                self.state.pending.clear();
            }

            if request
                .stop_strings
                .iter()
                .any(|stop| !stop.is_empty() && output.contains(stop.as_str()))
            {
                break;
            }
        }

        Ok(ForwardOutput {
            output,
            state: self.state.clone(),
        })
    }

    fn set_state(&mut self, state: &RwkvState<B>) {
        self.state = state.clone();
    }
}

/// Builds an [`RwkvRuntime`] on a fixed device the first time it is needed.
pub struct RwkvFactory<B: Backend> {
    config: ModelConfig,
    device: B::Device,
    backend: PhantomData<B>,
}

impl<B: Backend> RwkvFactory<B> {
    pub fn new(config: ModelConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            backend: PhantomData,
        }
    }
}

impl<B: Backend> ModelFactory for RwkvFactory<B> {
    type Model = RwkvRuntime<B>;

    fn release_caches(&self) {
        B::sync(&self.device);
    }

    fn build(&self) -> Result<RwkvRuntime<B>> {
        RwkvRuntime::load(&self.config, &self.device)
    }
}
