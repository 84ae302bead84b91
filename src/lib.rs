//! Playground front-end for RWKV language models: single-shot generation with
//! streamed output and a multi-turn chat persona, both driving one lazily
//! loaded recurrent model.

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod model;
pub mod params;
pub mod presets;
pub mod runtime;
pub mod stop;

pub use chat::{ChatController, ChatRequest, ChatSession, ChatTurn};
pub use config::{BackendKind, ModelConfig};
pub use engine::{ForwardOutput, ForwardRequest, ModelAccessor, ModelFactory, RecurrentModel};
pub use error::{Error, Result};
pub use generator::{Emission, GenerationController, GenerationRequest, GenerationStream, Mode};
pub use params::SamplingParams;
pub use runtime::{RwkvFactory, RwkvRuntime, RwkvState};
