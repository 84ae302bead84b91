mod channel_mix;
#[cfg(test)]
pub(crate) mod fixture;
mod layer;
mod load_from_safetensors;
mod rwkv_v7;
mod time_mix;

pub use layer::LayerState;
pub use load_from_safetensors::Weights;
pub use rwkv_v7::{RWKVv7, RWKVv7Config};
