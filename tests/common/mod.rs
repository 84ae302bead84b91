#![allow(dead_code)]

//! Scripted stand-in for a recurrent model.
//!
//! The model hands out pre-recorded fragments, one per `forward` call, and
//! logs every interaction. Its state is the text seen since the last reset,
//! so a restored snapshot is easy to recognize.

use std::cell::Cell;
use std::collections::VecDeque;

use rwkv_playground::engine::{
    ForwardOutput, ForwardRequest, ModelAccessor, ModelFactory, RecurrentModel,
};
use rwkv_playground::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Reset,
    Context(String),
    Forward {
        stop_strings: Vec<String>,
        temperature: f32,
        top_p: f32,
        end_adjustment: f32,
        number: usize,
    },
    SetState(String),
}

#[derive(Debug, Default)]
pub struct ScriptedModel {
    pub calls: Vec<Call>,
    fragments: VecDeque<String>,
    /// Forward call (0-based) that fails with a model error.
    fail_at: Option<usize>,
    forwards: usize,
    state: String,
}

impl ScriptedModel {
    pub fn new<I, T>(fragments: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn failing_at(mut self, forward: usize) -> Self {
        self.fail_at = Some(forward);
        self
    }

    /// Queues more fragments behind the remaining ones.
    pub fn script<I, T>(&mut self, fragments: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.fragments.extend(fragments.into_iter().map(Into::into));
    }

    pub fn forward_calls(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|call| matches!(call, Call::Forward { .. }))
            .collect()
    }

    pub fn contexts(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Context(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl RecurrentModel for ScriptedModel {
    type State = String;

    fn reset_state(&mut self) {
        self.calls.push(Call::Reset);
        self.state.clear();
    }

    fn empty_state(&self) -> String {
        String::new()
    }

    fn load_context(&mut self, text: &str) -> Result<()> {
        self.calls.push(Call::Context(text.to_string()));
        self.state.push_str(text);
        Ok(())
    }

    fn forward(&mut self, request: &ForwardRequest<'_>) -> Result<ForwardOutput<String>> {
        self.calls.push(Call::Forward {
            stop_strings: request.stop_strings.to_vec(),
            temperature: request.temperature,
            top_p: request.top_p,
            end_adjustment: request.end_adjustment,
            number: request.number,
        });

        let index = self.forwards;
        self.forwards += 1;
        if self.fail_at == Some(index) {
            return Err(Error::Model("device lost".into()));
        }

        let output = self.fragments.pop_front().unwrap_or_default();
        self.state.push_str(&output);
        Ok(ForwardOutput {
            output,
            state: self.state.clone(),
        })
    }

    fn set_state(&mut self, state: &String) {
        self.calls.push(Call::SetState(state.clone()));
        self.state = state.clone();
    }
}

/// Builds a fresh [`ScriptedModel`] from a fixed script.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    pub fragments: Vec<String>,
    pub builds: Cell<usize>,
}

impl ModelFactory for ScriptedFactory {
    type Model = ScriptedModel;

    fn build(&self) -> Result<ScriptedModel> {
        self.builds.set(self.builds.get() + 1);
        Ok(ScriptedModel::new(self.fragments.clone()))
    }
}

/// An accessor whose model is built lazily from `fragments`.
pub fn lazy_accessor<I, T>(fragments: I) -> ModelAccessor<ScriptedFactory>
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    ModelAccessor::new(ScriptedFactory {
        fragments: fragments.into_iter().map(Into::into).collect(),
        ..Default::default()
    })
}

/// An accessor around an already constructed model.
pub fn loaded_accessor(model: ScriptedModel) -> ModelAccessor<ScriptedFactory> {
    ModelAccessor::with_model(ScriptedFactory::default(), model)
}

/// The model inside `accessor`, which must already be loaded.
pub fn model(accessor: &mut ModelAccessor<ScriptedFactory>) -> &mut ScriptedModel {
    assert!(accessor.is_loaded());
    accessor.get().expect("model is loaded")
}
