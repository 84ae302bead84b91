use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::engine::{ForwardRequest, ModelAccessor, ModelFactory, RecurrentModel};
use crate::error::{Error, Result};
use crate::params::{Sampling, SamplingParams};
use crate::stop::StopSet;

/// How the prompt of a generation request is presented to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// The prompt is continued as is.
    #[default]
    Generative,
    /// The prompt is wrapped in an expert question/answer template.
    QuestionAnswer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Generative => f.write_str("generative"),
            Mode::QuestionAnswer => f.write_str("qa"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "generative" => Ok(Mode::Generative),
            "qa" | "q/a" => Ok(Mode::QuestionAnswer),
            other => Err(Error::Validation(format!(
                "unknown mode '{other}', expected 'generative' or 'qa'"
            ))),
        }
    }
}

/// A single-shot generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub mode: Mode,
    pub params: SamplingParams,
    /// Comma-separated stop sequences; backslash escapes are resolved.
    pub stop: String,
}

impl GenerationRequest {
    /// A request with the front-end's default settings: 40 tokens,
    /// temperature 0.8, top_p 0.85, no end adjustment, stopping on
    /// `<|endoftext|>`.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: Mode::Generative,
            params: SamplingParams::new(40, 0.8, 0.85, 0.0),
            stop: String::from("<|endoftext|>"),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop = stop.into();
        self
    }
}

/// Applies the prompt template of `mode`. An empty prompt becomes a single
/// space first; the model needs at least one token of context.
pub fn render_prompt(prompt: &str, mode: Mode) -> String {
    let prompt = if prompt.is_empty() { " " } else { prompt };

    match mode {
        Mode::Generative => prompt.to_string(),
        Mode::QuestionAnswer => {
            format!("Ask Expert\n\nQuestion:\n{prompt}\n\nExpert Full Answer:\n")
        }
    }
}

/// A value produced by a [`GenerationStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Everything generated so far. Supersedes earlier partial values.
    Partial(String),
    /// The finished text with stop sequences cut off. May be shorter than
    /// the last partial value.
    Final(String),
}

impl Emission {
    pub fn text(&self) -> &str {
        match self {
            Emission::Partial(text) | Emission::Final(text) => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Emission::Partial(text) | Emission::Final(text) => text,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Emission::Final(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stepping,
    Finishing,
    Done,
}

/// Runs single-shot generation requests against the shared model.
///
/// Every request starts from a freshly reset recurrent state.
pub struct GenerationController<'a, F: ModelFactory> {
    accessor: &'a mut ModelAccessor<F>,
}

impl<'a, F: ModelFactory> GenerationController<'a, F> {
    pub fn new(accessor: &'a mut ModelAccessor<F>) -> Self {
        Self { accessor }
    }

    /// Validates `request`, loads its prompt and returns the stream of
    /// emissions.
    ///
    /// Invalid parameters fail here without touching the model. The prompt is
    /// loaded eagerly; each pull of the stream then generates one step.
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationStream<'_, F::Model>> {
        let sampling = request.params.validate()?;
        let stops = StopSet::parse(&request.stop)?;

        let model = self.accessor.get()?;
        model.reset_state();

        let prompt = render_prompt(&request.prompt, request.mode);
        info!(mode = %request.mode, "PROMPT:\n{prompt}");
        model.load_context(&prompt)?;

        Ok(GenerationStream {
            model,
            sampling,
            stops,
            text: String::new(),
            steps: 0,
            phase: Phase::Stepping,
        })
    }

    /// Drives a request to completion, handing every emission to
    /// `on_emission`, and returns the final text.
    pub fn run(
        &mut self,
        request: &GenerationRequest,
        mut on_emission: impl FnMut(&Emission),
    ) -> Result<String> {
        let mut final_text = String::new();

        for emission in self.generate(request)? {
            let emission = emission?;
            on_emission(&emission);
            if let Emission::Final(text) = emission {
                final_text = text;
            }
        }

        Ok(final_text)
    }
}

/// Lazily generated output of one request.
///
/// Yields one [`Emission::Partial`] per model step, at most
/// `max_new_tokens` of them, then exactly one [`Emission::Final`]. A model
/// error is yielded once and ends the stream. Dropping the stream stops
/// generation.
pub struct GenerationStream<'a, M: RecurrentModel> {
    model: &'a mut M,
    sampling: Sampling,
    stops: StopSet,
    text: String,
    steps: usize,
    phase: Phase,
}

impl<M: RecurrentModel> GenerationStream<'_, M> {
    /// Number of model steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn step(&mut self) -> Result<Emission> {
        let request = ForwardRequest {
            stop_strings: self.stops.raw(),
            temperature: self.sampling.temperature(),
            top_p: self.sampling.top_p(),
            end_adjustment: self.sampling.end_adjustment(),
            number: 1,
        };
        let fragment = self.model.forward(&request)?.output;
        debug!(fragment = ?fragment, step = self.steps, "generated");

        self.text.push_str(&fragment);
        let leading = self.text.len() - self.text.trim_start_matches(['\n', ' ']).len();
        self.text.drain(..leading);
        self.steps += 1;

        if self.stops.matches(&self.text) {
            debug!(step = self.steps, "stop sequence reached");
            self.phase = Phase::Finishing;
        } else if self.steps >= self.sampling.max_new_tokens() {
            self.phase = Phase::Finishing;
        }

        Ok(Emission::Partial(self.text.clone()))
    }
}

impl<M: RecurrentModel> Iterator for GenerationStream<'_, M> {
    type Item = Result<Emission>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.phase {
            Phase::Done => None,
            Phase::Finishing => {
                self.phase = Phase::Done;
                let text = self.stops.truncate(&self.text);
                info!(steps = self.steps, "OUTPUT:\n{text}");
                Some(Ok(Emission::Final(text)))
            }
            Phase::Stepping => {
                let emission = self.step();
                if emission.is_err() {
                    self.phase = Phase::Done;
                }
                Some(emission)
            }
        }
    }
}

impl<M: RecurrentModel> std::iter::FusedIterator for GenerationStream<'_, M> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes() {
        assert_eq!("generative".parse::<Mode>().unwrap(), Mode::Generative);
        assert_eq!("Q/A".parse::<Mode>().unwrap(), Mode::QuestionAnswer);
        assert_eq!("qa".parse::<Mode>().unwrap(), Mode::QuestionAnswer);
        assert!("poetry".parse::<Mode>().is_err());
    }

    #[test]
    fn renders_qa_template() {
        assert_eq!(
            render_prompt("What is the capital of Germany?", Mode::QuestionAnswer),
            "Ask Expert\n\nQuestion:\nWhat is the capital of Germany?\n\nExpert Full Answer:\n"
        );
    }

    #[test]
    fn empty_prompt_becomes_a_space() {
        assert_eq!(render_prompt("", Mode::Generative), " ");
        assert_eq!(
            render_prompt("", Mode::QuestionAnswer),
            "Ask Expert\n\nQuestion:\n \n\nExpert Full Answer:\n"
        );
    }

    #[test]
    fn emission_accessors() {
        let partial = Emission::Partial("Ber".into());
        let last = Emission::Final("Berlin".into());
        assert!(!partial.is_final());
        assert!(last.is_final());
        assert_eq!(partial.text(), "Ber");
        assert_eq!(last.into_text(), "Berlin");
    }
}
