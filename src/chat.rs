//! Multi-turn chat on top of the shared model.
//!
//! A conversation lives in a [`ChatSession`] owned by the caller: the list of
//! turns and a snapshot of the model state right after the last reply. Each
//! call to [`ChatController::chat`] restores that snapshot (or resets the
//! model for a new conversation), generates one reply and hands back the
//! extended session.

use tracing::info;

use crate::engine::{ForwardRequest, ModelAccessor, ModelFactory, RecurrentModel};
use crate::error::Result;
use crate::params::SamplingParams;

/// Username used when the caller leaves it blank.
pub const DEFAULT_USERNAME: &str = "USER";

/// Emitted by the model at the end of a document.
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// One exchange: the rendered `"{username}: {message}\n"` line and the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub prompt: String,
    pub reply: String,
}

impl ChatTurn {
    /// The username the prompt was rendered with: everything before its
    /// first `:`.
    pub fn username(&self) -> &str {
        self.prompt.split(':').next().unwrap_or_default()
    }
}

/// A conversation: turns in order plus the model state after the last one.
#[derive(Debug, Clone)]
pub struct ChatSession<S> {
    turns: Vec<ChatTurn>,
    state: S,
}

impl<S> ChatSession<S> {
    /// A session with no turns, starting from `state`.
    pub fn new(state: S) -> Self {
        Self {
            turns: Vec::new(),
            state,
        }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Snapshot of the model state after the last turn.
    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The user this conversation belongs to, taken from its first turn.
    pub fn username(&self) -> Option<&str> {
        self.turns.first().map(ChatTurn::username)
    }

    fn push(&mut self, turn: ChatTurn, state: S) {
        self.turns.push(turn);
        self.state = state;
    }
}

/// One chat message with its generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub username: String,
    pub params: SamplingParams,
}

impl ChatRequest {
    /// A request with the chat defaults: 60 tokens, temperature 0.8, top_p
    /// 0.85 and an end-of-text adjustment of -2.
    pub fn new(message: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            username: username.into(),
            params: SamplingParams::new(60, 0.8, 0.85, -2.0),
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }
}

/// Few-shot conversation loaded ahead of the first message of a session.
pub fn intro(username: &str) -> String {
    format!(
        "The following is a verbose and detailed conversation between an AI assistant called FRITZ, and a human user called USER. FRITZ is intelligent, knowledgeable, wise and polite.

    {username}: What year was the french revolution?
    FRITZ: The French Revolution started in 1789, and lasted 10 years until 1799.
    {username}: 3+5=?
    FRITZ: The answer is 8.
    {username}: What year did the Berlin Wall fall?
    FRITZ: The Berlin wall stood for 28 years and fell in 1989.
    {username}: solve for a: 9-a=2
    FRITZ: The answer is a=7, because 9-7 = 2.
    {username}: wat is lhc
    FRITZ: The Large Hadron Collider (LHC) is a high-energy particle collider, built by CERN, and completed in 2008. It was used to confirm the existence of the Higgs boson in 2012.
    {username}: Tell me about yourself.
    FRITZ: My name is Fritz. I am an RNN based Large Language Model (LLM).
    "
    )
}

/// Cleans a raw reply: drops leading newlines and spaces, then every trailing
/// character that occurs anywhere in `"{username}:"`.
///
/// The trailing trim works on the character set, not the suffix, so a reply
/// ending in letters of the username loses them too.
pub fn clean_reply(raw: &str, username: &str) -> String {
    let marker = format!("{username}:");
    raw.trim_start_matches(['\n', ' '])
        .trim_end_matches(|c: char| marker.contains(c))
        .to_string()
}

/// Runs chat turns against the shared model.
pub struct ChatController<'a, F: ModelFactory> {
    accessor: &'a mut ModelAccessor<F>,
}

impl<'a, F: ModelFactory> ChatController<'a, F> {
    pub fn new(accessor: &'a mut ModelAccessor<F>) -> Self {
        Self { accessor }
    }

    /// Generates one reply and returns the transcript together with the
    /// session to pass into the next call.
    ///
    /// Starts a new conversation when `session` is missing or empty, or
    /// when its first turn was written by a different user. `session` itself
    /// is never modified, so a failed call leaves it usable.
    pub fn chat(
        &mut self,
        request: &ChatRequest,
        session: Option<&ChatSession<<F::Model as RecurrentModel>::State>>,
    ) -> Result<(Vec<ChatTurn>, ChatSession<<F::Model as RecurrentModel>::State>)> {
        let sampling = request.params.validate()?;

        let username = match request.username.trim() {
            "" => DEFAULT_USERNAME,
            name => name,
        };

        let model = self.accessor.get()?;

        let (mut session, preamble) = match session {
            Some(session) if session.username() == Some(username) => {
                model.set_state(session.state());
                (session.clone(), String::new())
            }
            Some(session) if !session.is_empty() => {
                info!(previous = ?session.username(), username, "username changed, reset chat state");
                model.reset_state();
                (ChatSession::new(model.empty_state()), intro(username))
            }
            _ => {
                info!(username, "reset chat state");
                model.reset_state();
                (ChatSession::new(model.empty_state()), intro(username))
            }
        };

        let prompt = format!("{username}: {}\n", request.message);
        info!("CHAT:\n{prompt}");
        model.load_context(&format!("{preamble}{prompt}"))?;

        let stop_strings = [END_OF_TEXT.to_string(), format!("{username}:")];
        let out = model.forward(&ForwardRequest {
            stop_strings: &stop_strings,
            temperature: sampling.temperature(),
            top_p: sampling.top_p(),
            end_adjustment: sampling.end_adjustment(),
            number: sampling.max_new_tokens(),
        })?;

        let reply = clean_reply(&out.output, username);
        info!("OUTPUT:\n{reply}");

        session.push(ChatTurn { prompt, reply }, out.state);
        Ok((session.turns.clone(), session))
    }
}
