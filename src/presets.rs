//! Ready-made generation requests showing what the model can do.

use crate::generator::{GenerationRequest, Mode};
use crate::params::SamplingParams;

/// A named example request.
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub name: &'static str,
    pub request: GenerationRequest,
}

fn preset(
    name: &'static str,
    prompt: &str,
    mode: Mode,
    max_new_tokens: usize,
    temperature: f32,
    top_p: f32,
    end_adjustment: f32,
    stop: &str,
) -> Preset {
    Preset {
        name,
        request: GenerationRequest::new(prompt)
            .with_mode(mode)
            .with_params(SamplingParams::new(max_new_tokens, temperature, top_p, end_adjustment))
            .with_stop(stop),
    }
}

/// All built-in examples, in display order.
pub fn presets() -> Vec<Preset> {
    vec![
        preset(
            "capital",
            "What is the capital of Germany?",
            Mode::QuestionAnswer,
            25,
            0.2,
            0.8,
            0.0,
            "<|endoftext|>,\\n",
        ),
        preset(
            "humans",
            "Are humans good or bad?",
            Mode::QuestionAnswer,
            150,
            0.8,
            0.8,
            -1.0,
            "<|endoftext|>",
        ),
        preset(
            "vitamin-a",
            "What is the purpose of Vitamin A?",
            Mode::QuestionAnswer,
            60,
            0.2,
            0.8,
            -0.5,
            "<|endoftext|>",
        ),
        preset(
            "llm-dialogue",
            "This is a conversation between two AI large language models named Alex and Fritz. They are exploring each other's capabilities, and trying to ask interesting questions of one another to explore the limits of each others AI.

Conversation:
Alex: Good morning, Fritz, what type of LLM are you based upon?
Fritz: Morning Alex, I am an RNN with transformer level performance. My language model is 100% attention free.
Alex:",
            Mode::Generative,
            220,
            0.9,
            0.9,
            -3.0,
            "<|endoftext|>,\\n\\n",
        ),
        preset(
            "cat-story",
            "Task given:

Please Write a Short story about a cat learning python

Best Full Response:
",
            Mode::Generative,
            140,
            0.85,
            0.8,
            -3.5,
            "<|endoftext|>",
        ),
        preset(
            "tolkien",
            "Here is a short story (in the style of Tolkien) in which Aiden attacks a robot with a sword:
        ",
            Mode::Generative,
            140,
            0.85,
            0.8,
            -3.5,
            "<|endoftext|>",
        ),
    ]
}

/// Looks a preset up by name or by 1-based position.
pub fn find(key: &str) -> Option<Preset> {
    let all = presets();
    if let Ok(index) = key.parse::<usize>() {
        return index.checked_sub(1).and_then(|i| all.get(i).cloned());
    }
    all.into_iter().find(|p| p.name == key)
}
