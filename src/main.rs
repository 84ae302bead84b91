use std::io::{self, Read, Write};
use std::process::ExitCode;

use burn::{
    backend::{
        LibTorch, NdArray, Wgpu, libtorch::LibTorchDevice, ndarray::NdArrayDevice,
        wgpu::WgpuDevice,
    },
    prelude::*,
};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rwkv_playground::chat::{ChatController, ChatRequest, ChatSession, DEFAULT_USERNAME};
use rwkv_playground::config::{BackendKind, ModelConfig};
use rwkv_playground::engine::ModelAccessor;
use rwkv_playground::error::{Error, Result};
use rwkv_playground::generator::{GenerationController, GenerationRequest, Mode};
use rwkv_playground::params::SamplingParams;
use rwkv_playground::presets;
use rwkv_playground::runtime::{RwkvFactory, RwkvState};
use rwkv_playground::stop::StopSet;

/// Generate text and chat with an RWKVv7 model.
///
/// Example usage:
/// ```sh
/// rwkv-playground -w ./model.safetensors generate "The capital of France is"
/// rwkv-playground -w ./model.safetensors chat --username ALEX
/// ```
#[derive(Parser, Debug)]
#[command(version, about = "Generate text and chat with an RWKVv7 model.")]
struct Cli {
    #[arg(long = "config", help = "JSON model config; the flags below override its fields")]
    config: Option<String>,

    #[arg(short = 'w', long = "weights", help = "Path to safetensors weight file")]
    weights: Option<String>,

    #[arg(
        long = "tokenizer_vocab_file",
        help = "Path to tokenizer vocab file (rwkv_vocab_v20230424.txt)"
    )]
    vocab_path: Option<String>,

    #[arg(short = 'b', long = "backend", help = "ndarray, wgpu or libtorch")]
    backend: Option<BackendKind>,

    #[arg(long = "cpu", help = "Run on the CPU even if the backend has an accelerator")]
    cpu: bool,

    #[arg(short = 'k', long = "top_k", help = "Top k for token sampling, 0 disables it")]
    top_k: Option<usize>,

    #[arg(long = "seed", help = "Seed for reproducible sampling")]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Continue a prompt, streaming the output.
    Generate(GenerateArgs),
    /// Talk to FRITZ. `\reset` starts over, `\name NAME` switches user,
    /// `\exit` quits.
    Chat(ChatArgs),
    /// List the built-in example prompts.
    Examples,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(help = "Prompt text; read from stdin when omitted")]
    prompt: Option<String>,

    #[arg(
        long = "example",
        help = "Run a built-in example by name or number; a prompt argument replaces its prompt"
    )]
    example: Option<String>,

    #[arg(long = "mode", default_value_t = Mode::Generative, help = "generative or qa")]
    mode: Mode,

    #[arg(short = 'n', long = "max_new_tokens", default_value_t = 40)]
    max_new_tokens: usize,

    #[arg(short = 't', long = "temperature", default_value_t = 0.8)]
    temperature: f32,

    #[arg(short = 'p', long = "top_p", default_value_t = 0.85)]
    top_p: f32,

    #[arg(
        short = 'e',
        long = "end_adj",
        default_value_t = 0.0,
        allow_hyphen_values = true,
        help = "Added to the end-of-text logit, -999..=0"
    )]
    end_adjustment: f32,

    #[arg(
        short = 's',
        long = "stop",
        default_value = "<|endoftext|>",
        help = "Comma-separated stop sequences, backslash escapes allowed"
    )]
    stop: String,

    #[arg(long = "no-stream", help = "Print only the finished text")]
    no_stream: bool,
}

impl GenerateArgs {
    fn into_request(self) -> Result<(GenerationRequest, bool)> {
        let no_stream = self.no_stream;

        let request = match self.example {
            Some(key) => {
                let preset = presets::find(&key)
                    .ok_or_else(|| Error::Validation(format!("no example named '{key}'")))?;
                info!(example = preset.name, "using built-in example");
                match self.prompt {
                    Some(prompt) => GenerationRequest { prompt, ..preset.request },
                    None => preset.request,
                }
            }
            None => {
                let prompt = match self.prompt {
                    Some(prompt) => prompt,
                    None => {
                        let mut prompt = String::new();
                        io::stdin().read_to_string(&mut prompt)?;
                        prompt
                    }
                };
                GenerationRequest::new(prompt)
                    .with_mode(self.mode)
                    .with_params(SamplingParams::new(
                        self.max_new_tokens,
                        self.temperature,
                        self.top_p,
                        self.end_adjustment,
                    ))
                    .with_stop(self.stop)
            }
        };

        Ok((request, no_stream))
    }
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(short = 'u', long = "username", default_value = DEFAULT_USERNAME)]
    username: String,

    #[arg(short = 'n', long = "max_new_tokens", default_value_t = 60)]
    max_new_tokens: usize,

    #[arg(short = 't', long = "temperature", default_value_t = 0.8)]
    temperature: f32,

    #[arg(short = 'p', long = "top_p", default_value_t = 0.85)]
    top_p: f32,

    #[arg(
        short = 'e',
        long = "end_adj",
        default_value_t = -2.0,
        allow_hyphen_values = true,
        help = "Added to the end-of-text logit, -999..=0"
    )]
    end_adjustment: f32,
}

impl Cli {
    /// The model config file, if any, with command line overrides applied.
    fn model_config(&self) -> Result<ModelConfig> {
        let mut config = match (&self.config, &self.weights) {
            (Some(path), _) => ModelConfig::from_file(path)?,
            (None, Some(weights)) => ModelConfig::new(weights.clone()),
            (None, None) => {
                return Err(Error::Config(
                    "either --config or --weights is required".into(),
                ));
            }
        };

        if let Some(weights) = &self.weights {
            config.weights = weights.clone();
        }
        if let Some(vocab_path) = &self.vocab_path {
            config.vocab_path = vocab_path.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if self.cpu {
            config.use_gpu = false;
        }
        if let Some(top_k) = self.top_k {
            config.top_k = top_k;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }

        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    if let Command::Examples = cli.command {
        list_examples();
        return Ok(());
    }

    let config = cli.model_config()?;
    info!(backend = %config.backend, use_gpu = config.use_gpu, weights = %config.weights, "model config");

    match (config.backend, config.use_gpu) {
        (BackendKind::NdArray, _) => run::<NdArray>(config, NdArrayDevice::Cpu, cli.command),
        (BackendKind::Wgpu, true) => run::<Wgpu>(config, WgpuDevice::DefaultDevice, cli.command),
        (BackendKind::Wgpu, false) => run::<Wgpu>(config, WgpuDevice::Cpu, cli.command),
        (BackendKind::LibTorch, true) => {
            run::<LibTorch>(config, LibTorchDevice::Cuda(0), cli.command)
        }
        (BackendKind::LibTorch, false) => {
            run::<LibTorch>(config, LibTorchDevice::Cpu, cli.command)
        }
    }
}

fn run<B: Backend>(config: ModelConfig, device: B::Device, command: Command) -> Result<()> {
    let mut accessor = ModelAccessor::new(RwkvFactory::<B>::new(config, device));
    accessor.initialize()?;

    match command {
        Command::Generate(args) => {
            let (request, no_stream) = args.into_request()?;
            generate(&mut accessor, &request, no_stream)
        }
        Command::Chat(args) => chat(&mut accessor, args),
        Command::Examples => {
            list_examples();
            Ok(())
        }
    }
}

fn list_examples() {
    for (index, preset) in presets::presets().iter().enumerate() {
        let request = &preset.request;
        let first_line = request.prompt.lines().next().unwrap_or_default();
        println!(
            "{:>2}. {:<13} [{}] {}",
            index + 1,
            preset.name,
            request.mode,
            first_line
        );
    }
}

fn generate<B: Backend>(
    accessor: &mut ModelAccessor<RwkvFactory<B>>,
    request: &GenerationRequest,
    no_stream: bool,
) -> Result<()> {
    let mut controller = GenerationController::new(accessor);

    if no_stream {
        let text = controller.run(request, |_| {})?;
        println!("{text}");
        return Ok(());
    }

    // Stop sequences are hidden while streaming, as they are in the final
    // value.
    let stops = StopSet::parse(&request.stop)?;
    let mut stdout = io::stdout();
    let mut shown = String::new();

    for emission in controller.generate(request)? {
        let emission = emission?;
        let text = if emission.is_final() {
            emission.into_text()
        } else {
            stops.truncate(emission.text())
        };

        if let Some(delta) = text.strip_prefix(shown.as_str()) {
            write!(stdout, "{delta}")?;
            stdout.flush()?;
            shown = text;
        }
    }
    writeln!(stdout)?;

    Ok(())
}

fn chat<B: Backend>(accessor: &mut ModelAccessor<RwkvFactory<B>>, args: ChatArgs) -> Result<()> {
    let params = SamplingParams::new(
        args.max_new_tokens,
        args.temperature,
        args.top_p,
        args.end_adjustment,
    );
    params.validate()?;

    let mut username = args.username;
    let mut session: Option<ChatSession<RwkvState<B>>> = None;
    let mut controller = ChatController::new(accessor);
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "{username}: ")?;
        stdout.flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let message = input.trim();

        if message.eq_ignore_ascii_case("\\exit") {
            break;
        }
        if message.eq_ignore_ascii_case("\\reset") {
            session = None;
            println!("Resetting the conversation.");
            continue;
        }
        if let Some(name) = message.strip_prefix("\\name") {
            let name = name.trim();
            username = if name.is_empty() { DEFAULT_USERNAME } else { name }.to_string();
            continue;
        }

        let request = ChatRequest::new(message, username.as_str()).with_params(params);
        match controller.chat(&request, session.as_ref()) {
            Ok((turns, next)) => {
                if let Some(turn) = turns.last() {
                    println!("FRITZ: {}\n", turn.reply);
                }
                session = Some(next);
            }
            Err(err) if err.is_validation() => error!("{err}"),
            Err(err) => return Err(err),
        }
    }

    Ok(())
}
