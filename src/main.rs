// Demo binary: chat, embeddings and JSON generation through the worker.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use log::LevelFilter;

use llama_cpp_worker::{
    setup_logging, ChatSession, ContextConfig, Coordinator, LlamaCppBackend, Logger, ModelConfig,
    Role, SamplerConfig, SessionStore, WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "llama_worker_demo", about = "llama.cpp worker demo")]
struct Cli {
    /// Worker settings file (JSON); defaults are used when absent.
    #[arg(long, default_value = "worker.json")]
    config: PathBuf,

    #[arg(long, default_value = "logs")]
    log_dir: String,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Path to a GGUF model file.
    #[arg(short, long)]
    model: String,

    #[arg(long, default_value_t = 0)]
    gpu_layers: u32,

    #[arg(long, default_value_t = 4096)]
    n_ctx: u32,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Streamed chat. Reads prompts from stdin when none is given.
    Chat {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = 512)]
        max_tokens: u32,
        /// deterministic | balanced | creative
        #[arg(long, default_value = "balanced")]
        preset: String,
        /// Override the preset's sampling seed.
        #[arg(long)]
        seed: Option<u32>,
        /// Restore this saved session before chatting.
        #[arg(long)]
        resume: Option<String>,
        /// Save the session on exit.
        #[arg(long)]
        save: bool,
        prompt: Option<String>,
    },
    /// Embed texts and print cosine similarity against the first one.
    Embed {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(required = true)]
        texts: Vec<String>,
    },
    /// Grammar-constrained JSON output.
    Json {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long, default_value_t = 256)]
        max_tokens: u32,
        prompt: String,
    },
}

async fn start(
    config: &WorkerConfig,
    args: &ModelArgs,
    embeddings: bool,
) -> Result<Coordinator<LlamaCppBackend>> {
    let coordinator = Coordinator::new(LlamaCppBackend::new(Logger::new("llama")), config.clone());
    coordinator.start().await?;
    if !coordinator.init_backend().await? {
        bail!("backend did not become ready within {:?}", config.ready_timeout());
    }

    let info = coordinator
        .load_model(
            &args.model,
            ModelConfig {
                gpu_layers: args.gpu_layers,
                ..ModelConfig::default()
            },
        )
        .await
        .with_context(|| format!("loading {}", args.model))?;
    log::info!(
        "Loaded {} (trained context {}, vocab {})",
        info.path,
        info.n_ctx_train,
        info.n_vocab
    );

    coordinator
        .create_context(ContextConfig {
            n_ctx: args.n_ctx.min(info.n_ctx_train.max(1)),
            embeddings,
            ..ContextConfig::default()
        })
        .await?;
    Ok(coordinator)
}

fn preset(name: &str) -> Result<SamplerConfig> {
    Ok(match name {
        "deterministic" => SamplerConfig::deterministic(),
        "balanced" => SamplerConfig::balanced(),
        "creative" => SamplerConfig::creative(),
        other => bail!("unknown preset {other:?}"),
    })
}

async fn chat(
    config: &WorkerConfig,
    args: &ModelArgs,
    system: Option<String>,
    sampler: SamplerConfig,
    resume: Option<String>,
    save: bool,
    prompt: Option<String>,
) -> Result<()> {
    let coordinator = start(config, args, false).await?;
    let store = SessionStore::new(&config.session_dir)?;

    let mut session = match resume {
        Some(id) => {
            let session = coordinator.load_session(&store, &id).await?;
            eprintln!("Resumed session {} ({} messages)", session.id, session.history.len());
            session
        }
        None => ChatSession::new(args.model.clone(), sampler.clone()),
    };

    let prompts: Vec<String> = match prompt {
        Some(p) => vec![p],
        None => std::io::stdin()
            .lock()
            .lines()
            .collect::<std::io::Result<_>>()
            .context("reading prompts from stdin")?,
    };

    for prompt in prompts.into_iter().filter(|p| !p.trim().is_empty()) {
        let mut stream = coordinator
            .generate_stream_with_history(&prompt, sampler.clone(), system.as_deref(), &session.history)
            .await?;
        session.push(Role::User, prompt.clone());
        let request_id = stream.request_id().clone();

        let mut stdout = std::io::stdout();
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(text)) => {
                        write!(stdout, "{text}")?;
                        stdout.flush()?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    coordinator.stop_generation(Some(request_id.clone())).await?;
                }
            }
        }
        writeln!(stdout)?;

        if let Some(done) = stream.completion() {
            session.push(Role::Assistant, done.text.clone());
            if let Some(m) = &done.metrics {
                eprintln!(
                    "[{} tokens, {:?}, {:.1} tok/s]",
                    done.tokens_generated,
                    done.stop_reason,
                    m.gen_tok_per_sec.unwrap_or(0.0)
                );
            }
        }
    }

    if save {
        coordinator.save_session(&store, &mut session).await?;
        eprintln!("Saved session {}", session.id);
    }
    coordinator.dispose().await?;
    Ok(())
}

async fn embed(config: &WorkerConfig, args: &ModelArgs, texts: &[String]) -> Result<()> {
    let coordinator = start(config, args, true).await?;
    let mut vectors = Vec::with_capacity(texts.len());
    for text in texts {
        vectors.push(coordinator.embed(text).await?);
    }

    let Some(first) = vectors.first() else {
        return Ok(());
    };
    println!("dimensions: {}", first.len());
    for (text, v) in texts.iter().zip(&vectors) {
        let cosine: f32 = first.iter().zip(v).map(|(a, b)| a * b).sum();
        println!("{cosine:.4}  {text}");
    }
    coordinator.dispose().await?;
    Ok(())
}

async fn json(config: &WorkerConfig, args: &ModelArgs, max_tokens: u32, prompt: &str) -> Result<()> {
    let coordinator = start(config, args, false).await?;
    let completion = coordinator
        .generate(prompt, SamplerConfig::json().with_max_tokens(max_tokens), None)
        .await?
        .context("worker disposed during generation")?;

    match serde_json::from_str::<serde_json::Value>(&completion.text) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(e) => {
            eprintln!("Output is not complete JSON ({e}); raw text follows");
            println!("{}", completion.text);
        }
    }
    coordinator.dispose().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = setup_logging(&cli.log_dir, level) {
        eprintln!("Failed to set up logging: {e}");
    }

    let config = WorkerConfig::load(&cli.config)?;

    match cli.command {
        Mode::Chat {
            model,
            system,
            max_tokens,
            preset: name,
            seed,
            resume,
            save,
            prompt,
        } => {
            let mut sampler = preset(&name)?.with_max_tokens(max_tokens);
            if let Some(seed) = seed {
                sampler = sampler.with_seed(seed);
            }
            chat(&config, &model, system, sampler, resume, save, prompt).await
        }
        Mode::Embed { model, texts } => embed(&config, &model, &texts).await,
        Mode::Json {
            model,
            max_tokens,
            prompt,
        } => json(&config, &model, max_tokens, &prompt).await,
    }
}
