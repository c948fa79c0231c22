//! # llama-cli
//!
//! Command-line front end for llama-rag.
//!
//! Wires: knowledge files → [`RagService`] → generation → cleaned output.
//! Three subcommands:
//!
//! - `query`: answer one prompt
//! - `retrieve`: show the best lexical matches without loading a model
//! - `chat`: answer prompts read line by line from stdin

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use llama_rag::{Chunk, KnowledgeStore, RagError, Retriever};
use llama_runtime::text::clean_output;
use llama_runtime::{
    load_config, ConfigError, DefaultBackend, GenerationConfig, InitError, RagService,
};

/// Errors surfaced by the CLI.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to initialize model (status {code}): {source}")]
    Init {
        code: i32,
        #[source]
        source: InitError,
    },
    #[error("knowledge error: {0}")]
    Knowledge(#[from] RagError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<InitError> for CliError {
    fn from(source: InitError) -> Self {
        CliError::Init {
            code: source.status_code(),
            source,
        }
    }
}

/// llama-rag: retrieval-augmented generation from the command line
#[derive(Debug, Parser)]
#[command(name = "llama-rag", version)]
pub struct Cli {
    /// Knowledge file, one document per line. Repeatable.
    #[arg(short, long = "knowledge", global = true, value_name = "FILE")]
    pub knowledge: Vec<PathBuf>,

    /// Inline knowledge document. Repeatable.
    #[arg(long = "doc", global = true, value_name = "TEXT")]
    pub docs: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Answer a single prompt.
    Query {
        #[command(flatten)]
        model: ModelArgs,

        /// Prompt text.
        #[arg(short, long)]
        prompt: String,
    },

    /// List the knowledge documents that best match a query.
    Retrieve {
        /// Query text.
        #[arg(short, long)]
        query: String,

        /// Number of matches to show.
        #[arg(short = 'n', long, default_value_t = 3)]
        top_k: usize,
    },

    /// Answer prompts read from stdin, one per line, until EOF or `exit`.
    Chat {
        #[command(flatten)]
        model: ModelArgs,
    },
}

/// Model and generation options.
#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    /// Model file: GGUF with the `native` feature, otherwise a JSON model card.
    #[arg(short, long, value_name = "FILE")]
    pub model: PathBuf,

    /// JSON generation config.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the generated-token budget.
    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// Override the maximum prompt length in tokens.
    #[arg(long)]
    pub context_window: Option<usize>,

    /// Print raw vocabulary pieces instead of cleaned text.
    #[arg(long)]
    pub raw: bool,
}

/// Config file (or defaults) with command-line overrides applied.
pub fn resolve_config(args: &ModelArgs) -> Result<GenerationConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GenerationConfig::default(),
    };
    if let Some(n) = args.max_new_tokens {
        config = config.with_max_new_tokens(n);
    }
    if let Some(n) = args.context_window {
        config = config.with_context_window(n);
    }
    config.validate()?;
    Ok(config)
}

/// Build a ready service with all knowledge loaded.
pub fn open_service(
    args: &ModelArgs,
    knowledge: &[PathBuf],
    docs: &[String],
) -> Result<RagService<DefaultBackend>, CliError> {
    let service = RagService::with_config(DefaultBackend::default(), resolve_config(args)?);
    service.initialize(&args.model)?;

    for path in knowledge {
        let added = service.try_load_knowledge_file(path)?;
        tracing::info!(path = %path.display(), added, "knowledge loaded");
    }
    for doc in docs {
        service.add_knowledge(doc.as_str());
    }
    Ok(service)
}

/// Knowledge store for retrieval-only commands.
pub fn build_store(knowledge: &[PathBuf], docs: &[String]) -> Result<KnowledgeStore, CliError> {
    let mut store = KnowledgeStore::new();
    for path in knowledge {
        store.try_load_file(path)?;
    }
    for doc in docs {
        store.add_document(doc.as_str());
    }
    Ok(store)
}

pub fn render(text: String, raw: bool) -> String {
    if raw {
        text
    } else {
        clean_output(&text)
    }
}

/// One line per chunk: score, document index, text.
pub fn format_chunks(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("{:.0}\t#{}\t{}", c.score, c.id, c.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Answer each non-empty input line until EOF, `exit` or `quit`.
/// Returns the number of prompts answered.
pub fn chat<R: BufRead, W: Write>(
    service: &RagService<DefaultBackend>,
    input: R,
    mut output: W,
    raw: bool,
) -> io::Result<usize> {
    let mut answered = 0;
    for line in input.lines() {
        let line = line?;
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "exit" || prompt == "quit" {
            break;
        }
        writeln!(output, "{}", render(service.query(prompt), raw))?;
        answered += 1;
    }
    output.flush()?;
    Ok(answered)
}

/// Execute a parsed command line.
pub fn run<R: BufRead, W: Write>(cli: Cli, input: R, mut output: W) -> Result<(), CliError> {
    match cli.command {
        Command::Query { model, prompt } => {
            let service = open_service(&model, &cli.knowledge, &cli.docs)?;
            writeln!(output, "{}", render(service.query(&prompt), model.raw))?;
        }
        Command::Retrieve { query, top_k } => {
            let store = build_store(&cli.knowledge, &cli.docs)?;
            let chunks = store.retrieve(&query, top_k)?;
            if chunks.is_empty() {
                writeln!(output, "no matching documents")?;
            } else {
                writeln!(output, "{}", format_chunks(&chunks))?;
            }
        }
        Command::Chat { model } => {
            let service = open_service(&model, &cli.knowledge, &cli.docs)?;
            let answered = chat(&service, input, &mut output, model.raw)?;
            tracing::info!(answered, "chat finished");
        }
    }
    Ok(())
}
