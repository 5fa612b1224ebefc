//! PromptL CLI - Command-line interface for the PromptL engine
//!
//! Provides subcommands for rendering documents, inspecting them
//! statically, and driving a chain one step at a time from saved state.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use promptl::compiler::scan::FileReferences;
use promptl::{
    AdapterKind, Chain, ChainOptions, ChainStep, CompileError, Document, ObjectMap, Scan,
    StepResponse, Value,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "promptl")]
#[command(about = "Compile PromptL documents into LLM conversations", long_about = None)]
struct Cli {
    /// Provider message format
    #[arg(short, long, global = true, default_value = "default")]
    adapter: AdapterKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a document to completion, answering every step with canned responses
    Render {
        /// Document to render
        prompt: PathBuf,

        /// Parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Responses for successive steps; the last one repeats
        #[arg(short, long = "response", default_value = "")]
        responses: Vec<String>,
    },

    /// Print parameters, config and problems found by static analysis
    Scan {
        /// Document to analyze
        prompt: PathBuf,

        /// Directory that absolute reference paths are resolved against
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Run one step of a chain whose state is kept in a file
    Chain {
        /// Chain state file, created on the first step
        state: PathBuf,

        /// Document to start from when the state file does not exist yet
        #[arg(long)]
        prompt: Option<PathBuf>,

        /// Parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Answer to the previous step
        #[arg(short, long)]
        response: Option<String>,
    },
}

fn parameters(raw: Option<&str>) -> Result<ObjectMap> {
    let Some(raw) = raw else {
        return Ok(ObjectMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(raw).context("parameters must be JSON")?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        other => bail!("parameters must be a JSON object, got {}", other.type_of()),
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_step(index: usize, step: &ChainStep) -> Result<()> {
    println!("--- step {} (completed: {})", index, step.completed);
    println!("{}", serde_json::to_string_pretty(step)?);
    Ok(())
}

fn print_error(error: &CompileError) {
    eprintln!("error[{}]: {}", error.code(), error.message());
    eprintln!("{}", error.frame);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let options = ChainOptions::default().with_adapter(cli.adapter);

    match cli.command {
        Commands::Render {
            prompt,
            params,
            responses,
        } => {
            let source = read(&prompt)?;
            let mut chain = Chain::new(source, parameters(params.as_deref())?, options)?;

            let mut step = chain.step(None).await?;
            print_step(0, &step)?;
            let mut index = 0;
            while !step.completed {
                let response = responses
                    .get(index)
                    .or(responses.last())
                    .cloned()
                    .unwrap_or_default();
                index += 1;
                step = chain.step(Some(StepResponse::Text(response))).await?;
                print_step(index, &step)?;
            }
        }

        Commands::Scan { prompt, root } => {
            let source = read(&prompt)?;
            let root = match root {
                Some(root) => root,
                None => prompt
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
            };
            let metadata = Scan::new(Document::new(prompt.to_string_lossy(), source))
                .with_reference_fn(Arc::new(FileReferences::new(root)))
                .run()
                .await;

            println!("Hash: {}", metadata.hash);
            println!("Chain: {}", metadata.is_chain);
            println!(
                "Parameters: {}",
                metadata.parameters.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            println!("Config: {}", serde_json::to_string(&metadata.config)?);
            for path in &metadata.included_prompt_paths {
                println!("  includes {}", path);
            }
            println!("{}", metadata.resolved_prompt);

            for error in &metadata.errors {
                print_error(error);
            }
            if !metadata.errors.is_empty() {
                bail!("{} problem(s) found", metadata.errors.len());
            }
        }

        Commands::Chain {
            state,
            prompt,
            params,
            response,
        } => {
            let mut chain = if state.exists() {
                let saved: serde_json::Value =
                    serde_json::from_str(&read(&state)?).context("state file is not JSON")?;
                Chain::deserialize(saved)?
            } else {
                let Some(prompt) = prompt else {
                    bail!("no state at {}; pass --prompt to start", state.display());
                };
                Chain::new(read(&prompt)?, parameters(params.as_deref())?, options)?
            };

            let step = chain.step(response.map(StepResponse::Text)).await?;
            println!("{}", serde_json::to_string_pretty(&step)?);

            let saved = serde_json::to_string_pretty(&chain.serialize())?;
            std::fs::write(&state, saved)
                .with_context(|| format!("writing {}", state.display()))?;
        }
    }

    Ok(())
}
