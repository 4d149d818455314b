//! pocketllm command-line front end
//!
//! `pocketllm <MODEL.gguf> [PROMPT...]`
//!
//! With a prompt, prints one reply. Without, every stdin line is a separate,
//! independent turn.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pocketllm::config::{default_config_path, load_config};
use pocketllm::{DriverConfig, LlamaCppEngine, Session};

fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    let filter = match "pocketllm=info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    info!("Starting pocketllm v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let Some(model_path) = args.next().map(PathBuf::from) else {
        eprintln!("usage: pocketllm <MODEL.gguf> [PROMPT...]");
        return ExitCode::FAILURE;
    };
    let prompt: Vec<String> = args.collect();

    let config = match default_config_path() {
        Ok(path) => load_config(&path),
        Err(e) => {
            tracing::warn!("{}, using default config", e);
            DriverConfig::default()
        }
    };

    let mut session = Session::new(LlamaCppEngine::new(), config);
    if let Err(e) = session.load(&model_path) {
        eprintln!("{e}: {}", model_path.display());
        return ExitCode::FAILURE;
    }

    if !prompt.is_empty() {
        let input = prompt.join(" ");
        println!("{}", reply(&mut session, &input));
        return ExitCode::SUCCESS;
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let text = reply(&mut session, &line);
        if writeln!(stdout, "{text}").and_then(|_| stdout.flush()).is_err() {
            break;
        }
    }

    session.unload();
    ExitCode::SUCCESS
}

fn reply(session: &mut Session<LlamaCppEngine>, input: &str) -> String {
    let prompt = session.config().render_prompt(input);
    session.generate_text(&prompt).trim().to_string()
}
