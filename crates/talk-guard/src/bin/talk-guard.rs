//! Talk Guard command line
//!
//! - `check`: sanitize and policy-check a piece of text
//! - `limits`: print the rate-limit tiers in effect
//! - `generate`: run a prompt through the full pipeline (needs an API key)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use talk_guard::{ChatMessage, FieldType, Guard, GuardConfig, GuardContext, Severity, TalkRequest};
use tracing::info;

const SYSTEM_PROMPT: &str = "You write sacrament meeting talks for members of the Church. \
Keep the tone warm and reverent, cite scripture where it helps, and only link to official Church resources.";

#[derive(Parser, Debug)]
#[command(name = "talk-guard")]
#[command(about = "Safety pipeline for generated talks")]
struct Args {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sanitize and policy-check text
    Check {
        /// Field type: email, password, name, topic, story, url or general
        #[arg(short, long, default_value = "topic")]
        field: FieldType,

        /// Identity to attribute violations to
        #[arg(long)]
        user: Option<String>,

        text: String,
    },
    /// Print the rate-limit tiers
    Limits,
    /// Generate a talk through the full pipeline
    Generate {
        /// Talk length in minutes
        #[arg(short, long, default_value_t = 5)]
        duration: u32,

        #[arg(long)]
        user: Option<String>,

        prompt: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<GuardConfig> {
    let config = match path {
        Some(path) => GuardConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GuardConfig::default(),
    };
    Ok(config.apply_env_overrides())
}

fn context(user: Option<String>) -> GuardContext {
    match user {
        Some(user) => GuardContext::new().with_user_id(user),
        None => GuardContext::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Check { field, user, text } => {
            let guard = Guard::new(config)?;
            let screening = guard.screen_input(&text, field, &context(user)).await;
            println!("{}", serde_json::to_string_pretty(&screening)?);
            if !screening.allowed() {
                std::process::exit(1);
            }
        }
        Command::Limits => {
            println!("{:<10} {:>6} {:>8} {:>8}", "severity", "max", "window", "block");
            for severity in Severity::ALL {
                let tier = config.rate_limit.tiers.get(severity);
                println!(
                    "{:<10} {:>6} {:>7}m {:>7}m",
                    severity, tier.max_violations, tier.window_minutes, tier.block_minutes
                );
            }
        }
        Command::Generate {
            duration,
            user,
            prompt,
        } => {
            if config.generation.api_key.is_none() {
                anyhow::bail!("set TALK_GUARD_API_KEY or generation.api_key to generate");
            }
            let guard = Arc::new(Guard::new(config)?);
            let maintenance = guard.spawn_maintenance(guard.maintenance_interval());
            let request = TalkRequest::new(vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ])
            .with_duration(duration);

            let result = guard.generate_with_policy(request, &context(user)).await;
            maintenance.abort();
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    info!(error = %e, "Generation refused");
                    eprintln!("{}", e.user_message());
                    std::process::exit(1);
                }
            };

            for warning in &outcome.warnings {
                eprintln!("warning: {}", warning);
            }
            if !outcome.accepted() {
                for error in &outcome.errors {
                    eprintln!("error: {}", error);
                }
                std::process::exit(1);
            }
            println!("{}", outcome.text);
        }
    }

    Ok(())
}
