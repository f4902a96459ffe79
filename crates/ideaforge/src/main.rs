//! ideaforge: developer CLI for the idea engine
//!
//! Runs one engine operation per invocation and prints the result as JSON.
//! The remote row store is used when `--store-url` is set, otherwise a local
//! JSON file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ideaforge_engine::{EntityRef, ResourceKind, VoteDirection};

mod app;
mod commands;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "ideaforge")]
#[command(about = "Share, vote on and fork ideas", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: app::Config,

    /// Print recent store failures to stderr after the command.
    #[arg(long, global = true, env = "IDEAFORGE_DIAGNOSTICS", value_parser = parse_bool_env, default_value = "false")]
    diagnostics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, list and inspect ideas
    Idea {
        #[command(subcommand)]
        command: IdeaCommand,
    },

    /// Toggle a vote on an idea
    Vote {
        idea_id: String,

        /// "up" or "down"
        direction: VoteDirection,
    },

    /// Fork an idea into a new one owned by you
    Fork {
        idea_id: String,

        /// Idempotency key. Reuse the key printed by a failed fork to retry it.
        #[arg(long)]
        key: Option<String>,
    },

    /// Comment on ideas and discussions
    Comment {
        #[command(subcommand)]
        command: CommentCommand,
    },

    /// Your notifications, newest first
    Notifications,

    /// Mark a notification read
    Read { notification_id: String },

    /// Your profile and influence balance
    Profile,

    /// Pledge a resource to an idea
    Pledge {
        idea_id: String,

        /// money, time, skill or other
        kind: ResourceKind,

        description: String,

        #[arg(long)]
        amount: Option<f64>,
    },

    /// List the resources pledged to an idea
    Pledges { idea_id: String },

    /// Apply for a role on an idea
    Apply {
        idea_id: String,

        role: String,

        #[arg(long, default_value = "")]
        message: String,
    },

    /// List the role applications on an idea
    Applications { idea_id: String },

    /// Accept or reject a role application on your idea
    Decide {
        application_id: String,

        /// Reject instead of accept
        #[arg(long)]
        reject: bool,
    },
}

#[derive(Subcommand)]
enum IdeaCommand {
    /// Post a new idea
    Create {
        title: String,

        #[arg(long, default_value = "")]
        body: String,
    },

    /// Newest ideas first
    List {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show an idea and your vote on it
    Show { idea_id: String },

    /// Record a view
    View { idea_id: String },

    /// Record a share
    Share { idea_id: String },
}

#[derive(Subcommand)]
enum CommentCommand {
    /// Comment on an idea or discussion (`idea:<id>`, `discussion:<id>` or a bare idea id)
    Add { target: EntityRef, text: String },

    /// Reply to a comment
    Reply { parent_comment_id: String, text: String },

    /// Toggle a vote on a comment
    Vote {
        comment_id: String,
        direction: VoteDirection,
    },

    /// Print the nested comment thread of an idea or discussion
    Thread { target: EntityRef },
}

fn default_data_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ideaforge")
        .join("data.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays parseable JSON.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ideaforge=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let app = app::App::connect(&cli.config).await?;

    let result = commands::run(&app, cli.command).await;

    if cli.diagnostics {
        app.report_diagnostics();
    }

    let output = result?;
    println!(
        "{}",
        serde_json::to_string_pretty(&output).map_err(|e| miette::miette!("{}", e))?
    );
    Ok(())
}
