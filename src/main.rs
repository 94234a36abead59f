use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use intentql::adapter::{AdapterFactory, QueryAdapter};
use intentql::db::{self, ConnectionConfig, DbContext};
use intentql::export;
use intentql::intent::AnalysisIntent;
use tracing_subscriber::EnvFilter;

/// Run an analysis intent against a saved PostgreSQL or MongoDB connection
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Saved connection to run against
    #[arg(long = "connect")]
    connect: String,

    /// Intent JSON file, or `-` to read stdin
    #[arg(long)]
    intent: String,

    /// Table or collection to use when the intent has no target
    #[arg(long)]
    target: Option<String>,

    /// Query timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Json)]
    format: Format,

    /// Print the translated query instead of running it
    #[arg(long)]
    explain: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
    Tsv,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let intent = read_intent(&cli.intent)?;
    let mut config = find_connection(&cli.connect)?;
    let adapter = AdapterFactory::global().get_adapter(config.database_type)?;

    if cli.explain {
        let mut context = DbContext::detached(config.database_type);
        context.target_hint = cli.target.clone();
        let artifact = adapter.translate(&intent, &context)?;
        println!("{}", serde_json::to_string_pretty(&artifact)?);
        return Ok(());
    }

    // Resolve password: environment variable, then interactive prompt
    if config.password.is_empty() {
        if let Ok(pw) = std::env::var(config.password_env_var()) {
            config.password = pw;
        } else if !config.username.is_empty() {
            let prompt = format!("Password for {}: ", config.display_string());
            config.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }

    let connection = db::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.display_string()))?;
    let mut context = DbContext::new(&connection).with_timeout(Duration::from_secs(cli.timeout));
    context.target_hint = cli.target.clone();

    let result = adapter.run(&intent, &context).await?;

    let output = match cli.format {
        Format::Json => export::to_json(&result),
        Format::Csv => export::to_csv(&result),
        Format::Tsv => export::to_tsv(&result),
    };
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
    if result.truncated {
        eprintln!("(truncated to {} rows)", result.row_count);
    }
    Ok(())
}

fn read_intent(source: &str) -> Result<AnalysisIntent> {
    let json = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read intent from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read intent file {}", source))?
    };
    Ok(AnalysisIntent::from_json(&json)?)
}

fn find_connection(name: &str) -> Result<ConnectionConfig> {
    let saved = db::load_saved_connections()?;
    if let Some(config) = saved.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
        return Ok(config.clone());
    }
    let known: Vec<&str> = saved.iter().map(|c| c.name.as_str()).collect();
    anyhow::bail!(
        "no saved connection named {:?} in {} (saved: {})",
        name,
        db::get_config_path().display(),
        if known.is_empty() {
            "none".to_string()
        } else {
            known.join(", ")
        }
    )
}
