use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "hbt")]
#[command(about = "Batch reconciliation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local ...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Reconcile a file of raw participant records offline and print the
    /// canonical batches with their timelines as JSON
    Reconcile {
        /// JSON file holding one record or an array of records
        #[arg(long)]
        input: String,

        /// Role for records that do not carry `sourceRole`
        #[arg(long)]
        role: Option<String>,

        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,

        /// Reference time for in-progress steps (RFC 3339). Defaults to now.
        #[arg(long)]
        now: Option<String>,

        /// Fail instead of warn when the config has keys this command ignores
        #[arg(long, default_value_t = false)]
        strict_config: bool,
    },

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of an audit JSONL file
    Verify {
        #[arg(long)]
        path: String,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = hbt_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Reconcile {
            input,
            role,
            config_paths,
            now,
            strict_config,
        } => {
            let out = commands::reconcile::run(commands::reconcile::ReconcileArgs {
                input,
                role,
                config_paths,
                now,
                strict_config,
            })?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { path } => commands::audit::verify(&path)?,
        },
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
