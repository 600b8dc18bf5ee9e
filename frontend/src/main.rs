//! Command-line front end for tinyenv stores.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tinyenv::config::{DEFAULT_KDF_ITERATIONS, DEFAULT_MODULUS_BITS};
use tinyenv::{TinyEnv, VaultConfig, kv};
use tracing::debug;
use zeroize::Zeroizing;

/// Encrypted `.env` files gated by a one-time token.
#[derive(Parser, Debug)]
#[command(name = "tinyenv", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Tuning {
    /// PBKDF2 iterations for key derivation.
    #[arg(long, global = true, default_value_t = DEFAULT_KDF_ITERATIONS)]
    kdf_iterations: u32,

    /// RSA modulus size for new key pairs.
    #[arg(long, global = true, default_value_t = DEFAULT_MODULUS_BITS)]
    modulus_bits: usize,

    /// Store file name inside the vault directory.
    #[arg(long, global = true, default_value = ".env")]
    env_file: String,
}

impl Tuning {
    fn config(&self) -> VaultConfig {
        VaultConfig::default()
            .with_kdf_iterations(self.kdf_iterations)
            .with_modulus_bits(self.modulus_bits)
            .with_env_file_name(self.env_file.clone())
    }
}

#[derive(Args, Debug)]
struct Access {
    /// Vault directory holding the store file.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Token printed by `tinyenv init`.
    #[arg(long, env = "TINYENV_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the key pair in a vault directory and print its access token.
    Init {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Encrypt one or more KEY=VALUE pairs into the store.
    Put {
        #[command(flatten)]
        access: Access,
        #[arg(required = true, value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Decrypt a single value and print it.
    Get {
        #[command(flatten)]
        access: Access,
        key: String,
    },
    /// List the record keys of a store file.
    Load { file: PathBuf },
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tinyenv={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = cli.tuning.config();
    config.validate().context("invalid settings")?;
    let env = TinyEnv::new(config);

    match cli.command {
        Commands::Init { dir } => {
            let token = Zeroizing::new(
                env.start(&dir)
                    .with_context(|| format!("initialising {}", dir.display()))?,
            );
            println!("{}", token.as_str());
        }
        Commands::Put { access, fields } => {
            let token = Zeroizing::new(access.token);
            env.store(&token, &access.dir, fields.iter().map(|(k, v)| (k, v)))
                .context("storing values")?;
            debug!(count = fields.len(), "Stored values");
            for (_, mut value) in fields {
                zeroize::Zeroize::zeroize(&mut value);
            }
        }
        Commands::Get { access, key } => {
            let token = Zeroizing::new(access.token);
            let Some(value) = env
                .get(&token, &access.dir, &key)
                .with_context(|| format!("reading {key}"))?
            else {
                bail!("{key} is not set");
            };
            println!("{}", value.as_str());
        }
        Commands::Load { file } => {
            let records =
                kv::load(&file).with_context(|| format!("loading {}", file.display()))?;
            for (key, _) in records.iter() {
                println!("{key}");
            }
        }
    }
    Ok(())
}
