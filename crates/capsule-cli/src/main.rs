//! capsule: passphrase-keyed encrypted vault CLI
//!
//! Commands:
//!   passgen                  - print a fresh random passphrase
//!   vault add <files...>     - encrypt and import files into the vault
//!   vault list               - list stored items, oldest first
//!   vault extract <id> <out> - decrypt one item to a file
//!   vault export <out>       - write the vault export archive
//!   vault inspect <archive>  - show the items inside an export archive
//!   config show              - display the effective configuration
//!
//! The passphrase is read from CAPSULE_PASSPHRASE or prompted for.

use anyhow::{Context, Result};
use capsule_core::config::CapsuleConfig;
use capsule_core::{ItemId, OutgoingFile, ProgressFn};
use capsule_crypto::{generate_passphrase, SecretManager};
use capsule_vault::{build_operator, export_archive, read_archive, VaultItem, VaultStore};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "capsule",
    version,
    about = "Passphrase-keyed encrypted vault",
    long_about = "capsule: import files into a local encrypted vault, list, extract and export them"
)]
struct Cli {
    /// Path to capsule.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CAPSULE_CONFIG",
        default_value = "~/.config/capsule/capsule.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "CAPSULE_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides [log] format
    #[arg(long, env = "CAPSULE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a fresh random passphrase to share with the other side
    Passgen,

    /// Local encrypted vault
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum VaultAction {
    /// Encrypt and import files
    Add {
        /// Files to import
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// MIME type recorded for every imported file
        #[arg(long = "type", short = 't')]
        mime_type: Option<String>,
    },

    /// List stored items, oldest first
    List,

    /// Decrypt one item to a file
    Extract {
        /// Item id (itm_...)
        id: String,
        /// Output path
        out: PathBuf,
    },

    /// Write the export archive (chunks stay encrypted)
    Export {
        /// Output path
        out: PathBuf,
    },

    /// Show the items inside an export archive
    Inspect {
        /// Archive produced by `vault export`
        archive: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, from_file) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    if !from_file {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Passgen => cmd_passgen(),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, from_file),
        Commands::Vault { action } => match action {
            VaultAction::Add { files, mime_type } => {
                cmd_vault_add(&config, &files, mime_type.as_deref()).await
            }
            VaultAction::List => cmd_vault_list(&config).await,
            VaultAction::Extract { id, out } => cmd_vault_extract(&config, &id, &out).await,
            VaultAction::Export { out } => cmd_vault_export(&config, &out).await,
            VaultAction::Inspect { archive } => cmd_vault_inspect(&archive).await,
        },
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Returns the config and whether it came from a file.
async fn load_config(path: &Path) -> Result<(CapsuleConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((CapsuleConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so command output stays pipeable
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{home}/{rest}"))
    } else {
        path.to_path_buf()
    }
}

// ── Secrets and vault handles ─────────────────────────────────────────────────

/// Passphrase from CAPSULE_PASSPHRASE, else an interactive hidden prompt.
fn read_passphrase() -> Result<SecretString> {
    if let Ok(pass) = std::env::var("CAPSULE_PASSPHRASE") {
        return Ok(SecretString::from(pass));
    }
    let pass = rpassword::prompt_password("Passphrase: ").context("reading passphrase")?;
    Ok(SecretString::from(pass))
}

async fn unlocked_secrets(config: &CapsuleConfig) -> Result<SecretManager> {
    let secrets = SecretManager::from_config(&config.crypto)?;
    let passphrase = read_passphrase()?;
    if passphrase.expose_secret().is_empty() {
        anyhow::bail!("empty passphrase");
    }

    let spinner = make_spinner("key");
    spinner.set_message("deriving room key...");
    secrets
        .derive(&passphrase)
        .await
        .context("deriving room key")?;
    spinner.finish_and_clear();
    Ok(secrets)
}

fn open_vault(config: &CapsuleConfig, secrets: SecretManager) -> Result<VaultStore> {
    let mut vault_cfg = config.vault.clone();
    vault_cfg.root = expand_tilde(&vault_cfg.root);
    let op = build_operator(&vault_cfg)
        .with_context(|| format!("opening vault at {}", vault_cfg.root.display()))?;
    info!(backend = ?vault_cfg.backend, root = %vault_cfg.root.display(), "vault opened");
    Ok(VaultStore::new(op, secrets, vault_cfg.chunk_size))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(bar_style());
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `capsule passgen` ─────────────────────────────────────────────────────────

fn cmd_passgen() -> Result<()> {
    println!("{}", generate_passphrase().expose_secret());
    Ok(())
}

// ── `capsule vault add` ───────────────────────────────────────────────────────

async fn cmd_vault_add(config: &CapsuleConfig, files: &[PathBuf], mime_type: Option<&str>) -> Result<()> {
    let secrets = unlocked_secrets(config).await?;
    let store = open_vault(config, secrets)?;

    let mut stored = Vec::with_capacity(files.len());
    for path in files {
        let mut file = OutgoingFile::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        if let Some(mime) = mime_type {
            file = file.with_mime_type(mime);
        }

        let pb = make_progress_bar(file.size, "add");
        pb.set_message(file.name.clone());
        let pb_clone = pb.clone();
        let progress: ProgressFn = Box::new(move |done, total, _id| {
            pb_clone.set_length(total);
            pb_clone.set_position(done);
        });

        let item = store
            .add_one(file, Some(&progress))
            .await
            .with_context(|| format!("importing {}", path.display()))?;
        pb.finish_with_message(format!("{} ({})", item.name, item.id));
        stored.push(item);
    }

    println!();
    println!("Added {} file(s):", stored.len());
    print_items(&stored);
    Ok(())
}

// ── `capsule vault list` ──────────────────────────────────────────────────────

async fn cmd_vault_list(config: &CapsuleConfig) -> Result<()> {
    let store = open_vault(config, SecretManager::from_config(&config.crypto)?)?;
    let items = store.list().await.context("listing vault")?;
    if items.is_empty() {
        println!("vault is empty");
        return Ok(());
    }
    print_items(&items);
    Ok(())
}

fn print_items(items: &[VaultItem]) {
    println!("{:<18} {:>10}  {:<24}  NAME", "ID", "SIZE", "CREATED");
    for item in items {
        println!(
            "{:<18} {:>10}  {:<24}  {}",
            item.id.as_str(),
            fmt_bytes(item.size),
            item.created_at_string(),
            item.name
        );
    }
}

// ── `capsule vault extract` ───────────────────────────────────────────────────

async fn cmd_vault_extract(config: &CapsuleConfig, id: &str, out: &Path) -> Result<()> {
    let secrets = unlocked_secrets(config).await?;
    let store = open_vault(config, secrets)?;
    let id = ItemId::new(id);

    let data = store
        .read_item(&id)
        .await
        .with_context(|| format!("decrypting {id}"))?;
    tokio::fs::write(out, &data)
        .await
        .with_context(|| format!("writing {}", out.display()))?;

    println!("{id} → {} ({})", out.display(), fmt_bytes(data.len() as u64));
    Ok(())
}

// ── `capsule vault export` ────────────────────────────────────────────────────

async fn cmd_vault_export(config: &CapsuleConfig, out: &Path) -> Result<()> {
    let store = open_vault(config, SecretManager::from_config(&config.crypto)?)?;
    let mut file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;

    let spinner = make_spinner("export");
    spinner.set_message(out.display().to_string());
    let summary = export_archive(&store, &mut file)
        .await
        .context("exporting vault")?;
    spinner.finish_with_message("done".to_string());

    println!("Export complete:");
    println!("  items:  {}", summary.items);
    println!("  chunks: {}", summary.chunks);
    println!("  bytes:  {}", fmt_bytes(summary.bytes));
    println!("  file:   {}", out.display());
    Ok(())
}

// ── `capsule vault inspect` ───────────────────────────────────────────────────

async fn cmd_vault_inspect(path: &Path) -> Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let archive = read_archive(bytes::Bytes::from(data))
        .with_context(|| format!("parsing archive {}", path.display()))?;

    println!("# Archive version {} ({} items)", archive.version, archive.items.len());
    let items: Vec<VaultItem> = archive.items.into_iter().map(|a| a.item).collect();
    print_items(&items);
    Ok(())
}

// ── `capsule config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &CapsuleConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
