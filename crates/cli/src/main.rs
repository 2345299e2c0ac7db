use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use recall_vector_store::{
    parse_dimension, DevicePreference, EmbeddingMode, Fields, StoreConfig, VectorStore,
};
use serde_json::Value;
use std::path::PathBuf;

mod doctor;

#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Store short texts and find the most similar ones", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Override embedding backend in this process
    #[arg(long, global = true, value_enum)]
    embed_mode: Option<EmbedMode>,

    /// Override embedding model id (overrides RECALL_EMBEDDING_MODEL)
    #[arg(long, global = true)]
    embed_model: Option<String>,

    /// Model directory (overrides RECALL_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Inference device
    #[arg(long, global = true, value_enum)]
    device: Option<DeviceArg>,

    /// CUDA device id
    #[arg(long, global = true)]
    cuda_device: Option<i32>,

    /// Vector dimension (must match the model)
    #[arg(long, global = true)]
    dimension: Option<String>,

    /// Index file path
    #[arg(long, global = true)]
    index_file: Option<PathBuf>,

    /// Metadata file path
    #[arg(long, global = true)]
    metadata_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a text and append it to the store
    Store(StoreArgs),

    /// Find the stored texts closest to a query
    Search(SearchArgs),

    /// Show store size, dimension, device and file paths
    Stats(StatsArgs),

    /// Diagnose GPU/runtime + model installation
    Doctor(DoctorArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// Text to store
    text: String,

    /// Extra metadata as key=value (value parsed as JSON when possible)
    #[arg(long = "field", value_name = "KEY=VALUE")]
    fields: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SearchArgs {
    /// Query text
    query: String,

    /// Number of results
    #[arg(short = 'n', long, default_value_t = 5, allow_negative_numbers = true)]
    top_k: i64,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct StatsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct DoctorArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, ValueEnum)]
enum EmbedMode {
    Fast,
    Stub,
}

impl From<EmbedMode> for EmbeddingMode {
    fn from(mode: EmbedMode) -> Self {
        match mode {
            EmbedMode::Fast => Self::Fast,
            EmbedMode::Stub => Self::Stub,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum DeviceArg {
    Auto,
    Cpu,
    Cuda,
}

impl From<DeviceArg> for DevicePreference {
    fn from(device: DeviceArg) -> Self {
        match device {
            DeviceArg::Auto => Self::Auto,
            DeviceArg::Cpu => Self::Cpu,
            DeviceArg::Cuda => Self::Cuda,
        }
    }
}

impl Commands {
    const fn json(&self) -> bool {
        match self {
            Self::Store(args) => args.json,
            Self::Search(args) => args.json,
            Self::Stats(args) => args.json,
            Self::Doctor(args) => args.json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut cli = Cli::parse();

    // Keep stdout clean for JSON parsing
    if cli.command.json() {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if !cli.verbose {
        builder.filter_module("ort", log::LevelFilter::Off);
    }
    builder.target(env_logger::Target::Stderr).init();

    let config = build_config(&cli)?;

    match cli.command {
        Commands::Store(args) => run_store(args, config).await?,
        Commands::Search(args) => run_search(args, config).await?,
        Commands::Stats(args) => run_stats(args, config).await?,
        Commands::Doctor(args) => run_doctor(args, &config)?,
    }

    Ok(())
}

/// Environment (and `.env`) first, then command-line overrides.
fn build_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = StoreConfig::from_env().context("Invalid store configuration")?;
    if let Some(mode) = cli.embed_mode {
        config.embedding_mode = mode.into();
    }
    if let Some(model) = &cli.embed_model {
        config.model_id.clone_from(model);
    }
    if let Some(dir) = &cli.model_dir {
        config.model_dir = Some(dir.clone());
    }
    if let Some(device) = cli.device {
        config.device = device.into();
    }
    if let Some(id) = cli.cuda_device {
        config.cuda_device_id = id;
    }
    if let Some(raw) = &cli.dimension {
        config.dimension = parse_dimension(raw).context("Invalid --dimension")?;
    }
    if let Some(path) = &cli.index_file {
        config.index_path.clone_from(path);
    }
    if let Some(path) = &cli.metadata_file {
        config.metadata_path.clone_from(path);
    }
    Ok(config)
}

async fn open_store(config: StoreConfig) -> Result<VectorStore> {
    VectorStore::open(config)
        .await
        .context("Failed to open vector store")
}

async fn run_store(args: StoreArgs, config: StoreConfig) -> Result<()> {
    let fields = parse_fields(&args.fields)?;
    let store = open_store(config).await?;
    let id = store
        .store_with_fields(&args.text, fields)
        .await
        .context("Failed to store text")?;

    if args.json {
        println!("{}", serde_json::json!({ "id": id }));
    } else {
        println!("{id}");
    }
    Ok(())
}

async fn run_search(args: SearchArgs, config: StoreConfig) -> Result<()> {
    let top_k = usize::try_from(args.top_k).unwrap_or(0);
    let store = open_store(config).await?;
    let hits = store
        .search_with_scores(&args.query, top_k)
        .await
        .context("Search failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        eprintln!("No results");
    } else {
        for hit in &hits {
            println!("{}\t{:.4}", hit.id, hit.distance);
        }
    }
    Ok(())
}

async fn run_stats(args: StatsArgs, config: StoreConfig) -> Result<()> {
    let store = open_store(config).await?;
    let stats = store.stats().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Vectors: {}", stats.vectors);
        println!("Metadata entries: {}", stats.metadata_entries);
        println!("Dimension: {}", stats.dimension);
        println!("Model: {}", stats.model_id);
        let backend = if stats.accelerated { "GPU" } else { "CPU" };
        println!("Device: {} ({backend})", stats.device);
        println!("Index file: {}", stats.index_path.display());
        println!("Metadata file: {}", stats.metadata_path.display());
    }
    Ok(())
}

fn run_doctor(args: DoctorArgs, config: &StoreConfig) -> Result<()> {
    let report = doctor::doctor(config);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        doctor::print_report(&report);
    }

    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Parses repeated `key=value` flags. Values that are valid JSON keep their type.
fn parse_fields(raw: &[String]) -> Result<Fields> {
    let mut fields = Fields::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("Invalid --field '{item}' (expected KEY=VALUE)"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid --field '{item}': empty key");
        }
        let value =
            serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_keep_json_types_and_fall_back_to_strings() {
        let fields = parse_fields(&[
            "page=12".to_string(),
            "source=handbook.pdf".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(fields["page"], json!(12));
        assert_eq!(fields["source"], json!("handbook.pdf"));
        assert_eq!(fields["tags"], json!(["a", "b"]));
        assert_eq!(fields["note"], json!("a=b"));
    }

    #[test]
    fn malformed_fields_are_rejected() {
        assert!(parse_fields(&["no-separator".to_string()]).is_err());
        assert!(parse_fields(&["=value".to_string()]).is_err());
    }
}
