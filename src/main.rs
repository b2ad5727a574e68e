//! Main module for the ragweed CLI application (rgw).
//!
//! Parses command-line arguments, loads configuration, performs the
//! caller-side upload validation (size cap, mime whitelist,
//! declared-vs-detected mismatch), and invokes the matching operation on the
//! service core.
//!
//! # Examples
//!
//! ```sh
//! rgw init
//! rgw ingest notes.txt
//! rgw ask "what color is the sky"
//! rgw ask -c 1 -u alice "and at sunset?"
//! ```

mod commands;

use clap::Parser;
use once_cell::sync::OnceCell;
use std::{env, error::Error, fs, path::Path};
use tracing::debug;
use uuid::Uuid;

use ragweed::config::{self, RagweedConfig};
use ragweed::error::RagweedError;
use ragweed::service::RagweedService;

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt::init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = commands::Cli::parse();

    if let commands::Commands::Init = cli.command {
        return init();
    }

    let config_path = match env::var("RAGWEED_CONFIG") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => ragweed::config_dir()?.join("config.yaml"),
    };
    debug!("loading config from: {}", config_path.display());
    let config_path_str = config_path
        .to_str()
        .ok_or("config path is not valid UTF-8")?;
    let config = config::load_config(config_path_str)?;
    let service = RagweedService::new(config.clone())?;

    match cli.command {
        commands::Commands::Init => unreachable!("handled above"),
        commands::Commands::Ingest {
            file,
            mime_type,
            resource_id,
        } => {
            let bytes = fs::read(&file)?;
            let mime_type = resolve_mime_type(&file, mime_type.as_deref(), &config, &bytes)?;
            let resource_id = resource_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let count = service.ingest(&resource_id, &bytes, &mime_type).await?;
            println!("{resource_id}: {count} chunks");
        }
        commands::Commands::Ask {
            question,
            conversation,
            user,
        } => {
            let answer = service
                .answer(&question, conversation, user.as_deref())
                .await?;
            println!("{answer}");
        }
        commands::Commands::NewConversation { user, title } => {
            let (conversation, welcome) = service
                .create_conversation(&user, title.as_deref())
                .await?;
            match conversation.id {
                Some(id) => println!("conversation {id}"),
                None => println!("conversation created"),
            }
            if let Some(welcome) = welcome {
                println!("{}", welcome.content);
            }
        }
        commands::Commands::Resources => {
            for resource in service.list_resources()? {
                println!(
                    "{}\t{}\t{} bytes\t{}",
                    resource.id, resource.mime_type, resource.file_size, resource.uploaded_at
                );
            }
        }
        commands::Commands::DeleteResource { id } => {
            service.delete_resource(&id)?;
            println!("deleted {id}");
        }
        commands::Commands::Attributes { user } => {
            let attributes = service.get_user_attributes(&user)?;
            for (name, value) in attributes {
                println!("{name}: {value}");
            }
        }
        commands::Commands::SetAttributes { user, names } => {
            let names: Vec<String> = names
                .split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect();
            service.set_required_attributes(&user, &names)?;
            println!("tracking {} attributes for {user}", names.len());
        }
        commands::Commands::Extract { user } => {
            let attributes = service.extraction_run(&user).await?;
            for (name, value) in attributes {
                println!("{name}: {value}");
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

/// Caller-side upload validation: size cap, extension-based detection, and
/// declared-vs-detected mismatch. The core re-checks only that a parser
/// exists for the final mime type.
fn resolve_mime_type(
    file: &Path,
    declared: Option<&str>,
    config: &RagweedConfig,
    bytes: &[u8],
) -> Result<String, RagweedError> {
    if bytes.len() > config.max_file_size_bytes {
        return Err(RagweedError::Validation(format!(
            "file size exceeds maximum limit of {} bytes",
            config.max_file_size_bytes
        )));
    }

    let detected = file
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .and_then(|e| match e.as_str() {
            "csv" => Some("text/csv"),
            "pdf" => Some("application/pdf"),
            "json" => Some("application/json"),
            "txt" | "md" | "text" => Some("text/plain"),
            _ => None,
        });

    let mime_type = match (declared, detected) {
        (Some(declared), Some(detected)) if declared != detected => {
            return Err(RagweedError::Validation(format!(
                "provided mime type ({declared}) doesn't match detected type ({detected})"
            )));
        }
        (Some(declared), _) => declared.to_string(),
        (None, Some(detected)) => detected.to_string(),
        (None, None) => {
            return Err(RagweedError::Validation(
                "cannot detect mime type; pass --mime-type".into(),
            ));
        }
    };

    if !config::is_supported_mime_type(&mime_type) {
        return Err(RagweedError::Validation(format!(
            "unsupported file type: {mime_type}. Allowed types: {}",
            config::SUPPORTED_MIME_TYPES.join(", ")
        )));
    }
    Ok(mime_type)
}

/// Initializes the application's configuration.
///
/// Creates the config directory and writes a starter `config.yaml` pointing
/// at a local OpenAI-compatible endpoint.
fn init() -> Result<(), Box<dyn Error>> {
    let config_dir = ragweed::config_dir()?;
    fs::create_dir_all(&config_dir)?;

    let config_path = config_dir.join("config.yaml");
    let config = RagweedConfig {
        api_base: "http://localhost:11434/v1".to_string(),
        api_key: "CHANGEME".to_string(),
        chat_model: "llama3.1".to_string(),
        embedding_model: "nomic-embed-text".to_string(),
        embedding_dimensions: 768,
        distance_metric: ragweed::config::DistanceMetric::Cosine,
        chunk_size: 1000,
        chunk_overlap: 200,
        retrieval_k: 5,
        gateway_timeout_secs: 60,
        history_max_tokens: 2048,
        database_url: config_dir
            .join("ragweed.db")
            .to_string_lossy()
            .into_owned(),
        max_file_size_bytes: 10 * 1024 * 1024,
        session_cache_capacity: 256,
        extraction_queue_depth: 64,
        extraction_max_attempts: 3,
        extraction_backoff_ms: 250,
    };
    let config_yaml = serde_yaml::to_string(&config)?;
    fs::write(&config_path, config_yaml)?;
    println!("wrote {}", config_path.display());

    Ok(())
}
