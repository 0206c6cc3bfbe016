//! NoETL command line tool.
//!
//! Talks to a running control plane for catalog and execution operations,
//! manages the local server process, and can run a playbook as a local
//! worker without any server at all.

mod client;
mod diagram;
mod runner;
mod server;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use client::ServerClient;

#[derive(Parser)]
#[command(name = "noetl")]
#[command(version, about = "NoETL Command Line Tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// NoETL server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// NoETL server port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// NoETL server URL (overrides host and port)
    #[arg(long, global = true)]
    server_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the control plane server process
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Catalog operations: register, execute, list
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Execute a playbook registered in the catalog
    Execute {
        /// Catalog path of the playbook
        path: String,

        /// Catalog version (default: latest)
        #[arg(long)]
        version: Option<String>,

        /// Path to a JSON file with input parameters
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Inline JSON payload merged over the workload
        #[arg(long)]
        payload: Option<String>,
    },

    /// Register a playbook or secret file in the catalog
    Register {
        /// YAML file to register
        file: PathBuf,
    },

    /// Run a playbook locally without a server
    Worker {
        /// Playbook file path
        path: PathBuf,

        /// Catalog version label (informational for local runs)
        #[arg(long)]
        version: Option<String>,

        /// Answer HTTP requests from the deterministic mock transport
        #[arg(long)]
        mock: bool,

        /// Persist events to Postgres (`NOETL_PGDB`) instead of memory
        #[arg(long)]
        pgdb: bool,

        /// Verbose engine logging
        #[arg(long)]
        debug: bool,
    },

    /// Render a workflow diagram from a playbook
    Diagram {
        /// Playbook file
        file: PathBuf,

        /// Output format: plantuml, svg, or png
        #[arg(long, default_value = "plantuml")]
        format: String,

        /// Output file (default: stdout for plantuml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Secret operations
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Start the control plane server
    Start,
    /// Stop a running control plane server
    Stop,
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Register a resource file
    Register {
        /// YAML file to register
        file: PathBuf,

        /// Resource type when the document does not declare a kind
        #[arg(long, default_value = "Playbook")]
        resource_type: String,
    },

    /// Execute a playbook from the catalog
    Execute {
        /// Catalog path
        path: String,

        /// Catalog version (default: latest)
        #[arg(long)]
        version: Option<String>,

        /// Path to a JSON file with input parameters
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Inline JSON payload
        #[arg(long)]
        payload: Option<String>,

        /// Wait for the execution to finish
        #[arg(long)]
        sync: bool,

        /// Merge the payload into the workload instead of replacing it
        #[arg(long, default_value_t = true)]
        merge: bool,
    },

    /// List catalog entries
    List {
        /// Filter by resource type (Playbook, Secret, Credential)
        resource_type: Option<String>,
    },
}

#[derive(Subcommand)]
enum SecretAction {
    /// Register a credential on the server
    Register {
        /// Credential name
        name: String,

        /// Credential type (postgres, gcs, gcs_hmac, s3, snowflake, ...)
        #[arg(long = "type")]
        credential_type: String,

        /// Inline JSON data payload
        #[arg(long)]
        data: Option<String>,

        /// Read the JSON data payload from a file
        #[arg(long)]
        data_file: Option<PathBuf>,

        /// JSON metadata
        #[arg(long)]
        meta: Option<String>,

        /// JSON tag list
        #[arg(long)]
        tags: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = ServerClient::new(resolve_server_url(&cli));

    match cli.command {
        Commands::Server { action } => match action {
            ServerAction::Start => server::start(),
            ServerAction::Stop => server::stop(),
        },

        Commands::Catalog { action } => match action {
            CatalogAction::Register { file, resource_type } => {
                let content = std::fs::read_to_string(&file)?;
                let response = client
                    .register(&BASE64.encode(&content), &resource_type)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
                Ok(())
            }
            CatalogAction::Execute {
                path,
                version,
                input,
                payload,
                sync,
                merge,
            } => {
                let payload = read_payload(input, payload)?;
                let response = client
                    .execute(&path, version.as_deref(), payload, sync, merge)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
                Ok(())
            }
            CatalogAction::List { resource_type } => {
                let response = client.list(resource_type.as_deref()).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
                Ok(())
            }
        },

        Commands::Execute {
            path,
            version,
            input,
            payload,
        } => {
            let payload = read_payload(input, payload)?;
            let response = client
                .execute(&path, version.as_deref(), payload, true, true)
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        Commands::Register { file } => {
            let content = std::fs::read_to_string(&file)?;
            let response = client.register(&BASE64.encode(&content), "Playbook").await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        Commands::Worker {
            path,
            version,
            mock,
            pgdb,
            debug,
        } => runner::run_worker(path, version, mock, pgdb, debug).await,

        Commands::Diagram {
            file,
            format,
            output,
        } => diagram::render(file, &format, output).await,

        Commands::Secret { action } => match action {
            SecretAction::Register {
                name,
                credential_type,
                data,
                data_file,
                meta,
                tags,
                description,
            } => {
                let data = match (data, data_file) {
                    (Some(inline), _) => serde_json::from_str(&inline)?,
                    (None, Some(file)) => {
                        serde_json::from_str(&std::fs::read_to_string(&file)?)?
                    }
                    (None, None) => {
                        anyhow::bail!("secret register requires --data or --data-file")
                    }
                };
                let meta = meta.map(|m| serde_json::from_str(&m)).transpose()?;
                let tags = tags.map(|t| serde_json::from_str(&t)).transpose()?;

                let response = client
                    .register_secret(&name, &credential_type, data, meta, tags, description)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
                Ok(())
            }
        },
    }
}

/// Server URL from flags, then `NOETL_SERVER_URL`, then host/port parts.
fn resolve_server_url(cli: &Cli) -> String {
    if let Some(ref url) = cli.server_url {
        return url.trim_end_matches('/').to_string();
    }
    if let Ok(url) = std::env::var("NOETL_SERVER_URL") {
        if !url.is_empty() {
            return url.trim_end_matches('/').to_string();
        }
    }
    let host = cli
        .host
        .clone()
        .or_else(|| std::env::var("NOETL_HOST").ok())
        .unwrap_or_else(|| "localhost".to_string());
    let port = cli
        .port
        .or_else(|| std::env::var("NOETL_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8082);
    format!("http://{}:{}", host, port)
}

/// Combine `--input <file>` and `--payload <json>`; inline values win.
fn read_payload(
    input: Option<PathBuf>,
    payload: Option<String>,
) -> Result<Option<serde_json::Value>> {
    let mut merged = serde_json::Map::new();

    if let Some(file) = input {
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
        if let serde_json::Value::Object(map) = value {
            merged.extend(map);
        }
    }
    if let Some(inline) = payload {
        let value: serde_json::Value = serde_json::from_str(&inline)?;
        if let serde_json::Value::Object(map) = value {
            merged.extend(map);
        }
    }

    if merged.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::Value::Object(merged)))
    }
}
