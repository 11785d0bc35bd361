use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;

use media_compressor::api::{ErrorBody, JobView, SubmitResponse, USER_EMAIL_HEADER};
use media_compressor::config::NodeConfig;
use media_compressor::node::Node;
use media_compressor::remote::FILE_NAME_HEADER;
use media_compressor::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "media-compressor")]
#[command(version)]
#[command(about = "A distributed video compression queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a compressor node
    Server(ServerArgs),

    /// Upload a video for compression
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// Owner email the job is filed under
        #[arg(long, short = 'e')]
        email: String,

        /// The video file to upload
        file: PathBuf,
    },

    /// List an owner's unfinished jobs
    Status {
        #[command(flatten)]
        client: ClientArgs,

        /// Owner email to list jobs for
        #[arg(long, short = 'e')]
        email: String,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the configuration file
    #[arg(long)]
    port: Option<u16>,

    /// Public base URL of this node, overriding the configuration file
    #[arg(long)]
    host_url: Option<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Node address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct StatusOutput {
    email: String,
    jobs: Vec<JobView>,
}

fn endpoint(addr: &str, path: &str) -> String {
    format!("{}{}", addr.trim_end_matches('/'), path)
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => format!("{} ({}): {}", status, body.code, body.message),
        Err(_) => status.to_string(),
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.listen_addr.set_port(port);
    }
    if let Some(host_url) = args.host_url {
        config.server.host_url = host_url;
    }
    if config.cluster.master_key.is_none() && !config.cluster.workers.is_empty() {
        tracing::warn!("Workers are configured but no master key is set, all jobs run locally");
    }

    tracing::info!(
        listen_addr = %config.server.listen_addr,
        queue_dir = %config.paths.queue_dir.display(),
        results_dir = %config.paths.results_dir.display(),
        max_queue_size = config.queue.max_queue_size,
        workers = ?config.cluster.workers.iter().map(|w| w.host.as_str()).collect::<Vec<_>>(),
        "Starting media-compressor node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config)?;
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_submit(
    client: &ClientArgs,
    email: String,
    file: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or("file path has no usable file name")?
        .to_string();
    let upload = tokio::fs::File::open(&file).await?;
    let size = upload.metadata().await?.len();

    let response = reqwest::Client::new()
        .post(endpoint(&client.addr, "/jobs"))
        .header(USER_EMAIL_HEADER, &email)
        .header(FILE_NAME_HEADER, &name)
        .header(reqwest::header::CONTENT_LENGTH, size)
        .body(reqwest::Body::wrap_stream(ReaderStream::new(upload)))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(format!("Upload rejected: {}", error_message(response).await).into());
    }

    let submitted: SubmitResponse = response.json().await?;
    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&submitted)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID:    {}", submitted.id);
            println!("Placement: {}", submitted.placement);
        }
    }
    Ok(())
}

async fn handle_status(client: &ClientArgs, email: String) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .get(endpoint(&client.addr, "/jobs/status"))
        .query(&[("user", email.as_str())])
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(format!("Status query failed: {}", error_message(response).await).into());
    }

    let jobs: Vec<JobView> = response.json().await?;
    match client.output {
        OutputFormat::Json => {
            let output = StatusOutput { email, jobs };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No unfinished jobs for {}", email);
                return Ok(());
            }
            println!(
                "{:<36}  {:<16}  {:>8}  {:>8}  NAME",
                "JOB ID", "STATUS", "PROGRESS", "SPEED"
            );
            for job in jobs {
                println!(
                    "{:<36}  {:<16}  {:>7}%  {:>7.2}x  {}",
                    job.id, job.status, job.progress, job.speed, job.name
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Submit {
            client,
            email,
            file,
        } => handle_submit(&client, email, file).await,
        Commands::Status { client, email } => handle_status(&client, email).await,
    }
}
