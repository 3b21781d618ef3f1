use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use taskvisor::api::{self, ApiState, ErrorResponse, JobListResponse, SubmitJobResponse};
use taskvisor::config::{Platform, SchedulerConfig, ShellConfig, SupervisorConfig};
use taskvisor::scheduler::{Job, JobStore, LocalJobStore};
use taskvisor::shutdown::install_shutdown_handler;
use taskvisor::worker::LogWindow;
use taskvisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "taskvisor")]
#[command(version)]
#[command(about = "Background job scheduler that runs and supervises script processes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the supervisor (scheduler loop + HTTP API)
    Serve(ServeArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port for the HTTP API
    #[arg(long, env = "TASKVISOR_PORT", default_value = "4000")]
    port: u16,

    /// Address to bind the HTTP API to
    #[arg(long, env = "TASKVISOR_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Maximum number of jobs running at once
    #[arg(long, env = "TASKVISOR_MAX_PARALLEL", default_value = "4")]
    max_parallel: usize,

    /// Scheduler tick period in milliseconds
    #[arg(long, env = "TASKVISOR_INTERVAL_MS", default_value = "1000")]
    interval_ms: u64,

    /// Directory for job log files (created if missing)
    #[arg(long, env = "TASKVISOR_LOG_DIR", default_value = ".scheduler")]
    log_dir: PathBuf,

    /// JSON file the job table is persisted to. Jobs are kept in memory only when unset.
    #[arg(long, env = "TASKVISOR_STORE")]
    store: Option<PathBuf>,

    /// Directory submitted script names are resolved against
    #[arg(long, env = "TASKVISOR_MODULES_DIR")]
    modules_dir: Option<PathBuf>,

    /// Shell used to launch jobs (defaults to bash, or powershell.exe on Windows)
    #[arg(long, env = "TASKVISOR_COMMAND")]
    command: Option<String>,

    /// Command run before every script, e.g. a virtualenv activation
    #[arg(long, env = "TASKVISOR_SOURCE_CMD")]
    source_cmd: Option<String>,

    /// Program scripts are passed to (defaults to "python3 -u"; empty runs scripts directly)
    #[arg(long, env = "TASKVISOR_INTERPRETER")]
    interpreter: Option<String>,

    /// Buffered events per live subscriber
    #[arg(long, env = "TASKVISOR_EVENT_CAPACITY", default_value = "1024")]
    event_capacity: usize,
}

impl ServeArgs {
    fn into_config(self) -> Result<SupervisorConfig, Box<dyn std::error::Error>> {
        let listen_addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;

        let mut shell = ShellConfig::for_platform(Platform::current());
        if let Some(command) = self.command {
            shell.command = command;
        }
        shell.source_cmd = self.source_cmd.filter(|s| !s.trim().is_empty());
        if let Some(interpreter) = self.interpreter {
            shell.interpreter = Some(interpreter).filter(|i| !i.trim().is_empty());
        }

        let config = SupervisorConfig {
            listen_addr,
            store_path: self.store,
            modules_dir: self.modules_dir,
            event_capacity: self.event_capacity,
            scheduler: SchedulerConfig {
                max_parallel: self.max_parallel,
                interval: Duration::from_millis(self.interval_ms),
                log_directory: self.log_dir,
            },
            shell,
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', env = "TASKVISOR_ADDR", default_value = "http://127.0.0.1:4000")]
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

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Schedule a script
    Submit {
        /// Script name, relative to the server's modules directory
        script_name: String,

        /// Script arguments as a JSON object
        #[arg(long)]
        args: Option<String>,

        /// Owner of the job
        #[arg(long, default_value = "0")]
        user_id: u64,
    },
    /// Show one job
    Status { job_id: u64 },
    /// List jobs, newest first
    List {
        /// Only jobs whose script path ends with this name
        #[arg(long)]
        script_name: Option<String>,

        /// Only jobs owned by this user
        #[arg(long)]
        user_id: Option<u64>,

        #[arg(long, default_value = "0")]
        skip: usize,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Send SIGINT to a running job
    Stop { job_id: u64 },
    /// Send SIGKILL to a running job
    Kill { job_id: u64 },
    /// Schedule a finished job again
    Restart { job_id: u64 },
    /// Delete a job that is not running, including its logs
    Delete { job_id: u64 },
    /// Print the end of a job's log
    Log {
        job_id: u64,

        /// Bytes to read from the end of the log
        #[arg(long, default_value = "16384")]
        max_size: u64,

        /// Print raw log lines instead of decoded output
        #[arg(long)]
        raw: bool,
    },
}

#[derive(Serialize)]
struct JobActionOutput {
    job_id: u64,
    action: &'static str,
    success: bool,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        max_parallel = config.scheduler.max_parallel,
        interval_ms = config.scheduler.interval.as_millis() as u64,
        log_directory = %config.scheduler.log_directory.display(),
        store = ?config.store_path,
        shell = %config.shell.command,
        "Starting taskvisor"
    );

    let store: Arc<dyn JobStore> = match &config.store_path {
        Some(path) => Arc::new(LocalJobStore::open(path).await?),
        None => {
            tracing::warn!("No --store configured, jobs will not survive a restart");
            Arc::new(LocalJobStore::in_memory())
        }
    };

    let shutdown = install_shutdown_handler();
    let listen_addr = config.listen_addr;
    let supervisor = Supervisor::new(config, store);
    let scheduler = supervisor.start(shutdown.clone()).await?;

    let state = ApiState {
        supervisor,
        shutdown: shutdown.clone(),
    };
    let served = api::run_api(listen_addr, state).await;

    // The API may also stop on its own (bind failure); take the scheduler down with it.
    shutdown.cancel();
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "Scheduler task panicked");
    }
    served?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        Self {
            base: addr.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Print the server's error message and exit for non-success responses.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    eprintln!("Error: {} ({})", message, status);
    std::process::exit(1);
}

async fn handle_job_submit(
    client: &ApiClient,
    script_name: String,
    args: Option<String>,
    user_id: u64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let script_args: Option<Value> = match args {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    let response = client
        .http
        .post(client.url("/api/jobs"))
        .json(&serde_json::json!({
            "script_name": script_name,
            "script_args": script_args,
            "user_id": user_id,
        }))
        .send()
        .await?;
    let created: SubmitJobResponse = check(response).await?.json().await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&created)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", created.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &ApiClient,
    job_id: u64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .http
        .get(client.url(&format!("/api/jobs/{}", job_id)))
        .send()
        .await?;
    let job: Job = check(response).await?.json().await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job ID:     {}", job.id);
            println!("Status:     {}", job.status);
            println!("Script:     {}", job.script_path);
            println!("Payload:    {}", job.script_payload);
            println!("Owner:      {}", job.created_by_user_id);
            println!("Created:    {}", job.creation_date);
            if let Some(pid) = job.pid {
                println!("PID:        {}", pid);
            }
            if let Some(exit_code) = job.exit_code {
                println!("Exit Code:  {}", exit_code);
            }
            if let Some(log_path) = &job.log_path {
                println!("Log:        {}", log_path);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &ApiClient,
    script_name: Option<String>,
    user_id: Option<u64>,
    skip: usize,
    limit: usize,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut query: Vec<(&str, String)> =
        vec![("skip", skip.to_string()), ("limit", limit.to_string())];
    if let Some(name) = script_name {
        query.push(("script_name", name));
    }
    if let Some(user_id) = user_id {
        query.push(("user_id", user_id.to_string()));
    }

    let response = client
        .http
        .get(client.url("/api/jobs"))
        .query(&query)
        .send()
        .await?;
    let list: JobListResponse = check(response).await?.json().await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&list)?),
        OutputFormat::Table => {
            if list.items.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<8} {:<10} {:<8} {:<8} SCRIPT", "JOB ID", "STATUS", "PID", "OWNER");
            println!("{}", "-".repeat(60));
            for job in &list.items {
                let pid = job
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<8} {:<10} {:<8} {:<8} {}",
                    job.id,
                    job.status,
                    pid,
                    job.created_by_user_id,
                    job.script_name()
                );
            }
            println!();
            println!("Showing {} of {} jobs", list.items.len(), list.count);
        }
    }
    Ok(())
}

async fn handle_job_action(
    client: &ApiClient,
    job_id: u64,
    action: &'static str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = client.url(&format!("/api/jobs/{}", job_id));
    let request = match action {
        "delete" => client.http.delete(url),
        _ => client.http.post(format!("{}/{}", url, action)),
    };
    let response = request.send().await?;
    let success = response.status().is_success();
    if !success && response.status() != reqwest::StatusCode::BAD_REQUEST {
        check(response).await?;
    }

    match output_format {
        OutputFormat::Json => {
            let output = JobActionOutput {
                job_id,
                action,
                success,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if success {
                println!("Job {}: {} ok", job_id, action);
            } else {
                println!("Job {}: {} rejected (job is not running)", job_id, action);
            }
        }
    }
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_job_log(
    client: &ApiClient,
    job_id: u64,
    max_size: u64,
    raw: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .http
        .get(client.url(&format!("/api/jobs/{}/log", job_id)))
        .query(&[("max_size", max_size)])
        .send()
        .await?;
    let window: LogWindow = check(response).await?.json().await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&window)?),
        OutputFormat::Table if raw => print!("{}", window.content),
        OutputFormat::Table => {
            use taskvisor::worker::log_line::{self, OutputStream};
            let mut content = window.content.as_bytes();
            if window.size > max_size {
                content = log_line::skip_partial_line(content);
            }
            for line in log_line::decode_all(content) {
                let text = String::from_utf8_lossy(&line.data);
                match line.stream {
                    OutputStream::Stdout => print!("{}", text),
                    OutputStream::Stderr => eprint!("{}", text),
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr);
            let output = &client.output;

            match command {
                JobCommands::Submit {
                    script_name,
                    args,
                    user_id,
                } => {
                    handle_job_submit(&api, script_name, args, user_id, output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&api, job_id, output).await?;
                }
                JobCommands::List {
                    script_name,
                    user_id,
                    skip,
                    limit,
                } => {
                    handle_job_list(&api, script_name, user_id, skip, limit, output).await?;
                }
                JobCommands::Stop { job_id } => {
                    handle_job_action(&api, job_id, "stop", output).await?;
                }
                JobCommands::Kill { job_id } => {
                    handle_job_action(&api, job_id, "kill", output).await?;
                }
                JobCommands::Restart { job_id } => {
                    handle_job_action(&api, job_id, "restart", output).await?;
                }
                JobCommands::Delete { job_id } => {
                    handle_job_action(&api, job_id, "delete", output).await?;
                }
                JobCommands::Log {
                    job_id,
                    max_size,
                    raw,
                } => {
                    handle_job_log(&api, job_id, max_size, raw, output).await?;
                }
            }
        }
    }

    Ok(())
}
