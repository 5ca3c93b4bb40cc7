// src/main.rs — tiledagctl: the operator CLI for the tile-DAG runtime.

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tiledagrt::runtime::cholesky_demo;
use tiledagrt::runtime::kernels::DenseKernels;
use tiledagrt::runtime::kv::InMemoryKv;
use tiledagrt::runtime::object_store::InMemoryObjectStore;
use tiledagrt::runtime::queue::InMemoryQueue;
use tiledagrt::runtime::tile_store::InMemoryTileStore;
use tiledagrt::{Collaborators, Program, ProgramStatus, Worker, WorkerConfig};
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "/etc/tiledagrt/config.toml";

#[derive(Parser)]
#[command(
    name = "tiledagctl",
    version,
    about = "tiledagctl — operator interface for the tile-DAG execution runtime"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Path to the worker config TOML
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run one of the reference demo programs to completion.
    Run {
        #[command(subcommand)]
        demo: DemoAction,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct Cholesky2x2 {
    #[arg(long, default_value_t = 4.0)]
    a00: f64,
    #[arg(long, default_value_t = 2.0)]
    a10: f64,
    #[arg(long, default_value_t = 3.0)]
    a11: f64,
    /// Number of concurrent workers to run against the in-process queues
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

#[derive(Args)]
struct Cholesky1x1 {
    #[arg(long, default_value_t = 9.0)]
    a00: f64,
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

#[derive(Subcommand)]
enum DemoAction {
    /// 2x2-tile Cholesky factorization (scenario S1)
    Cholesky2x2(Cholesky2x2),
    /// 1x1-tile Cholesky factorization (scenario S2)
    Cholesky1x1(Cholesky1x1),
}

#[derive(Subcommand)]
enum ConfigAction {
    View,
    Init,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn load_config(path: &PathBuf) -> WorkerConfig {
    WorkerConfig::from_toml_file(path).unwrap_or_else(|_| {
        info!(?path, "no config file found, using defaults");
        WorkerConfig::default()
    })
}

fn new_collaborators(num_priorities: usize) -> Collaborators {
    Collaborators {
        kv: Arc::new(InMemoryKv::new()),
        queue: Arc::new(InMemoryQueue::new(num_priorities)),
        objects: Arc::new(InMemoryObjectStore::new()),
        tiles: Arc::new(InMemoryTileStore::new()),
        kernels: Arc::new(DenseKernels),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { demo } => match demo {
            DemoAction::Cholesky2x2(args) => run_cholesky_2x2(&cli.config, args, cli.json).await,
            DemoAction::Cholesky1x1(args) => run_cholesky_1x1(&cli.config, args, cli.json).await,
        },
        Commands::Config { action } => match action {
            ConfigAction::View => {
                let cfg = load_config(&cli.config);
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&cfg).unwrap());
                } else {
                    println!("{}", toml::to_string_pretty(&cfg).unwrap());
                }
            }
            ConfigAction::Init => {
                let cfg = WorkerConfig::default();
                if let Some(parent) = cli.config.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match std::fs::write(&cli.config, toml::to_string_pretty(&cfg).unwrap()) {
                    Ok(()) => println!("[config] wrote defaults to {:?}", cli.config),
                    Err(e) => eprintln!("[config] failed to write {:?}: {}", cli.config, e),
                }
            }
        },
    }
}

async fn run_cholesky_2x2(config_path: &PathBuf, args: Cholesky2x2, json: bool) {
    let config = load_config(config_path);
    let blocks = cholesky_demo::build_2x2();
    let program = Arc::new(Program::build(blocks, 2, 1.0, 1.0, true).expect("valid DAG"));
    let collaborators = new_collaborators(program.max_priority + 1);

    cholesky_demo::seed_2x2(&*collaborators.tiles, args.a00, args.a10, args.a11)
        .await
        .expect("seed input tiles");

    program.start(&collaborators).await.expect("start program");
    run_workers(program.clone(), collaborators.clone(), config, args.workers).await;

    let l00 = collaborators
        .tiles
        .get_tile(&cholesky_demo::tile(cholesky_demo::OUTPUT_MATRIX, 0, 0))
        .await
        .expect("L00 present");
    let l10 = collaborators
        .tiles
        .get_tile(&cholesky_demo::tile(cholesky_demo::OUTPUT_MATRIX, 1, 0))
        .await
        .expect("L10 present");
    let l11 = collaborators
        .tiles
        .get_tile(&cholesky_demo::tile(cholesky_demo::OUTPUT_MATRIX, 1, 1))
        .await
        .expect("L11 present");

    print_result(
        &program,
        &collaborators,
        json,
        json!({
            "l00": l00.get(0, 0),
            "l10": l10.get(0, 0),
            "l11": l11.get(0, 0),
        }),
    )
    .await;
}

async fn run_cholesky_1x1(config_path: &PathBuf, args: Cholesky1x1, json: bool) {
    let config = load_config(config_path);
    let blocks = cholesky_demo::build_1x1();
    let program = Arc::new(Program::build(blocks, 1, 1.0, 1.0, false).expect("valid DAG"));
    let collaborators = new_collaborators(program.max_priority + 1);

    cholesky_demo::seed_1x1(&*collaborators.tiles, args.a00)
        .await
        .expect("seed input tile");

    program.start(&collaborators).await.expect("start program");
    run_workers(program.clone(), collaborators.clone(), config, args.workers).await;

    let l00 = collaborators
        .tiles
        .get_tile(&cholesky_demo::tile(cholesky_demo::OUTPUT_MATRIX, 0, 0))
        .await
        .expect("L00 present");

    print_result(
        &program,
        &collaborators,
        json,
        json!({ "l00": l00.get(0, 0) }),
    )
    .await;
}

async fn run_workers(
    program: Arc<Program>,
    collaborators: Collaborators,
    mut config: WorkerConfig,
    worker_count: usize,
) {
    config.wall_timeout_secs = config.wall_timeout_secs.min(30);
    config.idle_timeout_secs = config.idle_timeout_secs.min(5);
    let mut handles = Vec::new();
    for _ in 0..worker_count.max(1) {
        let worker = Worker::new(program.clone(), collaborators.clone(), config.clone());
        handles.push(tokio::spawn(async move { worker.run().await }));
    }
    let wait = program.wait(&collaborators, Duration::from_millis(20));
    let _ = tokio::time::timeout(Duration::from_secs(30), wait).await;
    for h in handles {
        let _ = h.await;
    }
}

async fn print_result(
    program: &Program,
    collaborators: &Collaborators,
    json: bool,
    tiles: serde_json::Value,
) {
    let status = program.program_status(collaborators).await.unwrap_or(ProgramStatus::NotStarted);
    let flops = program.total_flops(collaborators).await.unwrap_or(0.0);
    let read = program.total_read(collaborators).await.unwrap_or(0);
    let write = program.total_write(collaborators).await.unwrap_or(0);

    if json {
        let out = json!({
            "status": format!("{:?}", status),
            "program_hash": program.program_hash,
            "flops": flops,
            "bytes_read": read,
            "bytes_written": write,
            "tiles": tiles,
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap());
    } else {
        println!("[tiledagctl] program {} finished: {:?}", program.program_hash, status);
        println!("[tiledagctl] flops={flops} read={read} write={write}");
        println!("[tiledagctl] tiles: {}", tiles);
    }
}
