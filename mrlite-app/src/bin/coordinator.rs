use std::time::Duration;

use clap::Parser;

use mrlite::coordinator::{serve, Coordinator};

#[derive(Parser, Debug)]
#[command(name = "coordinator", version, about = "mrlite job coordinator")]
struct Opt {
    /// Port to listen on for worker RPCs (0 picks a free one)
    #[arg(short, long, default_value_t = 50051)]
    port: u16,

    /// Seconds a dispatched task may run before it is handed to another worker
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,

    /// Number of reduce partitions
    #[arg(short, long, default_value_t = 10)]
    n_reduce: usize,

    /// Input files, one map task each
    #[arg(value_name = "FILE", required = true)]
    files: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    let coordinator = Coordinator::new(opt.files, opt.n_reduce, Duration::from_secs(opt.timeout));

    let addr = serve(coordinator.clone(), opt.port).await?;
    log::info!("coordinator listening on {addr}");

    while !coordinator.done().await {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    log::info!("job complete, shutting down");
    // Give idle workers a moment to collect their exit notices before the
    // listener goes away with the process.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
