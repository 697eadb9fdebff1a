use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use mrlite::worker::{MapFn, ReduceFn, Worker};
use mrlite_app::{indexer, wc};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum App {
    Wc,
    Indexer,
}

impl App {
    fn functions(self) -> (MapFn, ReduceFn) {
        match self {
            App::Wc => (wc::map, wc::reduce),
            App::Indexer => (indexer::map, indexer::reduce),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "worker", version, about = "mrlite task worker")]
struct Opt {
    /// Coordinator address
    #[arg(short, long, default_value = "localhost:50051")]
    server: String,

    /// Directory intermediate and output files are written to
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Application to run
    #[arg(short, long, value_enum, default_value = "wc")]
    app: App,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    let (map_fn, reduce_fn) = opt.app.functions();

    let worker = Worker::connect(opt.server.as_str(), opt.dir, map_fn, reduce_fn).await?;
    worker.run().await
}
