use clap::Parser;
use docker_connector::server::runner::{self, Args};
use docker_connector::utils;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = utils::init_tracing(&args.log_level, &args.log_file) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = runner::run(args).await {
        tracing::error!("connector error: {}", e);
        std::process::exit(1);
    }
}
