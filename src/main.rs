use clap::Parser;
use swarmlink::app::{App, Cli};
use swarmlink::services::logger;

#[tokio::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();
    let outcome = match App::from_cli(&cli) {
        Ok(app) => app.run(cli.command).await,
        Err(err) => Err(err),
    };
    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::debug!(kind = %err.kind(), "command failed");
            eprintln!("swarmlink: {}", err);
            std::process::exit(1);
        }
    }
}
