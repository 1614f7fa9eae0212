use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use helm_runtime::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = helm_runtime::cli::dispatch(cli).await;
    std::process::exit(code);
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();
    let filter_layer = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::registry().with(filter_layer).with(fmt_layer).init();
}
