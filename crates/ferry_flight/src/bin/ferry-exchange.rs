use clap::Parser;
use ferry_core::config::BackendConfig;
use ferry_core::DataFusionBackend;
use ferry_flight::{BasicAuth, FlightExchangeServer, FlightUrl, ServerConfig};
use tracing::info;

#[derive(Parser)]
#[clap(name = "ferry-exchange")]
#[clap(version)]
#[clap(about = "Serve record batch exchanges over Arrow Flight", long_about = None)]
struct Cli {
    /// Host to bind to.
    #[clap(long, default_value_t = String::from(ferry_flight::config::DEFAULT_HOST))]
    host: String,

    /// Port to bind to.
    #[clap(long, default_value_t = ferry_flight::config::DEFAULT_PORT)]
    port: u16,

    /// User required in the authorization header.
    ///
    /// Only has an effect if a password is also provided.
    #[clap(short, long, env = "FERRY_EXCHANGE_USER", requires = "password")]
    user: Option<String>,

    /// Password required in the authorization header.
    #[clap(short, long, env = "FERRY_EXCHANGE_PASSWORD")]
    password: Option<String>,

    /// Log format, `human` or `json`.
    #[clap(long, default_value = "human")]
    log_format: logutil::LogFormat,

    /// Log level.
    #[clap(long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Batch size used by the execution context.
    #[clap(long, default_value_t = ferry_core::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logutil::configure_stderr_logger(cli.log_level, cli.log_format);

    if let Err(e) = run(cli).await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ferry_flight::Result<()> {
    let auth = match (cli.user, cli.password) {
        (Some(user), Some(password)) => Some(BasicAuth::new(user, password)),
        (None, Some(password)) => Some(BasicAuth::new("ferry", password)),
        _ => None,
    };
    let config = ServerConfig {
        auth,
        ..ServerConfig::new(FlightUrl::new(cli.host, cli.port))
    };

    let backend = DataFusionBackend::with_config(
        "ferry-exchange",
        BackendConfig {
            batch_size: cli.batch_size,
            ..BackendConfig::streaming()
        },
    );
    let server = FlightExchangeServer::start(config, backend.context()).await?;
    info!(version = env!("CARGO_PKG_VERSION"), url = %server.url(), "serving");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await
}
