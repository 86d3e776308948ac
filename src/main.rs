use automagik_omni::{app, Config, OmniError};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "automagik-omni",
    about = "Multi-tenant messaging gateway routing WhatsApp and Discord traffic to upstream AI agents",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run migrations and serve the gateway (default).
    Serve,
    /// Bring the database schema to head and exit.
    Migrate,
    /// Run one broker discovery pass and exit.
    Discover,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_new(Config::log_filter())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => app::serve(config).await,
        Command::Migrate => app::migrate(&config).await,
        Command::Discover => app::discover(&config).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        let user_error = e
            .downcast_ref::<OmniError>()
            .is_some_and(|err| matches!(err, OmniError::Config(_)));
        std::process::exit(if user_error { 1 } else { 2 });
    }
}
