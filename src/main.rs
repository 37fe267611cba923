use amqp_tools::amqp::configuration::{Settings, DEFAULT_CONFIGURATION_PATH};
use amqp_tools::amqp::{BrokerEndpoint, ConnectionFactory};
use amqp_tools::consumers::{Consumer, HandlerError, Incoming};
use amqp_tools::publishers::{Outbox, Publisher, DEFAULT_OUTBOX_CAPACITY};
use clap::{CommandFactory, Parser, ValueEnum};
use shutdown_handler::ShutdownHandler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const GREETING_DELAY: Duration = Duration::from_secs(5);

/// Consume from and publish to a RabbitMq broker.
#[derive(Parser, Debug)]
#[command(name = "amqp-tools", version)]
struct Cli {
    /// What to do. Prints this help if omitted.
    #[arg(long, value_enum)]
    action: Option<Action>,
    /// Path to the TOML configuration file.
    #[arg(long, env = "AMQP_TOOLS_CONFIG", default_value = DEFAULT_CONFIGURATION_PATH)]
    config: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Action {
    /// Load and validate the configuration, then print it (without secrets).
    Check,
    /// Consume messages until SIGTERM or Ctrl-C.
    Run,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let Some(action) = cli.action else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let settings = Settings::load(&cli.config)?;
    settings.validate()?;

    match action {
        Action::Check => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Action::Run => run(settings).await,
    }
}

async fn run(settings: Settings) -> Result<(), anyhow::Error> {
    let endpoint = Arc::new(BrokerEndpoint::from_settings(&settings));
    let factory = ConnectionFactory::new_from_config(&settings.rabbitmq)?;

    let publisher = Publisher::builder(factory.clone(), endpoint.clone()).build();
    let (outbox, outbox_task) = Outbox::spawn(publisher, DEFAULT_OUTBOX_CAPACITY);

    let consumer = Consumer::builder(factory, endpoint, ())
        .handler_fn(log_message)
        .build();

    let shutdown = ShutdownHandler::sigterm()?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.shutdown();
            }
        }
    });

    tokio::spawn(async move {
        tokio::time::sleep(GREETING_DELAY).await;
        if let Err(e) = outbox.send("Hello from amqp-tools").await {
            error!(error = ?e, "Failed to queue the greeting");
        }
    });

    consumer.run_until_shutdown(shutdown).await;
    outbox_task.abort();
    Ok(())
}

async fn log_message(incoming: Incoming<'_, ()>) -> Result<(), HandlerError> {
    info!(
        delivery_tag = incoming.delivery_tag,
        body = %String::from_utf8_lossy(incoming.body),
        "Received a message"
    );
    Ok(())
}
