//! sql-link - run one operation from a directory of .sql files.
//!
//! Prints the shaped result as JSON on stdout.

use sql_link::config::{Config, ConnectionOptions};
use sql_link::models::Param;
use sql_link::{Connection, Link};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    let options = ConnectionOptions::parse(&config.database)?;
    let link = Link::new(options, &config.directory)?;
    info!(
        driver = %link.options().driver,
        directory = %link.directory().display(),
        operation = %config.operation,
        "Starting sql-link v{}",
        env!("CARGO_PKG_VERSION")
    );

    let args: Vec<Param> = config.json_args().into_iter().map(Param::from).collect();
    let operation = config.operation.as_str();
    let work = async move |conn: &Connection<'_>| conn.invoke(operation, args).await;
    let result = if config.txn {
        link.txn(work).await
    } else {
        link.connect(work).await
    };
    link.disconnect().await;

    match result {
        Ok(output) => {
            let json = output.unwrap_or(serde_json::Value::Null);
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, context = ?e.context(), "Operation failed");
            Err(e.into())
        }
    }
}
