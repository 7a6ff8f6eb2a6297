use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::FmtSubscriber;

use asynfed::{
    messenger::RedisTransport,
    server::ServerCoordinator,
    settings::{LoggingSettings, ServerSettings},
    storage::Backend,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Server")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let mut settings = ServerSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let LoggingSettings { filter } = std::mem::take(&mut settings.log);
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();

    let store = Backend::from_settings(&settings.storage)
        .await
        .expect("failed to initialize the object store");
    let transport = RedisTransport::new(settings.bus.url.clone())
        .await
        .expect("failed to connect to the message bus");

    let server = ServerCoordinator::new(settings, store, transport);
    tokio::select! {
        result = server.run() => match result {
            Ok(()) => info!("shutting down: federation stopped"),
            Err(err) => {
                error!("shutting down: {}", err);
                process::exit(1);
            }
        },
        _ = signal::ctrl_c() => warn!("shutting down: interrupted"),
    }
}
