mod config;

use async_trait::async_trait;
use config::RelayConfig;
use librelay::event::{Event, EventListener, ListenerError};
use librelay::incoming::MessageReceiver;
use librelay::outgoing::MessageSender;
use librelay::store::SignalStore;
use librelay::EventDispatcher;
use librelay_hub::{HttpSignalClient, HubClientConfig};
use log::LevelFilter;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("config")]
    Config,
    #[error("hub")]
    Hub,
    #[error("store")]
    Store,
}

struct LogListener;

#[async_trait]
impl EventListener for LogListener {
    async fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        match event {
            Event::Message(message) => log::info!(
                "message from {}.{}: {:?}",
                message.source,
                message.source_device,
                message.data.body
            ),
            Event::Sent(sent) => log::info!("sent to {} ({})", sent.addr, sent.timestamp),
            Event::Receipt(receipt) => {
                log::info!("receipt from {} ({})", receipt.source, receipt.timestamp)
            }
            Event::Read(read) => log::info!("read by {} ({})", read.sender, read.timestamp),
            Event::KeyChange(change) => log::warn!("identity key changed for {}", change.addr),
            Event::Error(error) => log::error!("relay error: {}", error.error),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("relay.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path).map_err(|_| CliError::Config)?;
    init_logging(&cfg);

    let store = init_store(&cfg).await?;
    let client = Arc::new(
        HttpSignalClient::new(
            cfg.hub.base_url.clone(),
            HubClientConfig {
                username: cfg.hub.username.clone(),
                password: cfg.hub.password.clone(),
                ..HubClientConfig::default()
            },
        )
        .map_err(|_| CliError::Hub)?,
    );

    let events = EventDispatcher::new();
    events.add_listener(Arc::new(LogListener)).await;
    let sender = MessageSender::new(client.clone(), store.clone(), events.clone());
    let receiver = MessageReceiver::new(client, store.clone(), events, sender, None)
        .await
        .map_err(|_| CliError::Store)?;

    log::info!("polling for messages every {}ms", cfg.poll_interval_ms);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ctrl_c.as_mut() => break,
            _ = tokio::time::sleep(Duration::from_millis(cfg.poll_interval_ms)) => {
                if let Err(err) = receiver.drain().await {
                    log::warn!("drain failed: {}", err);
                }
            }
        }
    }
    let _ = store.shutdown().await;
    Ok(())
}

fn init_logging(cfg: &RelayConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn init_store(cfg: &RelayConfig) -> Result<SignalStore, CliError> {
    let storage = cfg.storage_config().map_err(|_| CliError::Config)?;
    let store = SignalStore::open(&storage);
    store.initialize().await.map_err(|_| CliError::Store)?;
    if !store.is_provisioned().await.map_err(|_| CliError::Store)? {
        let addr = Uuid::new_v4().to_string();
        let mut signaling_key = [0u8; 52];
        rand::thread_rng().fill_bytes(&mut signaling_key);
        store
            .provision(&addr, 1, &signaling_key)
            .await
            .map_err(|_| CliError::Store)?;
        log::info!("provisioned new account state for {}", addr);
    }
    Ok(store)
}
