use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use walletwatch::config::Config;
use walletwatch::database::{AddressStore, Database};
use walletwatch::telegram::TelegramNotifier;
use walletwatch::telegram_log::TelegramLogLayer;
use walletwatch::watcher::{
    AddOutcome, FeedMode, FeedSource, LogsPubsub, Notifier, RemoveOutcome, RpcActivityFeed, WatchManager,
};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Wallet watcher commands:")]
enum Command {
    #[command(description = "show this help")]
    Help,
    #[command(description = "watch a wallet: /watch <address>")]
    Watch(String),
    #[command(description = "stop watching a wallet: /unwatch <address>")]
    Unwatch(String),
    #[command(description = "list watched wallets")]
    List,
    #[command(description = "show connection status")]
    Status,
    #[command(description = "reconnect after the upstream was lost")]
    Restart,
}

struct BotState {
    config: Config,
    manager: WatchManager,
    store: Database,
    denied: Mutex<HashSet<UserId>>,
    started_at: DateTime<Utc>,
}

impl BotState {
    fn persist(&self) {
        let addresses = self.manager.list_addresses();
        if let Err(e) = self.store.save_addresses(&addresses) {
            error!(error = %e, "failed to save watch list");
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "walletwatch.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("walletwatch.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        registry.with(TelegramLogLayer::new(bot.clone(), log_chat_id)).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting walletwatch...");
    info!("Loaded config from {config_path}");
    info!("Owner IDs: {:?}", config.owner_ids);
    if config.dry_run {
        info!("DRY RUN mode enabled");
    }

    let feed = match RpcActivityFeed::new(&config.rpc_url, &config.commitment, config.request_timeout) {
        Ok(feed) => Arc::new(feed),
        Err(e) => {
            error!(error = %e, "failed to create RPC client");
            std::process::exit(1);
        }
    };
    let source = match config.feed_mode {
        FeedMode::Polling => FeedSource::Polling,
        FeedMode::Push => FeedSource::Push(Arc::new(LogsPubsub::new(&config.ws_url, &config.commitment))),
    };
    let notifier = Arc::new(TelegramNotifier::new(
        bot.clone(),
        config.notify_chat_id,
        &config.explorer_tx_url,
        config.dry_run,
    ));

    let store = match Database::open(&config.database_path()) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open database");
            std::process::exit(1);
        }
    };
    let initial = store.load_addresses().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load watch list, starting empty");
        Vec::new()
    });

    let manager = WatchManager::new(feed, source, notifier.clone(), config.watcher_settings())
        .with_validator(config.address_pattern.clone());
    manager.start(initial).await;

    let startup = format!(
        "Wallet watcher started: {} mode, {} address(es) watched.",
        manager.mode(),
        manager.list_addresses().len()
    );
    if let Err(e) = notifier.alert(&startup).await {
        warn!(error = %e, "failed to send startup message");
    }

    let state = Arc::new(BotState {
        config,
        manager,
        store,
        denied: Mutex::new(HashSet::new()),
        started_at: Utc::now(),
    });

    let handler = Update::filter_message()
        .filter_command::<Command>()
        .endpoint(handle_command);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state.clone()])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    state.manager.stop();
    info!("walletwatch shut down");
}

async fn handle_command(bot: Bot, msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    if !state.config.is_owner(user.id) {
        let mut denied = state.denied.lock().await;
        if denied.insert(user.id) {
            info!("Command from non-owner {} ({}) - denial", user.first_name, user.id);
            bot.send_message(msg.chat.id, "Access denied.").await.ok();
        }
        return Ok(());
    }

    let reply = match cmd {
        Command::Help => escape(&Command::descriptions().to_string()),
        Command::Watch(address) => match state.manager.add_address(&address).await {
            Ok(AddOutcome::Added) => {
                state.persist();
                format!("Now watching <code>{}</code>", escape(address.trim()))
            }
            Ok(AddOutcome::AlreadyWatched) => format!("Already watching <code>{}</code>", escape(address.trim())),
            Err(e) => format!("⚠️ {}", escape(&e.to_string())),
        },
        Command::Unwatch(address) => match state.manager.remove_address(&address).await {
            Ok(RemoveOutcome::Removed) => {
                state.persist();
                format!("Stopped watching <code>{}</code>", escape(address.trim()))
            }
            Ok(RemoveOutcome::NotWatched) => format!("Not watching <code>{}</code>", escape(address.trim())),
            Err(e) => format!("⚠️ {}", escape(&e.to_string())),
        },
        Command::List => {
            let addresses = state.manager.list_addresses();
            if addresses.is_empty() {
                "No wallets watched. Add one with /watch &lt;address&gt;".to_string()
            } else {
                addresses
                    .iter()
                    .enumerate()
                    .map(|(i, a)| format!("{}. <code>{}</code>", i + 1, a))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Status => status_text(&state),
        Command::Restart => {
            if state.manager.recover() {
                "Watcher restarted.".to_string()
            } else {
                format!("Watcher is {}, no restart needed.", state.manager.connection_state())
            }
        }
    };

    bot.send_message(msg.chat.id, reply)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

fn status_text(state: &BotState) -> String {
    let manager = &state.manager;
    let uptime = Utc::now() - state.started_at;
    let mut text = format!(
        "✅ Bot is running\nConnection: {}\nMode: {}\nWatched: {}\nUptime: {}h {}m",
        manager.connection_state(),
        manager.mode(),
        manager.list_addresses().len(),
        uptime.num_hours(),
        uptime.num_minutes() % 60,
    );
    if manager.transport_lost() {
        text.push_str("\n\n⚠️ Upstream lost. Use /restart to reconnect.");
    }
    text
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
