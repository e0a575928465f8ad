use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serenity::all::{Context, EventHandler, GatewayIntents, Ready};
use serenity::async_trait;
use serenity::client::Client;
use tokio_cron_scheduler::JobScheduler;
use tracing::{error, info, warn};

use tracker_bot::checkers::twitch::TwitchChecker;
use tracker_bot::checkers::twitter::TwitterChecker;
use tracker_bot::checkers::TrackerContext;
use tracker_bot::config::Config;
use tracker_bot::db::Database;
use tracker_bot::delivery::{ChatDelivery, DiscordDelivery};
use tracker_bot::dispatch::NotificationDispatcher;
use tracker_bot::jobs;
use tracker_bot::platforms::twitch::TwitchClient;
use tracker_bot::platforms::twitter::TwitterClient;
use tracker_bot::registry::FeedRegistry;
use tracker_bot::resolver::TargetResolver;
use tracker_bot::scheduler::PollingScheduler;

struct Handler {
    config: Config,
    db: Arc<Database>,
    started: AtomicBool,
    jobs: Mutex<Option<JobScheduler>>,
}

impl Handler {
    fn new(config: Config, db: Database) -> Self {
        Self {
            config,
            db: Arc::new(db),
            started: AtomicBool::new(false),
            jobs: Mutex::new(None),
        }
    }

    fn build_context(&self, ctx: &Context) -> (TrackerContext, Arc<FeedRegistry>) {
        let tracker = &self.config.tracker;
        let delivery: Arc<dyn ChatDelivery> = Arc::new(DiscordDelivery::new(ctx.http.clone()));

        let registry = Arc::new(FeedRegistry::new(
            self.db.clone(),
            self.db.clone(),
            tracker.seen_cache_ttl,
            tracker.seen_cache_capacity,
        ));
        let context = TrackerContext {
            registry: registry.clone(),
            resolver: Arc::new(TargetResolver::new(
                delivery.clone(),
                tracker.discord_task_timeout,
            )),
            dispatcher: Arc::new(NotificationDispatcher::new(
                delivery,
                tracker.discord_task_timeout,
                tracker.mention_cooldown,
            )),
        };
        (context, registry)
    }

    fn spawn_trackers(&self, context: &TrackerContext) {
        let tracker = &self.config.tracker;

        match &self.config.twitch {
            Some(credentials) => {
                match TwitchClient::new(credentials.clone(), tracker.twitch_call_delay) {
                    Ok(client) => {
                        let checker = TwitchChecker::new(
                            context.clone(),
                            Arc::new(client),
                            tracker.twitch_repeat,
                            tracker.feed_task_timeout,
                        );
                        let scheduler =
                            PollingScheduler::new(Arc::new(checker), tracker.pass_timeout);
                        tokio::spawn(scheduler.run_forever());
                    }
                    Err(e) => error!("[TWITCH] Failed to build API client: {}", e),
                }
            }
            None => warn!("[TWITCH] No client credentials configured, tracking disabled"),
        }

        match &self.config.twitter_bearer_token {
            Some(token) => match TwitterClient::new(token.clone(), tracker.twitter_call_delay) {
                Ok(client) => {
                    let checker = TwitterChecker::new(
                        context.clone(),
                        Arc::new(client),
                        tracker.twitter_repeat,
                        tracker.feed_task_timeout,
                        tracker.post_max_age,
                    );
                    let scheduler = PollingScheduler::new(Arc::new(checker), tracker.pass_timeout);
                    tokio::spawn(scheduler.run_forever());
                }
                Err(e) => error!("[TWITTER] Failed to build API client: {}", e),
            },
            None => warn!("[TWITTER] No bearer token configured, tracking disabled"),
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        // Gateway reconnects fire `ready` again; the loops only start once.
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (context, registry) = self.build_context(&ctx);
        self.spawn_trackers(&context);

        match jobs::start_background_jobs(registry, self.db.clone()).await {
            Ok(scheduler) => *self.jobs.lock() = Some(scheduler),
            Err(e) => error!("Failed to start background jobs: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let file_appender = tracing_appender::rolling::daily("logs", "tracker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .pretty();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracker_bot=info".parse()?)
                .add_directive("serenity=warn".parse()?),
        )
        .with(file_layer)
        .with(console_layer)
        .init();

    let config = Config::from_env()?;

    info!("Connecting to database...");
    let db = Database::new(&config.database_url).await?;

    info!("Running database migrations...");
    db.run_migrations().await?;

    let intents = GatewayIntents::GUILDS;
    let token = config.discord_token.clone();
    let handler = Handler::new(config, db);

    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .await?;

    info!("Starting Discord bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
