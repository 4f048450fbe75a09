pub mod cache;
pub mod config;
pub mod db;
pub mod discovery;
pub mod generation;
pub mod http;
pub mod images;
pub mod llm;
pub mod models;
pub mod parser;
pub mod saved;
pub mod transform;
pub mod url_validator;
mod utils;

use std::process::Command as Process;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cache::EventCache;
use config::{AppConfig, ConfigStore};
use db::{SharedStore, Store};
use discovery::{DiscoveryOrchestrator, FetchOutcome};
use generation::{fallback_events, EventPipeline};
use http::ReqwestTransport;
use models::DiscoveredEvent;
use saved::{reminder_time, SavedEvent, SavedEventStore};
use url_validator::{display_url, open_external, LinkOpener};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Discover {
        location: Option<String>,
        refresh: bool,
    },
    Saved,
    Save {
        id: String,
        location: Option<String>,
    },
    Unsave {
        id: String,
    },
    Open {
        url: String,
    },
    CacheClear {
        location: Option<String>,
    },
    SetLocation {
        location: String,
    },
    Help,
}

const USAGE: &str = "ballot - local civic event discovery

  discover [LOCATION] [--refresh]   Find events (cached for 12h unless --refresh)
  saved                             List saved events
  save <ID> [--location L]          Save an event from the last results for L
  unsave <ID>                       Remove a saved event
  open <URL>                        Open a link after validating it
  cache-clear [LOCATION]            Drop cached events for one or all locations
  set-location <LOCATION>           Remember the default location

Env: OPENROUTER_API_KEY, UNSPLASH_ACCESS_KEY, BALLOT_MODEL, BALLOT_COMPLETION_URL,
     BALLOT_DISPLAY_TZ, RUST_LOG";

fn parse_args<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(name) = args.next() else {
        return Ok(Command::Help);
    };

    let mut positional = Vec::new();
    let mut refresh = false;
    let mut location_flag = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--refresh" | "-r" => refresh = true,
            "--location" | "-l" => {
                location_flag = Some(args.next().ok_or_else(|| anyhow!("--location needs a value"))?)
            }
            _ => positional.push(arg),
        }
    }
    let joined = (!positional.is_empty()).then(|| positional.join(" "));

    let command = match name.as_str() {
        "discover" => Command::Discover {
            location: joined,
            refresh,
        },
        "refresh" => Command::Discover {
            location: joined,
            refresh: true,
        },
        "saved" => Command::Saved,
        "save" => Command::Save {
            id: joined.ok_or_else(|| anyhow!("save needs an event id"))?,
            location: location_flag,
        },
        "unsave" => Command::Unsave {
            id: joined.ok_or_else(|| anyhow!("unsave needs an event id"))?,
        },
        "open" => Command::Open {
            url: joined.ok_or_else(|| anyhow!("open needs a URL"))?,
        },
        "cache-clear" => Command::CacheClear { location: joined },
        "set-location" => Command::SetLocation {
            location: joined.ok_or_else(|| anyhow!("set-location needs a location"))?,
        },
        "help" | "--help" | "-h" => Command::Help,
        other => bail!("unknown command `{other}`\n\n{USAGE}"),
    };
    Ok(command)
}

struct SystemOpener;

impl LinkOpener for SystemOpener {
    fn open(&self, url: &str) -> Result<(), String> {
        let mut process = if cfg!(target_os = "macos") {
            let mut p = Process::new("open");
            p.arg(url);
            p
        } else if cfg!(target_os = "windows") {
            let mut p = Process::new("cmd");
            p.args(["/C", "start", "", url]);
            p
        } else {
            let mut p = Process::new("xdg-open");
            p.arg(url);
            p
        };
        process.spawn().map(|_| ()).map_err(|err| err.to_string())
    }
}

struct App {
    config_store: ConfigStore,
    config: AppConfig,
    cache: EventCache,
    discovery: DiscoveryOrchestrator,
    saved: SavedEventStore,
}

impl App {
    async fn build() -> Result<Self> {
        let config_store = ConfigStore::load_default();
        let config = config_store.effective();
        let store = SharedStore::new(Store::open_default().context("opening event database")?);

        let settings = config.discovery_settings();
        let cache = EventCache::new(store.clone(), settings.cache_ttl);
        let pipeline = EventPipeline::from_config(&config, Arc::new(ReqwestTransport::new()));
        let discovery = DiscoveryOrchestrator::new(Arc::new(pipeline), cache.clone(), settings);
        let saved = SavedEventStore::load(store).await;

        Ok(Self {
            config_store,
            config,
            cache,
            discovery,
            saved,
        })
    }

    fn location_or_default(&self, location: Option<String>) -> Result<String> {
        location
            .or_else(|| self.config.default_location.clone())
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| anyhow!("no location given and no default set (try `set-location`)"))
    }

    async fn discover(&self, location: Option<String>, refresh: bool) -> Result<serde_json::Value> {
        let location = self.location_or_default(location)?;
        let outcome = self.discovery.fetch(&location, refresh).await?;
        info!(?outcome, "discovery finished");

        let state = self.discovery.snapshot();
        Ok(json!({
            "location": location,
            "outcome": outcome_label(&outcome),
            "cache_age": self.discovery.cache_age_display(),
            "error": state.error(),
            "events": state.events().iter().map(event_summary).collect::<Vec<_>>(),
        }))
    }

    async fn save(&self, id: &str, location: Option<String>) -> Result<SavedEvent> {
        let location = self.location_or_default(location)?;
        let candidates = match self.cache.get(&location).await {
            Some(hit) => hit.events,
            None => Vec::new(),
        };
        let event = candidates
            .into_iter()
            .chain(fallback_events())
            .find(|event| event.id == id)
            .ok_or_else(|| anyhow!("no event `{id}` in the current results for {location}"))?;

        let saved = SavedEvent::from(event);
        if !self.saved.add(saved.clone()).await? {
            info!(id, "event already saved");
        }
        Ok(saved)
    }

    async fn saved_listing(&self) -> Vec<serde_json::Value> {
        let now = Utc::now();
        self.saved
            .list()
            .await
            .iter()
            .map(|event| {
                json!({
                    "id": event.id,
                    "title": event.title,
                    "date": event.date,
                    "location": event.location,
                    "link": event.link.as_deref().map(|l| display_url(l, 50)),
                    "reminder_at": reminder_time(event, now).map(|t| t.to_rfc3339()),
                })
            })
            .collect()
    }
}

fn outcome_label(outcome: &FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::Skipped(_) => "skipped",
        FetchOutcome::CacheHit { .. } => "cache",
        FetchOutcome::Fresh { .. } => "fresh",
        FetchOutcome::Empty => "empty",
        FetchOutcome::Fallback { .. } => "fallback",
    }
}

#[derive(Serialize)]
struct EventSummary<'a> {
    id: &'a str,
    title: &'a str,
    date: &'a str,
    address: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
}

fn event_summary(event: &DiscoveredEvent) -> EventSummary<'_> {
    EventSummary {
        id: &event.id,
        title: &event.title,
        date: &event.date,
        address: &event.address,
        image: event.image.key(),
        link: event.link.as_deref(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn dispatch(command: Command) -> Result<()> {
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }
    if let Command::Open { url } = &command {
        if !open_external(&SystemOpener, url) {
            bail!("refusing to open {}", display_url(url, 50));
        }
        return Ok(());
    }

    let app = App::build().await?;
    match command {
        Command::Discover { location, refresh } => print_json(&app.discover(location, refresh).await?)?,
        Command::Saved => print_json(&app.saved_listing().await)?,
        Command::Save { id, location } => {
            let saved = app.save(&id, location).await?;
            info!(id = %saved.id, title = %saved.title, "saved event");
        }
        Command::Unsave { id } => match app.saved.remove(&id).await? {
            Some(removed) => info!(id = %removed.id, "removed saved event"),
            None => bail!("`{id}` is not saved"),
        },
        Command::CacheClear { location } => match location {
            Some(location) => app.cache.invalidate(&location).await,
            None => app.cache.invalidate_all().await,
        },
        Command::SetLocation { location } => {
            let updated = app
                .config_store
                .update(|config| config.default_location = Some(location.trim().to_string()))?;
            info!(location = ?updated.default_location, "default location set");
        }
        Command::Help | Command::Open { .. } => {}
    }
    Ok(())
}

pub fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let command = parse_args(std::env::args().skip(1))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(dispatch(command))
}
