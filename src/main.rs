//! Command line interface for operating the relay client. Manages the relay
//! list, reports connection health, runs tiered queries and counts, and
//! maintains the local event cache.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use loopstr::{
    config::Settings, logging, EventCache, FileRelayStore, Filter, GatewayClient, HttpGateway,
    ProtocolClient, RelayChange, RelayFleet, RelayListStore, SortKey,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "loopstr",
    author,
    version,
    about = "Nostr relay client with a local event cache",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Manage the configured relay list.
    Relays {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Connect to every configured relay and print the status map.
    Status,
    /// Resolve a filter through cache, gateway and relays; prints JSON lines.
    Query {
        #[command(flatten)]
        filter: FilterArgs,
        /// Only consult the local cache.
        #[arg(long)]
        cache_only: bool,
    },
    /// Count events matching a filter.
    Count {
        #[command(flatten)]
        filter: FilterArgs,
        /// Only consult the local cache.
        #[arg(long)]
        cache_only: bool,
    },
    /// Delete cached events whose expiry has passed.
    Sweep {
        /// Unix timestamp to sweep against instead of now.
        #[arg(long)]
        before: Option<u64>,
    },
    /// Upsert one or more JSON event files into the cache.
    Ingest {
        #[arg(required = true)]
        files: Vec<String>,
    },
}

/// Operations available under `loopstr relays`.
#[derive(Subcommand)]
enum RelayAction {
    List,
    /// Add a relay and connect to it.
    Add { url: String },
    Remove { url: String },
}

/// Filter fields accepted on the command line.
#[derive(Args, Default)]
struct FilterArgs {
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    authors: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    kinds: Vec<u32>,
    /// `#t` hashtags.
    #[arg(long = "tag", value_delimiter = ',')]
    hashtags: Vec<String>,
    /// `#d` identifiers.
    #[arg(long = "d", value_delimiter = ',')]
    identifiers: Vec<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    since: Option<u64>,
    #[arg(long)]
    until: Option<u64>,
    #[arg(long)]
    limit: Option<usize>,
    /// created_at, loops, likes or comments.
    #[arg(long)]
    sort: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> anyhow::Result<Filter> {
        let mut f = Filter::new();
        if !self.ids.is_empty() {
            f = f.ids(self.ids.clone());
        }
        if !self.authors.is_empty() {
            f = f.authors(self.authors.clone());
        }
        if !self.kinds.is_empty() {
            f = f.kinds(self.kinds.clone());
        }
        if !self.hashtags.is_empty() {
            f = f.hashtags(self.hashtags.clone());
        }
        if !self.identifiers.is_empty() {
            f = f.identifiers(self.identifiers.clone());
        }
        if let Some(search) = &self.search {
            f = f.search(search.clone());
        }
        if let Some(since) = self.since {
            f = f.since(since);
        }
        if let Some(until) = self.until {
            f = f.until(until);
        }
        if let Some(limit) = self.limit {
            f = f.limit(limit);
        }
        if let Some(sort) = &self.sort {
            let Some(key) = SortKey::parse(sort) else {
                bail!("unknown sort key: {sort}");
            };
            f = f.sort(key);
        }
        Ok(f)
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    logging::init(&cfg.log_level);
    fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating {}", cfg.data_dir.display()))?;
    let cache = EventCache::open(cfg.cache_path())?;

    match cli.command {
        Commands::Ingest { files } => {
            for f in files {
                let data = fs::read_to_string(&f).with_context(|| format!("reading {f}"))?;
                let ev: loopstr::Event = serde_json::from_str(&data)?;
                if cfg.verify_sig {
                    ev.verify()
                        .with_context(|| format!("{f}: event {} failed verification", ev.id))?;
                }
                let stored = cache.upsert(&ev).await?;
                println!("{} {}", ev.id, if stored { "stored" } else { "skipped" });
            }
        }
        Commands::Sweep { before } => {
            let removed = cache.delete_expired(before).await?;
            println!("{removed} expired events removed");
        }
        Commands::Query {
            filter,
            cache_only: true,
        } => {
            for ev in cache.query_by_filter(&filter.to_filter()?).await? {
                println!("{}", serde_json::to_string(&ev)?);
            }
        }
        Commands::Count {
            filter,
            cache_only: true,
        } => {
            println!("{}", cache.count_by_filter(&filter.to_filter()?).await?);
        }
        command => {
            let client = open_client(&cfg, cache).await?;
            let result = run_online(&client, command).await;
            client.dispose();
            result?;
        }
    }
    Ok(())
}

/// Subcommands that need the relay fleet.
async fn run_online(client: &ProtocolClient, command: Commands) -> anyhow::Result<()> {
    let fleet = client.fleet();
    match command {
        Commands::Relays { action } => match action {
            RelayAction::List => {
                for record in fleet.relays() {
                    let marker = if record.is_default { " (default)" } else { "" };
                    println!("{}{marker}", record.url);
                }
            }
            RelayAction::Add { url } => match fleet.add_relay(&url).await? {
                RelayChange::Added(url) => println!("added {url}"),
                RelayChange::AlreadyConfigured(url) => bail!("relay already configured: {url}"),
                RelayChange::Invalid(url) => bail!("invalid relay url: {url}"),
                other => bail!("unexpected result: {other:?}"),
            },
            RelayAction::Remove { url } => match fleet.remove_relay(&url).await? {
                RelayChange::Removed(url) => println!("removed {url}"),
                RelayChange::DefaultProtected => bail!("the default relay cannot be removed"),
                RelayChange::NotConfigured(url) => bail!("relay not configured: {url}"),
                RelayChange::Invalid(url) => bail!("invalid relay url: {url}"),
                other => bail!("unexpected result: {other:?}"),
            },
        },
        Commands::Status => {
            fleet.sync_statuses();
            println!("{}", serde_json::to_string_pretty(&fleet.statuses())?);
            println!("{}", fleet.summary());
        }
        Commands::Query { filter, .. } => {
            for ev in client.query_events(&[filter.to_filter()?]).await? {
                println!("{}", serde_json::to_string(&ev)?);
            }
        }
        Commands::Count { filter, .. } => {
            let res = client.count_events(&[filter.to_filter()?]).await?;
            let note = if res.approximate { " (approximate)" } else { "" };
            println!("{}{note}", res.count);
        }
        Commands::Ingest { .. } | Commands::Sweep { .. } => {}
    }
    Ok(())
}

/// Build the client from settings and connect the fleet.
async fn open_client(cfg: &Settings, cache: EventCache) -> anyhow::Result<ProtocolClient> {
    let store = FileRelayStore::in_dir(&cfg.data_dir);
    if !cfg.relays.is_empty() && !store.path().exists() {
        store.save_relays(&cfg.relays).await?;
    }
    let gateway: Option<Arc<dyn GatewayClient>> = match &cfg.gateway_url {
        Some(url) => Some(Arc::new(HttpGateway::new(
            url.clone(),
            cfg.client_config().gateway_timeout,
        )?)),
        None => None,
    };
    let fleet = RelayFleet::new(cfg.fleet_config(), Arc::new(store), None);
    let client = ProtocolClient::new(fleet, cache, gateway, None, cfg.client_config());
    client.initialize().await?;
    Ok(client)
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let data_dir = base_dir.join("loopstr-data");
    let mut content = String::new();
    content.push_str(&format!("DATA_DIR={}\n", display_path(&data_dir)));
    content.push_str(&format!("DEFAULT_RELAY={}\n", loopstr::fleet::DEFAULT_RELAY));
    content.push_str("RELAYS=\n");
    content.push_str("GATEWAY_URL=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("LOG_LEVEL=info\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
