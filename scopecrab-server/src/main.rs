use anyhow::{Context, Result};
use scopecrab_server::cache::ConfigCache;
use scopecrab_server::config::Config;
use scopecrab_server::factory::SourceFactory;
use scopecrab_server::loader::{ConfigLoader, OptionFactory};
use scopecrab_server::metrics::Metrics;
use scopecrab_server::middleware::Dispatcher;
use scopecrab_server::registry::BackendRegistry;
use scopecrab_server::scope::{HeaderScopeResolver, ScopeContext, ScopeId};
use scopecrab_server::source::SettingsSource;
use scopecrab_server::transport::{Transport, http::HttpTransport};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env_and_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("scopecrab={}", config.log_level).parse()?)
                .add_directive(format!("scopecrab_server={}", config.log_level).parse()?),
        )
        .init();

    let source = Arc::new(match &config.settings {
        Some(path) => SettingsSource::from_file(path)
            .with_context(|| format!("reading settings from {}", path.display()))?,
        None => SettingsSource::from_env().context("reading settings from the environment")?,
    });

    let registry = Arc::new(BackendRegistry::with_defaults(config.redis_timeout));
    tracing::info!(engines = ?registry.names(), "storage engines registered");

    let factory = Arc::new(SourceFactory::new(source.clone(), registry));

    // Fail fast on a broken Default scope
    let default = factory
        .load(ScopeContext::default())
        .await
        .context("default scope configuration")?;

    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(ConfigCache::new().with_max_aliases(config.max_aliases));
    cache.set(ScopeId::DEFAULT, Arc::new(default));
    let loader = Arc::new(
        ConfigLoader::new(cache)
            .with_factory(factory)
            .with_backoff(config.load_backoff)
            .with_timeout(config.load_timeout)
            .with_metrics(metrics.clone()),
    );
    let dispatcher = Arc::new(
        Dispatcher::new(loader)
            .with_resolver(Arc::new(HeaderScopeResolver::new(
                config.default_website,
                config.default_store,
            )))
            .with_metrics(metrics),
    );

    #[cfg(unix)]
    spawn_reload_on_hangup(source, dispatcher.clone())?;

    tracing::info!(
        default_website = config.default_website,
        default_store = config.default_store,
        "ScopeCrab server starting"
    );

    HttpTransport::new(config.http.addr()?)
        .start(dispatcher)
        .await
}

/// SIGHUP re-reads the settings and drops every cached scope
#[cfg(unix)]
fn spawn_reload_on_hangup(source: Arc<SettingsSource>, dispatcher: Arc<Dispatcher>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match source.reload() {
                Ok(()) => {
                    dispatcher.cache().flush();
                    dispatcher.loader().reset_failures();
                    tracing::info!(reloads = source.reloads(), "settings reloaded");
                }
                Err(e) => tracing::error!(error = %e, "settings reload failed, keeping cached scopes"),
            }
        }
    });
    Ok(())
}
