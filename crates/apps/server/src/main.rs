mod api;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use assets::{
    AssetLoader, CacheConfig, FilesystemLoader, HttpLoader, ResolverConfig, RetryPolicy,
    SchemeLoader,
};
use axum::http::Method;
use catalog::{CatalogManifest, InMemoryCatalog, PlaceholderSet};
use clap::Parser;
use render::{RenderConfig, ServiceContext};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Try-on asset and render job service.
#[derive(Parser, Debug)]
#[command(name = "server")]
struct Args {
    /// Listen address; overrides TRYON_ADDR.
    #[arg(long)]
    addr: Option<SocketAddr>,
    /// Catalog manifest (JSON); overrides TRYON_CATALOG.
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Settings {
    addr: SocketAddr,
    asset_root: PathBuf,
    asset_base_url: Option<String>,
    catalog: Option<PathBuf>,
    placeholder_dir: String,
    cache: CacheConfig,
    resolver: ResolverConfig,
    render: RenderConfig,
    sweep_interval: Duration,
}

impl Settings {
    fn from_env(args: Args) -> anyhow::Result<Self> {
        Self::from_lookup(args, |key| env::var(key).ok())
    }

    fn from_lookup(args: Args, get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let addr = match args.addr {
            Some(addr) => addr,
            None => get("TRYON_ADDR")
                .unwrap_or_else(|| "127.0.0.1:8080".to_string())
                .parse()
                .context("invalid TRYON_ADDR")?,
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            max_bytes: env_var_or(&get, "TRYON_CACHE_MAX_BYTES", cache_defaults.max_bytes),
            default_ttl: env_var_duration_ms(&get, "TRYON_CACHE_TTL_MS", cache_defaults.default_ttl),
            placeholder_ttl: env_var_duration_ms(
                &get,
                "TRYON_PLACEHOLDER_TTL_MS",
                cache_defaults.placeholder_ttl,
            ),
        };

        let retry_defaults = RetryPolicy::default();
        let resolver = ResolverConfig {
            retry: RetryPolicy {
                max_attempts: env_var_or(&get, "TRYON_RETRY_ATTEMPTS", retry_defaults.max_attempts),
                base_delay: env_var_duration_ms(&get, "TRYON_RETRY_BASE_MS", retry_defaults.base_delay),
                ..retry_defaults
            },
            ..ResolverConfig::default()
        };

        let render_defaults = RenderConfig::default();
        let render = RenderConfig {
            workers: env_var_or(&get, "TRYON_WORKERS", render_defaults.workers),
            max_pending: env_var_or(&get, "TRYON_MAX_PENDING", render_defaults.max_pending),
            job_timeout: env_var_duration_ms(&get, "TRYON_JOB_TIMEOUT_MS", render_defaults.job_timeout),
            retention: env_var_duration_ms(&get, "TRYON_RETENTION_MS", render_defaults.retention),
            ..render_defaults
        };

        Ok(Self {
            addr,
            asset_root: get("TRYON_ASSET_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./assets")),
            asset_base_url: get("TRYON_ASSET_BASE_URL").filter(|s| !s.is_empty()),
            catalog: args.catalog.or_else(|| get("TRYON_CATALOG").map(PathBuf::from)),
            placeholder_dir: get("TRYON_PLACEHOLDER_DIR").unwrap_or_else(|| "placeholders".to_string()),
            cache,
            resolver,
            render,
            sweep_interval: env_var_duration_ms(
                &get,
                "TRYON_SWEEP_INTERVAL_MS",
                Duration::from_secs(60),
            ),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env(Args::parse())?;
    let (catalog, placeholders) = load_catalog(&settings).await?;
    info!(
        "catalog: {} assets, {} placeholder categories",
        catalog.len(),
        placeholders.categories()
    );

    let http: Arc<dyn AssetLoader> = {
        let loader = HttpLoader::new(reqwest::Client::new());
        match &settings.asset_base_url {
            Some(base) => Arc::new(loader.with_base_url(base.clone())),
            None => Arc::new(loader),
        }
    };
    // Relative locations come from the CDN when one is configured.
    let local: Arc<dyn AssetLoader> = if settings.asset_base_url.is_some() {
        http.clone()
    } else {
        Arc::new(FilesystemLoader::new(&settings.asset_root))
    };
    let loader = Arc::new(SchemeLoader::new(local, http));

    let ctx = ServiceContext::builder()
        .catalog(Arc::new(catalog))
        .loader(loader)
        .placeholders(placeholders)
        .cache_config(settings.cache.clone())
        .resolver_config(settings.resolver.clone())
        .render_config(settings.render.clone())
        .build();

    let sweeper = tokio::spawn(sweep(
        ctx.clone(),
        settings.sweep_interval,
        settings.render.retention,
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

    let app = api::router(ctx.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(settings.addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.addr))?;
    info!("try-on server listening on http://{}", settings.addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
    ctx.queue.shutdown().await;
    Ok(())
}

async fn load_catalog(settings: &Settings) -> anyhow::Result<(InMemoryCatalog, PlaceholderSet)> {
    let generic = format!("{}/generic.png", settings.placeholder_dir.trim_end_matches('/'));
    let Some(path) = &settings.catalog else {
        warn!("no catalog configured; every asset resolves to {generic}");
        return Ok((InMemoryCatalog::new(), PlaceholderSet::new(generic)));
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let manifest = CatalogManifest::from_json(&raw)?;
    let catalog = InMemoryCatalog::from_manifest(&manifest)?;
    Ok((catalog, manifest.placeholder_set()))
}

/// Periodic housekeeping: forget old finished jobs and drop expired cache
/// entries.
async fn sweep(ctx: ServiceContext, every: Duration, retention: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let purged = ctx.queue.purge_finished(retention);
        let evicted = ctx.cache.evict_expired().len();
        debug!("sweep: purged {purged} jobs, evicted {evicted} cache entries");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn env_var_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_var_duration_ms(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{Args, Settings};

    fn settings(vars: &[(&str, &str)], args: Args) -> Settings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(args, |key| vars.get(key).cloned()).unwrap()
    }

    fn no_args() -> Args {
        Args {
            addr: None,
            catalog: None,
        }
    }

    #[test]
    fn defaults_apply_without_environment() {
        let s = settings(&[], no_args());
        assert_eq!(s.addr.to_string(), "127.0.0.1:8080");
        assert_eq!(s.render.workers, 4);
        assert_eq!(s.cache.max_bytes, 256 * 1024 * 1024);
        assert_eq!(s.resolver.retry.max_attempts, 3);
        assert!(s.catalog.is_none());
    }

    #[test]
    fn environment_overrides_defaults_and_args_override_environment() {
        let s = settings(
            &[
                ("TRYON_ADDR", "0.0.0.0:9000"),
                ("TRYON_WORKERS", "8"),
                ("TRYON_CACHE_TTL_MS", "1500"),
                ("TRYON_RETRY_ATTEMPTS", "not a number"),
                ("TRYON_CATALOG", "env.json"),
            ],
            Args {
                addr: None,
                catalog: Some(PathBuf::from("cli.json")),
            },
        );
        assert_eq!(s.addr.port(), 9000);
        assert_eq!(s.render.workers, 8);
        assert_eq!(s.cache.default_ttl, Duration::from_millis(1500));
        assert_eq!(s.resolver.retry.max_attempts, 3, "unparseable falls back");
        assert_eq!(s.catalog, Some(PathBuf::from("cli.json")));
    }

    #[test]
    fn bad_address_is_an_error() {
        let vars: HashMap<String, String> = [("TRYON_ADDR".to_string(), "nowhere".to_string())].into();
        assert!(Settings::from_lookup(no_args(), |k| vars.get(k).cloned()).is_err());
    }

    #[tokio::test]
    async fn no_catalog_means_only_the_generic_placeholder() {
        let s = settings(&[("TRYON_PLACEHOLDER_DIR", "static/ph/")], no_args());

        let (catalog, placeholders) = super::load_catalog(&s).await.unwrap();
        assert!(catalog.is_empty());
        assert_eq!(placeholders.categories(), 0);
        assert_eq!(placeholders.generic().to_string(), "static/ph/generic.png");
    }

    #[tokio::test]
    async fn catalog_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"version":"1.0","assets":[{"id":"p1","category":"slim","primary":"p1.glb"}],
                "placeholders":{"slim":"placeholders/slim.glb"},"generic":"placeholders/generic.png"}"#,
        )
        .unwrap();
        let mut s = settings(&[], no_args());
        s.catalog = Some(path);

        let (catalog, placeholders) = super::load_catalog(&s).await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(placeholders.categories(), 1);
    }
}
