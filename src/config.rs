use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub upstream: UpstreamConfig,
    pub cdn: CdnConfig,
}

/// Where the blob provider lives and how to talk to it.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub api_base: String,
    pub bot_token: String,
    pub fetch_timeout: Duration,
    pub refresh_timeout: Duration,
}

impl std::fmt::Debug for UpstreamConfig {
    // the bot token ends up in every upstream URL, keep it out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("api_base", &self.api_base)
            .field("bot_token", &"<redacted>")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("refresh_timeout", &self.refresh_timeout)
            .finish()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".into(),
            bot_token: String::new(),
            fetch_timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the probe, monitor, router and streamer need to know about the edge.
#[derive(Debug, Clone)]
pub struct CdnConfig {
    pub enabled: bool,
    /// Bare host name of the CDN, e.g. `img.example.com`. Empty disables the CDN.
    pub domain: String,
    pub redirect_enabled: bool,
    pub max_redirect_count: u32,
    /// `max-age` of the 302 itself, not of the image behind it.
    pub redirect_cache_secs: u64,
    /// Objects younger than this are never redirected.
    pub grace_window: Duration,
    pub cache_ttl_secs: u64,
    pub edge_ttl_secs: u64,
    pub warming_enabled: bool,
    pub warming_delay: Duration,
    pub monitor_enabled: bool,
    pub monitor_interval: Duration,
    pub monitor_max_retries: u32,
    pub monitor_queue_size: usize,
    pub warm_recheck_delay: Duration,
    pub probe_timeout: Duration,
    pub warm_timeout: Duration,
    pub restore_window: Duration,
    pub restore_limit: i64,
    pub shutdown_grace: Duration,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            domain: String::new(),
            redirect_enabled: true,
            max_redirect_count: 2,
            redirect_cache_secs: 300,
            grace_window: Duration::from_secs(10),
            cache_ttl_secs: 31_536_000,
            edge_ttl_secs: 2_592_000,
            warming_enabled: true,
            warming_delay: Duration::from_secs(5),
            monitor_enabled: true,
            monitor_interval: Duration::from_secs(5),
            monitor_max_retries: 15,
            monitor_queue_size: 1000,
            warm_recheck_delay: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            warm_timeout: Duration::from_secs(10),
            restore_window: Duration::from_secs(86_400),
            restore_limit: 100,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl CdnConfig {
    /// The CDN is only usable when switched on and pointed at a domain.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.domain.is_empty()
    }

    pub fn cdn_base_url(&self) -> String {
        format!("https://{}", self.domain)
    }

    pub fn image_url(&self, id: &str) -> String {
        format!("{}/image/{}", self.cdn_base_url(), id)
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "CDN-fronted image relay")]
pub struct Args {
    /// Host to bind to (overrides EDGE_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides EDGE_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides EDGE_RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// CDN domain (overrides EDGE_RELAY_CDN_DOMAIN)
    #[arg(long)]
    pub cdn_domain: Option<String>,

    /// Disable redirects to the CDN regardless of environment
    #[arg(long)]
    pub no_redirect: bool,

    /// Disable the background cache monitor regardless of environment
    #[arg(long)]
    pub no_monitor: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("EDGE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("EDGE_RELAY_PORT", 18793u16)?;
        let env_db = env::var("EDGE_RELAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/edge_relay.db".into());

        let defaults = UpstreamConfig::default();
        let upstream = UpstreamConfig {
            api_base: env::var("EDGE_RELAY_UPSTREAM_API_BASE").unwrap_or(defaults.api_base),
            bot_token: env::var("EDGE_RELAY_BOT_TOKEN").unwrap_or_default(),
            fetch_timeout: env_secs("EDGE_RELAY_UPSTREAM_TIMEOUT", defaults.fetch_timeout)?,
            refresh_timeout: env_secs("EDGE_RELAY_REFRESH_TIMEOUT", defaults.refresh_timeout)?,
        };

        let mut cdn = cdn_from_env()?;
        if let Some(domain) = args.cdn_domain {
            cdn.domain = domain;
        }
        if args.no_redirect {
            cdn.redirect_enabled = false;
        }
        if args.no_monitor {
            cdn.monitor_enabled = false;
        }

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            upstream,
            cdn,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn cdn_from_env() -> Result<CdnConfig> {
    let d = CdnConfig::default();
    Ok(CdnConfig {
        enabled: env_flag("EDGE_RELAY_CDN_ENABLED", d.enabled)?,
        domain: env::var("EDGE_RELAY_CDN_DOMAIN")
            .map(|v| v.trim().to_string())
            .unwrap_or(d.domain),
        redirect_enabled: env_flag("EDGE_RELAY_CDN_REDIRECT_ENABLED", d.redirect_enabled)?,
        max_redirect_count: env_parse("EDGE_RELAY_CDN_REDIRECT_MAX_COUNT", d.max_redirect_count)?,
        redirect_cache_secs: env_parse("EDGE_RELAY_CDN_REDIRECT_CACHE_TIME", d.redirect_cache_secs)?,
        grace_window: env_secs("EDGE_RELAY_CDN_REDIRECT_DELAY", d.grace_window)?,
        cache_ttl_secs: env_parse("EDGE_RELAY_CDN_CACHE_TTL", d.cache_ttl_secs)?,
        edge_ttl_secs: env_parse("EDGE_RELAY_CDN_EDGE_TTL", d.edge_ttl_secs)?,
        warming_enabled: env_flag("EDGE_RELAY_CACHE_WARMING_ENABLED", d.warming_enabled)?,
        warming_delay: env_secs("EDGE_RELAY_CACHE_WARMING_DELAY", d.warming_delay)?,
        monitor_enabled: env_flag("EDGE_RELAY_CDN_MONITOR_ENABLED", d.monitor_enabled)?,
        monitor_interval: env_secs("EDGE_RELAY_CDN_MONITOR_INTERVAL", d.monitor_interval)?,
        monitor_max_retries: env_parse("EDGE_RELAY_CDN_MONITOR_MAX_RETRIES", d.monitor_max_retries)?,
        monitor_queue_size: env_parse("EDGE_RELAY_CDN_MONITOR_QUEUE_SIZE", d.monitor_queue_size)?,
        warm_recheck_delay: env_secs("EDGE_RELAY_CDN_WARM_RECHECK_DELAY", d.warm_recheck_delay)?,
        probe_timeout: env_secs("EDGE_RELAY_CDN_PROBE_TIMEOUT", d.probe_timeout)?,
        warm_timeout: env_secs("EDGE_RELAY_CDN_WARM_TIMEOUT", d.warm_timeout)?,
        restore_window: d.restore_window,
        restore_limit: d.restore_limit,
        shutdown_grace: d.shutdown_grace,
    })
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(value) => parse_flag(&value).with_context(|| format!("parsing {}", name)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got `{}`", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(parse_flag(" on ").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn cdn_needs_a_domain_to_be_active() {
        let mut cfg = CdnConfig::default();
        assert!(!cfg.is_active());
        cfg.domain = "img.example.com".into();
        assert!(cfg.is_active());
        assert_eq!(cfg.image_url("abc"), "https://img.example.com/image/abc");
        cfg.enabled = false;
        assert!(!cfg.is_active());
    }
}
