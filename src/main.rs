use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::policy_store::{MemoryPolicyRepository, PolicyReloader, PolicyRepository};
use gatekeeper::ratelimit::{
    Admission, AuthenticatedUser, ClientClassifier, ClientIp, IdentityResolver, RateLimiter, SystemClock,
    ThrottlePolicy,
};
use gatekeeper::store;
use gatekeeper::throttle_log::TracingThrottleLogger;

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "In-process API throttling")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse a policy file and report problems
    Validate {
        /// Policy file to check
        policy: String,
    },
    /// Run a burst of requests through the rate limiter
    Simulate {
        /// Policy file, overrides limiter.policy_path
        #[arg(long)]
        policy: Option<String>,

        /// Client IP address
        #[arg(long)]
        ip: Option<IpAddr>,

        /// Request path
        #[arg(long, default_value = "/")]
        endpoint: String,

        /// Client type, overrides the default classifier
        #[arg(long)]
        client_key: Option<String>,

        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: u64,

        /// Delay between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Start outside the startup grace window
        #[arg(long)]
        skip_grace: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatekeeperConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Validate { policy } => validate(&policy),
        Command::Simulate {
            policy,
            ip,
            endpoint,
            client_key,
            user,
            requests,
            interval_ms,
            skip_grace,
        } => {
            let request = SimulatedRequest {
                ip,
                endpoint,
                client_key,
                user,
            };
            tokio::select! {
                result = simulate(&config, policy, request, requests, Duration::from_millis(interval_ms), skip_grace) => result,
                _ = shutdown_signal() => Ok(()),
            }
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn validate(path: &str) -> anyhow::Result<()> {
    let policy = ThrottlePolicy::from_file(path).with_context(|| format!("Invalid policy file {}", path))?;
    let dimensions = policy.dimensions();

    println!("policy: {}", path);
    println!(
        "dimensions: ip={} client={} user={} endpoint={}",
        dimensions.ip, dimensions.client, dimensions.user, dimensions.endpoint
    );
    for (period, limit) in policy.rates_with_defaults() {
        if limit > 0 {
            println!("rate: {} per {}", limit, period);
        }
    }

    let problems = policy.lint();
    for problem in &problems {
        println!("warning: {}", problem);
    }
    if problems.is_empty() {
        println!("ok");
    }

    Ok(())
}

struct SimulatedRequest {
    ip: Option<IpAddr>,
    endpoint: String,
    client_key: Option<String>,
    user: Option<String>,
}

impl SimulatedRequest {
    fn to_http(&self) -> anyhow::Result<http::Request<()>> {
        let mut request = http::Request::builder()
            .uri(self.endpoint.as_str())
            .body(())
            .context("Invalid endpoint")?;

        if let Some(ip) = self.ip {
            request.extensions_mut().insert(ClientIp(ip));
        }
        if let Some(user) = &self.user {
            request.extensions_mut().insert(AuthenticatedUser::new(user.clone()));
        }

        Ok(request)
    }
}

async fn simulate(
    config: &GatekeeperConfig,
    policy_path: Option<String>,
    request: SimulatedRequest,
    requests: u64,
    interval: Duration,
    skip_grace: bool,
) -> anyhow::Result<()> {
    let limiter_config = &config.limiter;
    let policy_path = policy_path
        .or_else(|| limiter_config.policy_path.clone())
        .context("No policy given, pass --policy or set limiter.policy_path")?;

    let policy = ThrottlePolicy::from_file(&policy_path)?;
    let repository: Arc<dyn PolicyRepository> = Arc::new(MemoryPolicyRepository::new());
    repository.save(&limiter_config.policy_key, policy);

    let reloader = (limiter_config.policy_reload_interval_secs > 0).then(|| {
        PolicyReloader::new(
            &policy_path,
            limiter_config.policy_key.clone(),
            Duration::from_secs(limiter_config.policy_reload_interval_secs),
            repository.clone(),
        )
        .spawn()
    });

    let clock = Arc::new(SystemClock::new());
    let counter_store = store::from_config(&config.store, clock.clone()).await?;

    let grace_period = if skip_grace {
        Duration::ZERO
    } else {
        Duration::from_secs(limiter_config.grace_period_secs)
    };

    let limiter = RateLimiter::builder()
        .store(counter_store)
        .policy_repository(repository, limiter_config.policy_key.clone())
        .clock(clock)
        .grace_period(grace_period)
        .namespace(limiter_config.namespace.clone())
        .counting_mode(limiter_config.counting_mode)
        .logger(Arc::new(TracingThrottleLogger))
        .build();
    info!(?limiter, "Rate limiter initialized");

    let resolver = match &request.client_key {
        Some(client_key) => {
            let client_key = client_key.clone();
            IdentityResolver::new(ClientClassifier::new(move |_, _| client_key.clone()))
        }
        None => IdentityResolver::default(),
    }
    .trust_forwarded_headers(limiter_config.trust_forwarded_headers);

    let identity = resolver.resolve(&request.to_http()?);
    info!(?identity, requests, "Starting simulation");

    let mut denied = 0;
    for n in 1..=requests {
        match limiter.check(&identity).await {
            Admission::Allow => println!("#{:<4} allow", n),
            Admission::Deny(decision) => {
                denied += 1;
                let response = config.response.to_response(&decision);
                println!(
                    "#{:<4} {} retry-after={}s {}",
                    n,
                    response.status().as_u16(),
                    decision.retry_after,
                    response.body()
                );
            }
        }

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    println!("{} allowed, {} denied", requests - denied, denied);

    if let Some(handle) = reloader {
        handle.abort();
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
