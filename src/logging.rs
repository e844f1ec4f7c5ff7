//! Logging setup
//!
//! Human-readable or JSON output on stderr, so stdout stays free for command
//! results. `RUST_LOG` takes precedence over the level chosen here.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "mcpconn=debug"
    } else {
        "mcpconn=info"
    }
}

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Returns error if the filter directive is invalid or a subscriber is
/// already installed.
///
/// # Examples
///
/// ```no_run
/// use mcpconn::logging::{default_directive, init_logging};
///
/// init_logging(default_directive(false), false).unwrap();
/// tracing::info!("ready");
/// ```
pub fn init_logging(directive: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directive))?;
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);
        registry.with(layer).try_init()?;
    }

    Ok(())
}
