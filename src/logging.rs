use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn setup_logging() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .compact(),
        )
        .with(env_filter)
        .init();

    Ok(())
}

/// Structured logging for a failover transition between bots.
#[macro_export]
macro_rules! log_failover_event {
    ($from_bot:expr, $to_bot:expr, $reason:expr) => {
        tracing::warn!(
            from_bot = $from_bot,
            to_bot = $to_bot,
            reason = $reason,
            event_type = "failover",
            "bot failover occurred"
        );
    };
}

/// Structured logging for a circuit breaker state transition.
#[macro_export]
macro_rules! log_circuit_transition {
    ($dependency:expr, $from:expr, $to:expr) => {
        tracing::warn!(
            dependency = $dependency,
            from_state = $from,
            to_state = $to,
            event_type = "circuit_breaker_transition",
            "circuit breaker state changed"
        );
    };
}
