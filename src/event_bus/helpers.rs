use std::time::Duration;

use iggy::prelude::{Identifier, IggyError};
use rand::Rng;

use crate::error::AppError;

/// Jitter applied to reconnect delays (±20%).
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Floor for any reconnect delay.
const MIN_RECONNECT_DELAY_MS: u64 = 100;

/// Convert a stream, topic or consumer name to an Iggy identifier.
pub fn to_identifier(name: &str, kind: &str) -> Result<Identifier, AppError> {
    name.try_into().map_err(|e: IggyError| {
        tracing::debug!(kind, name, original_error = %e, "Identifier conversion failed");
        AppError::ConfigError(format!(
            "Invalid {kind} name '{name}': must be 1-255 characters, alphanumeric with dots, \
             underscores, or hyphens"
        ))
    })
}

/// Name of the durable Iggy consumer behind one binding, e.g.
/// `search-service-post-created`.
pub fn consumer_name(service: &str, routing_key: &str) -> String {
    format!("{service}-{}", routing_key.replace('.', "-"))
}

/// Exponential backoff for the `attempt`-th reconnect (1-based), capped at
/// `max` and jittered.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(max.as_millis() as u64);

    let jitter = (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
    let jittered = (delay_ms as i64).saturating_add(jitter);

    Duration::from_millis(jittered.max(MIN_RECONNECT_DELAY_MS as i64) as u64)
}

fn rand_jitter() -> f64 {
    rand::rng().random::<f64>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_keys_are_valid_topic_names() {
        assert!(to_identifier("post.created", "topic").is_ok());
        assert!(to_identifier("post.deleted", "topic").is_ok());
        assert!(to_identifier("facebook_events", "stream").is_ok());
    }

    #[test]
    fn test_invalid_identifier() {
        let err = to_identifier("", "stream").unwrap_err();
        assert!(err.to_string().contains("Invalid stream name"));
        assert!(to_identifier(&"a".repeat(300), "topic").is_err());
    }

    #[test]
    fn test_consumer_name() {
        assert_eq!(
            consumer_name("search-service", "post.created"),
            "search-service-post-created"
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(8000);

        for _ in 0..50 {
            let first = backoff_delay(1, base, max);
            assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));

            let third = backoff_delay(3, base, max);
            assert!(third >= Duration::from_millis(3200) && third <= Duration::from_millis(4800));

            let capped = backoff_delay(30, base, max);
            assert!(capped <= Duration::from_millis(9600));
        }
    }

    #[test]
    fn test_backoff_has_floor() {
        let delay = backoff_delay(1, Duration::ZERO, Duration::ZERO);
        assert_eq!(delay, Duration::from_millis(MIN_RECONNECT_DELAY_MS));
    }
}
