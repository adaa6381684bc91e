//! Upper bound on how long a rollout waits for the container to report healthy.

use anyhow::Result;
use std::time::Duration;

use super::types::{Healthcheck, HealthcheckConfig, Retries};
use crate::error::ProvisionError;
use crate::validation::parse_duration;

/// Docker's documented defaults.
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_START_PERIOD: &str = "5s";
const DEFAULT_INTERVAL: &str = "30s";

/// Added so the wait never races the last health probe.
pub const BUFFER: Duration = Duration::from_secs(1);

fn retries(check: &Healthcheck, service: &str) -> Result<u32> {
    match &check.retries {
        None => Ok(DEFAULT_RETRIES),
        Some(Retries::Count(n)) => Ok(*n),
        Some(Retries::Text(text)) => text.trim().parse().map_err(|_| {
            ProvisionError::invalid_service(
                service,
                format!("healthcheck.retries must be an integer: {}", text),
            )
            .into()
        }),
    }
}

fn duration_field(value: Option<&String>, default: &str, field: &str, service: &str) -> Result<Duration> {
    let text = value.map(String::as_str).unwrap_or(default);
    parse_duration(text).map_err(|_| {
        ProvisionError::invalid_service(
            service,
            format!("healthcheck.{} must be a valid duration: {}", field, text),
        )
        .into()
    })
}

/// Seconds to pass to `--wait-timeout`, or `None` when the service has no shell to probe.
///
/// `start_period + retries * interval + BUFFER`, rounded up.
pub fn max_wait_seconds(health: &HealthcheckConfig, service: &str) -> Result<Option<u64>> {
    let check = match health {
        HealthcheckConfig::NoShell => return Ok(None),
        HealthcheckConfig::Check(check) => check,
    };
    let retries = retries(check, service)?;
    let start = duration_field(check.start_period.as_ref(), DEFAULT_START_PERIOD, "start_period", service)?;
    let interval = duration_field(check.interval.as_ref(), DEFAULT_INTERVAL, "interval", service)?;

    let total = interval
        .checked_mul(retries)
        .and_then(|d| d.checked_add(start))
        .and_then(|d| d.checked_add(BUFFER))
        .ok_or_else(|| ProvisionError::invalid_service(service, "healthcheck wait overflows"))?;

    let mut seconds = total.as_secs();
    if total.subsec_nanos() > 0 {
        seconds += 1;
    }
    Ok(Some(seconds))
}
