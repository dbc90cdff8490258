use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use reqwest::Url;

use killfeed_engine::EngineConfig;

const DEFAULT_SUMMARY_URL: &str = "https://zkillboard.com/";
const DEFAULT_DETAIL_URL: &str = "https://esi.evetech.net/";
const DEFAULT_USER_AGENT: &str = "killfeed kill tracker - github.com/killfeed/killfeed";

fn default_summary_url() -> Url {
    Url::parse(DEFAULT_SUMMARY_URL).expect("DEFAULT_SUMMARY_URL must be a valid URL")
}

fn default_detail_url() -> Url {
    Url::parse(DEFAULT_DETAIL_URL).expect("DEFAULT_DETAIL_URL must be a valid URL")
}

fn parse_epoch(input: &str) -> Result<DateTime<Utc>, String> {
    let s = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Bare dates are taken as midnight UTC (e.g. "2003-05-06").
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(DateTime::from_naive_utc_and_offset(
            date.and_hms_opt(0, 0, 0).ok_or_else(|| format!("invalid date: {input:?}"))?,
            Utc,
        ));
    }
    Err(format!("invalid timestamp: {input:?} (want RFC 3339 or YYYY-MM-DD)"))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "killfeed", version, about = "Killmail ingestion service")]
pub struct Cli {
    /// Base URL of the summary source (paginated killmail listings).
    #[arg(long, env = "KILLFEED_SUMMARY_URL", default_value_t = default_summary_url())]
    pub summary_url: Url,

    /// Base URL of the detail source (authoritative killmail records).
    #[arg(long, env = "KILLFEED_DETAIL_URL", default_value_t = default_detail_url())]
    pub detail_url: Url,

    /// User-Agent sent on every upstream request.
    #[arg(long, env = "KILLFEED_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Number of ingestion workers draining the job queue.
    #[arg(
        short = 'w',
        long,
        env = "KILLFEED_WORKERS",
        default_value_t = EngineConfig::DEFAULT_WORKERS as u16,
        value_parser = clap::value_parser!(u16).range(1..=64)
    )]
    pub workers: u16,

    /// Job-queue capacity; enqueues past it are dropped until the next tick.
    #[arg(
        long,
        env = "KILLFEED_QUEUE_CAPACITY",
        default_value_t = EngineConfig::DEFAULT_QUEUE_CAPACITY as u32,
        value_parser = clap::value_parser!(u32).range(1..=1000)
    )]
    pub queue_capacity: u32,

    /// Minutes between roster-wide scheduling passes.
    #[arg(
        long = "tick-minutes",
        env = "KILLFEED_TICK_MINUTES",
        default_value_t = 60,
        value_parser = clap::value_parser!(u32).range(1..=1440)
    )]
    pub tick_minutes: u32,

    /// Concurrent detail fetches per job.
    #[arg(
        short = 'k',
        long,
        env = "KILLFEED_ENRICH_CONCURRENCY",
        default_value_t = EngineConfig::DEFAULT_ENRICH_CONCURRENCY as u16,
        value_parser = clap::value_parser!(u16).range(1..=64)
    )]
    pub enrich_concurrency: u16,

    /// Kill rows per store upsert batch.
    #[arg(
        long,
        env = "KILLFEED_BATCH_SIZE",
        default_value_t = EngineConfig::DEFAULT_BATCH_SIZE as u32,
        value_parser = clap::value_parser!(u32).range(1..=1000)
    )]
    pub batch_size: u32,

    /// Milliseconds slept between summary pages within a job.
    #[arg(long, env = "KILLFEED_PAGE_STAGGER_MS", default_value_t = 500)]
    pub page_stagger_ms: u64,

    /// Lower time bound for initial ingestion (RFC 3339 or YYYY-MM-DD).
    #[arg(
        long,
        env = "KILLFEED_INITIAL_EPOCH",
        default_value = "2003-05-06",
        value_parser = parse_epoch
    )]
    pub initial_epoch: DateTime<Utc>,
}

impl Cli {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers as usize,
            queue_capacity: self.queue_capacity as usize,
            tick_interval: Duration::from_secs(self.tick_minutes as u64 * 60),
            enrich_concurrency: self.enrich_concurrency as usize,
            batch_size: self.batch_size as usize,
            page_stagger: Duration::from_millis(self.page_stagger_ms),
            initial_epoch: self.initial_epoch,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn epoch_accepts_rfc3339_and_bare_dates() {
        assert_eq!(
            parse_epoch("2003-05-06").unwrap(),
            Utc.with_ymd_and_hms(2003, 5, 6, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_epoch("2024-01-01T12:30:00Z").unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap()
        );
        assert!(parse_epoch("yesterday").is_err());
    }
}
