use std::time::Duration;

/// Configures retry eligibility, backoff and the overall deadline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryOptions {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Response status codes treated as transient.
    pub retryable_status_codes: Vec<u16>,
    /// Delay before the first retry; doubled for every following one.
    pub backoff_base: Duration,
    /// Upper bound on a single backoff delay. `None` means uncapped.
    pub max_backoff: Option<Duration>,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
    /// Overall budget for one logical request, measured from its first attempt.
    pub deadline: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retryable_status_codes: vec![502, 503, 504],
            backoff_base: Duration::from_secs(1),
            max_backoff: None,
            jitter: false,
            deadline: None,
        }
    }
}

impl RetryOptions {
    /// Reads overrides from environment variables.
    ///
    /// Reads:
    /// - `HTTP_RETRY_MAX_RETRIES`
    /// - `HTTP_RETRY_BACKOFF_MS`
    /// - `HTTP_RETRY_MAX_BACKOFF_MS`
    /// - `HTTP_RETRY_STATUS_CODES` (comma-separated, e.g. `502,503,504`)
    /// - `HTTP_RETRY_DEADLINE_MS`
    ///
    /// Unset variables keep their default. Returns an error if a variable is
    /// set but cannot be parsed.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        if let Some(value) = lookup("HTTP_RETRY_MAX_RETRIES") {
            opts.max_retries = parse_number("HTTP_RETRY_MAX_RETRIES", &value)? as usize;
        }
        if let Some(value) = lookup("HTTP_RETRY_BACKOFF_MS") {
            opts.backoff_base =
                Duration::from_millis(parse_number("HTTP_RETRY_BACKOFF_MS", &value)?);
        }
        if let Some(value) = lookup("HTTP_RETRY_MAX_BACKOFF_MS") {
            opts.max_backoff = Some(Duration::from_millis(parse_number(
                "HTTP_RETRY_MAX_BACKOFF_MS",
                &value,
            )?));
        }
        if let Some(value) = lookup("HTTP_RETRY_STATUS_CODES") {
            opts.retryable_status_codes = parse_status_codes(&value)?;
        }
        if let Some(value) = lookup("HTTP_RETRY_DEADLINE_MS") {
            opts.deadline = Some(Duration::from_millis(parse_number(
                "HTTP_RETRY_DEADLINE_MS",
                &value,
            )?));
        }

        Ok(opts)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, String> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|err| format!("{key} must be a non-negative integer, got '{value}': {err}"))
}

fn parse_status_codes(value: &str) -> Result<Vec<u16>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| match code.parse::<u16>() {
            Ok(status) if (100..=999).contains(&status) => Ok(status),
            _ => Err(format!(
                "HTTP_RETRY_STATUS_CODES contains invalid status code '{code}'"
            )),
        })
        .collect()
}
