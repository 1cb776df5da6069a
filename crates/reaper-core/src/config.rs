use crate::error::AppError;

/// Environment variable holding the number of execution slots.
pub const SLOTS_ENV: &str = "REAPER_SLOTS";

/// Configuration for a job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of jobs that may run at the same time. 1 means strictly sequential.
    pub slots: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { slots: 1 }
    }
}

impl QueueConfig {
    /// Read configuration from environment variables.
    ///
    /// - `REAPER_SLOTS` (optional, defaults to 1)
    pub fn from_env() -> Result<Self, AppError> {
        match std::env::var(SLOTS_ENV) {
            Err(_) => Ok(Self::default()),
            Ok(raw) => Ok(Self {
                slots: parse_slots(&raw)?,
            }),
        }
    }

    /// Set the slot count; values below 1 are raised to 1.
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots.max(1);
        self
    }
}

fn parse_slots(raw: &str) -> Result<usize, AppError> {
    let parsed: usize = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!(
            "Invalid {SLOTS_ENV} '{raw}': must be a positive integer"
        ))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!(
            "{SLOTS_ENV} must be at least 1"
        )));
    }
    Ok(parsed)
}
