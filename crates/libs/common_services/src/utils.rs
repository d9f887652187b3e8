use app_state::WorkerSettings;

/// Generate a URL-safe random ID of a given length.
#[must_use]
pub fn nice_id(length: usize) -> String {
    const URL_SAFE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_";
    (0..length)
        .map(|_| {
            let idx = rand::random_range(0..URL_SAFE.len());
            URL_SAFE[idx] as char
        })
        .collect()
}

/// The identifier this machine writes into `claimed_by` and `source_machine`.
///
/// Uses the configured id, then the host name, then a random id.
#[must_use]
pub fn machine_id(settings: &WorkerSettings) -> String {
    settings
        .machine_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| format!("machine-{}", nice_id(8)))
}

/// Logs a warning message with an 'ALERT:' prefix.
#[macro_export]
macro_rules! alert {
    ($($arg:tt)*) => {
        ::tracing::warn!("ALERT: {}", format_args!($($arg)*));
    };
}
