use tracing_subscriber::EnvFilter;

pub mod admission;
pub mod align;
pub mod api;
pub mod audio;
pub mod audit;
pub mod batch;
pub mod config;
pub mod media;
pub mod pipeline;
pub mod regenerate;
pub mod srt;
pub mod steps;
pub mod store;
pub mod text;
pub mod truncation;
pub mod worker;

/// Installs the fmt subscriber used by both binaries. `RUST_LOG` wins over the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn logv(tag: &str, message: &str) {
    match tag {
        "WARN" => tracing::warn!("[{}] {}", tag, message),
        "ERROR" => tracing::error!("[{}] {}", tag, message),
        _ => tracing::info!("[{}] {}", tag, message),
    }
}

pub fn logi(message: impl AsRef<str>) {
    logv("INFO", message.as_ref());
}

pub fn logok(message: impl AsRef<str>) {
    logv("OK", message.as_ref());
}

pub fn logw(message: impl AsRef<str>) {
    logv("WARN", message.as_ref());
}

pub fn loge(message: impl AsRef<str>) {
    logv("ERROR", message.as_ref());
}

/// Cuts `input` to at most `max_chars` characters.
pub(crate) fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
