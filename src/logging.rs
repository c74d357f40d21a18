use crate::utils::truncate_str;
use crate::{Metadata, OgieError};
use std::io;
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt as subscriber_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

const LOG_FILE_NAME: &str = "ogie.log";

#[derive(Debug)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub console_output: bool,
    pub file_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".into(),
            log_level: "info".into(),
            console_output: true,
            file_output: false,
        }
    }
}

fn create_separator(width: usize, ch: char) -> String {
    std::iter::repeat_n(ch, width).collect()
}

fn wrap_text(text: &str, width: usize) -> String {
    let mut wrapped = String::new();
    let mut line_length = 0;

    for word in text.split_whitespace() {
        if line_length + word.len() + 1 > width {
            wrapped.push('\n');
            wrapped.push_str("  ");
            wrapped.push_str(word);
            line_length = word.len() + 2;
        } else {
            if line_length > 0 {
                wrapped.push(' ');
                line_length += 1;
            }
            wrapped.push_str(word);
            line_length += word.len();
        }
    }
    wrapped
}

/// Logs a boxed summary of extracted metadata at info level.
pub fn log_metadata_card(metadata: &Metadata, url: &str) {
    const CARD_WIDTH: usize = 80;
    const CONTENT_WIDTH: usize = CARD_WIDTH - 2;

    let og = &metadata.open_graph;
    let title = og.title.as_deref().or(metadata.basic.title.as_deref());
    let description = og
        .description
        .as_deref()
        .or(metadata.basic.description.as_deref());
    let image = og.images.first().map(|image| image.url.as_str());

    let horizontal_line = "═".repeat(CARD_WIDTH - 2);

    info!(
        "\n╔{}╗\n\
         URL: {}\n\
         Title: {}\n\
         Desc: {}\n\
         Image: {}\n\
         Site: {}\n\
         JSON-LD: {} item(s), feeds: {}\n\
         ╚{}╝",
        horizontal_line,
        wrap_text(url, CONTENT_WIDTH - 5),
        wrap_text(title.unwrap_or("N/A"), CONTENT_WIDTH - 7),
        wrap_text(description.unwrap_or("N/A"), CONTENT_WIDTH - 6),
        wrap_text(image.unwrap_or("N/A"), CONTENT_WIDTH - 7),
        wrap_text(og.site_name.as_deref().unwrap_or("N/A"), CONTENT_WIDTH - 6),
        metadata.json_ld.len(),
        metadata.feeds.len(),
        horizontal_line,
    );
}

pub fn log_error_card(url: &str, error: &OgieError) {
    const CARD_WIDTH: usize = 70;
    const CONTENT_WIDTH: usize = CARD_WIDTH - 8;

    let top_bottom = create_separator(CARD_WIDTH - 2, '═');
    let middle = create_separator(CARD_WIDTH - 2, '─');
    let details = format!("[{}] {}", error.code(), error);

    error!(
        "\n╔═{}═╗\n\
         ║ URL: {:<width$} ║\n\
         ║{}║\n\
         ║ Error: {:<width$} ║\n\
         ╚═{}═╝",
        top_bottom,
        truncate_str(url, CONTENT_WIDTH),
        middle,
        truncate_str(&details, CONTENT_WIDTH),
        top_bottom,
        width = CONTENT_WIDTH
    );
}

/// Installs the global subscriber. Fails if the log directory cannot be
/// created or a global subscriber is already set.
pub fn setup_logging(config: LogConfig) -> io::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let mut layers = Vec::new();

    if config.console_output {
        let console_layer = subscriber_fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            .with_span_events(subscriber_fmt::format::FmtSpan::CLOSE)
            .pretty();
        layers.push(console_layer.boxed());
    }

    if config.file_output {
        std::fs::create_dir_all(&config.log_dir)?;

        let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, LOG_FILE_NAME);

        let file_layer = subscriber_fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            .with_writer(file_appender);

        layers.push(file_layer.boxed());
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| io::Error::other(format!("failed to set global subscriber: {e}")))?;

    debug!("Logging system initialized with config: {:?}", config);
    Ok(())
}

/// Scoped subscriber with a fixed filter, restored when dropped.
pub struct LogLevelGuard {
    _guard: tracing::dispatcher::DefaultGuard,
}

impl LogLevelGuard {
    pub fn set_level(level: &str) -> Self {
        let filter = EnvFilter::new(level);
        let subscriber = tracing_subscriber::registry()
            .with(subscriber_fmt::layer().with_test_writer())
            .with(filter);

        LogLevelGuard {
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }
}
