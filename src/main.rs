use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use dotenvy::dotenv;
use regex::Regex;
use sentinel_bot::config::Settings;
use sentinel_bot::session::SessionTouchHandler;
use sentinel_bot::store::RedisStore;
use sentinel_bot::transport::TelegramTransport;
use sentinel_bot::Orchestrator;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    bot_token: Regex,
    bot_url_token: Regex,
    redis_password: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            bot_token: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            bot_url_token: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            redis_password: Regex::new(r"(rediss?://[^:@/\s]*):[^@/\s]+@")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .bot_token
            .replace_all(&output, "[BOT_TOKEN]")
            .to_string();
        output = self
            .bot_url_token
            .replace_all(&output, "$1[BOT_TOKEN]")
            .to_string();
        output = self
            .redis_password
            .replace_all(&output, "$1:[MASKED]@")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // We return the original buffer length to satisfy the contract,
        // even if the redacted string length differs.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = match RedactionPatterns::new() {
        Ok(patterns) => Arc::new(patterns),
        Err(err) => {
            eprintln!("Failed to compile regex patterns: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Setup logging with redaction
    init_logging(patterns);

    info!("Starting sentinel-bot...");

    let settings = match Settings::new().and_then(|settings| {
        settings.validate()?;
        Ok(settings)
    }) {
        Ok(settings) => Arc::new(settings),
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let store = match RedisStore::connect(&settings.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("state store connection failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let transport = Arc::new(TelegramTransport::new(&settings.bot_token));
    let handler = Arc::new(SessionTouchHandler::new(store.clone()));

    let orchestrator = Orchestrator::new(settings, store, transport, handler);
    match orchestrator.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}
