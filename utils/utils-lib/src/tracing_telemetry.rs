use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Fmt Layer for console output.
pub enum FmtLayer {
    /// Output traces to stdout.
    Stdout,
    /// Output traces to stderr.
    Stderr,
    /// Don't output traces to console.
    None,
}

/// Tracing output style.
#[derive(Debug, Clone, Copy, strum_macros::EnumString, strum_macros::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum FmtStyle {
    /// Compact style.
    Compact,
    /// Pretty Style.
    Pretty,
    /// JSON Style.
    Json,
}

/// Builds the console tracing subscriber.
pub struct TracingTelemetry {
    writer: FmtLayer,
    style: FmtStyle,
    colours: bool,
    default_filter: String,
}

impl TracingTelemetry {
    /// Tracing telemetry default builder.
    pub fn builder() -> Self {
        Self {
            writer: FmtLayer::Stdout,
            style: FmtStyle::Pretty,
            colours: true,
            default_filter: "info".to_string(),
        }
    }
    /// Specify writer stream.
    pub fn with_writer(self, writer: FmtLayer) -> TracingTelemetry {
        TracingTelemetry { writer, ..self }
    }
    /// Specify style.
    pub fn with_style(self, style: FmtStyle) -> TracingTelemetry {
        TracingTelemetry { style, ..self }
    }
    /// Specify whether colour is needed or not.
    pub fn with_colours(self, colours: bool) -> TracingTelemetry {
        TracingTelemetry { colours, ..self }
    }
    /// Filter directives used when `RUST_LOG` is not set.
    pub fn with_default_filter(self, default_filter: &str) -> TracingTelemetry {
        TracingTelemetry {
            default_filter: default_filter.to_string(),
            ..self
        }
    }

    /// Initialise the global subscriber.
    /// The service name is recorded once at startup so multi-binary log streams can be told apart.
    pub fn init(self, service_name: &str) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));
        let subscriber = Registry::default().with(filter);

        let stdout = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(self.colours);
        let stderr = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(self.colours);

        match (self.writer, self.style) {
            (FmtLayer::Stderr, FmtStyle::Compact) => subscriber.with(stderr.compact()).init(),
            (FmtLayer::Stdout, FmtStyle::Compact) => subscriber.with(stdout.compact()).init(),
            (FmtLayer::Stderr, FmtStyle::Pretty) => subscriber.with(stderr.pretty()).init(),
            (FmtLayer::Stdout, FmtStyle::Pretty) => subscriber.with(stdout.pretty()).init(),
            (FmtLayer::Stdout, FmtStyle::Json) => subscriber.with(stdout.json()).init(),
            (FmtLayer::Stderr, FmtStyle::Json) => subscriber.with(stderr.json()).init(),
            (FmtLayer::None, _) => subscriber.init(),
        };
        tracing::info!(service = service_name, "Tracing initialised");
    }
}

/// Initialise tracing with the given style, writing to stdout.
pub fn init_tracing(service_name: &str, style: FmtStyle) {
    TracingTelemetry::builder()
        .with_style(style)
        .with_colours(!matches!(style, FmtStyle::Json))
        .init(service_name);
}
