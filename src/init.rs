use crate::config::{self, ConfigError, FormatKind, HandlerSpec, LoggerSpec, LoggingConfiguration};
use crate::env::{Settings, DEFAULT_APP_LEVEL};
use crate::formatter::ROOT_LOGGER;
use crate::layer::ContextLayer;
use crate::sink::LogSink;
use crate::timer::ScopedTimer;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Child of [`ROOT_LOGGER`] the application logs under.
pub const APP_LOGGER_SUFFIX: &str = "app";

/// Error type returned by [`init_logging`].
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Named logger for application code.
///
/// Pass its name as the `logger` field of a `tracing` event to log under it:
///
/// ```ignore
/// tracing::info!(logger = app.name(), order_id = 42, "order placed");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLogger {
    name: String,
}

impl AppLogger {
    pub fn new(name: impl Into<String>) -> Self {
        AppLogger { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn child(&self, suffix: &str) -> AppLogger {
        AppLogger::new(format!("{}.{}", self.name, suffix))
    }

    /// Timer reporting under `<app>.timer.<namespace>`.
    pub fn timer(&self, namespace: &str, threshold_secs: f64) -> ScopedTimer {
        ScopedTimer::new(&self.name, namespace, threshold_secs)
    }
}

impl Default for AppLogger {
    fn default() -> Self {
        AppLogger::new(format!("{}.{}", ROOT_LOGGER, APP_LOGGER_SUFFIX))
    }
}

/// Fold the startup settings into a loaded configuration.
///
/// - the application logger gets `settings.app_level` when it is set, and
///   [`DEFAULT_APP_LEVEL`] only if no document gave it a level;
/// - formatters without their own traceback limit use `settings.traceback_limit`;
/// - `settings.pretty_json` switches JSON formatters to pretty output.
pub fn apply_settings(config: &mut LoggingConfiguration, settings: &Settings, app: &AppLogger) {
    let app_spec = config
        .loggers
        .entry(app.name().to_string())
        .or_insert_with(|| LoggerSpec::with_level(DEFAULT_APP_LEVEL));
    match settings.app_level {
        Some(level) => app_spec.level = Some(level),
        None => {
            app_spec.level.get_or_insert(DEFAULT_APP_LEVEL);
        }
    }

    for spec in config.formatters.values_mut() {
        if spec.traceback_limit.is_none() {
            spec.traceback_limit = Some(settings.traceback_limit);
        }
        if settings.pretty_json && spec.format == FormatKind::Json {
            spec.pretty = Some(true);
        }
    }
}

/// Load configuration per `settings` and build the layer without installing it.
pub fn build_layer(settings: &Settings) -> Result<(ContextLayer, AppLogger), ConfigError> {
    build_layer_with_sinks(settings, |_, spec| crate::sink::make_sink(spec))
}

/// Like [`build_layer`], obtaining each handler's sink from `sink_for`.
pub fn build_layer_with_sinks<F>(settings: &Settings, sink_for: F) -> Result<(ContextLayer, AppLogger), ConfigError>
where
    F: Fn(&str, &HandlerSpec) -> Result<Arc<dyn LogSink>, ConfigError>,
{
    let mut config = config::load(settings.config_filename.as_deref(), settings.file_type)?;
    let app = AppLogger::default();
    apply_settings(&mut config, settings, &app);
    let layer = ContextLayer::with_sinks(&config, sink_for)?;
    Ok((layer, app))
}

/// Initialize the global `tracing` subscriber from `settings`.
///
/// **Effects**
///
/// Installs a [`Registry`] combined with [`ContextLayer`] as the global
/// default subscriber, so every `tracing` event in the process is rendered
/// by the configured handlers.
///
/// **Errors**
/// - [`InitError::Config`] if the configuration cannot be loaded; the
///   application should abort startup.
/// - [`InitError::AlreadyInstalled`] if another subscriber was set first.
pub fn init_logging(settings: &Settings) -> Result<AppLogger, InitError> {
    let (layer, app) = build_layer(settings)?;
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(app)
}

/// [`init_logging`] with settings read from the environment.
pub fn init_from_env() -> Result<AppLogger, InitError> {
    init_logging(&Settings::from_env()?)
}
