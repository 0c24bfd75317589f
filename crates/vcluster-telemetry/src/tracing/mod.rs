//! Sets up the global tracing subscriber of the proxy.
//!
//! Two outputs are supported, each with its own level filter: human readable
//! or JSON events on stdout, and JSON events written to a rolling file.
use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt as _};

use crate::tracing::settings::{ConsoleLogSettings, FileLogSettings, Format, Rotation, Settings};

pub mod settings;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create log file appender in {directory:?}"))]
    CreateFileAppender {
        source: rolling::InitError,
        directory: PathBuf,
    },

    #[snafu(display("a global tracing subscriber is already installed"))]
    InstallSubscriber { source: SetGlobalDefaultError },
}

/// Log outputs of a service.
///
/// Build it with [`Tracing::new`] or [`Tracing::pre_configured`], then
/// install it with [`Tracing::init`]. The returned value is a guard, keep it
/// alive until the service exits.
///
/// ```
/// use tracing::level_filters::LevelFilter;
/// use vcluster_telemetry::tracing::{Error, Tracing};
///
/// fn main() -> Result<(), Error> {
///     let _tracing = Tracing::new("example")
///         .with_console_output(("EXAMPLE_LOG", LevelFilter::DEBUG))
///         .init()?;
///
///     tracing::debug!("tracing is ready");
///     Ok(())
/// }
/// ```
pub struct Tracing {
    service_name: &'static str,
    console_log_settings: ConsoleLogSettings,
    file_log_settings: FileLogSettings,
}

impl Tracing {
    /// Overrides the level filter of console output, for example
    /// `CONSOLE_LOG_LEVEL=vcluster_filters=debug,info`.
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";

    /// Overrides the level filter of file output.
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";

    /// Log files are named `<service>.<timestamp>.tracing-rs.json`.
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";

    /// Creates a [`Tracing`] without any output. `service_name` prefixes the
    /// names of log files.
    pub fn new(service_name: &'static str) -> Self {
        Self {
            service_name,
            console_log_settings: ConsoleLogSettings::Disabled,
            file_log_settings: FileLogSettings::Disabled,
        }
    }

    /// Creates a [`Tracing`] from command line options.
    ///
    /// Console output is enabled unless disabled explicitly, file output only
    /// if a directory is given. Both default to the `INFO` level.
    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        let console = (!options.console_log_disabled).then(|| {
            Settings::new(Self::CONSOLE_LOG_LEVEL, LevelFilter::INFO)
                .console(options.console_log_format)
        });

        let file = options.file_log_directory.map(|directory| {
            Settings::new(Self::FILE_LOG_LEVEL, LevelFilter::INFO)
                .file(directory, Self::FILE_LOG_SUFFIX)
                .rotation(options.file_log_rotation_period.unwrap_or_default())
                .max_files(options.file_log_max_files)
        });

        Self::new(service_name)
            .with_console_output(console)
            .with_file_output(file)
    }

    /// Sets the console output, replacing earlier settings.
    pub fn with_console_output(mut self, settings: impl Into<ConsoleLogSettings>) -> Self {
        self.console_log_settings = settings.into();
        self
    }

    /// Sets the rolling file output, replacing earlier settings.
    pub fn with_file_output(mut self, settings: impl Into<FileLogSettings>) -> Self {
        self.file_log_settings = settings.into();
        self
    }

    /// Installs the configured outputs as the global default subscriber.
    ///
    /// Nothing is installed if all outputs are disabled. Bind the result to a
    /// named variable, `let _ = ...` drops the guard right away.
    pub fn init(self) -> Result<Self, Error> {
        let console = console_layer(&self.console_log_settings);
        let file = file_layer(self.service_name, &self.file_log_settings)?;
        let layers: Vec<BoxedLayer> = console.into_iter().chain(file).collect();

        if !layers.is_empty() {
            let subscriber = tracing_subscriber::registry().with(layers);
            tracing::subscriber::set_global_default(subscriber).context(InstallSubscriberSnafu)?;
        }

        Ok(self)
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        tracing::debug!(
            service.name = self.service_name,
            console_log.enabled = self.console_log_settings.is_enabled(),
            file_log.enabled = self.file_log_settings.is_enabled(),
            "shutting down tracing"
        );
    }
}

fn console_layer(settings: &ConsoleLogSettings) -> Option<BoxedLayer> {
    let ConsoleLogSettings::Enabled {
        common_settings,
        log_format,
    } = settings
    else {
        return None;
    };

    let filter = level_filter(common_settings);
    let layer = match log_format {
        Format::Plain => tracing_subscriber::fmt::layer().with_filter(filter).boxed(),
        Format::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed(),
    };

    Some(layer)
}

fn file_layer(
    service_name: &str,
    settings: &FileLogSettings,
) -> Result<Option<BoxedLayer>, Error> {
    let FileLogSettings::Enabled {
        common_settings,
        file_log_dir,
        rotation_period,
        filename_suffix,
        max_log_files,
    } = settings
    else {
        return Ok(None);
    };

    let mut appender = RollingFileAppender::builder()
        .rotation(rotation_period.clone())
        .filename_prefix(service_name)
        .filename_suffix(filename_suffix);
    if let Some(max_log_files) = max_log_files {
        appender = appender.max_log_files(*max_log_files);
    }

    let appender = appender
        .build(file_log_dir)
        .with_context(|_| CreateFileAppenderSnafu {
            directory: file_log_dir.clone(),
        })?;

    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(appender)
        .with_filter(level_filter(common_settings))
        .boxed();

    Ok(Some(layer))
}

/// The level filter of an output. Directives in the environment variable take
/// precedence over the default level.
fn level_filter(settings: &Settings) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(settings.environment_variable)
        .with_default_directive(settings.default_level.into())
        .from_env_lossy()
}

/// Logging options of the command line.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[cfg_attr(feature = "clap", command(next_help_heading = "Logging Options"))]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Do not write logs to stdout.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Format of logs written to stdout.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "FORMAT", default_value_t = Format::Plain)
    )]
    pub console_log_format: Format,

    /// Write JSON logs into DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", group = "file_log")
    )]
    pub file_log_directory: Option<PathBuf>,

    /// How often a new log file is started.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "PERIOD", requires = "file_log")
    )]
    pub file_log_rotation_period: Option<RotationPeriod>,

    /// Delete the oldest log files once more than COUNT exist.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "COUNT", requires = "file_log")
    )]
    pub file_log_max_files: Option<usize>,
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(period: RotationPeriod) -> Self {
        match period {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}
