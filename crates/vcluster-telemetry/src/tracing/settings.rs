//! Settings of the individual log outputs.
use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
pub use tracing_appender::rolling::Rotation;

/// Level filtering shared by all outputs.
#[derive(Debug, PartialEq, Eq)]
pub struct Settings {
    /// Environment variable with `EnvFilter` directives. Overrides
    /// [`Self::default_level`] when set.
    pub environment_variable: &'static str,

    pub default_level: LevelFilter,
}

impl Settings {
    pub const fn new(environment_variable: &'static str, default_level: LevelFilter) -> Self {
        Self {
            environment_variable,
            default_level,
        }
    }

    /// Enables console output in the given format.
    pub fn console(self, log_format: Format) -> ConsoleLogSettings {
        ConsoleLogSettings::Enabled {
            common_settings: self,
            log_format,
        }
    }

    /// Starts the settings of file output into `directory`. Files are never
    /// rotated unless configured otherwise.
    pub fn file(
        self,
        directory: impl Into<PathBuf>,
        filename_suffix: impl Into<String>,
    ) -> FileLogSettingsBuilder {
        FileLogSettingsBuilder {
            common_settings: self,
            file_log_dir: directory.into(),
            rotation_period: Rotation::NEVER,
            filename_suffix: filename_suffix.into(),
            max_log_files: None,
        }
    }
}

/// Format of console output.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Format {
    /// Human readable, colored unless `NO_COLOR` is set.
    #[default]
    Plain,

    /// One JSON object per line.
    Json,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub enum ConsoleLogSettings {
    #[default]
    Disabled,

    Enabled {
        common_settings: Settings,
        log_format: Format,
    },
}

impl ConsoleLogSettings {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    pub fn is_disabled(&self) -> bool {
        !self.is_enabled()
    }
}

/// Plain console output filtered by the environment variable, falling back to
/// the level.
impl From<(&'static str, LevelFilter)> for ConsoleLogSettings {
    fn from((environment_variable, default_level): (&'static str, LevelFilter)) -> Self {
        Settings::new(environment_variable, default_level).console(Format::Plain)
    }
}

impl<T: Into<Self>> From<Option<T>> for ConsoleLogSettings {
    fn from(settings: Option<T>) -> Self {
        settings.map_or(Self::Disabled, Into::into)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub enum FileLogSettings {
    #[default]
    Disabled,

    Enabled {
        common_settings: Settings,
        file_log_dir: PathBuf,
        rotation_period: Rotation,
        filename_suffix: String,

        /// Older files are deleted once this many exist.
        max_log_files: Option<usize>,
    },
}

impl FileLogSettings {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    pub fn is_disabled(&self) -> bool {
        !self.is_enabled()
    }
}

impl<T: Into<Self>> From<Option<T>> for FileLogSettings {
    fn from(settings: Option<T>) -> Self {
        settings.map_or(Self::Disabled, Into::into)
    }
}

/// Created by [`Settings::file`].
pub struct FileLogSettingsBuilder {
    common_settings: Settings,
    file_log_dir: PathBuf,
    rotation_period: Rotation,
    filename_suffix: String,
    max_log_files: Option<usize>,
}

impl FileLogSettingsBuilder {
    pub fn rotation(mut self, rotation_period: impl Into<Rotation>) -> Self {
        self.rotation_period = rotation_period.into();
        self
    }

    pub fn max_files(mut self, max_log_files: impl Into<Option<usize>>) -> Self {
        self.max_log_files = max_log_files.into();
        self
    }

    pub fn build(self) -> FileLogSettings {
        FileLogSettings::Enabled {
            common_settings: self.common_settings,
            file_log_dir: self.file_log_dir,
            rotation_period: self.rotation_period,
            filename_suffix: self.filename_suffix,
            max_log_files: self.max_log_files,
        }
    }
}

impl From<FileLogSettingsBuilder> for FileLogSettings {
    fn from(builder: FileLogSettingsBuilder) -> Self {
        builder.build()
    }
}
