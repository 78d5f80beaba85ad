use std::path::PathBuf;

/// Storage configuration shared by the directory service and its tools.
///
/// Parsed from command-line arguments, then passed to storage initialization.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Directory holding the service's local state.
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite database holding the relational mirror and the
    /// delegations. Defaults to `{data_dir}/directory.sqlite`.
    pub sqlite_path: Option<PathBuf>,
}

impl ServiceConfig {
    /// Parse configuration from command-line arguments.
    ///
    /// Supported flags:
    /// - `--data-dir=PATH`
    /// - `--sqlite=PATH`
    ///
    /// Unknown flags are ignored so the same argument list can be handed to
    /// several config parsers.
    pub fn from_args(args: &[String]) -> Self {
        let mut config = ServiceConfig::default();

        for arg in args {
            if let Some(val) = arg.strip_prefix("--data-dir=") {
                config.data_dir = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--sqlite=") {
                config.sqlite_path = Some(PathBuf::from(val));
            }
        }

        config
    }

    /// Resolve the SQLite database path, falling back to `{data_dir}/directory.sqlite`.
    pub fn resolve_sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("directory.sqlite"))
    }

    fn resolve_data_subpath(&self, name: &str) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(|d| d.join(name))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}
