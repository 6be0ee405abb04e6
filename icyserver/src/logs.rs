//! Initialisation du logging
//!
//! Les logs partent sur stderr : stdout peut transporter le flux relayé.

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Options du logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingOptions {
    /// Nombre de `-v` : 0 → info, 1 → debug, 2+ → trace
    pub verbosity: u8,
    /// Ne garder que les avertissements et erreurs
    pub quiet: bool,
    /// Couleurs ANSI dans la console
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            verbosity: 0,
            quiet: false,
            ansi: true,
        }
    }
}

impl LoggingOptions {
    /// Niveau maximal effectif ; `quiet` l'emporte sur `verbosity`
    pub fn level(&self) -> Level {
        if self.quiet {
            return Level::WARN;
        }
        match self.verbosity {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Filtre : `RUST_LOG` s'il est défini, sinon le niveau des options
fn build_filter(options: &LoggingOptions) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(options.level()).into())
        .from_env_lossy()
}

/// Installe le subscriber global ; retourne `false` s'il y en avait déjà un
pub fn init_logging(options: LoggingOptions) -> bool {
    Registry::default()
        .with(build_filter(&options))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_ansi(options.ansi),
        )
        .try_init()
        .is_ok()
}
