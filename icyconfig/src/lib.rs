//! # icyconfig - Configuration d'icycat
//!
//! Cette crate construit la valeur de configuration utilisée par le relais :
//! - Configuration par défaut intégrée (YAML)
//! - Fusion avec un fichier `config.yaml` externe optionnel
//! - Surcharges par variables d'environnement (`ICYCAT_CONFIG__SECTION__KEY`)
//! - Désérialisation vers un [`Config`] typé
//!
//! Contrairement à une configuration globale, la valeur produite est passée
//! explicitement aux constructeurs qui en ont besoin.
//!
//! ## Usage
//!
//! ```no_run
//! use icyconfig::Config;
//!
//! let config = Config::load(None)?;
//! println!("timeout: {:?}", config.timeout);
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

mod duration;

pub use duration::{format_duration, parse_duration};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("icycat.yaml");

const ENV_CONFIG_FILE: &str = "ICYCAT_CONFIG";
const ENV_PREFIX: &str = "ICYCAT_CONFIG__";
const CONFIG_DIR_NAME: &str = ".icycat";
const CONFIG_FILE_NAME: &str = "config.yaml";

pub const DEFAULT_USER_AGENT: &str = "icycat/1.0";
pub const DEFAULT_PACKET_SIZE: usize = 1316;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_SERVICE_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration complète du relais
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Destination de sortie (`-`, chemin, `udp://host:port?pkt_size=N`)
    pub output: String,
    /// User-Agent envoyé aux serveurs ICY/HTTP
    pub user_agent: String,
    /// Réduit la verbosité des logs
    pub quiet: bool,
    /// Taille de paquet demandée pour les sorties UDP
    pub packet_size: usize,
    /// Plancher entre deux reconnexions, et fenêtre du watchdog
    #[serde(with = "duration::serde_str")]
    pub timeout: Duration,
    /// Reconnecte aussi quand la source termine proprement
    pub restart_on_eof: bool,
    /// Capacité (octets) des pipes internes
    pub pipe_capacity: usize,
    /// Intervalle d'émission des tables PSI
    #[serde(with = "duration::serde_str")]
    pub service_interval: Duration,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: "-".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            quiet: false,
            packet_size: DEFAULT_PACKET_SIZE,
            timeout: DEFAULT_TIMEOUT,
            restart_on_eof: false,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            service_interval: DEFAULT_SERVICE_INTERVAL,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Publication des métriques
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Port d'écoute (0 = attribué par le système)
    pub port: u16,
    /// Adresse locale complète, prioritaire sur `port`
    pub address: Option<String>,
}

impl MetricsConfig {
    /// Un port ou une adresse explicite suffit à activer les métriques.
    pub fn is_enabled(&self) -> bool {
        self.enabled || self.port != 0 || self.address.as_deref().is_some_and(|a| !a.is_empty())
    }

    /// Adresse d'écoute effective, `None` si les métriques sont désactivées
    pub fn listen_address(&self) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        match self.address.as_deref() {
            Some(addr) if !addr.is_empty() => Some(addr.to_string()),
            _ => Some(format!("0.0.0.0:{}", self.port)),
        }
    }
}

impl Config {
    /// Charge la configuration
    ///
    /// Le fichier est cherché dans l'ordre suivant :
    /// 1. Le chemin `file` fourni (doit exister)
    /// 2. La variable d'environnement `ICYCAT_CONFIG`
    /// 3. `.icycat/config.yaml` dans le répertoire courant
    /// 4. `.icycat/config.yaml` dans le répertoire de l'utilisateur
    ///
    /// Sans fichier, seule la configuration intégrée est utilisée.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let path = match file {
            Some(p) => Some(p.to_path_buf()),
            None => Self::find_config_file(),
        };
        Self::load_from(path.as_deref(), env::vars())
    }

    /// Variante de [`Config::load`] avec un fichier et des variables explicites
    pub fn load_from<I>(file: Option<&Path>, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        if let Some(path) = file {
            let data = fs::read(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            info!(config_file = %path.display(), "Loaded config file");
            let external: Value = serde_yaml::from_slice(&data)
                .with_context(|| format!("invalid YAML in {}", path.display()))?;
            overlay(&mut value, external);
        } else {
            debug!("No config file found, using embedded defaults");
        }

        apply_env_overrides(&mut value, vars);

        let config: Config = serde_yaml::from_value(value).context("invalid configuration")?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = env::var(ENV_CONFIG_FILE) {
            info!(env_var = ENV_CONFIG_FILE, path = %env_path, "Trying to load config from env");
            return Some(PathBuf::from(env_path));
        }

        let local = Path::new(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }

        home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .filter(|p| p.exists())
    }
}

/// Chaque variable `ICYCAT_CONFIG__A__B=v` devient la couche `{a: {b: v}}`
fn apply_env_overrides<I>(config: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, raw) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        debug!(env_var = %key, "Applying env override");
        let layer = path.rsplit("__").fold(parse_env_value(&raw), |inner, section| {
            let mut map = Mapping::new();
            map.insert(Value::String(section.to_string()), inner);
            Value::Mapping(map)
        });
        overlay(config, layer);
    }
}

/// `true`, `376` ou `5s` sont relus comme YAML, le reste reste une chaîne
fn parse_env_value(raw: &str) -> Value {
    serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Superpose `layer` à `base`, clés en minuscules ; un scalaire remplace tout
fn overlay(base: &mut Value, layer: Value) {
    let Value::Mapping(layer) = layer else {
        *base = layer;
        return;
    };
    if !base.is_mapping() {
        *base = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(base) = base {
        for (key, value) in layer {
            let key = match key {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other,
            };
            overlay(base.entry(key).or_insert(Value::Null), value);
        }
    }
}
