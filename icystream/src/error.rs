//! Types d'erreur du relais

use std::io;
use std::time::Duration;

use icympegts::MuxError;

/// Alias de résultat du relais
pub type Result<T> = std::result::Result<T, StreamError>;

/// Erreurs possibles pendant le relais d'un flux
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Le puits de sortie (ou une autre ressource de démarrage) n'a pas pu être créé
    #[error("setup failed: {0}")]
    Setup(String),

    /// Adresse de source ou de destination invalide
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Échec de la requête HTTP (connexion, protocole, ligne de statut non HTTP)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Le serveur amont a répondu hors 2xx
    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    /// Erreur d'entrée/sortie
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Copie sous chien de garde interrompue
    #[error(transparent)]
    Copy(#[from] CopyError),

    /// Échec du multiplexeur
    #[error("multiplexer error: {0}")]
    Mux(#[from] MuxError),

    /// Une tâche de fond a paniqué
    #[error("task {0} panicked")]
    TaskPanicked(&'static str),

    /// Annulation partagée déclenchée
    #[error("cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

/// Raison de l'arrêt d'une copie avant la fin de flux
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// Aucun progrès dans la fenêtre du chien de garde
    #[error("no progress within {0:?}")]
    Watchdog(Duration),

    #[error("cancelled")]
    Cancelled,
}
