//! En-têtes ICY (Icecast/Shoutcast)

use reqwest::header::HeaderMap;
use tracing::debug;
use url::Url;

const ICY_PREFIX: &str = "icy-";

/// Fournisseur par défaut quand l'adresse n'a pas d'hôte
pub const DEFAULT_PROVIDER: &str = "icycat";

/// Nom et fournisseur du service, dérivés des en-têtes ICY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMetadata {
    pub name: String,
    pub provider: String,
}

impl ServiceMetadata {
    /// `icy-name` donne le nom ; le fournisseur est l'hôte de l'adresse source
    pub fn from_headers(headers: &HeaderMap, address: &str) -> Option<Self> {
        let name = headers
            .get("icy-name")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())?;

        let provider = Url::parse(address)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        Some(Self {
            name: name.to_string(),
            provider,
        })
    }
}

/// En-têtes `icy-*` triés par nom, avec toutes leurs valeurs
pub fn icy_headers(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    let mut entries: Vec<(String, Vec<String>)> = headers
        .keys()
        .filter(|k| k.as_str().to_ascii_lowercase().starts_with(ICY_PREFIX))
        .map(|k| {
            let values = headers
                .get_all(k)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            (k.as_str().to_string(), values)
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// Rend une entrée : valeur unique entre guillemets, sinon liste
pub fn format_icy_header(name: &str, values: &[String]) -> String {
    match values {
        [single] => format!("{}: {:?}", name, single),
        many => format!("{}: {:?}", name, many),
    }
}

/// Journalise les en-têtes ICY d'une réponse
pub fn log_icy_headers(headers: &HeaderMap) {
    for (name, values) in icy_headers(headers) {
        debug!("{}", format_icy_header(&name, &values));
    }
}
