//! Sources de flux : HTTP(S) et fichiers locaux
//!
//! Une [`Source`] ouvre une adresse et retourne un [`SourceStream`] : un lecteur
//! d'octets, un nom optionnel et, pour HTTP seulement, les en-têtes de réponse.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::header::HeaderMap;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::{Result, StreamError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Flux ouvert
pub struct SourceStream {
    pub reader: BoxedReader,
    /// Nom lisible (dernier segment d'URL, nom de fichier)
    pub name: Option<String>,
    /// En-têtes de réponse, si la source en expose
    pub headers: Option<HeaderMap>,
}

impl SourceStream {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            name: None,
            headers: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("name", &self.name)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Ouvre une adresse ; chaque appel produit une nouvelle connexion
#[async_trait]
pub trait Source: Send + Sync {
    async fn open(&self, address: &str) -> Result<SourceStream>;
}

/// Source HTTP(S) avec User-Agent configurable
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::setup(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn open(&self, address: &str) -> Result<SourceStream> {
        let response = self.client.get(address).send().await?;

        if !response.status().is_success() {
            return Err(StreamError::Status {
                status: response.status().as_u16(),
                url: address.to_string(),
            });
        }

        let name = response
            .url()
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let headers = response.headers().clone();

        debug!(url = %response.url(), status = %response.status(), "HTTP source opened");

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut opened = SourceStream::new(StreamReader::new(stream)).with_headers(headers);
        opened.name = name;
        Ok(opened)
    }
}

/// Source fichier local (`file://` ou chemin)
#[derive(Debug, Clone, Default)]
pub struct FileSource;

impl FileSource {
    fn path_of(address: &str) -> Result<PathBuf> {
        if address.starts_with("file:") {
            let url = Url::parse(address)
                .map_err(|e| StreamError::invalid_address(address, e.to_string()))?;
            url.to_file_path()
                .map_err(|_| StreamError::invalid_address(address, "not a local file URL"))
        } else {
            Ok(PathBuf::from(address))
        }
    }
}

#[async_trait]
impl Source for FileSource {
    async fn open(&self, address: &str) -> Result<SourceStream> {
        let path = Self::path_of(address)?;
        let file = tokio::fs::File::open(&path).await?;
        let mut opened = SourceStream::new(file);
        opened.name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(opened)
    }
}

/// Aiguillage par schéma : `http`/`https` vers [`HttpSource`], le reste vers [`FileSource`]
#[derive(Clone)]
pub struct AnySource {
    http: HttpSource,
    file: FileSource,
}

impl AnySource {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpSource::new(user_agent, connect_timeout)?,
            file: FileSource,
        })
    }
}

pub fn is_http_address(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[async_trait]
impl Source for AnySource {
    async fn open(&self, address: &str) -> Result<SourceStream> {
        if is_http_address(address) {
            self.http.open(address).await
        } else {
            self.file.open(address).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_source_exposes_headers_and_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live/radio.mp3"))
            .and(header("user-agent", "icycat-test/0.1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("icy-name", "Radio Test")
                    .insert_header("icy-br", "128")
                    .set_body_bytes(b"audio-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let source = HttpSource::new("icycat-test/0.1", Duration::from_secs(2)).unwrap();
        let mut stream = source
            .open(&format!("{}/live/radio.mp3", server.uri()))
            .await
            .unwrap();

        assert_eq!(stream.name.as_deref(), Some("radio.mp3"));
        let headers = stream.headers.as_ref().unwrap();
        assert_eq!(headers.get("icy-name").unwrap(), "Radio Test");

        let mut body = Vec::new();
        stream.reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"audio-bytes");
    }

    #[tokio::test]
    async fn test_http_source_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = HttpSource::new("icycat", Duration::from_secs(2)).unwrap();
        let err = source.open(&server.uri()).await.unwrap_err();
        assert!(matches!(err, StreamError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_file_source_reads_plain_path_and_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.mp3");
        std::fs::write(&path, b"file-bytes").unwrap();

        let source = AnySource::new("icycat", Duration::from_secs(1)).unwrap();
        for address in [
            path.to_string_lossy().into_owned(),
            Url::from_file_path(&path).unwrap().to_string(),
        ] {
            let mut stream = source.open(&address).await.unwrap();
            assert_eq!(stream.name.as_deref(), Some("capture.mp3"));
            assert!(stream.headers.is_none());
            let mut body = Vec::new();
            stream.reader.read_to_end(&mut body).await.unwrap();
            assert_eq!(body, b"file-bytes");
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let err = FileSource.open("/nonexistent/icycat/stream.mp3").await.unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
