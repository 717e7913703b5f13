//! OCI distribution client.
//!
//! Talks the registry HTTP API (`/v2/<repository>/manifests|blobs/...`)
//! over reqwest. Credentials come from a [`CredentialProvider`]; bearer
//! challenges are answered with a token exchange and the token is cached
//! per registry and repository for the lifetime of the client.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use ocifs_core::error::{Result, RootfsError};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;

use super::auth::{fetch_token, pull_scope, Credential, CredentialProvider};
use super::reference::canonical_registry;
use super::manifest::{ManifestKind, ACCEPTED_MANIFEST_TYPES};
use super::reference::ImageReference;

/// Registry API host serving Docker Hub.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Manifests larger than this are refused.
const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Content descriptor: what a manifest says about a blob or another manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Byte stream of a blob as it arrives from the registry.
pub type BlobStream = Pin<Box<dyn AsyncRead + Send>>;

/// Read side of an OCI distribution registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve the reference's tag or digest to a manifest descriptor.
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor>;

    /// Fetch the manifest or index `descriptor` points at.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>>;

    /// Open a stream over the blob `descriptor` points at.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<BlobStream>;
}

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// What a request fetches; selects the error variant on failure.
#[derive(Clone, Copy)]
enum Fetch<'a> {
    Manifest,
    Blob(&'a str),
}

impl Fetch<'_> {
    fn error(self, reference: &ImageReference, message: String) -> RootfsError {
        match self {
            Fetch::Manifest => RootfsError::ManifestFetch {
                registry: reference.registry.clone(),
                message,
            },
            Fetch::Blob(digest) => RootfsError::BlobFetch {
                digest: digest.to_string(),
                message,
            },
        }
    }
}

/// Registry client over HTTPS (or plain HTTP for insecure registries).
pub struct HttpRegistryClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    insecure: HashSet<String>,
    tokens: Mutex<HashMap<(String, String), Credential>>,
}

impl HttpRegistryClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("ocifs/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            credentials,
            insecure: HashSet::new(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Talk plain HTTP to these registries.
    pub fn with_insecure_registries<I, S>(mut self, registries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insecure
            .extend(registries.into_iter().map(|r| canonical_registry(r.as_ref())));
        self
    }

    fn base_url(&self, registry: &str) -> String {
        let registry = canonical_registry(registry);
        let scheme = if self.insecure.contains(&registry) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}/v2", scheme, api_host(&registry))
    }

    fn manifest_url(&self, reference: &ImageReference, tag_or_digest: &str) -> String {
        format!(
            "{}/{}/manifests/{}",
            self.base_url(&reference.registry),
            reference.repository,
            tag_or_digest
        )
    }

    fn cache_key(reference: &ImageReference) -> (String, String) {
        (
            canonical_registry(&reference.registry),
            reference.repository.clone(),
        )
    }

    async fn credential_for(&self, reference: &ImageReference) -> Result<Credential> {
        let key = Self::cache_key(reference);
        let cached = self.tokens.lock().get(&key).cloned();
        if let Some(credential) = cached {
            return Ok(credential);
        }
        let credential = self
            .credentials
            .credential(&reference.registry, &reference.repository)
            .await?;
        if matches!(credential, Credential::Bearer(_)) {
            self.tokens.lock().insert(key, credential.clone());
        }
        Ok(credential)
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        credential: &Credential,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        match credential {
            Credential::Anonymous => request,
            Credential::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credential::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Send a request, answering one bearer challenge if the registry asks.
    async fn send(
        &self,
        reference: &ImageReference,
        method: Method,
        url: &str,
        accept: Option<&str>,
        fetch: Fetch<'_>,
    ) -> Result<reqwest::Response> {
        let credential = self.credential_for(reference).await?;
        let response = self
            .request(method.clone(), url, accept, &credential)
            .send()
            .await
            .map_err(|e| fetch.error(reference, format!("request to {} failed: {}", url, e)))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse);
        let Some(challenge) = challenge.filter(Challenge::is_bearer) else {
            return Err(fetch.error(
                reference,
                format!("{} refused the request: {}", reference.registry, response.status()),
            ));
        };
        let realm = challenge.param("realm").ok_or_else(|| RootfsError::AuthToken {
            registry: reference.registry.clone(),
            message: "bearer challenge without realm".to_string(),
        })?;
        let scope = challenge
            .param("scope")
            .map(str::to_string)
            .unwrap_or_else(|| pull_scope(&reference.repository));
        let basic = match &credential {
            Credential::Basic { username, password } => {
                Some((username.as_str(), password.as_str()))
            }
            _ => None,
        };

        tracing::debug!(
            registry = %reference.registry,
            realm,
            scope = %scope,
            "Answering bearer challenge"
        );
        let token = fetch_token(
            &self.http,
            &reference.registry,
            realm,
            challenge.param("service"),
            &scope,
            basic,
        )
        .await?;
        let bearer = Credential::Bearer(token);
        self.tokens
            .lock()
            .insert(Self::cache_key(reference), bearer.clone());

        let response = self
            .request(method, url, accept, &bearer)
            .send()
            .await
            .map_err(|e| fetch.error(reference, format!("request to {} failed: {}", url, e)))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(fetch.error(
                reference,
                format!("{} rejected the issued token", reference.registry),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor> {
        let url = self.manifest_url(reference, reference.tag_or_digest());
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");

        let response = self
            .send(reference, Method::HEAD, &url, Some(&accept), Fetch::Manifest)
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Fetch::Manifest.error(
                reference,
                format!("manifest {} not found", reference.tag_or_digest()),
            ));
        }
        if status.is_success() {
            let served = header_value(&response, "docker-content-digest");
            if let (Some(pinned), Some(served)) = (&reference.digest, &served) {
                if pinned != served {
                    return Err(Fetch::Manifest.error(
                        reference,
                        format!("registry answered {} for pinned digest {}", served, pinned),
                    ));
                }
            }
            let digest = reference.digest.clone().or(served);
            let media_type = content_type(&response);
            if let (Some(digest), Some(media_type)) = (digest, media_type) {
                if ManifestKind::from_media_type(&media_type).is_some() {
                    let size = response
                        .headers()
                        .get(CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    return Ok(Descriptor {
                        media_type,
                        digest,
                        size,
                    });
                }
            }
        }

        // Some registries answer HEAD without a digest; the body tells us.
        tracing::debug!(
            reference = %reference,
            status = %status,
            "HEAD did not resolve manifest, falling back to GET"
        );
        let response = self
            .send(reference, Method::GET, &url, Some(&accept), Fetch::Manifest)
            .await?;
        let (media_type, bytes) = read_manifest(reference, response).await?;
        let digest = sha256_digest(&bytes);
        if let Some(pinned) = &reference.digest {
            verify_digest(pinned, &bytes)
                .map_err(|message| Fetch::Manifest.error(reference, message))?;
        }
        Ok(Descriptor {
            media_type: media_type.unwrap_or_default(),
            digest: reference.digest.clone().unwrap_or(digest),
            size: bytes.len() as u64,
        })
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let url = self.manifest_url(reference, &descriptor.digest);
        let accept = if descriptor.media_type.is_empty() {
            ACCEPTED_MANIFEST_TYPES.join(", ")
        } else {
            descriptor.media_type.clone()
        };
        let response = self
            .send(reference, Method::GET, &url, Some(&accept), Fetch::Manifest)
            .await?;
        let (_, bytes) = read_manifest(reference, response).await?;
        verify_digest(&descriptor.digest, &bytes)
            .map_err(|message| Fetch::Manifest.error(reference, message))?;
        Ok(bytes)
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<BlobStream> {
        let url = format!(
            "{}/{}/blobs/{}",
            self.base_url(&reference.registry),
            reference.repository,
            descriptor.digest
        );
        let fetch = Fetch::Blob(&descriptor.digest);
        let response = self.send(reference, Method::GET, &url, None, fetch).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch.error(reference, format!("registry returned {}", status)));
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let reader = StreamReader::new(Box::pin(stream));
        Ok(Box::pin(VerifyingReader::new(
            reader,
            &descriptor.digest,
            descriptor.size,
        )))
    }
}

fn api_host(registry: &str) -> &str {
    match registry {
        "docker.io" => DOCKER_HUB_API_HOST,
        other => other,
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Content type without parameters.
fn content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn read_manifest(
    reference: &ImageReference,
    response: reqwest::Response,
) -> Result<(Option<String>, Vec<u8>)> {
    let status = response.status();
    if !status.is_success() {
        return Err(Fetch::Manifest.error(reference, format!("registry returned {}", status)));
    }
    let declared: Option<u64> = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    if declared.map_or(false, |len| len > MAX_MANIFEST_SIZE) {
        return Err(Fetch::Manifest.error(reference, "manifest too large".to_string()));
    }
    let media_type = content_type(&response);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Fetch::Manifest.error(reference, format!("failed to read manifest: {}", e)))?;
    if bytes.len() as u64 > MAX_MANIFEST_SIZE {
        return Err(Fetch::Manifest.error(reference, "manifest too large".to_string()));
    }
    Ok((media_type, bytes.to_vec()))
}

fn verify_digest(expected: &str, data: &[u8]) -> std::result::Result<(), String> {
    match expected.split_once(':') {
        Some(("sha256", _)) => {
            let actual = sha256_digest(data);
            if actual == expected {
                Ok(())
            } else {
                Err(format!("digest mismatch: expected {}, got {}", expected, actual))
            }
        }
        _ => {
            tracing::warn!(digest = expected, "Unsupported digest algorithm, not verified");
            Ok(())
        }
    }
}

/// Checks size and sha256 digest of a blob when the stream ends.
struct VerifyingReader<R> {
    inner: R,
    digest: String,
    hasher: Option<Sha256>,
    expected_size: u64,
    read: u64,
    done: bool,
}

impl<R> VerifyingReader<R> {
    fn new(inner: R, digest: &str, expected_size: u64) -> Self {
        let hasher = digest.starts_with("sha256:").then(Sha256::new);
        Self {
            inner,
            digest: digest.to_string(),
            hasher,
            expected_size,
            read: 0,
            done: false,
        }
    }

    fn verify(&mut self) -> io::Result<()> {
        if self.expected_size > 0 && self.read != self.expected_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "blob {} is {} bytes, expected {}",
                    self.digest, self.read, self.expected_size
                ),
            ));
        }
        if let Some(hasher) = self.hasher.take() {
            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
            if actual != self.digest {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("blob digest mismatch: expected {}, got {}", self.digest, actual),
                ));
            }
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let filled = &buf.filled()[before..];
        if !filled.is_empty() {
            this.read += filled.len() as u64;
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(filled);
            }
        } else if buf.remaining() > 0 && !this.done {
            this.done = true;
            this.verify()?;
        }
        Poll::Ready(Ok(()))
    }
}

/// Parsed `WWW-Authenticate` header.
#[derive(Debug)]
struct Challenge {
    scheme: String,
    params: HashMap<String, String>,
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.is_empty() {
            return None;
        }

        let mut params = HashMap::new();
        let mut chars = rest.chars().peekable();
        loop {
            while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
                chars.next();
            }
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' {
                    break;
                }
                key.push(c);
                chars.next();
            }
            // Consume '='; stop at a dangling key.
            if chars.next().is_none() {
                break;
            }

            let mut value = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value = value.trim().to_string();
            }
            params.insert(key.trim().to_ascii_lowercase(), value);
        }

        Some(Self {
            scheme: scheme.to_string(),
            params,
        })
    }

    fn is_bearer(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("bearer")
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}
