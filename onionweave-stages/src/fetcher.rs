use crate::error::{Result, StageError};
use crate::result::FetchResult;
use chrono::{SecondsFormat, Utc};
use onionweave_core::config::FetcherConfig;
use onionweave_core::{Message, Stage};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, LOCATION, SERVER};
use reqwest::{Proxy, redirect};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

const ACCEPTED_CONTENT_TYPES: [&str; 2] = ["text/html", "text/plain"];

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub user_agent: String,
    /// e.g. `socks5h://127.0.0.1:9050`; `socks5h` resolves names through the proxy.
    pub proxy: Option<String>,
    pub max_content_size: usize,
    pub max_retries: u32,
    pub timeout: Duration,
    /// Where fetched bodies are written before being routed downstream.
    pub content_dir: PathBuf,
}

impl FetcherSettings {
    pub fn from_config(config: &FetcherConfig, content_dir: PathBuf) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            max_content_size: config.max_content_size,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            content_dir,
        }
    }
}

/// Fetches one URL per message and stores the body for downstream stages.
pub struct Fetcher {
    client: Client,
    settings: FetcherSettings,
    pid: u32,
    sequence: u64,
}

impl Fetcher {
    pub fn new(settings: FetcherSettings) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            // Redirects are reported, the frontier decides whether to follow
            .redirect(redirect::Policy::none())
            // Onion services mostly use self-signed certificates
            .danger_accept_invalid_certs(true);

        if let Some(proxy) = &settings.proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
        }

        fs::create_dir_all(&settings.content_dir)?;

        Ok(Self {
            client: builder.build()?,
            settings,
            pid: std::process::id(),
            sequence: 0,
        })
    }

    pub fn settings(&self) -> &FetcherSettings {
        &self.settings
    }

    /// GETs `url`. Transport failures become an `error` result, never an `Err`.
    pub fn fetch(&mut self, url: &str) -> Result<FetchResult> {
        let parsed = Url::parse(url).map_err(|e| StageError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StageError::InvalidUrl(format!("unsupported scheme: {}", url)));
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let start = Instant::now();
        debug!("GET {}", url);

        let response = match self.send(url) {
            Ok(response) => response,
            Err(e) => {
                info!("Fetch failed for {}: {}", url, e);
                let mut result = FetchResult::with_error(url.to_string(), timestamp, e.to_string());
                result.elapsed_time = start.elapsed().as_secs_f64();
                return Ok(result);
            }
        };

        let mut result = FetchResult::new(url.to_string(), timestamp);
        let status = response.status();
        result.http_code = Some(status.as_u16());
        result.server = header_value(response.headers(), SERVER);
        result.header = Some(header_map(response.headers()));

        if status.is_redirection() {
            result.redirect = header_value(response.headers(), LOCATION)
                .and_then(|location| parsed.join(&location).ok())
                .map(|target| target.to_string());
        }

        if !accepts_content_type(response.headers()) {
            debug!("Rejected content type from {}", url);
            result.rejected = true;
            result.elapsed_time = start.elapsed().as_secs_f64();
            return Ok(result);
        }

        match self.read_body(response) {
            Ok((body, partial)) => {
                let (path, hash) = self.store(&body)?;
                result.content_path = Some(path.to_string_lossy().into_owned());
                result.content_hash = Some(hash);
                result.partial = partial;
            }
            Err(e) => {
                warn!("Body of {} unreadable: {}", url, e);
                result.error = true;
                result.error_message = Some(e.to_string());
            }
        }

        result.elapsed_time = start.elapsed().as_secs_f64();
        info!(
            "Fetched {} ({}){}",
            url,
            status.as_u16(),
            if result.partial { " truncated" } else { "" }
        );
        Ok(result)
    }

    fn send(&self, url: &str) -> std::result::Result<Response, reqwest::Error> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send() {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    debug!("Retrying {} ({}/{}): {}", url, attempt, self.settings.max_retries, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads at most `max_content_size` bytes; the flag is set when the body
    /// was longer.
    fn read_body(&self, response: Response) -> std::io::Result<(Vec<u8>, bool)> {
        let limit = self.settings.max_content_size;
        let mut body = Vec::new();
        response.take(limit as u64 + 1).read_to_end(&mut body)?;

        let partial = body.len() > limit;
        body.truncate(limit);
        Ok((body, partial))
    }

    fn store(&mut self, body: &[u8]) -> Result<(PathBuf, String)> {
        let hash = hex::encode(Sha256::digest(body));
        self.sequence += 1;

        let name = format!(
            "{}_{}_{}_{}",
            self.pid,
            Utc::now().timestamp(),
            self.sequence,
            &hash[..16]
        );
        let path = self.settings.content_dir.join(name);
        fs::write(&path, body)?;
        Ok((path, hash))
    }
}

fn header_value(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Lowercase header names; repeated headers are joined with `, `.
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

/// A missing content type is given the benefit of the doubt.
fn accepts_content_type(headers: &HeaderMap) -> bool {
    match header_value(headers, CONTENT_TYPE) {
        None => true,
        Some(content_type) => {
            let mime = content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            ACCEPTED_CONTENT_TYPES.contains(&mime.as_str())
        }
    }
}

impl Stage for Fetcher {
    fn name(&self) -> &str {
        "Fetcher"
    }

    fn on_message(&mut self, mut message: Message) -> anyhow::Result<Option<Message>> {
        let url = message
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StageError::MissingField("url".to_string()))?
            .to_string();

        let result = self.fetch(&url)?;
        result.merge_into(&mut message)?;
        Ok(Some(message))
    }
}
