use crate::error::{Result, StageError};
use onionweave_core::runtime::CONTENT_PATH_KEY;
use onionweave_core::{Message, Stage};
use scraper::{Html, Selector};
use serde_json::{Value, json};
use std::fs;
use std::io::ErrorKind;
use tracing::{debug, warn};
use url::Url;

/// Element/attribute pairs that point at another resource.
const LINK_ATTRIBUTES: [(&str, &str); 8] = [
    ("a[href]", "href"),
    ("link[href]", "href"),
    ("area[href]", "href"),
    ("iframe[src]", "src"),
    ("frame[src]", "src"),
    ("img[src]", "src"),
    ("script[src]", "src"),
    ("form[action]", "action"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub urls: Vec<String>,
}

/// Makes `href` absolute against `base`, without query or fragment.
/// Anything that is not http(s) is dropped.
pub fn resolve_url(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// `scheme://host[:port]` of `url`.
pub fn origin_root(url: &Url) -> Option<String> {
    match url.origin() {
        origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}

pub fn extract_metadata(html: &str, origin: &Url) -> PageMetadata {
    let document = Html::parse_document(html);
    let mut metadata = PageMetadata::default();

    if let Ok(selector) = Selector::parse("title")
        && let Some(title) = document.select(&selector).next()
    {
        let text = title.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            metadata.title = Some(text);
        }
    }

    if let Ok(selector) = Selector::parse("meta[name][content]") {
        metadata.description = document
            .select(&selector)
            .find(|meta| {
                meta.value()
                    .attr("name")
                    .is_some_and(|name| name.eq_ignore_ascii_case("description"))
            })
            .and_then(|meta| meta.value().attr("content"))
            .map(|content| content.trim().to_string());
    }

    for (css, attribute) in LINK_ATTRIBUTES {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        for element in document.select(&selector) {
            if let Some(value) = element.value().attr(attribute)
                && let Some(url) = resolve_url(origin, value)
                && !metadata.urls.contains(&url)
            {
                metadata.urls.push(url);
            }
        }
    }

    metadata
}

/// Turns fetched pages into titles, descriptions and outgoing links.
#[derive(Debug, Default)]
pub struct Extractor;

impl Extractor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, message: &mut Message) -> Result<()> {
        let origin = message
            .get("origin")
            .and_then(Value::as_str)
            .ok_or_else(|| StageError::MissingField("origin".to_string()))?;
        let origin = Url::parse(origin).map_err(|e| StageError::InvalidUrl(e.to_string()))?;

        let mut urls = Vec::new();
        if let Some(Value::String(path)) = message.remove(CONTENT_PATH_KEY) {
            let bytes = fs::read(&path);
            // The content copy is ours alone; remove it whatever happens next
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", path, e),
            }

            let html = String::from_utf8_lossy(&bytes?).into_owned();
            let metadata = extract_metadata(&html, &origin);
            if let Some(title) = metadata.title {
                message.insert("title".to_string(), json!(title));
            }
            if let Some(description) = metadata.description {
                message.insert("description".to_string(), json!(description));
            }
            urls = metadata.urls;
        }

        if let Some(redirect) = message.get("redirect").and_then(Value::as_str)
            && let Some(url) = resolve_url(&origin, redirect)
        {
            urls.push(url);
        }
        if let Some(root) = origin_root(&origin) {
            urls.push(root);
        }

        debug!("{} urls extracted from {}", urls.len(), origin);
        message.insert("urls".to_string(), json!(urls));
        Ok(())
    }
}

impl Stage for Extractor {
    fn name(&self) -> &str {
        "Extractor"
    }

    fn on_message(&mut self, mut message: Message) -> anyhow::Result<Option<Message>> {
        self.process(&mut message)?;
        Ok(Some(message))
    }
}
