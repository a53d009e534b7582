use crate::error::{Result, StageError};
use onionweave_core::frontier::location_of;
use onionweave_core::runtime::CONTENT_PATH_KEY;
use onionweave_core::storage::{Storage, current_timestamp};
use onionweave_core::{Message, Stage};
use rusqlite::params;
use scraper::{Html, Node};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::sync::LazyLock;
use tracing::{debug, warn};

pub const FINGERPRINT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fingerprint (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    domain TEXT NOT NULL,
    language TEXT,
    term_frequency TEXT,     -- JSON [[term, count], ...]
    content_hash TEXT,
    analyzed INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fingerprint_domain ON fingerprint(domain);
CREATE INDEX IF NOT EXISTS idx_fingerprint_url ON fingerprint(url);
";

pub const ENGLISH: &str = "en";

/// Share of stopwords above which a text is taken to be English.
const ENGLISH_STOPWORD_RATIO: f64 = 0.2;
const MIN_TOKENS: usize = 5;

const SKIPPED_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "your", "yours",
        "yourself", "yourselves", "he", "him", "his", "himself", "she", "her", "hers",
        "herself", "it", "its", "itself", "they", "them", "their", "theirs", "themselves",
        "what", "which", "who", "whom", "this", "that", "these", "those", "am", "is", "are",
        "was", "were", "be", "been", "being", "have", "has", "had", "having", "do", "does",
        "did", "doing", "a", "an", "the", "and", "but", "if", "or", "because", "as", "until",
        "while", "of", "at", "by", "for", "with", "about", "against", "between", "into",
        "through", "during", "before", "after", "above", "below", "to", "from", "up", "down",
        "in", "out", "on", "off", "over", "under", "again", "further", "then", "once", "here",
        "there", "when", "where", "why", "how", "all", "any", "both", "each", "few", "more",
        "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so",
        "than", "too", "very", "s", "t", "can", "will", "just", "don", "should", "now", "d",
        "ll", "m", "o", "re", "ve", "y", "ain", "aren", "couldn", "didn", "doesn", "hadn",
        "hasn", "haven", "isn", "ma", "mightn", "mustn", "needn", "shan", "shouldn", "wasn",
        "weren", "won", "wouldn",
    ]
    .into_iter()
    .collect()
});

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(word)
}

/// Text a reader would see: everything but scripts and styles.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();

    for node in document.root_element().descendants() {
        let Node::Text(fragment) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|e| SKIPPED_ELEMENTS.contains(&e.name()))
        });
        if !hidden {
            text.push_str(fragment);
            text.push(' ');
        }
    }

    text
}

/// Lowercase words, punctuation treated as whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

pub fn is_english(tokens: &[String]) -> bool {
    if tokens.len() < MIN_TOKENS {
        return false;
    }
    let stopwords = tokens.iter().filter(|t| is_stopword(t)).count();
    stopwords as f64 / tokens.len() as f64 >= ENGLISH_STOPWORD_RATIO
}

/// The `limit` most frequent non-stopword terms, most frequent first; ties
/// sorted alphabetically.
pub fn term_frequencies(tokens: &[String], limit: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in tokens.iter().filter(|t| !is_stopword(t)) {
        *counts.entry(token.as_str()).or_default() += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(term, count)| (term.to_string(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub url: String,
    pub domain: String,
    pub language: Option<String>,
    pub term_frequency: Option<Vec<(String, usize)>>,
    pub content_hash: Option<String>,
}

/// Language and term frequency of fetched pages.
pub struct Analyzer {
    storage: Storage,
    tf_limit: usize,
}

impl Analyzer {
    pub fn new(mut storage: Storage, tf_limit: usize) -> Result<Self> {
        storage.ensure_schema("fingerprint", FINGERPRINT_SCHEMA)?;
        Ok(Self { storage, tf_limit })
    }

    pub fn fingerprint(&self, url: &str, html: &str) -> Option<Fingerprint> {
        let tokens = tokenize(&visible_text(html));
        if tokens.is_empty() {
            return None;
        }

        let english = is_english(&tokens);
        Some(Fingerprint {
            url: url.to_string(),
            domain: location_of(url).unwrap_or_default(),
            language: english.then(|| ENGLISH.to_string()),
            term_frequency: english.then(|| term_frequencies(&tokens, self.tf_limit)),
            content_hash: None,
        })
    }

    pub fn save(&mut self, fingerprint: &Fingerprint) -> Result<()> {
        let terms = fingerprint
            .term_frequency
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.storage.with_cursor(|tx| {
            tx.execute(
                "INSERT INTO fingerprint (url, domain, language, term_frequency, content_hash, analyzed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &fingerprint.url,
                    &fingerprint.domain,
                    &fingerprint.language,
                    terms,
                    &fingerprint.content_hash,
                    current_timestamp()
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Fingerprints stored for `url`, oldest first.
    pub fn fingerprints(&mut self, url: &str) -> Result<Vec<Fingerprint>> {
        let rows = self.storage.with_cursor(|tx| {
            let mut stmt = tx.prepare(
                "SELECT url, domain, language, term_frequency, content_hash
                 FROM fingerprint WHERE url = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![url], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(url, domain, language, terms, content_hash)| -> Result<Fingerprint> {
                let term_frequency = match terms {
                    Some(terms) => Some(serde_json::from_str(&terms)?),
                    None => None,
                };
                Ok(Fingerprint {
                    url,
                    domain,
                    language,
                    term_frequency,
                    content_hash,
                })
            })
            .collect()
    }
}

impl Stage for Analyzer {
    fn name(&self) -> &str {
        "Analyzer"
    }

    fn on_message(&mut self, message: Message) -> anyhow::Result<Option<Message>> {
        let origin = message
            .get("origin")
            .and_then(Value::as_str)
            .ok_or_else(|| StageError::MissingField("origin".to_string()))?;

        let Some(path) = message.get(CONTENT_PATH_KEY).and_then(Value::as_str) else {
            return Ok(None);
        };

        let bytes = fs::read(path);
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path, e),
        }
        let html = String::from_utf8_lossy(&bytes?).into_owned();

        if let Some(mut fingerprint) = self.fingerprint(origin, &html) {
            fingerprint.content_hash = message
                .get("content_hash")
                .and_then(Value::as_str)
                .map(str::to_string);
            debug!(
                "{} language {}",
                origin,
                fingerprint.language.as_deref().unwrap_or("unknown")
            );
            self.save(&fingerprint)?;
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const ENGLISH_PAGE: &str = r#"<html><head><style>body { color: red }</style>
        <script>var market = "market market market";</script></head>
        <body><p>This is a market for the people of the hidden web. The market is open
        and the vendors are waiting for you in the market square.</p></body></html>"#;

    fn create_test_analyzer() -> (TempDir, Analyzer) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(&temp_dir.path().join("fingerprint.db"));
        let analyzer = Analyzer::new(storage, 3).unwrap();
        (temp_dir, analyzer)
    }

    #[test]
    fn test_visible_text_skips_scripts_and_styles() {
        let text = visible_text(ENGLISH_PAGE);
        assert!(text.contains("hidden web"));
        assert!(!text.contains("var market"));
        assert!(!text.contains("color"));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World! it's"), vec!["hello", "world", "it", "s"]);
    }

    #[test]
    fn test_language_detection() {
        assert!(is_english(&tokenize(&visible_text(ENGLISH_PAGE))));
        assert!(!is_english(&tokenize(
            "zoco mercado vendedores plaza abierta gente oculta red"
        )));
        assert!(!is_english(&tokenize("the a")));
    }

    #[test]
    fn test_term_frequencies() {
        let tokens = tokenize(&visible_text(ENGLISH_PAGE));
        let tf = term_frequencies(&tokens, 3);
        assert_eq!(tf[0], ("market".to_string(), 3));
        assert_eq!(tf.len(), 3);
        assert!(tf.iter().all(|(term, _)| !is_stopword(term)));
    }

    #[test]
    fn test_on_message_stores_fingerprint() {
        let (temp_dir, mut analyzer) = create_test_analyzer();
        let content = temp_dir.path().join("page");
        fs::write(&content, ENGLISH_PAGE).unwrap();

        let mut message = Message::new();
        message.insert("origin".to_string(), json!("http://abc.onion/"));
        message.insert(CONTENT_PATH_KEY.to_string(), json!(content.to_string_lossy()));
        message.insert("content_hash".to_string(), json!("feed"));

        assert!(analyzer.on_message(message).unwrap().is_none());
        assert!(!content.exists());

        let stored = analyzer.fingerprints("http://abc.onion/").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].domain, "abc.onion");
        assert_eq!(stored[0].language.as_deref(), Some(ENGLISH));
        assert_eq!(stored[0].content_hash.as_deref(), Some("feed"));
        assert_eq!(stored[0].term_frequency.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn test_on_message_without_content_is_noop() {
        let (_temp_dir, mut analyzer) = create_test_analyzer();
        let mut message = Message::new();
        message.insert("origin".to_string(), json!("http://abc.onion/"));

        assert!(analyzer.on_message(message).unwrap().is_none());
        assert!(analyzer.fingerprints("http://abc.onion/").unwrap().is_empty());
    }
}
