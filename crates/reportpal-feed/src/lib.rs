//! Feed retrieval and XML-to-tree parsing for the Report Pal integration.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reportpal_core::{XmlValue, FETCH_TIMEOUT};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "reportpal-feed";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("xml: {0}")]
    Xml(String),
    #[error("feed body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("feed document has no root element")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: FETCH_TIMEOUT,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// HTTP GET against the feed URL with a fixed overall timeout.
///
/// A failed cycle is abandoned and reported to the caller; the next scheduled
/// cycle is the retry, so there is no in-request backoff loop here.
#[derive(Debug)]
pub struct FeedFetcher {
    client: reqwest::Client,
}

impl FeedFetcher {
    pub fn new(config: FeedClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, run_id: Uuid, url: &str) -> Result<FetchedFeed, FetchError> {
        let span = info_span!("feed_fetch", %run_id, url);
        let _guard = span.enter();

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedFeed {
            status,
            final_url,
            body,
        })
    }
}

struct Frame {
    name: String,
    children: BTreeMap<String, XmlValue>,
    text: String,
}

impl Frame {
    fn open(event: &BytesStart<'_>) -> Result<Self, ParseError> {
        let name = String::from_utf8_lossy(event.name().as_ref()).into_owned();
        let mut children = BTreeMap::new();
        for attr in event.attributes() {
            let attr = attr.map_err(|err| ParseError::Xml(err.to_string()))?;
            let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
            let value = attr
                .unescape_value()
                .map_err(|err| ParseError::Xml(err.to_string()))?
                .into_owned();
            children.insert(key, XmlValue::Text(value));
        }
        Ok(Self {
            name,
            children,
            text: String::new(),
        })
    }

    fn close(self) -> (String, XmlValue) {
        let text = self.text.trim();
        let value = if self.children.is_empty() {
            XmlValue::Text(text.to_string())
        } else {
            let mut map = self.children;
            if !text.is_empty() {
                map.insert("#text".to_string(), XmlValue::Text(text.to_string()));
            }
            XmlValue::Map(map)
        };
        (self.name, value)
    }
}

/// A second child under an already-used name promotes the entry to a list.
/// This is the sole point where the one-or-many ambiguity enters the tree.
fn insert_child(map: &mut BTreeMap<String, XmlValue>, name: String, value: XmlValue) {
    let merged = match map.remove(&name) {
        None => value,
        Some(XmlValue::List(mut items)) => {
            items.push(value);
            XmlValue::List(items)
        }
        Some(single) => XmlValue::List(vec![single, value]),
    };
    map.insert(name, merged);
}

/// Parse one polled feed body into the document tree.
///
/// The result is a single-key map holding the root element, so projector
/// paths start at the root name (`report/...`).
pub fn parse_document(bytes: &[u8]) -> Result<XmlValue, ParseError> {
    let text = std::str::from_utf8(bytes)?;
    let mut reader = Reader::from_reader(text.as_bytes());
    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, XmlValue)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(event)) => {
                stack.push(Frame::open(&event)?);
            }
            Ok(Event::Empty(event)) => {
                let (name, value) = Frame::open(&event)?.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None => root = Some((name, value)),
                }
            }
            Ok(Event::End(_)) => {
                let frame = stack.pop().ok_or_else(|| {
                    ParseError::Xml("closing tag without an open element".to_string())
                })?;
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None => root = Some((name, value)),
                }
            }
            Ok(Event::Text(event)) => {
                let content = event
                    .unescape()
                    .map_err(|err| ParseError::Xml(err.to_string()))?;
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(content.trim());
                }
            }
            Ok(Event::CData(event)) => {
                if let Some(frame) = stack.last_mut() {
                    let content = event.into_inner();
                    frame.text.push_str(String::from_utf8_lossy(&content).trim());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ParseError::Xml(err.to_string())),
        }
        buf.clear();
    }

    let (name, value) = root.ok_or(ParseError::Empty)?;
    let mut document = BTreeMap::new();
    document.insert(name, value);
    Ok(XmlValue::Map(document))
}
