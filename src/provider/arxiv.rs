//! arXiv export API source.
//!
//! Discovery pages through the Atom feed of `export.arxiv.org/api/query`,
//! pausing between pages as the API's usage policy asks. Entries are parsed
//! with regular expressions; the feed's structure is flat and stable enough
//! that a full XML parser buys nothing here.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info};

use super::{
    check_status, fetch_bytes, ContentType, DiscoveryQuery, DownloadedContent, HttpSettings,
    PaperSource, ProviderError, ProviderResult,
};
use crate::models::{Author, Paper};
use crate::resilience::ErrorCategory;

/// Default arXiv API endpoint.
pub const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";

/// Largest page the API serves comfortably.
const PAGE_SIZE: usize = 100;

pub const SOURCE_NAME: &str = "arxiv";

static ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<entry>(.*?)</entry>").expect("entry regex"));
static ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<id>\s*(.*?)\s*</id>").expect("id regex"));
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<title[^>]*>(.*?)</title>").expect("title regex"));
static SUMMARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<summary[^>]*>(.*?)</summary>").expect("summary regex"));
static PUBLISHED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<published>\s*(\d{4}-\d{2}-\d{2})").expect("published regex"));
static AUTHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<author>(.*?)</author>").expect("author regex"));
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<name>(.*?)</name>").expect("name regex"));
static AFFILIATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<arxiv:affiliation[^>]*>(.*?)</arxiv:affiliation>")
        .expect("affiliation regex")
});
static CATEGORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<category[^>]*\bterm="([^"]+)""#).expect("category regex"));
static LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<link\s([^>]*)>").expect("link regex"));
static HREF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bhref="([^"]+)""#).expect("href regex"));
static JOURNAL_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<arxiv:journal_ref[^>]*>(.*?)</arxiv:journal_ref>")
        .expect("journal_ref regex")
});
static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#x?[0-9A-Fa-f]+|[a-z]+);").expect("entity regex"));

/// Source backed by the arXiv export API.
#[derive(Debug, Clone)]
pub struct ArxivSource {
    client: Client,
    api_url: String,
    settings: HttpSettings,
}

impl ArxivSource {
    /// # Errors
    /// Returns `ProviderError::ConfigError` if the HTTP client cannot be built
    pub fn new(settings: &HttpSettings, api_url: Option<&str>) -> ProviderResult<Self> {
        Ok(Self {
            client: settings.client()?,
            api_url: api_url.unwrap_or(ARXIV_API_URL).to_string(),
            settings: settings.clone(),
        })
    }

    async fn fetch_page(
        &self,
        search_query: &str,
        start: usize,
        max_results: usize,
    ) -> ProviderResult<String> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("search_query", search_query.to_string()),
                ("start", start.to_string()),
                ("max_results", max_results.to_string()),
                ("sortBy", "submittedDate".to_string()),
                ("sortOrder", "descending".to_string()),
            ])
            .send()
            .await?;
        check_status(response.status(), &self.api_url)?;
        Ok(response.text().await?)
    }
}

/// Build the API `search_query` for a discovery query.
pub fn build_search_query(query: &DiscoveryQuery) -> String {
    let mut clauses = Vec::new();
    match query.categories.len() {
        0 => clauses.push("all:*".to_string()),
        1 => clauses.push(format!("cat:{}", query.categories[0])),
        _ => clauses.push(format!(
            "({})",
            query
                .categories
                .iter()
                .map(|c| format!("cat:{}", c))
                .collect::<Vec<_>>()
                .join(" OR ")
        )),
    }
    if query.date_from.is_some() || query.date_to.is_some() {
        let from = query
            .date_from
            .map_or_else(|| "000001010000".to_string(), |d| format!("{}0000", d.format("%Y%m%d")));
        let to = query
            .date_to
            .map_or_else(|| "999912312359".to_string(), |d| format!("{}2359", d.format("%Y%m%d")));
        clauses.push(format!("submittedDate:[{} TO {}]", from, to));
    }
    clauses.join(" AND ")
}

/// Replace XML entities with the characters they stand for.
pub fn unescape_xml(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let entity = &caps[1];
            let decoded = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

fn clean(text: &str) -> String {
    unescape_xml(text).split_whitespace().collect::<Vec<_>>().join(" ")
}

fn capture<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Short id (`2301.00001v2`, `hep-th/9901001v1`) from an entry's abs URL.
fn short_id(url: &str) -> String {
    url.split("/abs/").nth(1).unwrap_or(url).trim().to_string()
}

fn pdf_link(entry: &str) -> Option<String> {
    LINK_RE
        .captures_iter(entry)
        .map(|c| c[1].to_string())
        .find(|attrs| {
            attrs.contains(r#"title="pdf""#) || attrs.contains(r#"type="application/pdf""#)
        })
        .and_then(|attrs| capture(&HREF_RE, &attrs).map(str::to_string))
}

fn parse_entry(entry: &str) -> ProviderResult<Paper> {
    let id = capture(&ID_RE, entry)
        .map(short_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProviderError::ParseError("arXiv entry without <id>".to_string()))?;
    let title = capture(&TITLE_RE, entry).map(clean).unwrap_or_default();

    let mut paper = Paper::new(id.clone(), title);
    paper.abstract_text = capture(&SUMMARY_RE, entry).map(clean).unwrap_or_default();
    paper.published = capture(&PUBLISHED_RE, entry)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
    paper.publish_year = paper.published.map(|d| d.year());
    paper.authors = AUTHOR_RE
        .captures_iter(entry)
        .filter_map(|c| {
            let block = c.get(1)?.as_str();
            let mut author = Author::new(clean(capture(&NAME_RE, block)?));
            author.affiliation = capture(&AFFILIATION_RE, block).map(clean);
            Some(author)
        })
        .collect();
    paper.categories = CATEGORY_RE.captures_iter(entry).map(|c| c[1].to_string()).collect();
    paper.journal = capture(&JOURNAL_REF_RE, entry).map(clean);
    paper.pdf_url =
        Some(pdf_link(entry).unwrap_or_else(|| format!("https://arxiv.org/pdf/{}", id)));
    paper.source = SOURCE_NAME.to_string();
    Ok(paper)
}

/// Parse an Atom feed into papers.
///
/// # Errors
/// Returns `ProviderError::ParseError` if the input is not an Atom feed or
/// an entry has no id
pub fn parse_feed(feed: &str) -> ProviderResult<Vec<Paper>> {
    if !feed.contains("<feed") {
        return Err(ProviderError::ParseError("response is not an Atom feed".to_string()));
    }
    ENTRY_RE
        .captures_iter(feed)
        .map(|c| parse_entry(&c[1]))
        .collect()
}

#[async_trait]
impl PaperSource for ArxivSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::ArxivApi
    }

    async fn discover(&self, query: &DiscoveryQuery) -> ProviderResult<Vec<Paper>> {
        let search_query = build_search_query(query);
        info!(search_query = %search_query, max_results = query.max_results, "Querying arXiv");

        let mut papers = Vec::new();
        let mut start = 0;
        while papers.len() < query.max_results {
            if start > 0 {
                tokio::time::sleep(self.settings.request_delay()).await;
            }
            let page_size = PAGE_SIZE.min(query.max_results - papers.len());
            let feed = self.fetch_page(&search_query, start, page_size).await?;
            let page = parse_feed(&feed)?;
            debug!(start, returned = page.len(), "Fetched arXiv page");
            if page.is_empty() {
                break;
            }
            start += page.len();
            let exhausted = page.len() < page_size;
            papers.extend(page.into_iter().filter(|p| query.matches_dates(p)));
            if exhausted {
                break;
            }
        }
        papers.truncate(query.max_results);
        Ok(papers)
    }

    fn extract_metadata(&self, raw: &str) -> ProviderResult<Vec<Paper>> {
        parse_feed(raw)
    }

    async fn download(&self, paper: &Paper) -> ProviderResult<DownloadedContent> {
        let url = paper
            .pdf_url
            .clone()
            .unwrap_or_else(|| format!("https://arxiv.org/pdf/{}", paper.id));
        debug!(paper_id = %paper.id, url = %url, "Downloading arXiv PDF");
        let bytes = fetch_bytes(&self.client, &url).await?;
        Ok(DownloadedContent {
            paper_id: paper.id.clone(),
            bytes,
            content_type: ContentType::Pdf,
            source_url: Some(url),
        })
    }
}
