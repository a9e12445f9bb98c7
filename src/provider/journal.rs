//! Journal archive sources.
//!
//! A [`JournalProfile`] describes where a journal lists its articles and which
//! CSS selectors pick out each article's title, authors, landing page and PDF
//! link. Two profiles ship built in: the Journal of Statistical Software (an
//! OJS site) and The R Journal.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    fetch_bytes, fetch_text, ContentType, DiscoveryQuery, DownloadedContent, HttpSettings,
    PaperSource, ProviderError, ProviderResult,
};
use crate::models::{Author, Paper};
use crate::resilience::ErrorCategory;

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19[5-9]\d|20\d{2})\b").expect("year regex"));

/// Scraping recipe for one journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalProfile {
    /// Short name, used as source name and id prefix
    pub name: String,

    /// Full journal title recorded on papers
    pub journal_title: String,

    pub base_url: String,

    /// Listing pages, relative to `base_url`
    pub listing_paths: Vec<String>,

    /// One match per article on a listing page
    pub article_selector: String,

    /// Within an article: element whose text is the title
    pub title_selector: String,

    /// Within an article: link to the landing page; its href yields the id
    pub link_selector: String,

    /// Within an article: element(s) holding author names
    pub authors_selector: String,

    /// Within an article: link to the PDF, if listed
    pub pdf_selector: Option<String>,

    /// `(from, to)` substitution turning a PDF viewer URL into a download URL
    pub pdf_url_rewrite: Option<(String, String)>,

    /// Subject categories stamped on every paper
    pub categories: Vec<String>,
}

impl JournalProfile {
    /// Journal of Statistical Software (jstatsoft.org).
    pub fn jss() -> Self {
        Self {
            name: "jss".to_string(),
            journal_title: "Journal of Statistical Software".to_string(),
            base_url: "https://www.jstatsoft.org".to_string(),
            listing_paths: vec!["/issue/archive".to_string()],
            article_selector: "div.obj_article_summary".to_string(),
            title_selector: "h3.title a".to_string(),
            link_selector: "h3.title a".to_string(),
            authors_selector: "div.authors".to_string(),
            pdf_selector: Some("a.obj_galley_link.pdf".to_string()),
            pdf_url_rewrite: Some(("/article/view/".to_string(), "/article/download/".to_string())),
            categories: vec!["stat.CO".to_string(), "statistical_software".to_string()],
        }
    }

    /// The R Journal (journal.r-project.org).
    pub fn r_journal() -> Self {
        Self {
            name: "rjournal".to_string(),
            journal_title: "The R Journal".to_string(),
            base_url: "https://journal.r-project.org".to_string(),
            listing_paths: vec!["/articles/".to_string()],
            article_selector: "div.article".to_string(),
            title_selector: ".title".to_string(),
            link_selector: "a".to_string(),
            authors_selector: ".authors".to_string(),
            pdf_selector: Some("a[href$='.pdf']".to_string()),
            pdf_url_rewrite: None,
            categories: vec!["stat.CO".to_string(), "r_packages".to_string()],
        }
    }
}

struct CompiledSelectors {
    article: Selector,
    title: Selector,
    link: Selector,
    authors: Selector,
    pdf: Option<Selector>,
}

fn parse_selector(selector: &str) -> ProviderResult<Selector> {
    Selector::parse(selector).map_err(|e| {
        ProviderError::ConfigError(format!("Invalid selector '{}': {}", selector, e))
    })
}

impl CompiledSelectors {
    fn compile(profile: &JournalProfile) -> ProviderResult<Self> {
        Ok(Self {
            article: parse_selector(&profile.article_selector)?,
            title: parse_selector(&profile.title_selector)?,
            link: parse_selector(&profile.link_selector)?,
            authors: parse_selector(&profile.authors_selector)?,
            pdf: profile.pdf_selector.as_deref().map(parse_selector).transpose()?,
        })
    }
}

/// Source scraping a journal's archive pages.
pub struct JournalSource {
    client: Client,
    profile: JournalProfile,
    selectors: CompiledSelectors,
    base: Url,
    settings: HttpSettings,
}

impl std::fmt::Debug for JournalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalSource")
            .field("profile", &self.profile.name)
            .field("base_url", &self.profile.base_url)
            .finish()
    }
}

fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split an author line (`A. Smith, B. Jones and C. Lee`) into names.
fn split_authors(line: &str) -> Vec<String> {
    line.replace(" and ", ",")
        .split([',', ';'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stable id from an article URL's last path segment.
fn article_id(prefix: &str, url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let segment = segment.trim_end_matches(".html");
    let safe: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    Some(format!("{}-{}", prefix, safe))
}

impl JournalSource {
    /// # Errors
    /// Returns `ProviderError::ConfigError` for an invalid selector, base URL or HTTP client
    pub fn new(profile: JournalProfile, settings: &HttpSettings) -> ProviderResult<Self> {
        let selectors = CompiledSelectors::compile(&profile)?;
        let base = Url::parse(&profile.base_url).map_err(|e| {
            ProviderError::ConfigError(format!("Invalid base URL '{}': {}", profile.base_url, e))
        })?;
        Ok(Self {
            client: settings.client()?,
            profile,
            selectors,
            base,
            settings: settings.clone(),
        })
    }

    pub fn profile(&self) -> &JournalProfile {
        &self.profile
    }

    fn parse_article(&self, article: ElementRef<'_>) -> Option<Paper> {
        let title = article.select(&self.selectors.title).next().map(|e| element_text(&e))?;
        let href = article
            .select(&self.selectors.link)
            .find_map(|e| e.value().attr("href"))?;
        let landing = self.base.join(href).ok()?;
        let id = article_id(&self.profile.name, &landing)?;

        let mut paper = Paper::new(id, title);
        paper.authors = article
            .select(&self.selectors.authors)
            .flat_map(|e| split_authors(&element_text(&e)))
            .map(Author::new)
            .collect();
        paper.pdf_url = self
            .selectors
            .pdf
            .as_ref()
            .and_then(|selector| article.select(selector).find_map(|e| e.value().attr("href")))
            .and_then(|href| self.base.join(href).ok())
            .map(|url| self.rewrite_pdf_url(url.as_str()));
        paper.publish_year = YEAR_RE
            .captures(&element_text(&article))
            .or_else(|| YEAR_RE.captures(landing.as_str()))
            .and_then(|c| c[1].parse().ok());
        paper.journal = Some(self.profile.journal_title.clone());
        paper.categories = self.profile.categories.clone();
        paper.source = self.profile.name.clone();
        Some(paper)
    }

    fn rewrite_pdf_url(&self, url: &str) -> String {
        match &self.profile.pdf_url_rewrite {
            Some((from, to)) => url.replacen(from.as_str(), to, 1),
            None => url.to_string(),
        }
    }

    /// Parse one listing page. Articles without a title or link are skipped.
    pub fn parse_listing(&self, html: &str) -> Vec<Paper> {
        let document = Html::parse_document(html);
        let mut papers = Vec::new();
        for article in document.select(&self.selectors.article) {
            match self.parse_article(article) {
                Some(paper) => papers.push(paper),
                None => debug!(
                    journal = %self.profile.name,
                    "Skipping article without title or link"
                ),
            }
        }
        papers
    }
}

#[async_trait]
impl PaperSource for JournalSource {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::JournalSource
    }

    async fn discover(&self, query: &DiscoveryQuery) -> ProviderResult<Vec<Paper>> {
        let mut papers = Vec::new();
        for (i, path) in self.profile.listing_paths.iter().enumerate() {
            if papers.len() >= query.max_results {
                break;
            }
            if i > 0 {
                tokio::time::sleep(self.settings.request_delay()).await;
            }
            let url = self
                .base
                .join(path)
                .map_err(|e| {
                    ProviderError::ConfigError(format!("Invalid listing path '{}': {}", path, e))
                })?;
            info!(journal = %self.profile.name, url = %url, "Fetching journal listing");
            let html = fetch_text(&self.client, url.as_str()).await?;
            let page = self.parse_listing(&html);
            if page.is_empty() {
                warn!(journal = %self.profile.name, url = %url, "Listing page yielded no articles");
            }
            papers.extend(page.into_iter().filter(|p| query.matches_dates(p)));
        }
        papers.truncate(query.max_results);
        Ok(papers)
    }

    fn extract_metadata(&self, raw: &str) -> ProviderResult<Vec<Paper>> {
        Ok(self.parse_listing(raw))
    }

    async fn download(&self, paper: &Paper) -> ProviderResult<DownloadedContent> {
        let url = paper
            .pdf_url
            .clone()
            .ok_or_else(|| {
                ProviderError::NotFound(format!("No PDF link for journal article {}", paper.id))
            })?;
        let bytes = fetch_bytes(&self.client, &url).await?;
        Ok(DownloadedContent {
            paper_id: paper.id.clone(),
            bytes,
            content_type: ContentType::Pdf,
            source_url: Some(url),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const JSS_LISTING: &str = r#"
<html><body>
  <div class="obj_article_summary">
    <h3 class="title">
      <a href="https://www.jstatsoft.org/article/view/v105i01">lme4: Mixed-Effects Models</a>
    </h3>
    <div class="authors">Douglas Bates, Martin Maechler and Ben Bolker</div>
    <div class="published">2023-01-15</div>
    <a class="obj_galley_link pdf" href="/article/view/v105i01/4470">PDF</a>
  </div>
  <div class="obj_article_summary">
    <h3 class="title"><a href="/article/view/v098i01">Older Article</a></h3>
    <div class="authors">A. Author</div>
    <div class="published">2021-05-01</div>
  </div>
  <div class="obj_article_summary"><div class="authors">No title here</div></div>
</body></html>"#;

    fn jss() -> JournalSource {
        JournalSource::new(JournalProfile::jss(), &HttpSettings::default()).unwrap()
    }

    #[test]
    fn test_parse_jss_listing() {
        let papers = jss().parse_listing(JSS_LISTING);
        assert_eq!(papers.len(), 2);

        let first = &papers[0];
        assert_eq!(first.id, "jss-v105i01");
        assert_eq!(first.title, "lme4: Mixed-Effects Models");
        assert_eq!(first.author_names(), "Douglas Bates, Martin Maechler, Ben Bolker");
        assert_eq!(first.publish_year, Some(2023));
        assert_eq!(
            first.pdf_url.as_deref(),
            Some("https://www.jstatsoft.org/article/download/v105i01/4470")
        );
        assert_eq!(first.journal.as_deref(), Some("Journal of Statistical Software"));
        assert_eq!(first.source, "jss");

        assert_eq!(papers[1].id, "jss-v098i01");
        assert_eq!(papers[1].pdf_url, None);
    }

    #[test]
    fn test_parse_r_journal_listing() {
        let source =
            JournalSource::new(JournalProfile::r_journal(), &HttpSettings::default()).unwrap();
        let html = r#"<div class="article">
            <a href="/articles/RJ-2023-012/"><span class="title">Tidy Data Frames</span></a>
            <span class="authors">Jane Doe; John Roe</span>
            <a href="/articles/RJ-2023-012/RJ-2023-012.pdf">pdf</a>
        </div>"#;
        let papers = source.parse_listing(html);
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].id, "rjournal-RJ-2023-012");
        assert_eq!(papers[0].publish_year, Some(2023));
        assert_eq!(papers[0].authors.len(), 2);
        assert_eq!(
            papers[0].pdf_url.as_deref(),
            Some("https://journal.r-project.org/articles/RJ-2023-012/RJ-2023-012.pdf")
        );
    }

    #[test]
    fn test_year_filter_applies_to_discovered_papers() {
        let papers = jss().parse_listing(JSS_LISTING);
        let query = DiscoveryQuery::new(&[], 10)
            .with_dates(NaiveDate::from_ymd_opt(2022, 1, 1), None);
        let kept: Vec<_> = papers.iter().filter(|p| query.matches_dates(p)).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "jss-v105i01");
    }

    #[test]
    fn test_invalid_selector_is_a_config_error() {
        let mut profile = JournalProfile::jss();
        profile.article_selector = "div[".to_string();
        assert!(matches!(
            JournalSource::new(profile, &HttpSettings::default()),
            Err(ProviderError::ConfigError(_))
        ));
    }

    #[test]
    fn test_split_authors() {
        assert_eq!(split_authors("A, B and C"), vec!["A", "B", "C"]);
        assert_eq!(split_authors(" X ; Y "), vec!["X", "Y"]);
        assert!(split_authors("").is_empty());
    }
}
