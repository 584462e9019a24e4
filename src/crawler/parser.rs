//! Search-results (index) page parser
//!
//! Extracts the ordered detail-page links of every listing card. A card
//! without the expected link is skipped with a warning; the rest of the
//! page is still returned.

use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use url::Url;

static CARD: LazyLock<Option<Selector>> =
    LazyLock::new(|| Selector::parse(r#"article[data-name="CardComponent"]"#).ok());

/// Card links carry a hashed class name from the `--link--` family
static CARD_LINK: LazyLock<Option<Selector>> =
    LazyLock::new(|| Selector::parse(r#"a[class*="--link--"][href]"#).ok());

/// Links extracted from one search-results page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPage {
    /// Absolute detail-page URLs in document order, duplicates kept
    pub urls: Vec<String>,

    /// Cards that had no usable link
    pub skipped: usize,
}

impl IndexPage {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Parses a search-results page
///
/// # Arguments
///
/// * `html` - The page markup
/// * `base_url` - Site root used to resolve relative card links
///
/// # Example
///
/// ```
/// use estate_watch::crawler::parse_index;
/// use url::Url;
///
/// let html = r#"<article data-name="CardComponent">
///     <a class="_93444fe79c--link--eoxce" href="/sale/flat/1/">Flat</a>
/// </article>"#;
/// let base = Url::parse("https://www.cian.ru/").unwrap();
/// let page = parse_index(html, &base);
/// assert_eq!(page.urls, vec!["https://www.cian.ru/sale/flat/1/"]);
/// ```
pub fn parse_index(html: &str, base_url: &Url) -> IndexPage {
    let (Some(card_selector), Some(link_selector)) = (CARD.as_ref(), CARD_LINK.as_ref()) else {
        return IndexPage::default();
    };

    let document = Html::parse_document(html);
    let mut page = IndexPage::default();

    for (position, card) in document.select(card_selector).enumerate() {
        match card_link(card, link_selector, base_url) {
            Some(url) => page.urls.push(url),
            None => {
                tracing::warn!(card = position, "Listing card without a detail link, skipping");
                page.skipped += 1;
            }
        }
    }

    tracing::debug!(
        found = page.urls.len(),
        skipped = page.skipped,
        "Parsed index page"
    );

    page
}

fn card_link(card: ElementRef<'_>, selector: &Selector, base_url: &Url) -> Option<String> {
    card.select(selector)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| resolve_link(href, base_url))
}

/// Resolves a link href to an absolute URL and validates it
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel:, data: hrefs
/// - fragment-only hrefs
/// - Non-HTTP(S) URLs after resolution
pub(crate) fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| href.starts_with(scheme))
    {
        return None;
    }

    let absolute_url = base_url.join(href).ok()?;
    match absolute_url.scheme() {
        "http" | "https" => Some(absolute_url.to_string()),
        _ => None,
    }
}
