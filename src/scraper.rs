// 🌐 Carbon Price Scraper - relay for the live prices page
// Fetches the page with browser headers and cuts out the price table HTML.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_CARBON_PRICES_URL: &str =
    "https://carboncredits.com/live-carbon-prices/index.php";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("failed to fetch carbon prices: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("carbon prices source returned status {0}")]
    Status(u16),

    #[error("no price table found")]
    NoTable,
}

fn container_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)class\s*=\s*["'](?:[^"']*\s)?live-carbon-prices(?:\s[^"']*)?["']"#)
            .expect("container regex is valid")
    })
}

fn table_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(/?)table\b[^>]*>").expect("table regex is valid"))
}

/// Outer HTML of the first complete `<table>` opening in `html[from..to]`.
/// Nested tables are balanced so the outer one is returned whole.
fn table_in(html: &str, from: usize, to: usize) -> Option<String> {
    let mut depth = 0usize;
    let mut start = None;

    for caps in table_tag_regex().captures_iter(&html[from..to]) {
        let tag = caps.get(0)?;
        let closing = caps.get(1).map(|m| !m.as_str().is_empty()).unwrap_or(false);

        if !closing {
            if depth == 0 {
                start = Some(from + tag.start());
            }
            depth += 1;
        } else if depth > 0 {
            depth -= 1;
            if depth == 0 {
                let begin = start?;
                return Some(html[begin..from + tag.end()].to_string());
            }
        }
    }

    None
}

/// Byte range of the content of the element whose opening tag contains
/// offset `attr_at`. An element that is never closed runs to the end of
/// the document.
fn element_body(html: &str, attr_at: usize) -> Option<(usize, usize)> {
    let open = html[..attr_at].rfind('<')?;
    let name: String = html[open + 1..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    if name.is_empty() {
        return None;
    }
    let body_start = attr_at + html[attr_at..].find('>')? + 1;

    let tag_re = Regex::new(&format!(r"(?i)<(/?){}\b[^>]*>", regex::escape(&name))).ok()?;
    let mut depth = 1usize;
    for caps in tag_re.captures_iter(&html[body_start..]) {
        let tag = caps.get(0)?;
        let closing = caps.get(1).map(|m| !m.as_str().is_empty()).unwrap_or(false);

        if closing {
            depth -= 1;
            if depth == 0 {
                return Some((body_start, body_start + tag.start()));
            }
        } else if !tag.as_str().ends_with("/>") {
            depth += 1;
        }
    }

    Some((body_start, html.len()))
}

/// Find the price table: first table inside a `live-carbon-prices` container,
/// else the first table on the page.
pub fn extract_price_table(html: &str) -> Option<String> {
    if let Some(container) = container_regex().find(html) {
        if let Some((start, end)) = element_body(html, container.start()) {
            if let Some(table) = table_in(html, start, end) {
                return Some(table);
            }
        }
    }

    debug!("no live-carbon-prices container table, trying first table");
    table_in(html, 0, html.len())
}

#[derive(Debug, Clone)]
pub struct PriceScraper {
    client: reqwest::Client,
    url: String,
}

impl PriceScraper {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw page HTML.
    pub async fn fetch_page(&self) -> Result<String, ScrapeError> {
        info!(url = %self.url, "fetching live carbon prices");

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "carbon prices source returned error");
            return Err(ScrapeError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        debug!(
            bytes = body.len(),
            preview = %body.chars().take(500).collect::<String>(),
            "carbon prices page fetched"
        );
        Ok(body)
    }

    /// Fetch the page and return the price table's outer HTML.
    pub async fn fetch_price_table(&self) -> Result<String, ScrapeError> {
        let html = self.fetch_page().await?;
        extract_price_table(&html).ok_or_else(|| {
            warn!("no price table in carbon prices page");
            ScrapeError::NoTable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <table id="nav"><tr><td>menu</td></tr></table>
          <div class="widget live-carbon-prices dark">
            <h2>Prices</h2>
            <TABLE class="prices"><tr><td>EU</td><td>79.90</td></tr></TABLE>
          </div>
        </body></html>"#;

    #[test]
    fn test_prefers_container_table() {
        let table = extract_price_table(PAGE).unwrap();
        assert!(table.starts_with("<TABLE class=\"prices\">"));
        assert!(table.contains("79.90"));
        assert!(table.ends_with("</TABLE>"));
    }

    #[test]
    fn test_falls_back_to_first_table() {
        let html = "<p>x</p><table><tr><td>only</td></tr></table><table>second</table>";
        assert_eq!(
            extract_price_table(html).unwrap(),
            "<table><tr><td>only</td></tr></table>"
        );
    }

    #[test]
    fn test_nested_tables_balanced() {
        let html = r#"<div class='live-carbon-prices'><table><tr><td><table><tr><td>in</td></tr></table></td></tr></table></div>"#;
        let table = extract_price_table(html).unwrap();
        assert!(table.ends_with("</td></tr></table>"));
        assert_eq!(table.matches("</table>").count(), 2);
    }

    #[test]
    fn test_no_table() {
        assert_eq!(extract_price_table("<div class='live-carbon-prices'>none</div>"), None);
        assert_eq!(extract_price_table("<table><tr>unterminated"), None);
    }

    #[test]
    fn test_empty_container_ignores_later_tables() {
        let html = r#"<table>first</table><div class="live-carbon-prices">no table</div><footer><table>footer</table></footer>"#;
        assert_eq!(extract_price_table(html).unwrap(), "<table>first</table>");
    }

    #[test]
    fn test_container_end_balances_nested_divs() {
        let html = r#"<table>nav</table><div class="live-carbon-prices"><div>head</div><div><table>prices</table></div></div><table>footer</table>"#;
        assert_eq!(extract_price_table(html).unwrap(), "<table>prices</table>");
    }

    #[test]
    fn test_similar_class_name_does_not_match() {
        let html = r#"<table>first</table><div class="live-carbon-prices-old"><table>old</table></div>"#;
        assert_eq!(extract_price_table(html).unwrap(), "<table>first</table>");
    }

    #[tokio::test]
    async fn test_fetch_sends_browser_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/live")
            .match_header("user-agent", BROWSER_USER_AGENT)
            .match_header("accept-language", "en-US,en;q=0.9")
            .with_status(200)
            .with_body(PAGE)
            .create_async()
            .await;

        let scraper = PriceScraper::new(format!("{}/live", server.url()));
        let table = scraper.fetch_price_table().await.unwrap();

        assert!(table.contains("79.90"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/live")
            .with_status(503)
            .create_async()
            .await;

        let scraper = PriceScraper::new(format!("{}/live", server.url()));
        assert!(matches!(
            scraper.fetch_price_table().await,
            Err(ScrapeError::Status(503))
        ));
    }

    #[tokio::test]
    async fn test_page_without_table() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/live")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let scraper = PriceScraper::new(format!("{}/live", server.url()));
        assert!(matches!(
            scraper.fetch_price_table().await,
            Err(ScrapeError::NoTable)
        ));
    }
}
