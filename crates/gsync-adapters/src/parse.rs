//! Scholar HTML extraction: profile pages and publication detail pages.

use chrono::NaiveDate;
use gsync_core::{CitationGraph, PublicationDetail, ScrapeSnapshot, ScrapedPublication, StatsRow};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Earliest publication year kept as-is; older years are clamped up to it.
pub const MIN_PUBLICATION_YEAR: i32 = 1901;

const PROFILE_GRAPH: &str = "#gsc_rsb_cit .gsc_md_hist_b";
const PUBLICATION_GRAPH: &str = "#gsc_oci_graph_bars";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("page has no {0} element")]
    Missing(&'static str),
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(format!("{css}: {e}")))
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_count(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Parses one page of a profile: publication rows, plus the citation graph
/// and statistics table from the sidebar.
pub fn parse_profile_page(html: &str, base: &Url) -> Result<ScrapeSnapshot, ParseError> {
    let document = Html::parse_document(html);
    let body_sel = selector("#gsc_a_b")?;
    let Some(body) = document.select(&body_sel).next() else {
        return Err(ParseError::Missing("#gsc_a_b"));
    };

    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a")?;
    let span_sel = selector("span")?;

    let mut publications = Vec::new();
    for row in body.select(&row_sel) {
        let cells: Vec<_> = row.select(&cell_sel).collect();
        // The "no articles" placeholder row has no title link.
        let Some(title_link) = cells.first().and_then(|c| c.select(&link_sel).next()) else {
            continue;
        };

        let url = publication_link(title_link, base);
        let citations = cells
            .get(1)
            .and_then(|c| c.select(&link_sel).next())
            .and_then(|a| parse_count(&text_of(a)))
            .unwrap_or(0);
        let year = cells
            .get(2)
            .and_then(|c| c.select(&span_sel).next())
            .and_then(|s| text_of(s).parse::<i32>().ok())
            .map(|y| y.max(MIN_PUBLICATION_YEAR));

        publications.push(ScrapedPublication {
            title: text_of(title_link),
            year,
            scholar_publication_id: url.as_deref().and_then(scholar_publication_id),
            url,
            citations,
        });
    }

    let graph_sel = selector(PROFILE_GRAPH)?;
    let citation_graph = match document.select(&graph_sel).next() {
        Some(scope) => parse_year_graph(scope)?,
        None => CitationGraph::new(),
    };

    Ok(ScrapeSnapshot {
        publications,
        citation_graph,
        stats_rows: parse_stats_rows(&document)?,
    })
}

fn publication_link(link: ElementRef<'_>, base: &Url) -> Option<String> {
    ["data-href", "href"]
        .into_iter()
        .filter_map(|attr| link.value().attr(attr))
        .map(str::trim)
        .find(|href| !href.is_empty() && !href.starts_with("javascript:"))
        .and_then(|href| base.join(href).ok())
        .map(|url| url.to_string())
}

/// The publication key embedded in `citation_for_view=<user>:<key>`.
pub fn scholar_publication_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let (_, value) = parsed
        .query_pairs()
        .find(|(key, _)| key == "citation_for_view")?;
    let (user, key) = value.split_once(':')?;
    if user.is_empty() || key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

fn parse_stats_rows(document: &Html) -> Result<Vec<StatsRow>, ParseError> {
    let row_sel = selector("#gsc_rsb_st tbody tr")?;
    let cell_sel = selector("td")?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<_> = row.select(&cell_sel).collect();
        if cells.is_empty() {
            continue;
        }
        let all_time = cells.get(1).and_then(|c| parse_count(&text_of(*c)));
        let recent = cells.get(2).and_then(|c| parse_count(&text_of(*c)));
        match (all_time, recent) {
            (Some(all_time), Some(recent)) => rows.push(StatsRow { all_time, recent }),
            _ => debug!(cells = cells.len(), "skipping unusable statistics row"),
        }
    }
    Ok(rows)
}

/// Each bar carries `z-index:N` in its style; N counts back from the most
/// recent year label (1 = latest). Years without a bar are left out.
fn parse_year_graph(scope: ElementRef<'_>) -> Result<CitationGraph, ParseError> {
    let year_sel = selector(".gsc_g_t")?;
    let bar_sel = selector(".gsc_g_a")?;
    let value_sel = selector(".gsc_g_al")?;

    let mut years_latest_first: Vec<Option<i32>> = scope
        .select(&year_sel)
        .map(|label| text_of(label).parse().ok())
        .collect();
    years_latest_first.reverse();

    let mut graph = CitationGraph::new();
    for bar in scope.select(&bar_sel) {
        let Some(z) = bar.value().attr("style").and_then(z_index) else {
            warn!("graph bar without z-index");
            continue;
        };
        let year = z
            .checked_sub(1)
            .and_then(|i| years_latest_first.get(i))
            .copied()
            .flatten();
        let Some(year) = year else {
            warn!(z, "graph bar does not map to a year label");
            continue;
        };
        let count = bar
            .select(&value_sel)
            .next()
            .and_then(|v| parse_count(&text_of(v)))
            .unwrap_or(0);
        graph.insert(year, count);
    }
    Ok(graph)
}

fn z_index(style: &str) -> Option<usize> {
    let (_, rest) = style.rsplit_once("z-index:")?;
    rest.split(';').next()?.trim().parse().ok()
}

/// Parses a publication's detail page. Unknown fields are ignored.
pub fn parse_publication_page(html: &str) -> Result<PublicationDetail, ParseError> {
    let document = Html::parse_document(html);
    let table_sel = selector("#gsc_oci_table")?;
    let Some(table) = document.select(&table_sel).next() else {
        return Err(ParseError::Missing("#gsc_oci_table"));
    };

    let row_sel = selector(".gs_scl")?;
    let field_sel = selector(".gsc_oci_field")?;
    let value_sel = selector(".gsc_oci_value")?;

    let mut detail = PublicationDetail::default();
    for row in table.select(&row_sel) {
        let Some(field) = row.select(&field_sel).next().map(text_of) else {
            continue;
        };
        let value = row
            .select(&value_sel)
            .next()
            .map(text_of)
            .and_then(text_or_none);
        match field.as_str() {
            "Authors" => detail.authors = value,
            "Publication date" => {
                detail.publication_date = value.as_deref().and_then(parse_publication_date)
            }
            "Journal" => detail.journal = value,
            "Publisher" => detail.publisher = value,
            _ => {}
        }
    }

    let graph_sel = selector(PUBLICATION_GRAPH)?;
    if let Some(scope) = document.select(&graph_sel).next() {
        detail.citation_graph = parse_year_graph(scope)?;
    }
    Ok(detail)
}

/// Accepts `YYYY`, `YYYY/MM` and `YYYY/MM/DD`; missing parts default to 1.
pub fn parse_publication_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split('/').collect();
    let numbers = parts
        .iter()
        .map(|p| p.parse::<u32>().ok())
        .collect::<Option<Vec<_>>>();

    let date = match numbers.as_deref() {
        Some(&[year]) if parts[0].len() == 4 => NaiveDate::from_ymd_opt(year as i32, 1, 1),
        Some(&[year, month]) => NaiveDate::from_ymd_opt(year as i32, month, 1),
        Some(&[year, month, day]) => NaiveDate::from_ymd_opt(year as i32, month, day),
        _ => None,
    };
    if date.is_none() {
        warn!(raw, "unparseable publication date");
    }
    date
}
