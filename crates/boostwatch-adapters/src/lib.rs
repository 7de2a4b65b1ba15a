//! HTML snapshot parsers for the boost pages.
//!
//! Pure functions from raw markup to structured records. Parse problems never
//! surface as errors: a missing section yields an empty result (with a
//! diagnostic log) and malformed numeric text counts as zero, so a bad page
//! degrades to "no data this round" instead of killing a poll cycle.

use boostwatch_core::{ContributionRecord, FeaturedItem};
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "boostwatch-adapters";

/// Which part of the fetched document holds the contribution listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Section {
    /// The listing items appear anywhere in the document (AJAX fragments).
    Document,
    /// The listing is scoped to a `div[data-page="..."]` tab block.
    DataPage(String),
}

fn sel(selector: &'static str) -> Selector {
    Selector::parse(selector).expect("static selector is valid")
}

/// Extracts the ordered contribution listing from `html`.
///
/// Order is as-encountered in the source, which the server already emits in
/// contribution-descending order. Items without a profile link are skipped;
/// relative profile hrefs are absolutized against `base_url`.
pub fn parse_contributions(html: &str, section: &Section, base_url: &str) -> Vec<ContributionRecord> {
    let document = Html::parse_document(html);
    let item_sel = sel(".club-boost__top-item");

    let items: Vec<ElementRef<'_>> = match section {
        Section::Document => document.select(&item_sel).collect(),
        Section::DataPage(name) => {
            let scoped = format!("div[data-page=\"{name}\"]");
            let Ok(section_sel) = Selector::parse(&scoped) else {
                warn!(section = %name, "section name does not form a valid selector");
                return Vec::new();
            };
            match document.select(&section_sel).next() {
                Some(block) => block.select(&item_sel).collect(),
                None => {
                    warn!(section = %name, "section block not found in page");
                    return Vec::new();
                }
            }
        }
    };

    if items.is_empty() {
        warn!("no contribution items found in listing");
        return Vec::new();
    }

    let name_sel = sel("a.club-boost__top-name");
    let contrib_sel = sel(".club-boost__top-contribution");

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let Some(name_link) = item.select(&name_sel).next() else {
            continue;
        };
        let display_name = collect_text(&name_link);
        let href = name_link.value().attr("href").unwrap_or_default();
        let entity_id = entity_id_from_href(href).unwrap_or(0);
        let profile_url = absolutize(href, base_url);
        let contribution = item
            .select(&contrib_sel)
            .next()
            .map(|el| parse_count(&collect_text(&el)))
            .unwrap_or(0);

        records.push(ContributionRecord {
            entity_id,
            display_name,
            profile_url,
            contribution,
        });
    }

    debug!(count = records.len(), "parsed contribution listing");
    records
}

/// Extracts the currently featured card from the boost page, if any.
///
/// The item id comes from the `/cards/{id}/users` owners link; the image and
/// the two page counters are best-effort.
pub fn parse_featured(html: &str, base_url: &str) -> Option<FeaturedItem> {
    let document = Html::parse_document(html);

    let link_sel = sel(r#"a[href*="/cards/"][href*="/users"]"#);
    let href = document
        .select(&link_sel)
        .next()
        .and_then(|link| link.value().attr("href"))?;
    let item_id = id_between(href, "/cards/", "/users")?;

    let image_sel = sel(".club-boost__image img");
    let image = document.select(&image_sel).next();
    let image_url = image
        .and_then(|img| img.value().attr("src"))
        .and_then(|src| absolutize(src, base_url));
    let display_name = image
        .and_then(|img| img.value().attr("alt"))
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("#{item_id}"));

    let page_text: String = document.root_element().text().collect();
    let counters = fraction_pairs(&page_text);
    let replacements = counters.first().map(|(a, b)| format!("{a}/{b}"));
    let daily_donated = counters.get(1).map(|(a, b)| format!("{a}/{b}"));

    let owners_sel = sel(r#".club-boost__owners-list a[href*="/users/"]"#);
    let owner_ids = document
        .select(&owners_sel)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(entity_id_from_href)
        .collect();

    Some(FeaturedItem {
        item_id,
        display_name,
        image_url,
        replacements,
        daily_donated,
        owner_ids,
        discovered_at: Utc::now(),
    })
}

fn collect_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Numeric id out of an `/users/{id}` href.
fn entity_id_from_href(href: &str) -> Option<i64> {
    id_after(href, "/users/")
}

fn id_after(href: &str, marker: &str) -> Option<i64> {
    let rest = href.split(marker).nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn id_between(href: &str, start: &str, end: &str) -> Option<i64> {
    let rest = href.split(start).nth(1)?;
    let head = rest.split(end).next()?;
    head.trim_matches('/').parse().ok()
}

fn absolutize(href: &str, base_url: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        None
    } else if href.starts_with('/') {
        Some(format!("{}{}", base_url.trim_end_matches('/'), href))
    } else {
        Some(href.to_string())
    }
}

/// Malformed numeric text counts as zero rather than dropping the record.
fn parse_count(text: &str) -> i64 {
    text.trim().parse().unwrap_or(0)
}

/// Scans free text for "X / Y" counter patterns, in document order.
fn fraction_pairs(text: &str) -> Vec<(i64, i64)> {
    let mut pairs = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let num_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let first: i64 = match text[num_start..i].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let mut j = i;
        while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b'/' {
            continue;
        }
        j += 1;
        while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
            j += 1;
        }
        let denom_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if denom_start == j {
            continue;
        }
        if let Ok(second) = text[denom_start..j].parse() {
            pairs.push((first, second));
        }
        i = j;
    }
    pairs
}
