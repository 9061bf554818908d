//! Per-site menu parsers behind a common contract, plus the site registry.
//!
//! Every parser turns one fetched page body into loosely-typed
//! [`RawRecord`]s; validation and date stamping happen later, at the
//! normalizer boundary. Site markup is idiosyncratic, so each parser is
//! deliberately narrow and fixture-tested.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use menuwatch_core::{RawPrice, RawRecord};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "menuwatch-adapters";

// Pizza Hut lists sides and drinks in the same payload; menu items start
// well above this.
const PIZZAHUT_MIN_PRICE: u32 = 2000;
const PIZZAHUT_PIZZA_CATEGORY_ID: i64 = 3;
const PIZZAHUT_PASTA_CATEGORY_ID: i64 = 2388;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("malformed page: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    Bellozzo,
    Donnamamma,
    EtnaPizza,
    EtnaPasta,
    Pizzahut,
}

impl ParserKind {
    /// File extension used when archiving the raw page body.
    pub fn artifact_extension(&self) -> &'static str {
        match self {
            ParserKind::Pizzahut => "json",
            _ => "html",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Plain HTTP GET of the configured url.
    #[default]
    Fetch,
    /// Payload captured out-of-band and dropped into the manual directory
    /// (sites that only render their menu through a browser session).
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    pub restaurant: String,
    pub category: String,
    pub url: String,
    pub parser: ParserKind,
    #[serde(default)]
    pub mode: FetchMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteConfig>,
}

pub fn load_site_registry(path: impl AsRef<Path>) -> Result<SiteRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub trait SiteParser: Send + Sync {
    fn parse(&self, body: &str, site: &SiteConfig) -> Result<Vec<RawRecord>, ParseError>;
}

pub fn parser_for(kind: ParserKind) -> Box<dyn SiteParser> {
    match kind {
        ParserKind::Bellozzo => Box::new(BellozzoParser),
        ParserKind::Donnamamma => Box::new(DonnamammaParser),
        ParserKind::EtnaPizza => Box::new(EtnaPizzaParser),
        ParserKind::EtnaPasta => Box::new(EtnaPastaParser),
        ParserKind::Pizzahut => Box::new(PizzahutParser),
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|err| ParseError::Selector(err.to_string()))
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef) -> String {
    collapse_ws(&el.text().collect::<Vec<_>>().join(" "))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    let mut out: String = first.to_uppercase().collect();
                    out.push_str(&chars.as_str().to_lowercase());
                    out
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DigitRun {
    start: usize,
    end: usize,
    len: usize,
    value: u32,
}

/// ASCII digit runs with byte offsets; runs too long for a u32 are skipped.
fn digit_runs(text: &str) -> Vec<DigitRun> {
    let bytes = text.as_bytes();
    let mut runs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(value) = text[start..i].parse::<u32>() {
                runs.push(DigitRun {
                    start,
                    end: i,
                    len: i - start,
                    value,
                });
            }
        } else {
            i += 1;
        }
    }
    runs
}

fn site_record(site: &SiteConfig, name: String, price: u32, description: String) -> RawRecord {
    RawRecord {
        restaurant: Some(site.restaurant.clone()),
        category: Some(site.category.clone()),
        name: Some(name),
        price: Some(RawPrice::Number(i64::from(price))),
        description: Some(description),
        row_index: None,
    }
}

/// Following sibling elements, in document order.
fn sibling_elements<'a>(el: &ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.next_siblings().filter_map(ElementRef::wrap)
}

fn is_centered_block(el: &ElementRef) -> bool {
    matches!(el.value().name(), "p" | "div") && el.value().attr("align") == Some("center")
}

/// Bellozzo: card-per-product markup; the price block sometimes splits the
/// amount across several spans, so the price is the last digit run across
/// the card's joined price text.
struct BellozzoParser;

impl SiteParser for BellozzoParser {
    fn parse(&self, body: &str, site: &SiteConfig) -> Result<Vec<RawRecord>, ParseError> {
        let document = Html::parse_document(body);
        let card_sel = selector(".menu-item-box")?;
        let name_sel = selector(".menu-item-maintitle span")?;
        let desc_sel = selector(".menu-item-component")?;
        let price_sel = selector(".menu-item-price")?;

        let mut items = Vec::new();
        for card in document.select(&card_sel) {
            let name = card
                .select(&name_sel)
                .next()
                .map(|el| element_text(&el))
                .unwrap_or_else(|| "N/A".to_string());
            let description = card
                .select(&desc_sel)
                .next()
                .map(|el| element_text(&el))
                .unwrap_or_default();
            let price_text = card
                .select(&price_sel)
                .map(|el| element_text(&el))
                .collect::<Vec<_>>()
                .join(" ");
            let price = digit_runs(&price_text)
                .last()
                .map(|run| run.value)
                .unwrap_or(0);

            items.push(site_record(site, name, price, description));
        }
        Ok(items)
    }
}

/// Donna Mamma: infobox cards per page section; the menu sections come
/// before the salads section, so parsing stops there.
struct DonnamammaParser;

impl SiteParser for DonnamammaParser {
    fn parse(&self, body: &str, site: &SiteConfig) -> Result<Vec<RawRecord>, ParseError> {
        let document = Html::parse_document(body);
        let section_sel = selector("section")?;
        let heading_sel = selector("h2")?;
        let card_sel = selector("div.eael-infobox")?;
        let name_sel = selector("h2.title")?;
        let desc_sel = selector(".infobox-content p")?;
        let price_sel = selector(".infobox-button-text")?;

        let mut items = Vec::new();
        for section in document.select(&section_sel) {
            let is_salad_section = section
                .select(&heading_sel)
                .any(|h| element_text(&h).to_lowercase().contains("olasz ízvilágú salátáink"));
            if is_salad_section {
                break;
            }

            for card in section.select(&card_sel) {
                let (Some(name_el), Some(desc_el), Some(price_el)) = (
                    card.select(&name_sel).next(),
                    card.select(&desc_sel).next(),
                    card.select(&price_sel).next(),
                ) else {
                    continue;
                };

                let name = title_case(&element_text(&name_el));
                if name.to_lowercase().contains("pisztácia") {
                    continue;
                }

                let price_text: String = element_text(&price_el)
                    .replace("Ft", "")
                    .chars()
                    .filter(|c| !c.is_whitespace() && *c != '.')
                    .collect();
                let Ok(price) = price_text.parse::<u32>() else {
                    continue;
                };

                items.push(site_record(site, name, price, element_text(&desc_el)));
            }
        }
        Ok(items)
    }
}

/// Etna pizza menu: centered headers carrying name and price, with the
/// large ("GM") size price listed after the regular one. The primary price
/// is the first digit run followed by `.-` before any "GM" marker; some
/// entries split the amount ("28" + "00.-" means 2800).
struct EtnaPizzaParser;

impl EtnaPizzaParser {
    fn primary_price(text: &str, gm_pos: Option<usize>) -> Option<u32> {
        let runs = digit_runs(text);
        let direct = runs.iter().find(|run| {
            run.value > 0
                && text[run.end..].starts_with(".-")
                && gm_pos.map_or(true, |gm| run.start < gm)
        });
        if let Some(run) = direct {
            return Some(run.value);
        }

        // Split-price fallback: combine the last two runs before "GM".
        let head = gm_pos.map_or(text, |gm| &text[..gm]);
        let head_runs = digit_runs(head);
        if head_runs.len() < 2 {
            return None;
        }
        let low = head_runs[head_runs.len() - 1];
        let high = head_runs[head_runs.len() - 2];
        let combined =
            u64::from(high.value) * 10u64.checked_pow(low.len as u32)? + u64::from(low.value);
        u32::try_from(combined).ok()
    }

    fn product_name(header: &ElementRef, highlight_sel: &Selector, span_sel: &Selector) -> String {
        if let Some(el) = header.select(highlight_sel).next() {
            return collapse_ws(&element_text(&el));
        }
        for span in header.select(span_sel) {
            let text = element_text(&span);
            if !text.is_empty()
                && !text
                    .chars()
                    .any(|c| c.is_ascii_digit() || c == '.' || c == '-')
            {
                return text;
            }
        }
        "N/A".to_string()
    }
}

impl SiteParser for EtnaPizzaParser {
    fn parse(&self, body: &str, site: &SiteConfig) -> Result<Vec<RawRecord>, ParseError> {
        let document = Html::parse_document(body);
        let header_sel = selector(r#"p[align="center"], div[align="center"]"#)?;
        let highlight_sel = selector(r#"span[style*="rgb(189, 148, 0)"]"#)?;
        let span_sel = selector("span")?;

        let mut items = Vec::new();
        let mut seen_names = HashSet::new();

        for header in document.select(&header_sel) {
            let text = element_text(&header);
            let gm_pos = text.find("GM");

            let Some(price) = Self::primary_price(&text, gm_pos).filter(|&p| p > 0) else {
                continue;
            };

            let name = Self::product_name(&header, &highlight_sel, &span_sel);
            if !seen_names.insert(name.clone()) {
                continue;
            }

            let description = sibling_elements(&header)
                .find(is_centered_block)
                .map(|el| element_text(&el))
                .unwrap_or_default();

            items.push(site_record(site, name, price, description));
        }
        Ok(items)
    }
}

/// Etna pasta menu: the same centered-header markup, but prices are bare
/// three-to-four digit runs and group headings ("... alapú") and footer
/// lines are interleaved with the products.
struct EtnaPastaParser;

impl EtnaPastaParser {
    fn strip_course_marker(name: &str) -> String {
        name.split_whitespace()
            .filter(|token| *token != "N." && *token != "N")
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn strip_sauce_label(text: &str) -> String {
        let lower = text.to_lowercase();
        for label in ["paradicsom alapú", "tejszín alapú"] {
            if lower.starts_with(label) {
                return text[label.len()..]
                    .trim_start()
                    .trim_start_matches(':')
                    .trim()
                    .to_string();
            }
        }
        text.trim().to_string()
    }

    fn sibling_description(header: &ElementRef) -> Option<String> {
        let sibling = sibling_elements(header).find(is_centered_block)?;
        let text = element_text(&sibling);
        let lower = text.to_lowercase();
        let has_price = digit_runs(&text).iter().any(|run| (3..=4).contains(&run.len));
        if has_price || text.contains(".-") || text.contains("GM") || lower.contains("nem elérhető")
        {
            return None;
        }
        Some(Self::strip_sauce_label(&text))
    }
}

impl SiteParser for EtnaPastaParser {
    fn parse(&self, body: &str, site: &SiteConfig) -> Result<Vec<RawRecord>, ParseError> {
        let document = Html::parse_document(body);
        let header_sel = selector(r#"p[align="center"], div[align="center"]"#)?;

        let mut items = Vec::new();
        let mut seen_names = HashSet::new();

        for header in document.select(&header_sel) {
            let text = element_text(&header);
            let lower = text.to_lowercase();
            if lower.contains("alapú")
                || lower.contains('©')
                || lower.contains("all rights")
                || lower.contains("web by")
                || lower.contains("design by")
            {
                continue;
            }

            let gm_pos = text.find("GM");
            let Some(run) = digit_runs(&text).into_iter().find(|run| {
                (3..=4).contains(&run.len) && gm_pos.map_or(true, |gm| run.start < gm)
            }) else {
                continue;
            };

            let name = collapse_ws(&Self::strip_course_marker(text[..run.start].trim()));
            if name.is_empty() || !seen_names.insert(name.clone()) {
                continue;
            }

            let description = Self::sibling_description(&header).unwrap_or_else(|| {
                Self::strip_sauce_label(&collapse_ws(&text[run.end..]))
            });

            items.push(site_record(site, name, run.value, description));
        }
        Ok(items)
    }
}

/// Pizza Hut: the takeaway menu is a JSON payload captured out-of-band
/// (the site only serves it to a browser session). Accepts either the full
/// response envelope or the inner menu object.
struct PizzahutParser;

impl SiteParser for PizzahutParser {
    fn parse(&self, body: &str, site: &SiteConfig) -> Result<Vec<RawRecord>, ParseError> {
        let value: JsonValue = serde_json::from_str(body)
            .map_err(|err| ParseError::Malformed(format!("invalid menu payload: {err}")))?;
        let menu = value.get("menu").unwrap_or(&value);
        let categories = menu
            .get("categories")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| ParseError::Malformed("payload has no categories".to_string()))?;

        let mut items = Vec::new();
        for category in categories {
            let category_name = match category.get("id").and_then(JsonValue::as_i64) {
                Some(PIZZAHUT_PIZZA_CATEGORY_ID) => "pizza",
                Some(PIZZAHUT_PASTA_CATEGORY_ID) => "pasta",
                _ => continue,
            };
            let Some(products) = category.get("products").and_then(JsonValue::as_object) else {
                continue;
            };

            for product in products.values() {
                let price = product
                    .get("price")
                    .and_then(JsonValue::as_f64)
                    .unwrap_or(0.0) as u32;
                if price < PIZZAHUT_MIN_PRICE {
                    continue;
                }
                let name = title_case(
                    product
                        .get("name")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("")
                        .trim(),
                );
                let description = product
                    .get("description")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();

                items.push(RawRecord {
                    restaurant: Some(site.restaurant.clone()),
                    category: Some(category_name.to_string()),
                    name: Some(name),
                    price: Some(RawPrice::Number(i64::from(price))),
                    description: Some(description),
                    row_index: None,
                });
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_runs_report_offsets_and_values() {
        let runs = digit_runs("Margherita 28 00.- GM 3400.-");
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].value, 28);
        assert_eq!(runs[1].value, 0);
        assert_eq!(runs[1].len, 2);
        assert_eq!(runs[2].value, 3400);
    }

    #[test]
    fn etna_primary_price_prefers_marked_price_before_gm() {
        let text = "Quattro Formaggi 2800.- GM 3600.-";
        let gm = text.find("GM");
        assert_eq!(EtnaPizzaParser::primary_price(text, gm), Some(2800));
    }

    #[test]
    fn etna_primary_price_combines_split_amounts() {
        // "28" and "00" render as one price broken across spans
        let text = "Songoku 28 00 GM 3600";
        let gm = text.find("GM");
        assert_eq!(EtnaPizzaParser::primary_price(text, gm), Some(2800));
    }

    #[test]
    fn etna_primary_price_ignores_the_gm_section() {
        let text = "Songoku GM 3600.-";
        let gm = text.find("GM");
        assert_eq!(EtnaPizzaParser::primary_price(text, gm), None);
    }

    #[test]
    fn course_markers_are_stripped_from_pasta_names() {
        assert_eq!(
            EtnaPastaParser::strip_course_marker("N. Carbonara"),
            "Carbonara"
        );
        assert_eq!(
            EtnaPastaParser::strip_course_marker("Bolognese N"),
            "Bolognese"
        );
    }

    #[test]
    fn sauce_labels_are_stripped_from_descriptions() {
        assert_eq!(
            EtnaPastaParser::strip_sauce_label("paradicsom alapú: bacon, sajt"),
            "bacon, sajt"
        );
        assert_eq!(
            EtnaPastaParser::strip_sauce_label("tejszín alapú : bacon, sajt"),
            "bacon, sajt"
        );
        assert_eq!(
            EtnaPastaParser::strip_sauce_label("bacon, sajt"),
            "bacon, sajt"
        );
    }

    #[test]
    fn title_case_lowercases_the_tail_of_each_word() {
        assert_eq!(title_case("QUATTRO stagioni"), "Quattro Stagioni");
    }

    #[test]
    fn registry_defaults_mode_and_enabled() {
        let yaml = r#"
sites:
  - site_id: bellozzo-pizza
    restaurant: Bellozzo
    category: pizza
    url: https://example.test/pizzak.html
    parser: bellozzo
  - site_id: pizzahut
    restaurant: Pizza Hut
    category: both
    url: https://example.test/menu-takeaway
    parser: pizzahut
    mode: manual
    enabled: false
"#;
        let registry: SiteRegistry = serde_yaml::from_str(yaml).expect("parse registry");
        assert_eq!(registry.sites.len(), 2);
        assert_eq!(registry.sites[0].mode, FetchMode::Fetch);
        assert!(registry.sites[0].enabled);
        assert_eq!(registry.sites[1].parser, ParserKind::Pizzahut);
        assert_eq!(registry.sites[1].mode, FetchMode::Manual);
        assert!(!registry.sites[1].enabled);
    }
}
