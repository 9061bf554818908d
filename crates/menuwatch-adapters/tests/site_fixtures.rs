//! Fixture tests for the per-site parsers, using captured page samples
//! checked in under `fixtures/`.

use std::path::{Path, PathBuf};

use menuwatch_adapters::{parser_for, FetchMode, ParserKind, SiteConfig};
use menuwatch_core::RawRecord;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(site_id: &str, file: &str) -> String {
    let path = workspace_root().join("fixtures").join(site_id).join(file);
    std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("reading {}", path.display()))
}

fn site(site_id: &str, restaurant: &str, category: &str, parser: ParserKind) -> SiteConfig {
    SiteConfig {
        site_id: site_id.to_string(),
        restaurant: restaurant.to_string(),
        category: category.to_string(),
        url: format!("https://example.test/{site_id}"),
        parser,
        mode: FetchMode::Fetch,
        enabled: true,
    }
}

fn price(record: &RawRecord) -> u32 {
    record
        .price
        .as_ref()
        .expect("price present")
        .as_minor_units()
        .expect("price parses")
}

#[test]
fn bellozzo_takes_the_last_price_run_per_card() {
    let config = site("bellozzo-pizza", "Bellozzo", "pizza", ParserKind::Bellozzo);
    let records = parser_for(config.parser)
        .parse(&fixture("bellozzo", "sample.html"), &config)
        .expect("parse");

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name.as_deref(), Some("Margherita"));
    assert_eq!(price(&records[0]), 2590);
    assert_eq!(
        records[0].description.as_deref(),
        Some("paradicsomszósz, mozzarella, bazsalikom")
    );
    assert_eq!(records[0].restaurant.as_deref(), Some("Bellozzo"));
    assert_eq!(records[0].category.as_deref(), Some("pizza"));

    // two price blocks on the card; the larger size is listed last
    assert_eq!(records[1].name.as_deref(), Some("Diavola"));
    assert_eq!(price(&records[1]), 2890);
}

#[test]
fn donnamamma_stops_at_salads_and_skips_pistachio() {
    let config = site("donnamamma-pizza", "Donna Mamma", "pizza", ParserKind::Donnamamma);
    let records = parser_for(config.parser)
        .parse(&fixture("donnamamma", "sample.html"), &config)
        .expect("parse");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name.as_deref(), Some("Quattro Stagioni"));
    assert_eq!(price(&records[0]), 3490);
    assert_eq!(
        records[0].description.as_deref(),
        Some("sonka, gomba, articsóka, olívabogyó")
    );
}

#[test]
fn etna_pizza_reads_marked_and_split_prices() {
    let config = site("etna-pizza", "Etna", "pizza", ParserKind::EtnaPizza);
    let records = parser_for(config.parser)
        .parse(&fixture("etna-pizza", "sample.html"), &config)
        .expect("parse");

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name.as_deref(), Some("SONGOKU"));
    assert_eq!(price(&records[0]), 2800);
    assert_eq!(records[0].description.as_deref(), Some("sonka, kukorica, sajt"));

    // split "28" + "00" spans combine into one amount
    assert_eq!(records[1].name.as_deref(), Some("HAWAII"));
    assert_eq!(price(&records[1]), 2800);
    assert_eq!(records[1].description.as_deref(), Some("sonka, ananász, sajt"));
}

#[test]
fn etna_pasta_skips_headings_and_strips_markers() {
    let config = site("etna-pasta", "Etna", "pasta", ParserKind::EtnaPasta);
    let records = parser_for(config.parser)
        .parse(&fixture("etna-pasta", "sample.html"), &config)
        .expect("parse");

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name.as_deref(), Some("Bolognese"));
    assert_eq!(price(&records[0]), 1950);
    assert_eq!(
        records[0].description.as_deref(),
        Some("darált marhahús, paradicsomszósz, parmezán")
    );

    // inline description after the price, sauce label stripped
    assert_eq!(records[1].name.as_deref(), Some("Carbonara"));
    assert_eq!(price(&records[1]), 2050);
    assert_eq!(
        records[1].description.as_deref(),
        Some("bacon, tojássárgája, parmezán")
    );
}

#[test]
fn pizzahut_filters_cheap_rows_and_title_cases_names() {
    let config = site("pizzahut", "Pizza Hut", "both", ParserKind::Pizzahut);
    let records = parser_for(config.parser)
        .parse(&fixture("pizzahut", "sample.json"), &config)
        .expect("parse");

    assert_eq!(records.len(), 3);
    let names: Vec<_> = records.iter().filter_map(|r| r.name.as_deref()).collect();
    assert!(names.contains(&"Supreme"));
    assert!(names.contains(&"Margherita"));
    assert!(names.contains(&"Carbonara Tészta"));
    // the cola row sits below the menu price floor
    assert!(!names.iter().any(|n| n.contains("Cola")));

    let pasta = records
        .iter()
        .find(|r| r.name.as_deref() == Some("Carbonara Tészta"))
        .expect("pasta record");
    assert_eq!(pasta.category.as_deref(), Some("pasta"));
    assert_eq!(price(pasta), 3290);

    let supreme = records
        .iter()
        .find(|r| r.name.as_deref() == Some("Supreme"))
        .expect("supreme record");
    assert_eq!(supreme.category.as_deref(), Some("pizza"));
    assert_eq!(
        supreme.description.as_deref(),
        Some("pepperoni, marhahús, zöldpaprika")
    );
}
