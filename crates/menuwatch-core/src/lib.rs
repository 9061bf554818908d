//! Core domain model for menuwatch: product records, change records,
//! aggregate buckets, and the column contracts of the backing store.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "menuwatch-core";

// Header names as they appear in the backing store's header row.
pub const COL_DATE: &str = "Date";
pub const COL_RESTAURANT: &str = "Restaurant";
pub const COL_TYPE: &str = "Type";
pub const COL_NAME: &str = "Name";
pub const COL_PRICE: &str = "Price";
pub const COL_DESCRIPTION: &str = "Description";
pub const COL_OLD_PRICE: &str = "Old Price";
pub const COL_NEW_PRICE: &str = "New Price";
pub const COL_OLD_DESCRIPTION: &str = "Old Description";
pub const COL_NEW_DESCRIPTION: &str = "New Description";
pub const COL_COMMENT: &str = "Comment";
pub const COL_COUNT: &str = "Count";
pub const COL_AVERAGE: &str = "Average";
pub const COL_LOWEST: &str = "Lowest";
pub const COL_HIGHEST: &str = "Highest";

pub const PRODUCTS_HEADER: [&str; 6] = [
    COL_DATE,
    COL_RESTAURANT,
    COL_TYPE,
    COL_NAME,
    COL_PRICE,
    COL_DESCRIPTION,
];

pub const DIFFERENCES_HEADER: [&str; 9] = [
    COL_DATE,
    COL_RESTAURANT,
    COL_TYPE,
    COL_NAME,
    COL_OLD_PRICE,
    COL_NEW_PRICE,
    COL_OLD_DESCRIPTION,
    COL_NEW_DESCRIPTION,
    COL_COMMENT,
];

pub const AVERAGES_HEADER: [&str; 6] = [
    COL_RESTAURANT,
    COL_TYPE,
    COL_COUNT,
    COL_AVERAGE,
    COL_LOWEST,
    COL_HIGHEST,
];

/// Category that always sorts first in the averages table.
pub const CATEGORY_PIZZA: &str = "pizza";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("record is missing required fields [{missing}]: {record}")]
    Validation { missing: String, record: String },
    #[error("price {raw:?} is not a whole non-negative amount")]
    Price { raw: String },
    #[error("snapshot record has no row index: {record}")]
    MissingRowIndex { record: String },
}

/// Identity of one product across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub restaurant: String,
    pub category: String,
    pub name: String,
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.restaurant, self.category, self.name)
    }
}

/// Price value as it arrives from a scraper or the store API: the store
/// returns numbers or numeric strings depending on how the cell was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Number(i64),
    Float(f64),
    Text(String),
}

impl RawPrice {
    /// Coerce to the canonical integer price (smallest currency unit).
    pub fn as_minor_units(&self) -> Result<u32, CatalogError> {
        match self {
            RawPrice::Number(n) => {
                u32::try_from(*n).map_err(|_| CatalogError::Price { raw: n.to_string() })
            }
            RawPrice::Float(f) => {
                if f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX) {
                    Ok(*f as u32)
                } else {
                    Err(CatalogError::Price { raw: f.to_string() })
                }
            }
            RawPrice::Text(s) => {
                let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
                cleaned
                    .parse::<u32>()
                    .map_err(|_| CatalogError::Price { raw: s.clone() })
            }
        }
    }
}

/// Loosely-typed record as produced by site parsers and the store reader.
/// Validated into a [`ProductRecord`] at the normalizer boundary; never
/// crosses into the reconciliation engine as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "Restaurant")]
    pub restaurant: Option<String>,
    #[serde(default, alias = "Type", alias = "type")]
    pub category: Option<String>,
    #[serde(default, alias = "Name")]
    pub name: Option<String>,
    #[serde(default, alias = "Price")]
    pub price: Option<RawPrice>,
    #[serde(default, alias = "Description")]
    pub description: Option<String>,
    /// Physical 1-based row location, attached by the snapshot reader.
    /// Always `None` for freshly scraped records.
    #[serde(default, skip_serializing)]
    pub row_index: Option<u32>,
}

impl RawRecord {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.restaurant.is_none() {
            missing.push(COL_RESTAURANT);
        }
        if self.category.is_none() {
            missing.push(COL_TYPE);
        }
        if self.name.is_none() {
            missing.push(COL_NAME);
        }
        if self.price.is_none() {
            missing.push(COL_PRICE);
        }
        if self.description.is_none() {
            missing.push(COL_DESCRIPTION);
        }
        missing
    }

    /// Rebuild a raw record from a stored row in [`PRODUCTS_HEADER`] order.
    pub fn from_product_row(cells: &[String]) -> Self {
        let cell = |i: usize| cells.get(i).cloned();
        Self {
            restaurant: cell(1),
            category: cell(2),
            name: cell(3),
            price: cell(4).map(RawPrice::Text),
            description: cell(5),
            row_index: None,
        }
    }
}

/// One menu item at one point of observation. Immutable after construction;
/// comparisons always produce new derived records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub restaurant: String,
    pub category: String,
    pub name: String,
    /// Smallest currency unit, non-negative.
    pub price: u32,
    pub description: String,
    pub observed_date: NaiveDate,
}

impl ProductRecord {
    pub fn key(&self) -> ProductKey {
        ProductKey {
            restaurant: self.restaurant.clone(),
            category: self.category.clone(),
            name: self.name.clone(),
        }
    }

    /// Row cells in [`PRODUCTS_HEADER`] order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.observed_date.to_string(),
            self.restaurant.clone(),
            self.category.clone(),
            self.name.clone(),
            self.price.to_string(),
            self.description.clone(),
        ]
    }
}

/// A product record plus its physical location in the backing store.
/// The row index is stable only until a delete is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub row_index: u32,
    pub record: ProductRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    New,
    Removed,
    PriceChanged,
    DescriptionChanged,
    PriceAndDescriptionChanged,
}

impl ChangeKind {
    /// Human comment string used in the differences table.
    pub fn comment(&self) -> &'static str {
        match self {
            ChangeKind::New => "New Product",
            ChangeKind::Removed => "Deleted Product",
            ChangeKind::PriceChanged => "Price Changed",
            ChangeKind::DescriptionChanged => "Description Changed",
            ChangeKind::PriceAndDescriptionChanged => "Price & Description Changed",
        }
    }
}

/// One detected difference between the fresh catalog and the snapshot.
/// Price and description pairs are populated only for the aspects that
/// actually changed; `New` carries only the new side, `Removed` only the old.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub date: NaiveDate,
    pub restaurant: String,
    pub category: String,
    pub name: String,
    pub old_price: Option<u32>,
    pub new_price: Option<u32>,
    pub old_description: Option<String>,
    pub new_description: Option<String>,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn added(record: &ProductRecord) -> Self {
        Self {
            date: record.observed_date,
            restaurant: record.restaurant.clone(),
            category: record.category.clone(),
            name: record.name.clone(),
            old_price: None,
            new_price: Some(record.price),
            old_description: None,
            new_description: Some(record.description.clone()),
            kind: ChangeKind::New,
        }
    }

    pub fn removed(record: &ProductRecord) -> Self {
        Self {
            date: record.observed_date,
            restaurant: record.restaurant.clone(),
            category: record.category.clone(),
            name: record.name.clone(),
            old_price: Some(record.price),
            new_price: None,
            old_description: Some(record.description.clone()),
            new_description: None,
            kind: ChangeKind::Removed,
        }
    }

    pub fn modified(
        fresh: &ProductRecord,
        persisted: &ProductRecord,
        price_changed: bool,
        description_changed: bool,
    ) -> Self {
        let kind = match (price_changed, description_changed) {
            (true, true) => ChangeKind::PriceAndDescriptionChanged,
            (true, false) => ChangeKind::PriceChanged,
            (false, true) => ChangeKind::DescriptionChanged,
            (false, false) => unreachable!("modified() requires at least one changed aspect"),
        };
        Self {
            date: fresh.observed_date,
            restaurant: fresh.restaurant.clone(),
            category: fresh.category.clone(),
            name: fresh.name.clone(),
            old_price: price_changed.then_some(persisted.price),
            new_price: price_changed.then_some(fresh.price),
            old_description: description_changed.then(|| persisted.description.trim().to_string()),
            new_description: description_changed.then(|| fresh.description.trim().to_string()),
            kind,
        }
    }

    pub fn key(&self) -> ProductKey {
        ProductKey {
            restaurant: self.restaurant.clone(),
            category: self.category.clone(),
            name: self.name.clone(),
        }
    }

    /// Row cells in [`DIFFERENCES_HEADER`] order; absent values render as
    /// empty strings, never a literal "null".
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.date.to_string(),
            self.restaurant.clone(),
            self.category.clone(),
            self.name.clone(),
            self.old_price.map(|p| p.to_string()).unwrap_or_default(),
            self.new_price.map(|p| p.to_string()).unwrap_or_default(),
            self.old_description.clone().unwrap_or_default(),
            self.new_description.clone().unwrap_or_default(),
            self.kind.comment().to_string(),
        ]
    }
}

/// One `(restaurant, category)` statistics row, recomputed fully each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub restaurant: String,
    pub category: String,
    pub count: u32,
    /// Truncating integer mean of the bucket's prices.
    pub average: u32,
    pub min_price: u32,
    pub max_price: u32,
}

impl AggregateBucket {
    /// Row cells in [`AVERAGES_HEADER`] order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.restaurant.clone(),
            self.category.clone(),
            self.count.to_string(),
            self.average.to_string(),
            self.min_price.to_string(),
            self.max_price.to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(price: u32) -> ProductRecord {
        ProductRecord {
            restaurant: "Bellozzo".to_string(),
            category: "pizza".to_string(),
            name: "Margherita".to_string(),
            price,
            description: "tomato, cheese".to_string(),
            observed_date: NaiveDate::from_ymd_opt(2026, 8, 26).unwrap(),
        }
    }

    #[test]
    fn comments_match_the_differences_sheet_wording() {
        assert_eq!(ChangeKind::New.comment(), "New Product");
        assert_eq!(ChangeKind::Removed.comment(), "Deleted Product");
        assert_eq!(
            ChangeKind::PriceAndDescriptionChanged.comment(),
            "Price & Description Changed"
        );
    }

    #[test]
    fn absent_fields_render_as_empty_cells() {
        let row = ChangeRecord::added(&record(2000)).to_row();
        assert_eq!(row.len(), DIFFERENCES_HEADER.len());
        assert_eq!(row[4], "");
        assert_eq!(row[5], "2000");
        assert_eq!(row[6], "");
        assert_eq!(row[8], "New Product");
    }

    #[test]
    fn modified_populates_only_changed_pairs() {
        let old = record(2000);
        let mut new = record(2200);
        new.description = "tomato, cheese".to_string();
        let change = ChangeRecord::modified(&new, &old, true, false);
        assert_eq!(change.kind, ChangeKind::PriceChanged);
        assert_eq!(change.old_price, Some(2000));
        assert_eq!(change.new_price, Some(2200));
        assert_eq!(change.old_description, None);
        assert_eq!(change.new_description, None);
    }

    #[test]
    fn raw_price_coercion_accepts_numbers_and_numeric_strings() {
        assert_eq!(RawPrice::Number(2990).as_minor_units().unwrap(), 2990);
        assert_eq!(RawPrice::Float(2990.0).as_minor_units().unwrap(), 2990);
        assert_eq!(
            RawPrice::Text(" 2 990 ".to_string()).as_minor_units().unwrap(),
            2990
        );
        assert!(RawPrice::Number(-1).as_minor_units().is_err());
        assert!(RawPrice::Text("2990 Ft".to_string()).as_minor_units().is_err());
    }

    #[test]
    fn missing_fields_are_reported_by_header_name() {
        let raw = RawRecord {
            restaurant: Some("Etna".to_string()),
            name: Some("Carbonara".to_string()),
            ..RawRecord::default()
        };
        assert_eq!(
            raw.missing_fields(),
            vec![COL_TYPE, COL_PRICE, COL_DESCRIPTION]
        );
    }

    #[test]
    fn raw_record_round_trips_through_a_product_row() {
        let row = record(1500).to_row();
        assert_eq!(row.len(), PRODUCTS_HEADER.len());
        let raw = RawRecord::from_product_row(&row);
        assert_eq!(raw.restaurant.as_deref(), Some("Bellozzo"));
        assert_eq!(raw.price, Some(RawPrice::Text("1500".to_string())));
        assert!(raw.row_index.is_none());
    }
}
