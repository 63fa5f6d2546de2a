//! Core listing model, feed descriptors and pipeline observer types for the harvester.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub mod delay;
pub mod events;

pub use delay::{RecordingSleeper, Sleeper, TokioSleeper};
pub use events::{EventSink, HarvestEvent, MemorySink, RetryCause, SkipReason, TracingSink};

pub const CRATE_NAME: &str = "harvest-core";

/// Detail pages live under this prefix as `{id}_{slug}/`.
pub const LISTING_URL_BASE: &str = "https://www.bazaraki.com/adv";

/// One advert as returned by the listing endpoint.
///
/// Timestamps are opaque strings and are stored exactly as received.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Listing {
    #[serde(deserialize_with = "nullable")]
    pub id: i64,
    #[serde(deserialize_with = "nullable")]
    pub title: String,
    #[serde(deserialize_with = "nullable")]
    pub slug: String,
    #[serde(deserialize_with = "nullable")]
    pub description: String,
    #[serde(deserialize_with = "nullable")]
    pub price: String,
    #[serde(deserialize_with = "nullable")]
    pub created_dt: String,
    #[serde(deserialize_with = "nullable")]
    pub owner_advert_count: i32,
    #[serde(deserialize_with = "nullable")]
    pub negotiable_price: bool,
    #[serde(deserialize_with = "nullable")]
    pub rubric: i32,
    #[serde(deserialize_with = "nullable")]
    pub city: i32,
    #[serde(deserialize_with = "nullable")]
    pub user_id: i64,
    #[serde(deserialize_with = "nullable")]
    pub currency: String,
    #[serde(deserialize_with = "nullable")]
    pub raise_dt: String,
}

impl Listing {
    pub fn canonical_url(&self) -> String {
        format!("{LISTING_URL_BASE}/{}_{}/", self.id, self.slug)
    }

    /// Parses the textual price. Non-finite values are rejected along with garbage.
    pub fn parse_price(&self) -> Result<f64, PriceError> {
        match self.price.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(PriceError {
                id: self.id,
                raw: self.price.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid price {raw:?} for item {id}")]
pub struct PriceError {
    pub id: i64,
    pub raw: String,
}

/// A listing flattened into the column layout of the `items` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub url: String,
    pub created_dt: String,
    pub owner_advert_count: i32,
    pub negotiable_price: i16,
    pub rubric: i32,
    pub city: i32,
    pub user_id: i64,
    pub currency: String,
    pub raise_dt: String,
}

impl TryFrom<&Listing> for ItemRow {
    type Error = PriceError;

    fn try_from(listing: &Listing) -> Result<Self, Self::Error> {
        let price = listing.parse_price()?;
        Ok(Self {
            id: listing.id,
            title: listing.title.clone(),
            description: listing.description.clone(),
            price,
            url: listing.canonical_url(),
            created_dt: listing.created_dt.clone(),
            owner_advert_count: listing.owner_advert_count,
            negotiable_price: i16::from(listing.negotiable_price),
            rubric: listing.rubric,
            city: listing.city,
            user_id: listing.user_id,
            currency: listing.currency.clone(),
            raise_dt: listing.raise_dt.clone(),
        })
    }
}

/// Body of one listing page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageResponse {
    #[serde(default)]
    pub results: Vec<Listing>,
    #[serde(default, deserialize_with = "nullable")]
    pub next: String,
    #[serde(default, deserialize_with = "nullable")]
    pub count: u64,
}

impl PageResponse {
    /// An empty continuation token marks the last page of a feed.
    pub fn has_more(&self) -> bool {
        !self.next.trim().is_empty()
    }
}

/// A fixed query against the listing endpoint, harvested to exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDescriptor {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl FeedDescriptor {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// `null` decodes to the zero value, like an absent field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
