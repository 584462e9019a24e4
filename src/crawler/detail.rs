//! Detail page parser
//!
//! Three stages run in order, each only filling fields that are still empty:
//!
//! 1. The JSON-LD `Product` block (title, description, price, currency, images)
//! 2. Visible page elements (title, price, address, publish date, rooms)
//! 3. The label/value summary items, through a fixed label whitelist
//!
//! The parser never fails: missing or malformed data leaves fields empty.

use crate::listing::{Listing, MAX_IMAGES};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::sync::LazyLock;

struct Selectors {
    ld_json: Selector,
    title: Selector,
    price: Selector,
    address: Selector,
    address_part: Selector,
    creation_date: Selector,
    summary_item: Selector,
    paragraph: Selector,
}

impl Selectors {
    fn new() -> Option<Self> {
        Some(Self {
            ld_json: Selector::parse(r#"script[type="application/ld+json"]"#).ok()?,
            title: Selector::parse(r#"span[data-mark="OfferTitle"]"#).ok()?,
            price: Selector::parse(r#"span[data-mark="MainPrice"]"#).ok()?,
            address: Selector::parse(r#"div[data-name="AddressContainer"]"#).ok()?,
            address_part: Selector::parse("a").ok()?,
            creation_date: Selector::parse(r#"div[data-mark="CreationDate"]"#).ok()?,
            summary_item: Selector::parse(r#"div[data-name="OfferSummaryInfoItem"]"#).ok()?,
            paragraph: Selector::parse("p").ok()?,
        })
    }
}

static SELECTORS: LazyLock<Option<Selectors>> = LazyLock::new(Selectors::new);

static ROOMS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+)-?комн").ok());

/// Summary item labels recognised by the label/value scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SummaryField {
    Area,
    LivingArea,
    KitchenArea,
    Floor,
    BuildYear,
}

impl SummaryField {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "Общая площадь" => Some(Self::Area),
            "Жилая площадь" => Some(Self::LivingArea),
            "Площадь кухни" => Some(Self::KitchenArea),
            "Этаж" => Some(Self::Floor),
            "Год постройки" | "Год сдачи" => Some(Self::BuildYear),
            _ => None,
        }
    }

    fn slot(self, listing: &mut Listing) -> &mut Option<String> {
        match self {
            Self::Area => &mut listing.area,
            Self::LivingArea => &mut listing.living_area,
            Self::KitchenArea => &mut listing.kitchen_area,
            Self::Floor => &mut listing.floor,
            Self::BuildYear => &mut listing.build_year,
        }
    }
}

/// Parses a listing detail page
///
/// The returned listing has an empty `url`; the caller knows which link it
/// fetched and fills it in.
pub fn parse_detail(html: &str) -> Listing {
    let mut listing = Listing::default();
    let Some(selectors) = SELECTORS.as_ref() else {
        return listing;
    };

    let document = Html::parse_document(html);

    apply_structured_data(&document, selectors, &mut listing);
    apply_visible_fields(&document, selectors, &mut listing);
    apply_summary_items(&document, selectors, &mut listing);

    listing
}

fn apply_structured_data(document: &Html, selectors: &Selectors, listing: &mut Listing) {
    for script in document.select(&selectors.ld_json) {
        let raw: String = script.text().collect();
        let data: Value = match serde_json::from_str(raw.trim()) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Skipping malformed JSON-LD block: {}", e);
                continue;
            }
        };

        if let Some(product) = find_product(&data) {
            fill_from_product(product, listing);
        }
    }
}

/// Finds the first `Product` object in a JSON-LD document
///
/// Looks at the top level, inside top-level arrays and inside `@graph`.
fn find_product(data: &Value) -> Option<&Value> {
    match data {
        Value::Array(items) => items.iter().find_map(find_product),
        Value::Object(map) => {
            let is_product = match map.get("@type") {
                Some(Value::String(t)) => t == "Product",
                Some(Value::Array(types)) => types.iter().any(|t| t == "Product"),
                _ => false,
            };
            if is_product {
                Some(data)
            } else {
                map.get("@graph").and_then(find_product)
            }
        }
        _ => None,
    }
}

fn fill_from_product(product: &Value, listing: &mut Listing) {
    fill(&mut listing.title, json_text(product.get("name")));
    fill(&mut listing.description, json_text(product.get("description")));

    let offer = match product.get("offers") {
        Some(Value::Array(offers)) => offers.first(),
        other => other,
    };
    if let Some(offer) = offer {
        if listing.price.is_none() {
            listing.price = offer.get("price").and_then(json_price);
        }
        fill(&mut listing.currency, json_text(offer.get("priceCurrency")));
    }

    if listing.images.is_empty() {
        listing.images = match product.get("image") {
            Some(Value::Array(images)) => images.iter().filter_map(image_url).take(MAX_IMAGES).collect(),
            Some(image) => image_url(image).into_iter().collect(),
            None => Vec::new(),
        };
    }
}

fn json_text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(normalize_text)
        .filter(|s| !s.is_empty())
}

fn json_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

fn image_url(value: &Value) -> Option<String> {
    match value {
        Value::String(url) => Some(url.trim().to_string()).filter(|u| !u.is_empty()),
        Value::Object(map) => json_text(map.get("url").or_else(|| map.get("contentUrl"))),
        _ => None,
    }
}

fn apply_visible_fields(document: &Html, selectors: &Selectors, listing: &mut Listing) {
    if listing.title.is_none() {
        listing.title = first_text(document, &selectors.title);
    }

    if listing.price.is_none() {
        listing.price = first_text(document, &selectors.price).and_then(|text| parse_price(&text));
    }

    if listing.address.is_none() {
        listing.address = document.select(&selectors.address).next().and_then(|block| {
            let parts: Vec<String> = block
                .select(&selectors.address_part)
                .map(element_text)
                .filter(|part| !part.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        });
    }

    if listing.date_published.is_none() {
        listing.date_published = first_text(document, &selectors.creation_date);
    }

    if listing.rooms.is_none() {
        listing.rooms = listing.title.as_deref().and_then(rooms_from_title);
    }
}

fn apply_summary_items(document: &Html, selectors: &Selectors, listing: &mut Listing) {
    for item in document.select(&selectors.summary_item) {
        let mut paragraphs = item.select(&selectors.paragraph).map(element_text);
        let (Some(label), Some(value)) = (paragraphs.next(), paragraphs.next()) else {
            continue;
        };

        match SummaryField::from_label(&label) {
            Some(field) => fill(field.slot(listing), Some(value).filter(|v| !v.is_empty())),
            None => tracing::debug!(label = %label, "Ignoring unknown summary label"),
        }
    }
}

/// Room count from a title such as "2-комн. квартира, 54 м²"
fn rooms_from_title(title: &str) -> Option<u32> {
    let regex = ROOMS.as_ref()?;
    regex
        .captures(&title.to_lowercase())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parses "12 500 000 ₽", "12,500,000" or "9450000.50" into a number
fn parse_price(text: &str) -> Option<f64> {
    let kept: Vec<char> = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();

    // Only the last separator can be a decimal mark, and only before 1-2 digits
    let decimal = kept
        .iter()
        .rposition(|c| !c.is_ascii_digit())
        .filter(|&i| (1..=2).contains(&(kept.len() - i - 1)));

    let cleaned: String = kept
        .iter()
        .enumerate()
        .filter_map(|(i, &c)| match c {
            '0'..='9' => Some(c),
            _ if Some(i) == decimal => Some('.'),
            _ => None,
        })
        .collect();

    cleaned.parse().ok()
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    normalize_text(&element.text().collect::<String>())
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
