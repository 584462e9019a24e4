//! Listing record produced by the detail parser and persisted by the store

use std::fmt;

/// Maximum number of image URLs kept per listing
pub const MAX_IMAGES: usize = 5;

/// A single real-estate listing
///
/// The URL is the natural key. Every other field is optional because the
/// detail parser never fails on missing data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Listing {
    /// Canonical detail-page URL
    pub url: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    /// ISO currency code from structured data (e.g. "RUB")
    pub currency: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    /// Publish date as shown on the page ("сегодня, 12:30", "3 мар" ...)
    pub date_published: Option<String>,
    pub rooms: Option<u32>,
    pub area: Option<String>,
    pub living_area: Option<String>,
    pub kitchen_area: Option<String>,
    pub floor: Option<String>,
    pub build_year: Option<String>,
    /// Up to `MAX_IMAGES` image URLs
    pub images: Vec<String>,
}

impl Listing {
    /// Creates an empty listing for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Replaces the images, keeping at most `MAX_IMAGES`
    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = images.into_iter().take(MAX_IMAGES).map(Into::into).collect();
        self
    }

    /// Returns true if nothing besides the URL was extracted
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.price.is_none()
            && self.description.is_none()
            && self.address.is_none()
            && self.rooms.is_none()
            && self.area.is_none()
            && self.images.is_empty()
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title.as_deref().unwrap_or("(untitled)"))?;
        if let Some(price) = self.price {
            write!(f, " | {:.0}", price)?;
            if let Some(currency) = &self.currency {
                write!(f, " {}", currency)?;
            }
        }
        if let Some(address) = &self.address {
            write!(f, " | {}", address)?;
        }
        write!(f, " | {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_images_truncates() {
        let listing = Listing::new("https://example.com/flat/1/")
            .with_images((0..8).map(|i| format!("https://img.example.com/{}.jpg", i)));
        assert_eq!(listing.images.len(), MAX_IMAGES);
        assert_eq!(listing.images[0], "https://img.example.com/0.jpg");
    }

    #[test]
    fn test_is_empty() {
        let mut listing = Listing::new("https://example.com/flat/1/");
        assert!(listing.is_empty());

        listing.title = Some("2-комн. квартира".to_string());
        assert!(!listing.is_empty());
    }

    #[test]
    fn test_display() {
        let mut listing = Listing::new("/listing1");
        listing.title = Some("A".to_string());
        listing.price = Some(100.0);
        listing.currency = Some("RUB".to_string());
        assert_eq!(listing.to_string(), "A | 100 RUB | /listing1");
    }
}
