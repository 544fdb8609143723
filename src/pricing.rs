//! Pay-per-download price rules.
//!
//! Pricing never mutates anything: recording that the daily free image was
//! consumed is the caller's job, and only once the image is actually served.

use chrono::NaiveDate;
use serde::Serialize;

use crate::store::User;

/// Every amount is denominated in this stable-coin.
pub const CURRENCY: &str = "USDC";

const IMAGE_PRICES: TierPrices = TierPrices {
    low: 0.1,
    medium: 0.2,
    high: 0.3,
};

const VIDEO_PRICES: TierPrices = TierPrices {
    low: 0.3,
    medium: 0.5,
    high: 1.0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    /// Anything that is not an image or a video is priced as "other".
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "image" => Self::Image,
            "video" => Self::Video,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    /// Absent or blank means `high`; unknown tiers are rejected.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
            return Some(Self::High);
        };

        match value.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierPrices {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl TierPrices {
    fn for_quality(&self, quality: Quality) -> f64 {
        match quality {
            Quality::Low => self.low,
            Quality::Medium => self.medium,
            Quality::High => self.high,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PriceTable {
    pub image: TierPrices,
    pub video: TierPrices,
    pub currency: &'static str,
}

pub fn price_table() -> PriceTable {
    PriceTable {
        image: IMAGE_PRICES,
        video: VIDEO_PRICES,
        currency: CURRENCY,
    }
}

/// Whether this user still has today's complimentary image.
pub fn has_free_image(user: &User, today: NaiveDate) -> bool {
    !user.is_subscribed && user.last_free_image_date != Some(today)
}

pub fn price(kind: MediaKind, quality: Quality, user: &User, today: NaiveDate) -> f64 {
    match kind {
        MediaKind::Image if has_free_image(user, today) => 0.0,
        MediaKind::Image => IMAGE_PRICES.for_quality(quality),
        MediaKind::Video => VIDEO_PRICES.for_quality(quality),
        MediaKind::Other => 0.0,
    }
}
