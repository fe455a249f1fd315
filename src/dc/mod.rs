//! Datacenter identifiers
//!
//! A DC is addressed in configuration as `<digits>[_media|_cdn]` and on the
//! wire as a single signed integer:
//!
//! ```text
//! signed = id + (test ? 10000 : 0)
//! signed = -signed            if media
//! ```
//!
//! The CDN variant is not encoded in the integer; it stays a context flag.

use crate::Error;
use std::fmt;
use std::str::FromStr;

/// Lowest valid numeric DC id
pub const MIN_DC_ID: u16 = 1;

/// Highest valid numeric DC id
pub const MAX_DC_ID: u16 = 1000;

/// Offset added to the numeric id for test servers
pub const TEST_DC_OFFSET: i32 = 10_000;

const MEDIA_SUFFIX: &str = "_media";
const CDN_SUFFIX: &str = "_cdn";

/// Kind of DC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DcVariant {
    /// Regular API endpoint
    #[default]
    Main,
    /// Media (file download) endpoint
    Media,
    /// CDN endpoint
    Cdn,
}

impl DcVariant {
    fn suffix(self) -> &'static str {
        match self {
            DcVariant::Main => "",
            DcVariant::Media => MEDIA_SUFFIX,
            DcVariant::Cdn => CDN_SUFFIX,
        }
    }
}

/// A validated datacenter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DcId {
    id: u16,
    variant: DcVariant,
}

impl DcId {
    /// Create an identifier, validating the numeric range
    pub fn new(id: u16, variant: DcVariant) -> Result<Self, Error> {
        if !(MIN_DC_ID..=MAX_DC_ID).contains(&id) {
            return Err(Error::InvalidIdentifier(format!(
                "DC id {} outside {}..={}",
                id, MIN_DC_ID, MAX_DC_ID
            )));
        }
        Ok(Self { id, variant })
    }

    /// Numeric part of the identifier
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Endpoint variant
    pub fn variant(&self) -> DcVariant {
        self.variant
    }

    pub fn is_media(&self) -> bool {
        self.variant == DcVariant::Media
    }

    pub fn is_cdn(&self) -> bool {
        self.variant == DcVariant::Cdn
    }

    /// Signed wire encoding of this identifier
    pub fn encode(&self, test: bool) -> i32 {
        encode(self.id, test, self.is_media())
    }
}

/// Encode a numeric DC id with its test and media flags
pub fn encode(id: u16, test: bool, media: bool) -> i32 {
    let mut dc = i32::from(id);
    if test {
        dc += TEST_DC_OFFSET;
    }
    if media {
        dc = -dc;
    }
    dc
}

impl FromStr for DcId {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let digits_end = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, suffix) = raw.split_at(digits_end);

        let variant = match suffix {
            "" => DcVariant::Main,
            MEDIA_SUFFIX => DcVariant::Media,
            CDN_SUFFIX => DcVariant::Cdn,
            _ => {
                return Err(Error::InvalidIdentifier(format!(
                    "unknown DC suffix in {:?}",
                    raw
                )))
            }
        };

        // Overlong digit strings overflow u16 and are out of range anyway
        let id = digits
            .parse::<u16>()
            .map_err(|_| Error::InvalidIdentifier(format!("invalid DC id {:?}", raw)))?;

        Self::new(id, variant)
    }
}

impl fmt::Display for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.id, self.variant.suffix())
    }
}
