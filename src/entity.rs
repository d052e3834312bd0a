use chrono::{DateTime, SecondsFormat, SubsecRound, Timelike, Utc};
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Instants are UTC with millisecond precision so they survive the text form unchanged.
pub type Timestamp = DateTime<Utc>;

/// Field names in delta-file column order.
pub const FIELD_NAMES: [&str; 6] = ["id", "label", "price", "createdAt", "updatedAt", "deletedAt"];

pub const DELIMITER: char = ',';

/// Current instant truncated to milliseconds.
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(3)
}

/// RFC 3339 with a millisecond fraction and `Z` suffix, e.g. `2024-05-01T08:30:00.000Z`.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("field '{field}' has invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Non-negative price with two-decimal precision, held as whole cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price(u64);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid price {0:?}")]
pub struct ParsePriceError(String);

impl Price {
    /// Upper bound of generated prices (1000.00).
    pub const MAX_GENERATED_CENTS: u64 = 100_000;

    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    /// Uniform price in `[0.00, 1000.00]`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(0..=Self::MAX_GENERATED_CENTS))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Price {
    type Err = ParsePriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePriceError(s.to_string());
        let (units, frac) = s.split_once('.').unwrap_or((s, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if units.is_empty() || frac.len() > 2 || !all_digits(units) || !all_digits(frac) {
            return Err(err());
        }

        let units: u64 = units.parse().map_err(|_| err())?;
        let frac_cents = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| err())? * 10,
            _ => frac.parse::<u64>().map_err(|_| err())?,
        };
        units
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .map(Self)
            .ok_or_else(err)
    }
}

/// A catalog item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub label: String,
    pub price: Price,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Tombstone; `Some` marks the item for removal.
    pub deleted_at: Option<Timestamp>,
}

impl Entity {
    /// Fresh item: new id, `Product_<index>` label, random price, never modified.
    pub fn new<R: Rng + ?Sized>(index: u64, created_at: Timestamp, rng: &mut R) -> Self {
        Self {
            id: fresh_id(rng),
            label: label_for(index),
            price: Price::random(rng),
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Header row of the delta file.
    pub fn header_line() -> String {
        FIELD_NAMES.join(",")
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{id},{label},{price},{created},{updated},{deleted}",
            id = self.id,
            label = self.label,
            price = self.price,
            created = format_timestamp(&self.created_at),
            updated = format_timestamp(&self.updated_at),
            deleted = self
                .deleted_at
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_default(),
        )
    }

    /// Builds an entity from already-split fields in column order.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, RecordError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let fields: Vec<&str> = fields.into_iter().collect();
        let &[id, label, price, created_at, updated_at, deleted_at] = fields.as_slice() else {
            return Err(RecordError::FieldCount {
                expected: FIELD_NAMES.len(),
                found: fields.len(),
            });
        };

        if id.is_empty() {
            return Err(RecordError::EmptyField("id"));
        }
        let price = price.parse::<Price>().map_err(|_| RecordError::InvalidField {
            field: "price",
            value: price.to_string(),
        })?;

        Ok(Self {
            id: id.to_string(),
            label: label.to_string(),
            price,
            created_at: required_timestamp("createdAt", created_at)?,
            updated_at: required_timestamp("updatedAt", updated_at)?,
            deleted_at: match deleted_at {
                "" => None,
                text => Some(required_timestamp("deletedAt", text)?),
            },
        })
    }
}

impl FromStr for Entity {
    type Err = RecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::from_fields(line.trim_end_matches(['\r', '\n']).split(DELIMITER))
    }
}

pub fn label_for(index: u64) -> String {
    format!("Product_{index}")
}

/// Random (v4) UUID drawn from `rng`, so seeded runs produce the same ids.
pub fn fresh_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    uuid::Builder::from_random_bytes(rng.gen())
        .into_uuid()
        .to_string()
}

fn required_timestamp(field: &'static str, text: &str) -> Result<Timestamp, RecordError> {
    if text.is_empty() {
        return Err(RecordError::EmptyField(field));
    }
    let invalid = || RecordError::InvalidField {
        field,
        value: text.to_string(),
    };
    let ts = parse_timestamp(text).map_err(|_| invalid())?;
    // sub-millisecond digits would not survive `format_timestamp`
    if ts.nanosecond() % 1_000_000 != 0 {
        return Err(invalid());
    }
    Ok(ts)
}
