//! Labels of numbering columns.
//!
//! A label is a position number optionally followed by insertion letters:
//! `27`, `27A`, `111AB`. Insertions sort after their position, shorter
//! insertions first, so `27 < 27A < 27Z < 27AA < 28`.

use anyhow::{bail, Result};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionLabel {
    pub number: u32,
    pub insertion: String,
}

impl FromStr for PositionLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<PositionLabel> {
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, insertion) = s.split_at(split);
        if digits.is_empty() || !insertion.chars().all(|c| c.is_ascii_alphabetic()) {
            bail!("{s:?} is not a numbering position");
        }
        Ok(PositionLabel {
            number: digits.parse()?,
            insertion: insertion.to_string(),
        })
    }
}

impl Display for PositionLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.number, self.insertion)
    }
}

impl Ord for PositionLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number
            .cmp(&other.number)
            .then(self.insertion.len().cmp(&other.insertion.len()))
            .then_with(|| self.insertion.cmp(&other.insertion))
    }
}

impl PartialOrd for PositionLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Order column labels: numbering positions in numbering order, then any
/// other label in byte order.
pub fn column_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<PositionLabel>(), b.parse::<PositionLabel>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
