//! Byte-valued measurement types: offsets, sizes, half-open ranges, quota.
//!
//! `Range` is half-open `[begin, end)` and its constructor rejects inverted
//! bounds. All types render with `Display` and parse back with `FromStr`,
//! so they can appear in config files and diagnostic dumps unchanged.

use std::fmt;
use std::str::FromStr;

use crate::archive::{InputArchive, Load, LoadError, OutputArchive, Save};

// ── Offset / Size ─────────────────────────────────────────────────────────────

/// A byte offset into a segment or collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(pub u64);

/// A byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Size(pub u64);

impl Offset {
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl Size {
    pub const ZERO: Size = Size(0);

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::ops::Add<Size> for Offset {
    type Output = Offset;
    fn add(self, rhs: Size) -> Offset {
        Offset(self.0 + rhs.0)
    }
}

impl std::ops::Sub<Offset> for Offset {
    type Output = Size;
    /// Distance between two offsets. The left operand must not be smaller.
    fn sub(self, rhs: Offset) -> Size {
        Size(self.0 - rhs.0)
    }
}

impl std::ops::Add for Size {
    type Output = Size;
    fn add(self, rhs: Size) -> Size {
        Size(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Size {
    type Output = Size;
    fn sub(self, rhs: Size) -> Size {
        Size(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Size {
    fn add_assign(&mut self, rhs: Size) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Size {
    fn sub_assign(&mut self, rhs: Size) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Offset {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Offset(s.parse()?))
    }
}

impl FromStr for Size {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Size(s.parse()?))
    }
}

impl Save for Offset {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.save(oa);
    }
}

impl Load for Offset {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(Offset(u64::load(ia)?))
    }
}

impl Save for Size {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.save(oa);
    }
}

impl Load for Size {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(Size(u64::load(ia)?))
    }
}

// ── Range ─────────────────────────────────────────────────────────────────────

/// Errors from constructing a [`Range`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range begin {begin} must not be larger than end {end}")]
    Inverted { begin: Offset, end: Offset },
}

/// A half-open byte range `[begin, end)` with `begin <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    begin: Offset,
    end: Offset,
}

impl Range {
    pub fn new(begin: Offset, end: Offset) -> Result<Range, RangeError> {
        if begin > end {
            return Err(RangeError::Inverted { begin, end });
        }
        Ok(Range { begin, end })
    }

    /// `[0, size)`.
    pub fn with_size(size: Size) -> Range {
        Range {
            begin: Offset(0),
            end: Offset(size.0),
        }
    }

    pub fn begin(&self) -> Offset {
        self.begin
    }

    pub fn end(&self) -> Offset {
        self.end
    }

    pub fn len(&self) -> Size {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, offset: Offset) -> bool {
        offset >= self.begin && offset < self.end
    }

    /// Whether `other` lies entirely within this range.
    pub fn covers(&self, other: &Range) -> bool {
        other.begin >= self.begin && other.end <= self.end
    }

    /// The overlap of two ranges, if any bytes are shared.
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        if begin < end {
            Some(Range { begin, end })
        } else {
            None
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl FromStr for Range {
    type Err = String;

    /// Parses the `Display` form `[begin, end)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| format!("expected [begin, end), got {s:?}"))?;
        let (begin, end) = inner
            .split_once(',')
            .ok_or_else(|| format!("expected two comma-separated offsets in {s:?}"))?;
        let begin: Offset = begin.trim().parse().map_err(|e| format!("bad begin: {e}"))?;
        let end: Offset = end.trim().parse().map_err(|e| format!("bad end: {e}"))?;
        Range::new(begin, end).map_err(|e| e.to_string())
    }
}

impl Save for Range {
    fn save(&self, oa: &mut OutputArchive) {
        self.begin.save(oa);
        self.end.save(oa);
    }
}

impl Load for Range {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        let begin = Offset::load(ia)?;
        let end = Offset::load(ia)?;
        Range::new(begin, end).map_err(|e| LoadError::Invalid(e.to_string()))
    }
}

// ── MaxSize ───────────────────────────────────────────────────────────────────

/// Storage quota: either unlimited or a hard byte limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSize {
    Unlimited,
    Limit(Size),
}

impl MaxSize {
    /// Whether `used + additional` stays within the quota.
    pub fn allows(&self, used: Size, additional: Size) -> bool {
        match self {
            MaxSize::Unlimited => true,
            MaxSize::Limit(limit) => used.0.saturating_add(additional.0) <= limit.0,
        }
    }
}

impl fmt::Display for MaxSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxSize::Unlimited => write!(f, "unlimited"),
            MaxSize::Limit(size) => write!(f, "limit {size}"),
        }
    }
}

impl FromStr for MaxSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "unlimited" {
            return Ok(MaxSize::Unlimited);
        }
        match s.strip_prefix("limit ") {
            Some(rest) => Ok(MaxSize::Limit(
                rest.parse().map_err(|e| format!("bad limit: {e}"))?,
            )),
            None => Err(format!("expected 'unlimited' or 'limit N', got {s:?}")),
        }
    }
}

impl Save for MaxSize {
    fn save(&self, oa: &mut OutputArchive) {
        match self {
            MaxSize::Unlimited => oa.variant_tag(0),
            MaxSize::Limit(size) => {
                oa.variant_tag(1);
                size.save(oa);
            }
        }
    }
}

impl Load for MaxSize {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        match ia.variant_tag()? {
            0 => Ok(MaxSize::Unlimited),
            1 => Ok(MaxSize::Limit(Size::load(ia)?)),
            index => Err(LoadError::UnknownVariant {
                type_name: "MaxSize",
                index,
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
