// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cmp::Ordering, fmt, sync::Arc};

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One level of a parameter name.
///
/// Exact names and instance numbers address a single node; `*` addresses
/// every child; an alias addresses the instances whose key parameters carry
/// the given values (`[Name=wan0]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Name(String),
    Instance(u64),
    Wildcard,
    Alias(Vec<(Path, String)>),
}

impl Segment {
    /// Exact segments address one node; wildcards and aliases are patterns.
    pub fn is_exact(&self) -> bool {
        matches!(self, Segment::Name(_) | Segment::Instance(_))
    }

    fn rank(&self) -> u8 {
        match self {
            Segment::Name(_) | Segment::Instance(_) => 0,
            Segment::Wildcard => 1,
            Segment::Alias(_) => 2,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Name(s) => f.write_str(s),
            Segment::Instance(n) => write!(f, "{n}"),
            Segment::Wildcard => f.write_str("*"),
            Segment::Alias(pairs) => {
                f.write_str("[")?;
                for (i, (p, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{p}={v}")?;
                }
                f.write_str("]")
            },
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        // Exact segments sort before wildcards, wildcards before aliases, so
        // that declaration processing visits concrete nodes first.
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.to_string().cmp(&other.to_string()))
    }
}

/// An immutable, dot-separated parameter path.
///
/// The segment positions holding wildcards and aliases are cached as
/// bitmasks so pattern checks do not have to scan the segments. The
/// canonical string form is cached as well and doubles as the identity used
/// for hashing and interning.
#[derive(Debug, Clone)]
pub struct Path {
    segments: Arc<[Segment]>,
    wildcard: u32,
    alias: u32,
    text: String,
}

impl Path {
    /// Maximum number of segments a path may carry; bounded by the width of
    /// the position bitmasks.
    pub const MAX_DEPTH: usize = 32;

    fn from_segments(segments: Vec<Segment>) -> Result<Self> {
        ensure!(
            segments.len() <= Self::MAX_DEPTH,
            "path depth {} exceeds {}",
            segments.len(),
            Self::MAX_DEPTH
        );

        let mut wildcard = 0u32;
        let mut alias = 0u32;
        for (i, seg) in segments.iter().enumerate() {
            match seg {
                Segment::Wildcard => wildcard |= 1 << i,
                Segment::Alias(_) => alias |= 1 << i,
                _ => {},
            }
        }

        let text = segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(".");

        Ok(Self {
            segments: segments.into(),
            wildcard,
            alias,
            text,
        })
    }

    /// The empty path addressing the data model root.
    pub fn root() -> Self {
        Self {
            segments: Vec::new().into(),
            wildcard: 0,
            alias: 0,
            text: String::new(),
        }
    }

    /// Parses a dot-separated parameter path. Each segment may be a name, a
    /// decimal instance number, `*`, or an `[key=value,…]` alias expression.
    /// A trailing dot (partial path notation) is accepted and ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for raw in split_segments(s)? {
            segments.push(parse_segment(raw)?);
        }
        Self::from_segments(segments)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, i: usize) -> &Segment {
        &self.segments[i]
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Bitmask of the segment positions holding `*`.
    pub fn wildcard_mask(&self) -> u32 {
        self.wildcard
    }

    /// Bitmask of the segment positions holding alias expressions.
    pub fn alias_mask(&self) -> u32 {
        self.alias
    }

    /// True when no segment is a wildcard or alias.
    pub fn is_concrete(&self) -> bool {
        self.wildcard == 0 && self.alias == 0
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the subpath covering segment positions `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let segs = self.segments[start..end].to_vec();
        // Slicing cannot deepen a path, so from_segments cannot fail here.
        Self::from_segments(segs).unwrap_or_else(|_| Self::root())
    }

    /// Returns this path's parent, or the root for the root itself.
    pub fn parent(&self) -> Self {
        if self.is_root() {
            self.clone()
        } else {
            self.slice(0, self.len() - 1)
        }
    }

    pub fn concat(&self, other: &Path) -> Result<Self> {
        let mut segs = self.segments.to_vec();
        segs.extend(other.segments.iter().cloned());
        Self::from_segments(segs)
    }

    /// Appends a single segment.
    pub fn child(&self, seg: Segment) -> Result<Self> {
        let mut segs = self.segments.to_vec();
        segs.push(seg);
        Self::from_segments(segs)
    }

    /// True when `self`, read as a pattern, can stand for `other` at every
    /// position. Both paths must have the same depth; aliases are treated as
    /// wildcards here, their key constraints are checked by `device::unpack`.
    pub fn covers(&self, other: &Path) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.covers_prefix(other)
    }

    /// Returns the same path with every alias segment replaced by `*`. Alias
    /// key constraints are enforced separately against parameter values.
    pub fn dealias(&self) -> Self {
        if self.alias == 0 {
            return self.clone();
        }
        let segs = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Alias(_) => Segment::Wildcard,
                other => other.clone(),
            })
            .collect();
        Self::from_segments(segs).unwrap_or_else(|_| Self::root())
    }

    /// Like [`Path::covers`] but only over the first `self.len()` segments of
    /// `other`, which may be deeper.
    pub fn covers_prefix(&self, other: &Path) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| match a {
                Segment::Wildcard | Segment::Alias(_) => true,
                exact => exact == b,
            })
    }
}

fn split_segments(s: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                ensure!(depth > 0, "unbalanced ']' in path {s:?}");
                depth -= 1;
            },
            '.' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    ensure!(depth == 0, "unbalanced '[' in path {s:?}");
    out.push(&s[start..]);
    Ok(out)
}

fn parse_segment(raw: &str) -> Result<Segment> {
    ensure!(!raw.is_empty(), "empty path segment");

    if raw == "*" {
        return Ok(Segment::Wildcard);
    }

    if let Some(inner) = raw.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| anyhow::anyhow!("malformed alias segment {raw:?}"))?;
        let mut pairs = Vec::new();
        for pair in inner.split(',') {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("alias pair without '=' in {raw:?}"))?;
            let key = Path::parse(k.trim())?;
            ensure!(!key.is_root(), "alias key must not be empty in {raw:?}");
            ensure!(
                key.is_concrete(),
                "alias key must be a concrete path in {raw:?}"
            );
            pairs.push((key, v.trim().to_string()));
        }
        ensure!(!pairs.is_empty(), "empty alias segment {raw:?}");
        // Canonical order so textually different spellings intern to the
        // same path.
        pairs.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        return Ok(Segment::Alias(pairs));
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(Segment::Instance(raw.parse()?));
    }

    if raw.contains(['[', ']', '=', ' ']) {
        bail!("invalid characters in path segment {raw:?}");
    }

    Ok(Segment::Name(raw.to_string()))
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Path {}

impl std::hash::Hash for Path {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(other.segments.iter()) {
            match a.cmp(b) {
                Ordering::Equal => {},
                ord => return ord,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Path::parse(&s).map_err(serde::de::Error::custom)
    }
}
