//! Partition keys and channel templates.
//!
//! Records are grouped into chunks by [`PartitionKey`]: the record's tag plus
//! its time truncated to the configured bucket width. Channels are chosen
//! per record by resolving a [`ChannelTemplate`] against the record's tag.

use std::borrow::Cow;
use std::fmt;

use crate::record::Record;

/// Identifies the chunk a record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// The record tag.
    pub tag: String,
    /// Start of the time bucket, in seconds since the Unix epoch.
    pub bucket: i64,
}

impl PartitionKey {
    /// Creates a key from its parts.
    pub fn new(tag: impl Into<String>, bucket: i64) -> Self {
        Self {
            tag: tag.into(),
            bucket,
        }
    }

    /// Computes the key for `record` with buckets of `width_secs` seconds.
    ///
    /// The bucket is `floor(time / width) * width`, so negative times land in
    /// the bucket below zero rather than being rounded toward it. Times so
    /// close to `i64::MIN` that their bucket start is not representable all
    /// share the lowest representable bucket.
    ///
    /// # Panics
    ///
    /// Panics if `width_secs` is not positive. [`BufferConfig::validate`]
    /// guarantees this for configured widths.
    ///
    /// [`BufferConfig::validate`]: crate::config::BufferConfig::validate
    pub fn for_record(record: &Record, width_secs: i64) -> Self {
        assert!(width_secs > 0, "bucket width must be positive");
        let bucket = record
            .time
            .div_euclid(width_secs)
            .checked_mul(width_secs)
            .unwrap_or(i64::MIN / width_secs * width_secs);
        Self {
            tag: record.tag.clone(),
            bucket,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tag, self.bucket)
    }
}

/// One piece of a parsed channel template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Copied verbatim.
    Literal(String),
    /// `${tag}`: the whole tag.
    Tag,
    /// `${tag[N]}`: one dot-separated part of the tag; negative counts from the end.
    TagPart(isize),
}

/// A channel name pattern resolved per record.
///
/// Supported placeholders:
///
/// - `${tag}`: the record tag
/// - `${tag[N]}`: the N-th dot-separated part of the tag (`${tag[-1]}` is
///   the last part); an out-of-range index resolves to an empty string
///
/// Anything else, including unknown `${...}` sequences, is literal text.
///
/// # Example
///
/// ```rust
/// use redpub::partition::ChannelTemplate;
///
/// let template = ChannelTemplate::parse("logs.${tag[0]}.${tag}");
/// assert_eq!(template.resolve("app.web"), "logs.app.app.web");
///
/// let fixed = ChannelTemplate::parse("events");
/// assert!(fixed.is_static());
/// assert_eq!(fixed.resolve("anything"), "events");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTemplate {
    pattern: String,
    segments: Vec<Segment>,
}

impl ChannelTemplate {
    /// Parses a template string. Parsing never fails.
    pub fn parse(pattern: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;

        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let parsed = after
                .find('}')
                .and_then(|end| parse_placeholder(&after[..end]).map(|seg| (seg, end)));

            match parsed {
                Some((segment, end)) => {
                    literal.push_str(&rest[..start]);
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                    rest = &after[end + 1..];
                }
                None => {
                    literal.push_str(&rest[..start + 2]);
                    rest = after;
                }
            }
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            pattern: pattern.to_string(),
            segments,
        }
    }

    /// Returns the pattern this template was parsed from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns `true` if the template contains no placeholders.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Resolves the channel name for a record with the given tag.
    ///
    /// Static templates are returned borrowed and unchanged.
    pub fn resolve<'a>(&'a self, tag: &str) -> Cow<'a, str> {
        if self.is_static() {
            return Cow::Borrowed(self.pattern.as_str());
        }

        let mut out = String::with_capacity(self.pattern.len() + tag.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Tag => out.push_str(tag),
                Segment::TagPart(index) => {
                    if let Some(part) = tag_part(tag, *index) {
                        out.push_str(part);
                    }
                }
            }
        }
        Cow::Owned(out)
    }
}

impl Default for ChannelTemplate {
    fn default() -> Self {
        Self::parse("${tag}")
    }
}

/// Parses the inside of `${...}`.
fn parse_placeholder(inner: &str) -> Option<Segment> {
    if inner == "tag" {
        return Some(Segment::Tag);
    }
    let index = inner.strip_prefix("tag[")?.strip_suffix(']')?;
    index.trim().parse().ok().map(Segment::TagPart)
}

fn tag_part(tag: &str, index: isize) -> Option<&str> {
    let parts: Vec<&str> = tag.split('.').collect();
    let resolved = if index < 0 {
        parts.len().checked_sub(index.unsigned_abs())?
    } else {
        index.unsigned_abs()
    };
    parts.get(resolved).copied()
}
