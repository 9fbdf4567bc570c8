use std::fmt;

use serde::Deserialize;

use crate::error::PolicyError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment
    Single,
    /// `**`: any number of trailing segments, including none
    Rest,
}

/// A request path pattern such as `/api/v1/orders/**`.
///
/// Literal segments match exactly, `*` matches one segment and a trailing
/// `**` matches the remainder of the path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let invalid = |reason| PolicyError::InvalidPattern {
            pattern: raw.to_string(),
            reason,
        };

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let parts: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let segment = match *part {
                "**" if idx + 1 == parts.len() => Segment::Rest,
                "**" => return Err(invalid("'**' is only allowed as the last segment")),
                "*" => Segment::Single,
                literal if literal.contains('*') => {
                    return Err(invalid("wildcards must span a whole segment"));
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let mut parts = path.split('/').filter(|s| !s.is_empty());

        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => {
                    if parts.next() != Some(literal.as_str()) {
                        return false;
                    }
                }
            }
        }

        parts.next().is_none()
    }
}

impl TryFrom<String> for PathPattern {
    type Error = PolicyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
