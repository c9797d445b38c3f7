use std::fmt;
use std::str::FromStr;

/// A parsed segment of a token's key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Plain property name. Never a decimal integer, `[]` or `+`.
    Key(String),
    /// Positional index into a sequence. If applied to a mapping, the index
    /// may also serve as a (stringified) property name.
    Index(usize),
    /// `[]`: the next free slot of a collection on writes, the collection
    /// itself on reads.
    Append,
    /// `+`: wildcard over all children of a collection or mapping.
    Wildcard,
}

impl Segment {
    fn parse(raw: &str) -> Result<Self, TokenError> {
        if raw.is_empty() {
            return Err(TokenError::EmptySegment);
        }
        Ok(match raw {
            "[]" => Segment::Append,
            "+" => Segment::Wildcard,
            _ if raw.bytes().all(|b| b.is_ascii_digit()) => match raw.parse::<usize>() {
                Ok(index) => Segment::Index(index),
                Err(_) => Segment::Key(raw.to_string()),
            },
            _ => Segment::Key(raw.to_string()),
        })
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Segment::Index(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => write!(f, "{key}"),
            Segment::Index(index) => write!(f, "{index}"),
            Segment::Append => write!(f, "[]"),
            Segment::Wildcard => write!(f, "+"),
        }
    }
}

/// A fully parsed token: a domain plus the key path inside it. A token with
/// an empty key path addresses the whole domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    domain: String,
    segments: Vec<Segment>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has an empty domain")]
    EmptyDomain,
    #[error("token contains an empty key segment")]
    EmptySegment,
}

impl Token {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_domain_only(&self) -> bool {
        self.segments.is_empty()
    }

    /// The key path without the leading domain, in dotted string form.
    pub fn key_path(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, TokenError> {
        let (domain, rest) = match s.split_once('.') {
            Some((domain, rest)) => (domain, Some(rest)),
            None => (s, None),
        };
        if domain.trim().is_empty() {
            return Err(TokenError::EmptyDomain);
        }

        let mut segments = Vec::new();
        if let Some(rest) = rest {
            // A trailing "domain." still means the whole domain.
            if !rest.is_empty() {
                for raw in rest.split('.') {
                    segments.push(Segment::parse(raw)?);
                }
            }
        }
        Ok(Token {
            domain: domain.to_string(),
            segments,
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.domain)?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// Parses a bare key path (a token without its leading domain) into
/// segments. An empty path addresses the whole domain.
pub fn parse_key_path(path: &str) -> Result<Vec<Segment>, TokenError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('.').map(Segment::parse).collect()
}

/// Fast dissection of a token into its domain and raw key path, without
/// parsing segments. The key path is empty for a lone domain. Returns `None`
/// for tokens with an empty domain.
pub fn split_token(token: &str) -> Option<(&str, &str)> {
    let (domain, key) = match token.split_once('.') {
        Some((domain, key)) => (domain, key),
        None => (token, ""),
    };
    if domain.trim().is_empty() {
        None
    } else {
        Some((domain, key))
    }
}
