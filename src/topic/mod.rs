//! # Topic handling
//!
//! Topic filters, the factory topic namespace and the [`TopicRouter`] that maps
//! inbound topics to handlers.
//!
//! ## Namespace
//!
//! ```text
//! factory/<lineId>/<machineId>/<category>
//!                               └── telemetry | state | command | command-ack
//! ```
//!
//! ## Filter algebra
//!
//! Filters and topics are split on `/`. A literal segment matches only the
//! identical level, `+` matches exactly one level and `#` matches every
//! remaining level, including none. `#` is only valid as the last segment, and
//! wildcard characters may not be mixed with other characters inside a
//! segment (`sensor+` is rejected).

pub mod router;


pub use router::TopicRouter;

use std::fmt;
use std::str::FromStr;

use crate::model::MachineId;

/// First level of every topic in the factory namespace.
pub const ROOT_SEGMENT: &str = "factory";

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid filter '{filter}': topic filter is empty")]
    Empty { filter: String },

    #[error("Invalid filter '{filter}': multi-level wildcard must be the last segment")]
    MultiLevelNotTerminal { filter: String },

    #[error("Invalid filter '{filter}': wildcard mixed into segment '{segment}'")]
    MixedWildcard { filter: String, segment: String },
}

/// One level of a [`TopicFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterSegment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

impl fmt::Display for FilterSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FilterSegment::Literal(literal) => f.write_str(literal),
            FilterSegment::SingleLevel => f.write_str(SINGLE_LEVEL),
            FilterSegment::MultiLevel => f.write_str(MULTI_LEVEL),
        }
    }
}

/// A validated subscription pattern.
///
/// Construction goes through [`TopicFilter::parse`], so a value of this type
/// always satisfies the invariant that `#` only appears last.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    segments: Vec<FilterSegment>,
}

impl TopicFilter {
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        if raw.is_empty() {
            return Err(FilterError::Empty {
                filter: raw.to_string(),
            });
        }

        let levels: Vec<&str> = raw.split('/').collect();
        let last = levels.len() - 1;
        let mut segments = Vec::with_capacity(levels.len());

        for (index, level) in levels.into_iter().enumerate() {
            let segment = match level {
                MULTI_LEVEL if index != last => {
                    return Err(FilterError::MultiLevelNotTerminal {
                        filter: raw.to_string(),
                    })
                }
                MULTI_LEVEL => FilterSegment::MultiLevel,
                SINGLE_LEVEL => FilterSegment::SingleLevel,
                literal if literal.contains(|c: char| c == '+' || c == '#') => {
                    return Err(FilterError::MixedWildcard {
                        filter: raw.to_string(),
                        segment: literal.to_string(),
                    })
                }
                literal => FilterSegment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[FilterSegment] {
        &self.segments
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| !matches!(segment, FilterSegment::Literal(_)))
    }

    /// Whether `topic` is covered by this filter.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');

        for segment in &self.segments {
            match segment {
                FilterSegment::MultiLevel => return true,
                FilterSegment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                FilterSegment::Literal(literal) => match levels.next() {
                    Some(level) if level == literal => {}
                    _ => return false,
                },
            }
        }

        levels.next().is_none()
    }
}

impl FromStr for TopicFilter {
    type Err = FilterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

/// Last level of a factory topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Telemetry,
    State,
    Command,
    CommandAck,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Telemetry => "telemetry",
            Category::State => "state",
            Category::Command => "command",
            Category::CommandAck => "command-ack",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "telemetry" => Some(Category::Telemetry),
            "state" => Some(Category::State),
            "command" => Some(Category::Command),
            "command-ack" => Some(Category::CommandAck),
            _ => None,
        }
    }

    /// Wildcard filter covering this category on every line and machine.
    pub fn any_machine_filter(&self) -> String {
        format!("{}/+/+/{}", ROOT_SEGMENT, self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic split into its namespace parts.
///
/// The category is kept raw so callers can decide how to treat categories
/// they do not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryTopic<'a> {
    pub machine: MachineId,
    pub category: &'a str,
}

impl<'a> FactoryTopic<'a> {
    /// Splits `factory/<line>/<machine>/<category>`. Returns `None` for
    /// anything with a different shape or empty identifiers.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let mut levels = topic.split('/');
        let root = levels.next()?;
        let line = levels.next()?;
        let machine = levels.next()?;
        let category = levels.next()?;

        if root != ROOT_SEGMENT || levels.next().is_some() {
            return None;
        }
        if line.is_empty() || machine.is_empty() {
            return None;
        }

        Some(Self {
            machine: MachineId::new(line, machine),
            category,
        })
    }
}
