use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved JSON-tuple entry holding the metric name.
pub const METRIC_NAME_KEY: &str = "metric_name";

/// Reserved JSON-tuple entry holding the [`KeyDirective`].
pub const GRAPHITE_KEYS_KEY: &str = "graphite_keys";

/// Separator of tag names within a [`KeyDirective`].
const DIRECTIVE_SEPARATOR: char = ';';

/// An error returned when a raw metric key cannot be turned into a name.
///
/// Each of these is a defect in the producer of the key. The affected entry is dropped, all other
/// entries of the same flush are unaffected.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum KeyError {
    /// The first segment of a delimited key is a tag.
    #[error("metric name must not start with a tag")]
    LeadingTag,
    /// Nothing of the key remains after sanitization.
    #[error("metric name is empty")]
    EmptyName,
    /// A JSON-tuple key has no `metric_name` entry, or it is empty.
    #[error("missing or empty `metric_name` entry")]
    MissingMetricName,
    /// The `graphite_keys` directive lists an entry that is not part of the key.
    #[error("`graphite_keys` references missing entry `{key}`")]
    MissingReferencedKey {
        /// The name of the referenced entry.
        key: String,
    },
}

/// Encoding of raw metric keys expected by the SignalFx backend.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    /// Dot-delimited keys with inline `name=value` tags, such as `api.requests.host=web1`.
    ///
    /// See [`ParsedKey::parse_delimited`].
    #[default]
    Delimited,
    /// JSON lists of `[name, value]` tuples with a reserved `metric_name` entry.
    ///
    /// Keys that are not JSON-tuple encoded are parsed as [`KeyFormat::Delimited`]. See
    /// [`ParsedKey::parse_multi_key`].
    MultiKey,
}

/// Replaces whitespace runs with `_`, slashes with `-` and strips all other characters outside of
/// `[A-Za-z0-9_\-=.]`.
pub fn sanitize_key(raw: &str) -> String {
    let mut sanitized = String::with_capacity(raw.len());
    let mut in_whitespace = false;

    for c in raw.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                sanitized.push('_');
            }
            in_whitespace = true;
            continue;
        }

        in_whitespace = false;
        match c {
            '/' => sanitized.push('-'),
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | '.') => {
                sanitized.push(c)
            }
            _ => (),
        }
    }

    sanitized
}

/// A metric name and the dimensions extracted from a raw metric key.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ParsedKey {
    /// The metric name without any tags.
    pub metric_name: String,
    /// Dimensions of the metric.
    pub tags: BTreeMap<String, String>,
}

impl ParsedKey {
    /// Parses a raw key in the given format.
    pub fn parse(raw: &str, format: KeyFormat) -> Result<Self, KeyError> {
        match format {
            KeyFormat::Delimited => Self::parse_delimited(raw),
            KeyFormat::MultiKey => Self::parse_multi_key(raw),
        }
    }

    /// Parses a dot-delimited key with inline tags.
    ///
    /// The key is [sanitized](sanitize_key) and split on `.`. The first segment starts the metric
    /// name and must not be a tag. Every following segment containing `=` is a tag, split on the
    /// first `=`, all others are appended to the name. For repeated tags the last one wins.
    ///
    /// ```
    /// use tagflush_metrics::ParsedKey;
    ///
    /// let key = ParsedKey::parse_delimited("api.requests.host=web1.count").unwrap();
    /// assert_eq!(key.metric_name, "api.requests.count");
    /// assert_eq!(key.tags["host"], "web1");
    /// ```
    pub fn parse_delimited(raw: &str) -> Result<Self, KeyError> {
        let sanitized = sanitize_key(raw);
        let mut segments = sanitized.split('.');

        let first = segments.next().unwrap_or_default();
        if first.contains('=') {
            return Err(KeyError::LeadingTag);
        }

        let mut name_parts = vec![first];
        let mut tags = BTreeMap::new();

        for segment in segments {
            match segment.split_once('=') {
                Some((name, value)) => {
                    tags.insert(name.to_owned(), value.to_owned());
                }
                None => name_parts.push(segment),
            }
        }

        let metric_name = name_parts.join(".");
        if metric_name.is_empty() {
            return Err(KeyError::EmptyName);
        }

        Ok(Self { metric_name, tags })
    }

    /// Parses a JSON-tuple key into its `metric_name` and tags.
    ///
    /// If the key carries a [`KeyDirective`], only the listed entries become tags. Otherwise, all
    /// entries except for `metric_name` do. Keys that are not JSON-tuple encoded fall back to
    /// [`parse_delimited`](Self::parse_delimited).
    ///
    /// ```
    /// use tagflush_metrics::ParsedKey;
    ///
    /// let key = ParsedKey::parse_multi_key(r#"[["metric_name", "latency"], ["host", "web1"]]"#);
    /// let key = key.unwrap();
    /// assert_eq!(key.metric_name, "latency");
    /// assert_eq!(key.tags["host"], "web1");
    /// ```
    pub fn parse_multi_key(raw: &str) -> Result<Self, KeyError> {
        let Some(tuples) = TupleKey::parse(raw) else {
            return Self::parse_delimited(raw);
        };

        let metric_name = tuples.metric_name()?.to_owned();
        let tags = match tuples.directive() {
            Some(directive) => directive
                .resolve(&tuples)?
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            None => tuples
                .entries
                .into_iter()
                .filter(|(name, _)| name != METRIC_NAME_KEY)
                .collect(),
        };

        Ok(Self { metric_name, tags })
    }
}

/// An ordered list of tag names to project into a composed metric name.
///
/// In JSON-tuple keys, the directive is the `graphite_keys` entry holding a `;`-separated list of
/// entry names. Empty names are ignored.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyDirective {
    keys: Vec<String>,
}

impl KeyDirective {
    /// Parses a `;`-separated directive.
    pub fn parse(directive: &str) -> Self {
        let keys = directive
            .split(DIRECTIVE_SEPARATOR)
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .collect();

        Self { keys }
    }

    /// Returns the referenced entry names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Looks up all referenced entries in the given key.
    ///
    /// Returns the `(name, value)` pairs in directive order, or an error for the first entry that
    /// does not exist.
    pub fn resolve<'a>(&'a self, key: &'a TupleKey) -> Result<Vec<(&'a str, &'a str)>, KeyError> {
        self.keys()
            .map(|name| match key.get(name) {
                Some(value) => Ok((name, value)),
                None => Err(KeyError::MissingReferencedKey {
                    key: name.to_owned(),
                }),
            })
            .collect()
    }
}

/// A key encoded as a JSON list of `[name, value]` tuples.
///
/// ```json
/// [["metric_name", "latency"], ["host", "web1"], ["graphite_keys", "host"]]
/// ```
///
/// Non-string values are stringified. For duplicate names the last tuple wins.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TupleKey {
    entries: BTreeMap<String, String>,
}

impl TupleKey {
    /// Parses the raw key, returning `None` if it is not a JSON list of tuples.
    pub fn parse(raw: &str) -> Option<Self> {
        let tuples: Vec<(String, serde_json::Value)> = serde_json::from_str(raw).ok()?;

        let entries = tuples
            .into_iter()
            .map(|(name, value)| (name, tag_value(value)))
            .collect();

        Some(Self { entries })
    }

    /// Returns the value of the given entry.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Returns the non-empty `metric_name` entry.
    pub fn metric_name(&self) -> Result<&str, KeyError> {
        self.get(METRIC_NAME_KEY)
            .filter(|name| !name.is_empty())
            .ok_or(KeyError::MissingMetricName)
    }

    /// Returns the `graphite_keys` directive, if present.
    pub fn directive(&self) -> Option<KeyDirective> {
        self.get(GRAPHITE_KEYS_KEY).map(KeyDirective::parse)
    }
}

fn tag_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(string) => string,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Composes the multi-dimensional Graphite name of a raw key.
///
/// For JSON-tuple keys with a [`KeyDirective`], the name is `metric_name` followed by a
/// `name.value` pair for each referenced entry, in directive order. All other keys are returned
/// unchanged.
///
/// ```
/// use tagflush_metrics::graphite_name;
///
/// let raw = r#"[["graphite_keys", "host"], ["host", "web1"], ["metric_name", "latency"]]"#;
/// assert_eq!(graphite_name(raw).unwrap(), "latency.host.web1");
/// assert_eq!(graphite_name("plain.metric").unwrap(), "plain.metric");
/// ```
pub fn graphite_name(raw: &str) -> Result<Cow<'_, str>, KeyError> {
    let Some(tuples) = TupleKey::parse(raw) else {
        return Ok(Cow::Borrowed(raw));
    };

    let Some(directive) = tuples.directive() else {
        return Ok(Cow::Borrowed(raw));
    };

    let mut segments = vec![tuples.metric_name()?];
    for (name, value) in directive.resolve(&tuples)? {
        segments.push(name);
        segments.push(value);
    }

    Ok(Cow::Owned(segments.join(".")))
}
