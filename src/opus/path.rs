//! Structured paths into action trees
//!
//! A small JSONPath subset used by parametrized action templates to point at
//! the value a parameter replaces:
//!
//! - `$` the root (optional)
//! - `.name`, `['name']`, `["name"]` object members
//! - `[3]` array elements
//! - `[*]`, `.*` every child
//!
//! Resolution never mutates. [`ValuePath::update`] consumes the tree and
//! returns the rewritten one, so a template and its instances never share
//! structure.

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A parsed path expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePath {
    source: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("malformed path '{path}': {reason}")]
    Malformed { path: String, reason: String },
}

impl ValuePath {
    pub fn parse(source: &str) -> Result<Self, PathError> {
        let malformed = |reason: &str| PathError::Malformed {
            path: source.to_string(),
            reason: reason.to_string(),
        };

        let chars: Vec<char> = source.trim().chars().collect();
        let mut segments = Vec::new();
        let mut pos = 0;

        if chars.first() == Some(&'$') {
            pos = 1;
        } else if let Some(&c) = chars.first() {
            // Bare leading member, e.g. "params.text"
            if c != '.' && c != '[' {
                let (name, next) = read_name(&chars, 0);
                segments.push(Segment::Key(name));
                pos = next;
            }
        }

        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    match chars.get(pos) {
                        Some('*') => {
                            segments.push(Segment::Wildcard);
                            pos += 1;
                        }
                        Some(&c) if c != '.' && c != '[' => {
                            let (name, next) = read_name(&chars, pos);
                            segments.push(Segment::Key(name));
                            pos = next;
                        }
                        _ => return Err(malformed("expected a member name after '.'")),
                    }
                }
                '[' => {
                    pos += 1;
                    let close = chars[pos..]
                        .iter()
                        .position(|&c| c == ']')
                        .map(|offset| pos + offset)
                        .ok_or_else(|| malformed("unterminated '['"))?;
                    let inner: String = chars[pos..close].iter().collect();
                    let inner = inner.trim();
                    let segment = if inner == "*" {
                        Segment::Wildcard
                    } else if let Some(quoted) = strip_quotes(inner) {
                        Segment::Key(quoted.to_string())
                    } else {
                        inner
                            .parse::<usize>()
                            .map(Segment::Index)
                            .map_err(|_| malformed("expected an index, a quoted name or '*'"))?
                    };
                    segments.push(segment);
                    pos = close + 1;
                }
                other => {
                    return Err(malformed(&format!("unexpected character '{other}'")));
                }
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Every value the path points at, in document order
    pub fn find<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut found = Vec::new();
        collect(root, &self.segments, &mut found);
        found
    }

    /// Rewrite every matched value with `f`, returning the new tree.
    ///
    /// Unmatched branches are returned untouched.
    pub fn update<F>(&self, root: Value, mut f: F) -> Value
    where
        F: FnMut(&Value) -> Value,
    {
        rewrite(root, &self.segments, &mut f)
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let end = chars[start..]
        .iter()
        .position(|&c| c == '.' || c == '[')
        .map(|offset| start + offset)
        .unwrap_or(chars.len());
    (chars[start..end].iter().collect(), end)
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')))
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn collect<'a>(value: &'a Value, segments: &[Segment], found: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };

    match (head, value) {
        (Segment::Key(key), Value::Object(map)) => {
            if let Some(child) = map.get(key) {
                collect(child, rest, found);
            }
        }
        (Segment::Index(index), Value::Array(items)) => {
            if let Some(child) = items.get(*index) {
                collect(child, rest, found);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for child in map.values() {
                collect(child, rest, found);
            }
        }
        (Segment::Wildcard, Value::Array(items)) => {
            for child in items {
                collect(child, rest, found);
            }
        }
        _ => {}
    }
}

fn rewrite<F>(value: Value, segments: &[Segment], f: &mut F) -> Value
where
    F: FnMut(&Value) -> Value,
{
    let Some((head, rest)) = segments.split_first() else {
        return f(&value);
    };

    match (head, value) {
        (Segment::Key(key), Value::Object(mut map)) => {
            if let Some(slot) = map.get_mut(key) {
                let child = std::mem::take(slot);
                *slot = rewrite(child, rest, f);
            }
            Value::Object(map)
        }
        (Segment::Index(index), Value::Array(mut items)) => {
            if let Some(slot) = items.get_mut(*index) {
                let child = std::mem::take(slot);
                *slot = rewrite(child, rest, f);
            }
            Value::Array(items)
        }
        (Segment::Wildcard, Value::Object(mut map)) => {
            for slot in map.values_mut() {
                let child = std::mem::take(slot);
                *slot = rewrite(child, rest, f);
            }
            Value::Object(map)
        }
        (Segment::Wildcard, Value::Array(items)) => Value::Array(
            items
                .into_iter()
                .map(|child| rewrite(child, rest, f))
                .collect(),
        ),
        (_, other) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_mixed_segments() {
        let path = ValuePath::parse("$[0].params['text']").unwrap();
        assert_eq!(
            path.segments,
            vec![
                Segment::Index(0),
                Segment::Key("params".into()),
                Segment::Key("text".into()),
            ]
        );
    }

    #[test]
    fn test_parse_without_root() {
        let path = ValuePath::parse("params.volume").unwrap();
        assert_eq!(
            path.segments,
            vec![Segment::Key("params".into()), Segment::Key("volume".into())]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ValuePath::parse("$[abc]").is_err());
        assert!(ValuePath::parse("$[0").is_err());
        assert!(ValuePath::parse("$.").is_err());
    }

    #[test]
    fn test_find_wildcard() {
        let tree = json!([
            {"params": {"n": 1}},
            {"params": {"n": 2}},
        ]);
        let path = ValuePath::parse("$[*].params.n").unwrap();
        assert_eq!(path.find(&tree), vec![&json!(1), &json!(2)]);
    }

    #[test]
    fn test_find_missing_is_empty() {
        let tree = json!([{"params": {}}]);
        let path = ValuePath::parse("$[3].params.n").unwrap();
        assert!(path.find(&tree).is_empty());
    }

    #[test]
    fn test_update_leaves_original_intact() {
        let original = json!([{"target": "audio", "params": {"volume": "$v"}}]);
        let path = ValuePath::parse("$[0].params.volume").unwrap();

        let updated = path.update(original.clone(), |_| json!(5));

        assert_eq!(updated[0]["params"]["volume"], json!(5));
        assert_eq!(original[0]["params"]["volume"], json!("$v"));
        assert_eq!(updated[0]["target"], json!("audio"));
    }

    #[test]
    fn test_update_preserves_member_order() {
        let tree = json!({"a": 1, "b": 2, "c": 3});
        let path = ValuePath::parse("$.a").unwrap();
        let updated = path.update(tree, |_| json!(9));
        let keys: Vec<_> = updated.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
