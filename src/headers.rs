//! Order-preserving header merge.

use std::collections::{BTreeMap, HashMap};

use http::HeaderMap;
use http::header::SET_COOKIE;

use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value};

/// One input to [`merge_headers`]: an existing header map, or name/value pairs
/// that are validated when merged.
#[derive(Clone, Debug)]
pub enum HeaderSource {
    Map(HeaderMap),
    Pairs(Vec<(String, String)>),
}

impl HeaderSource {
    fn into_map(self) -> Result<HeaderMap, Error> {
        match self {
            Self::Map(map) => Ok(map),
            Self::Pairs(pairs) => {
                let mut map = HeaderMap::with_capacity(pairs.len());
                for (name, value) in pairs {
                    let header_value = parse_header_value(&name, &value)?;
                    map.append(parse_header_name(&name)?, header_value);
                }
                Ok(map)
            }
        }
    }
}

impl From<HeaderMap> for HeaderSource {
    fn from(map: HeaderMap) -> Self {
        Self::Map(map)
    }
}

impl From<&HeaderMap> for HeaderSource {
    fn from(map: &HeaderMap) -> Self {
        Self::Map(map.clone())
    }
}

impl<K: Into<String>, V: Into<String>> From<Vec<(K, V)>> for HeaderSource {
    fn from(pairs: Vec<(K, V)>) -> Self {
        Self::Pairs(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for HeaderSource {
    fn from(pairs: [(K, V); N]) -> Self {
        Self::from(Vec::from(pairs))
    }
}

impl From<BTreeMap<String, String>> for HeaderSource {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self::Pairs(map.into_iter().collect())
    }
}

impl From<HashMap<String, String>> for HeaderSource {
    fn from(map: HashMap<String, String>) -> Self {
        Self::Pairs(map.into_iter().collect())
    }
}

/// Merges `sources` into `base`, left to right.
///
/// A later source replaces every value an earlier one set under the same name,
/// except `set-cookie`, whose values accumulate in the order they were added.
/// Names keep the position of their first appearance.
pub fn merge_headers<I, S>(base: impl Into<HeaderSource>, sources: I) -> Result<HeaderMap, Error>
where
    I: IntoIterator<Item = S>,
    S: Into<HeaderSource>,
{
    let mut merged = base.into().into_map()?;
    for source in sources {
        merge_into(&mut merged, source.into().into_map()?);
    }
    Ok(merged)
}

pub(crate) fn merge_into(target: &mut HeaderMap, source: HeaderMap) {
    let mut current_name = None;
    for (name, value) in source {
        let name = match name {
            Some(name) => {
                current_name = Some(name.clone());
                if name != SET_COOKIE {
                    target.insert(name, value);
                    continue;
                }
                name
            }
            // further values of the previous name
            None => match &current_name {
                Some(name) => name.clone(),
                None => continue,
            },
        };
        target.append(name, value);
    }
}

#[cfg(test)]
mod tests {
    use http::header::{AUTHORIZATION, CONTENT_TYPE};

    use super::*;

    fn values(map: &HeaderMap, name: &str) -> Vec<String> {
        map.get_all(name)
            .iter()
            .map(|value| value.to_str().unwrap_or_default().to_owned())
            .collect()
    }

    #[test]
    fn later_sources_override_case_insensitively() {
        let merged = merge_headers(
            [("Content-Type", "text/plain"), ("X-Keep", "1")],
            [HeaderSource::from([("content-type", "application/json")])],
        )
        .expect("merge headers");
        assert_eq!(values(&merged, "content-type"), ["application/json"]);
        assert_eq!(values(&merged, "x-keep"), ["1"]);
        let order: Vec<_> = merged.keys().map(|name| name.as_str().to_owned()).collect();
        assert_eq!(order, ["content-type", "x-keep"]);
    }

    #[test]
    fn set_cookie_accumulates_in_order() {
        let merged = merge_headers(
            [("set-cookie", "a=1"), ("x-other", "first")],
            [
                HeaderSource::from([("Set-Cookie", "b=2"), ("x-other", "second")]),
                HeaderSource::from([("set-cookie", "c=3")]),
            ],
        )
        .expect("merge headers");
        assert_eq!(values(&merged, "set-cookie"), ["a=1", "b=2", "c=3"]);
        assert_eq!(values(&merged, "x-other"), ["second"]);
    }

    #[test]
    fn grouping_does_not_change_result() {
        let a = HeaderSource::from([("set-cookie", "a=1"), ("accept", "*/*")]);
        let b = HeaderSource::from([("set-cookie", "b=2"), ("accept", "text/html")]);
        let c = HeaderSource::from([("accept", "application/json")]);

        let nested = merge_headers(
            merge_headers(a.clone(), [b.clone()]).expect("merge a b"),
            [c.clone()],
        )
        .expect("merge ab c");
        let flat = merge_headers(a, [b, c]).expect("merge a b c");
        assert_eq!(nested, flat);
    }

    #[test]
    fn existing_header_maps_are_accepted() {
        let mut base = HeaderMap::new();
        base.insert(AUTHORIZATION, "Bearer old".parse().expect("header value"));
        let mut update = HeaderMap::new();
        update.insert(AUTHORIZATION, "Bearer new".parse().expect("header value"));
        update.insert(CONTENT_TYPE, "text/plain".parse().expect("header value"));

        let merged = merge_headers(&base, [&update]).expect("merge maps");
        assert_eq!(values(&merged, "authorization"), ["Bearer new"]);
        assert_eq!(merged.len(), 2);
        assert_eq!(values(&base, "authorization"), ["Bearer old"]);
    }

    #[test]
    fn invalid_pairs_are_rejected() {
        let error = merge_headers([("bad name", "x")], Vec::<HeaderSource>::new())
            .expect_err("invalid header name");
        assert!(matches!(error, Error::InvalidHeaderName { .. }));
    }
}
