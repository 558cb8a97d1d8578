// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Filter evaluation for Describe* handlers.
//!
//! Filters compose with AND across the filter list; values within one
//! filter compose with OR. A filter naming an unsupported field fails the
//! whole call with `InvalidParameterValue`.

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

/// Anything a filter can be evaluated against: a flat attribute lookup plus
/// the parsed tag list, since tags live under a reserved attribute prefix
/// but filters address them by bare key.
pub trait Filterable {
    fn attribute(&self, name: &str) -> Option<String>;
    fn tags(&self) -> &[(String, String)];
}

pub fn matches_all<T: Filterable>(item: &T, filters: &[Filter]) -> Result<bool> {
    for filter in filters {
        if !matches_one(item, filter)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_one<T: Filterable>(item: &T, filter: &Filter) -> Result<bool> {
    if let Some(key) = filter.name.strip_prefix("tag:") {
        return Ok(item
            .tags()
            .iter()
            .any(|(k, v)| k == key && filter.values.iter().any(|want| want == v)));
    }
    if filter.name == "tag-key" {
        return Ok(item
            .tags()
            .iter()
            .any(|(k, _)| filter.values.iter().any(|want| want == k)));
    }

    const KNOWN: &[&str] = &[
        "instance-state-name",
        "instance-type",
        "availability-zone",
        "instance-id",
        "private-ip-address",
        "ip-address",
        "private-dns-name",
        "dns-name",
    ];
    if !KNOWN.contains(&filter.name.as_str()) {
        return Err(Error::InvalidParameterValue(format!(
            "unsupported filter name: {}",
            filter.name
        )));
    }
    let Some(actual) = item.attribute(&filter.name) else {
        return Ok(false);
    };
    Ok(filter.values.iter().any(|want| want == &actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        attrs: Vec<(String, String)>,
        tags: Vec<(String, String)>,
    }

    impl Filterable for Fixture {
        fn attribute(&self, name: &str) -> Option<String> {
            self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
        }
        fn tags(&self) -> &[(String, String)] {
            &self.tags
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            attrs: vec![
                ("instance-state-name".into(), "running".into()),
                ("instance-type".into(), "t3.micro".into()),
            ],
            tags: vec![("Name".into(), "app".into())],
        }
    }

    #[test]
    fn unsupported_filter_name_is_invalid_parameter() {
        let item = fixture();
        let err = matches_all(&item, &[Filter { name: "bogus".into(), values: vec![] }]).unwrap_err();
        assert_eq!(err.code(), "InvalidParameterValue");
    }

    #[test]
    fn and_across_filters_or_within_values() {
        let item = fixture();
        assert!(matches_all(
            &item,
            &[
                Filter {
                    name: "instance-state-name".into(),
                    values: vec!["pending".into(), "running".into()],
                },
                Filter {
                    name: "tag:Name".into(),
                    values: vec!["app".into()],
                },
            ],
        )
        .unwrap());

        assert!(!matches_all(
            &item,
            &[Filter {
                name: "instance-type".into(),
                values: vec!["t3.large".into()],
            }],
        )
        .unwrap());
    }

    #[test]
    fn adding_a_filter_never_enlarges_the_result() {
        let item = fixture();
        let narrower = [Filter {
            name: "tag-key".into(),
            values: vec!["Name".into()],
        }];
        let wider: [Filter; 0] = [];
        assert!(matches_all(&item, &wider).unwrap());
        assert!(matches_all(&item, &narrower).unwrap());
        let impossible = [
            Filter {
                name: "tag-key".into(),
                values: vec!["Name".into()],
            },
            Filter {
                name: "instance-type".into(),
                values: vec!["t3.large".into()],
            },
        ];
        assert!(!matches_all(&item, &impossible).unwrap());
    }
}
