//! Label selector evaluation
//!
//! Evaluates `matchLabels` and `matchExpressions` (`In`, `NotIn`, `Exists`,
//! `DoesNotExist`) against a label set, renders selectors in the string form
//! list calls accept, and resolves which BackupConfiguration owns a workload.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;
use tracing::warn;

use crate::crd::BackupConfiguration;
use crate::{Error, Result};

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> Result<bool> {
    let values = req.values.as_deref().unwrap_or_default();
    let value = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => Ok(value.is_some_and(|v| values.contains(v))),
        "NotIn" => Ok(value.map_or(true, |v| !values.contains(v))),
        "Exists" => Ok(value.is_some()),
        "DoesNotExist" => Ok(value.is_none()),
        op => Err(Error::validation(format!(
            "{op:?} is not a valid label selector operator"
        ))),
    }
}

/// True when every `matchLabels` entry and every expression holds.
///
/// An empty selector matches everything.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(match_labels) = &selector.match_labels {
        if match_labels.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return Ok(false);
        }
    }
    for req in selector.match_expressions.as_deref().unwrap_or_default() {
        if !requirement_matches(req, labels)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Render a selector as a list-call label selector string
pub fn to_selector_string(selector: &LabelSelector) -> Result<String> {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for req in selector.match_expressions.as_deref().unwrap_or_default() {
        let mut values = req.values.clone().unwrap_or_default();
        values.sort();
        let part = match req.operator.as_str() {
            "In" => format!("{} in ({})", req.key, values.join(",")),
            "NotIn" => format!("{} notin ({})", req.key, values.join(",")),
            "Exists" => req.key.clone(),
            "DoesNotExist" => format!("!{}", req.key),
            op => {
                return Err(Error::validation(format!(
                    "{op:?} is not a valid label selector operator"
                )))
            }
        };
        parts.push(part);
    }
    Ok(parts.join(","))
}

/// Pick the BackupConfiguration whose selector matches `labels`.
///
/// Configurations without a selector or with an invalid one never match.
/// When several match, the lexicographically smallest name wins and the
/// ambiguity is logged.
pub fn find_configuration<'a>(
    configs: &'a [BackupConfiguration],
    labels: &BTreeMap<String, String>,
) -> Option<&'a BackupConfiguration> {
    let mut candidates: Vec<&BackupConfiguration> = configs
        .iter()
        .filter(|c| {
            c.spec
                .selector
                .as_ref()
                .is_some_and(|s| matches(s, labels).unwrap_or(false))
        })
        .collect();
    candidates.sort_by_key(|c| c.name_any());

    if candidates.len() > 1 {
        warn!(
            candidates = ?candidates.iter().map(|c| c.name_any()).collect::<Vec<_>>(),
            chosen = %candidates[0].name_any(),
            "multiple BackupConfigurations match workload, using first by name"
        );
    }
    candidates.first().copied()
}
