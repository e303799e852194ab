//! Variation generation: the deterministic ordered set of parameter
//! combinations a batch sweeps over.

use crate::config::{DimensionKind, VariationDimension};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// One concrete combination of values drawn from the declared
/// dimensions. Immutable once generated; ids are sequential from 1 and
/// stable across identical inputs, which resume correctness relies on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variation {
    pub id: u32,
    pub description: String,
    /// Modification key is the dimension label (`{type}:{target}`).
    pub modifications: BTreeMap<String, serde_json::Value>,
}

impl Variation {
    /// Short filesystem-safe label, used in logs and output paths.
    pub fn label(&self) -> String {
        format!("var-{:03}", self.id)
    }
}

/// Number of variations `generate` would produce, without
/// materializing them. Zero dimensions count as one base variation.
pub fn count(dimensions: &[VariationDimension]) -> usize {
    dimensions.iter().map(|d| d.values.len()).product()
}

/// Build the full variation list: nested Cartesian product over the
/// dimension value lists, declaration order outermost-first (the last
/// dimension varies fastest). Deterministic for identical input.
pub fn generate(dimensions: &[VariationDimension]) -> Vec<Variation> {
    if dimensions.is_empty() {
        return vec![Variation {
            id: 1,
            description: "base".to_string(),
            modifications: BTreeMap::new(),
        }];
    }

    let total = count(dimensions);
    let mut variations = Vec::with_capacity(total);
    let mut indices = vec![0usize; dimensions.len()];

    for id in 1..=total {
        let mut modifications = BTreeMap::new();
        let mut parts = Vec::with_capacity(dimensions.len());
        for (dim, &idx) in dimensions.iter().zip(indices.iter()) {
            let value = dim.values[idx].clone();
            parts.push(format!("{}={}", dim.target, value_display(&value)));
            modifications.insert(dim.label(), value);
        }
        variations.push(Variation {
            id: id as u32,
            description: parts.join(", "),
            modifications,
        });

        // Odometer increment, last dimension fastest.
        for pos in (0..dimensions.len()).rev() {
            indices[pos] += 1;
            if indices[pos] < dimensions[pos].values.len() {
                break;
            }
            indices[pos] = 0;
        }
    }

    variations
}

fn value_display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Materialize a runnable scenario snapshot: load the base scenario
/// YAML, apply the variation's modifications, write to `destination`.
///
/// A modification whose target does not exist in the base scenario is
/// reported with a warning and skipped; it never aborts
/// materialization.
pub fn apply(variation: &Variation, base_scenario: &Path, destination: &Path) -> Result<()> {
    let bytes = fs::read(base_scenario)
        .map_err(|e| anyhow!("scenario_read_failed: {}: {}", base_scenario.display(), e))?;
    let mut scenario: serde_yaml::Value = serde_yaml::from_slice(&bytes)
        .map_err(|e| anyhow!("scenario_parse_failed: {}: {}", base_scenario.display(), e))?;

    for (label, value) in variation.modifications.iter() {
        let (kind, target) = label
            .split_once(':')
            .ok_or_else(|| anyhow!("modification_label_invalid: {}", label))?;
        let yaml_value = serde_yaml::to_value(value)
            .map_err(|e| anyhow!("modification_value_invalid: {}: {}", label, e))?;
        let applied = match kind {
            k if k == DimensionKind::ActorModel.label() => {
                apply_actor_model(&mut scenario, target, yaml_value)
            }
            k if k == DimensionKind::ScenarioParameter.label() => {
                apply_scenario_parameter(&mut scenario, target, yaml_value)
            }
            other => return Err(anyhow!("modification_kind_unknown: {}", other)),
        };
        if !applied {
            warn!(
                variation = variation.id,
                modification = %label,
                "modification target not found in base scenario, skipping"
            );
        }
    }

    let out = serde_yaml::to_string(&scenario)
        .map_err(|e| anyhow!("scenario_serialize_failed: {}", e))?;
    if let Some(parent) = destination.parent() {
        simlab_core::ensure_dir(parent)?;
    }
    fs::write(destination, out)
        .map_err(|e| anyhow!("scenario_write_failed: {}: {}", destination.display(), e))?;
    Ok(())
}

/// Set the `model` of the actor named `target`. Returns false when no
/// such actor exists.
fn apply_actor_model(scenario: &mut serde_yaml::Value, target: &str, value: serde_yaml::Value) -> bool {
    let Some(actors) = scenario
        .get_mut("actors")
        .and_then(|v| v.as_sequence_mut())
    else {
        return false;
    };
    for actor in actors.iter_mut() {
        let matches = actor
            .get("name")
            .and_then(|v| v.as_str())
            .map(|name| name == target)
            .unwrap_or(false);
        if matches {
            if let Some(mapping) = actor.as_mapping_mut() {
                mapping.insert(serde_yaml::Value::from("model"), value);
                return true;
            }
        }
    }
    false
}

/// Override the scenario parameter named `target`. Returns false when
/// the base scenario declares no such parameter.
fn apply_scenario_parameter(
    scenario: &mut serde_yaml::Value,
    target: &str,
    value: serde_yaml::Value,
) -> bool {
    let Some(parameters) = scenario
        .get_mut("parameters")
        .and_then(|v| v.as_mapping_mut())
    else {
        return false;
    };
    let key = serde_yaml::Value::from(target);
    if parameters.contains_key(&key) {
        parameters.insert(key, value);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;

    fn dim(kind: DimensionKind, target: &str, values: Vec<serde_json::Value>) -> VariationDimension {
        VariationDimension {
            kind,
            target: target.to_string(),
            values,
        }
    }

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "simlab_var_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn zero_dimensions_yield_one_base_variation() {
        let variations = generate(&[]);
        assert_eq!(variations.len(), 1);
        assert_eq!(variations[0].id, 1);
        assert_eq!(variations[0].description, "base");
        assert!(variations[0].modifications.is_empty());
        assert_eq!(count(&[]), 1);
    }

    #[test]
    fn product_count_and_sequential_ids() {
        let dims = vec![
            dim(
                DimensionKind::ActorModel,
                "researcher",
                vec![json!("gpt-4o"), json!("claude-3"), json!("gemini")],
            ),
            dim(
                DimensionKind::ScenarioParameter,
                "temperature",
                vec![json!(0.2), json!(0.7)],
            ),
        ];
        assert_eq!(count(&dims), 6);
        let variations = generate(&dims);
        assert_eq!(variations.len(), 6);
        for (i, v) in variations.iter().enumerate() {
            assert_eq!(v.id as usize, i + 1);
        }
        // Declaration order outermost-first: first dimension held while
        // the second sweeps.
        assert_eq!(
            variations[0].modifications["actor_model:researcher"],
            json!("gpt-4o")
        );
        assert_eq!(
            variations[1].modifications["actor_model:researcher"],
            json!("gpt-4o")
        );
        assert_eq!(
            variations[1].modifications["scenario_parameter:temperature"],
            json!(0.7)
        );
        assert_eq!(
            variations[2].modifications["actor_model:researcher"],
            json!("claude-3")
        );
    }

    #[test]
    fn two_by_two_descriptions_combine_both_labels() {
        let dims = vec![
            dim(
                DimensionKind::ActorModel,
                "buyer",
                vec![json!("gpt-4o"), json!("claude-3")],
            ),
            dim(
                DimensionKind::ScenarioParameter,
                "rounds",
                vec![json!(3), json!(5)],
            ),
        ];
        let variations = generate(&dims);
        assert_eq!(variations.len(), 4);
        for v in &variations {
            assert!(v.description.contains("buyer="), "{}", v.description);
            assert!(v.description.contains("rounds="), "{}", v.description);
        }
        assert_eq!(variations[0].description, "buyer=gpt-4o, rounds=3");
        assert_eq!(variations[3].description, "buyer=claude-3, rounds=5");
    }

    #[test]
    fn generate_is_deterministic() {
        let dims = vec![
            dim(
                DimensionKind::ActorModel,
                "seller",
                vec![json!("a"), json!("b")],
            ),
            dim(
                DimensionKind::ScenarioParameter,
                "rounds",
                vec![json!(1), json!(2), json!(3)],
            ),
        ];
        let first = generate(&dims);
        let second = generate(&dims);
        assert_eq!(first, second);
    }

    #[test]
    fn apply_rewrites_actor_model_and_parameter() {
        let root = temp_root("apply");
        simlab_core::ensure_dir(&root).expect("root");
        let base = root.join("scenario.yaml");
        fs::write(
            &base,
            "actors:\n  - name: buyer\n    model: gpt-3.5\n  - name: seller\n    model: gpt-3.5\nparameters:\n  rounds: 3\n",
        )
        .expect("base scenario");

        let dims = vec![
            dim(DimensionKind::ActorModel, "buyer", vec![json!("claude-3")]),
            dim(
                DimensionKind::ScenarioParameter,
                "rounds",
                vec![json!(7)],
            ),
        ];
        let variation = generate(&dims).remove(0);
        let dest = root.join("materialized.yaml");
        apply(&variation, &base, &dest).expect("apply");

        let out: serde_yaml::Value =
            serde_yaml::from_slice(&fs::read(&dest).expect("read")).expect("parse");
        assert_eq!(
            out["actors"][0]["model"].as_str(),
            Some("claude-3"),
            "buyer model rewritten"
        );
        assert_eq!(
            out["actors"][1]["model"].as_str(),
            Some("gpt-3.5"),
            "seller untouched"
        );
        assert_eq!(out["parameters"]["rounds"].as_u64(), Some(7));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn apply_skips_missing_targets_without_error() {
        let root = temp_root("missing");
        simlab_core::ensure_dir(&root).expect("root");
        let base = root.join("scenario.yaml");
        fs::write(&base, "actors:\n  - name: buyer\n    model: gpt-3.5\n").expect("base");

        let dims = vec![dim(
            DimensionKind::ActorModel,
            "ghost",
            vec![json!("claude-3")],
        )];
        let variation = generate(&dims).remove(0);
        let dest = root.join("materialized.yaml");
        apply(&variation, &base, &dest).expect("missing target must not abort");
        assert!(dest.exists());
        let _ = fs::remove_dir_all(root);
    }
}
