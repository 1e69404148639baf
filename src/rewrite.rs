//! Source rewriter: substitute a parameter map into an algorithm manifest.
//!
//! The rewriter is a structured editor, not a template engine. It parses the
//! manifest into a format-preserving document, touches only the value nodes
//! under `[config.parameters]` that the caller names, and writes everything
//! else back byte for byte: comments, key order, blank lines, untouched
//! parameters, other tables.
//!
//! ## Numeric fidelity
//!
//! | Declared type | Emitted as                                  |
//! |---------------|---------------------------------------------|
//! | integer       | `12`, `-5` (no decimal point)               |
//! | real          | shortest round-trip form: `0.5`, `-0.75`, `2.0` |
//!
//! A negative value is always `-` followed by the positive literal.
//!
//! ## Relative bases
//!
//! A manifest may `extends = "base.toml"` relative to its own directory.
//! Rewritten candidates are written into a scratch directory, so the rewriter
//! turns that path absolute against the original location; the candidate then
//! loads in isolation.

use std::path::Path;

use thiserror::Error;
use toml_edit::{DocumentMut, Item, TableLike, Value};

use crate::types::{ParamKind, ParamMap, ParamValue};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RewriteError {
    #[error("cannot parse source: {0}")]
    Parse(String),

    #[error("class `{0}` not found in source")]
    ClassNotFound(String),

    #[error("`{0}` is not a mapping literal")]
    NotAMapping(&'static str),

    #[error("parameter `{0}` is not present in the source")]
    UnknownParameter(String),

    #[error("parameter `{0}` does not have a numeric default")]
    NotNumeric(String),

    #[error("parameter `{name}` is {kind:?} and cannot hold {value}")]
    TypeMismatch {
        name: String,
        kind: ParamKind,
        value: ParamValue,
    },
}

fn parse(source: &str) -> Result<DocumentMut, RewriteError> {
    source
        .parse::<DocumentMut>()
        .map_err(|e| RewriteError::Parse(e.to_string()))
}

/// The `[config.parameters]` item, checked to be a mapping at each level.
fn parameters_item(doc: &DocumentMut) -> Result<&Item, RewriteError> {
    let config = doc
        .get("config")
        .filter(|c| c.is_table_like())
        .ok_or(RewriteError::NotAMapping("config"))?;
    config
        .get("parameters")
        .filter(|p| p.is_table_like())
        .ok_or(RewriteError::NotAMapping("config.parameters"))
}

// `Item::get_mut` inserts missing keys, so mutable lookups go through
// `TableLike::get_mut` instead.
fn parameters_table_mut(doc: &mut DocumentMut) -> Result<&mut dyn TableLike, RewriteError> {
    let config = doc
        .get_mut("config")
        .and_then(Item::as_table_like_mut)
        .ok_or(RewriteError::NotAMapping("config"))?;
    config
        .get_mut("parameters")
        .and_then(Item::as_table_like_mut)
        .ok_or(RewriteError::NotAMapping("config.parameters"))
}

fn numeric_value(name: &str, item: &Item) -> Result<ParamValue, RewriteError> {
    match item.as_value() {
        Some(Value::Integer(v)) => Ok(ParamValue::Int(*v.value())),
        Some(Value::Float(v)) => Ok(ParamValue::Float(*v.value())),
        _ => Err(RewriteError::NotNumeric(name.to_string())),
    }
}

/// Read the declared parameter map, in declaration order.
pub fn extract_parameters(source: &str) -> Result<Vec<(String, ParamValue)>, RewriteError> {
    let doc = parse(source)?;
    let params = parameters_item(&doc)?;
    let table = params
        .as_table_like()
        .ok_or(RewriteError::NotAMapping("config.parameters"))?;

    table
        .iter()
        .map(|(name, item)| Ok((name.to_string(), numeric_value(name, item)?)))
        .collect()
}

/// Produce a new manifest with `new_params` substituted.
///
/// Every key of `new_params` must already be declared; each value is coerced
/// to the declared type of that key. `origin_dir` is the directory of the
/// original file, used to make a relative `extends` absolute.
pub fn rewrite_source(
    source: &str,
    class_name: &str,
    new_params: &ParamMap,
    origin_dir: Option<&Path>,
) -> Result<String, RewriteError> {
    let mut doc = parse(source)?;

    let class = doc
        .get("algorithm")
        .and_then(|a| a.get("class"))
        .and_then(Item::as_str);
    if class != Some(class_name) {
        return Err(RewriteError::ClassNotFound(class_name.to_string()));
    }

    let params = parameters_table_mut(&mut doc)?;
    for (name, new_value) in new_params.iter() {
        let slot = params
            .get_mut(name)
            .ok_or_else(|| RewriteError::UnknownParameter(name.to_string()))?;
        let declared = numeric_value(name, slot)?.kind();
        let coerced = new_value
            .coerce(declared)
            .ok_or_else(|| RewriteError::TypeMismatch {
                name: name.to_string(),
                kind: declared,
                value: new_value,
            })?;

        let value = slot
            .as_value_mut()
            .ok_or_else(|| RewriteError::NotNumeric(name.to_string()))?;
        let decor = value.decor().clone();
        *value = match coerced {
            ParamValue::Int(v) => Value::from(v),
            ParamValue::Float(v) => Value::from(v),
        };
        *value.decor_mut() = decor;
    }

    if let Some(dir) = origin_dir {
        absolutize_extends(&mut doc, dir);
    }

    Ok(doc.to_string())
}

fn absolutize_extends(doc: &mut DocumentMut, dir: &Path) {
    let Some(slot) = doc
        .get_mut("algorithm")
        .and_then(Item::as_table_like_mut)
        .and_then(|a| a.get_mut("extends"))
    else {
        return;
    };
    let Some(value) = slot.as_value_mut() else {
        return;
    };
    let Some(relative) = value.as_str().map(str::to_string) else {
        return;
    };
    if Path::new(&relative).is_absolute() {
        return;
    }
    let absolute = dir.join(&relative).to_string_lossy().into_owned();
    let decor = value.decor().clone();
    *value = Value::from(absolute);
    *value.decor_mut() = decor;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SOURCE: &str = r#"# ID: 123456
# Version: 1.0

[algorithm]
class = "Mixer"
extends = "base.toml"

[config]
description = "x"

[config.parameters]
alpha = 0.5   # blend factor
beta = 3
gamma = 10

[[signals]]
kind = "frequency"
window = "beta"
weight = "alpha"
"#;

    fn params(pairs: &[(&str, ParamValue)]) -> ParamMap {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_negative_float_and_untouched_neighbours() {
        let out = rewrite_source(
            SOURCE,
            "Mixer",
            &params(&[("alpha", ParamValue::Float(-0.75))]),
            None,
        )
        .unwrap();

        assert!(out.contains("alpha = -0.75   # blend factor"), "{out}");
        assert!(out.contains("beta = 3\n"));
        assert!(out.contains("gamma = 10\n"));
        assert!(out.starts_with("# ID: 123456\n# Version: 1.0\n"));
        assert!(out.contains("extends = \"base.toml\""));
    }

    #[test]
    fn test_inline_parameter_table() {
        let source = "[algorithm]\nclass = \"A\"\n\n[config]\ndescription = \"x\"\nparameters = { alpha = 0.5, beta = 3 }\n";
        let out = rewrite_source(source, "A", &params(&[("beta", ParamValue::Int(-4))]), None)
            .unwrap();
        let extracted = extract_parameters(&out).unwrap();
        assert_eq!(
            extracted,
            vec![
                ("alpha".to_string(), ParamValue::Float(0.5)),
                ("beta".to_string(), ParamValue::Int(-4)),
            ]
        );
    }

    #[test]
    fn test_integer_param_keeps_integer_literal() {
        let whole = params(&[("beta", ParamValue::Float(12.0))]);
        let out = rewrite_source(SOURCE, "Mixer", &whole, None).unwrap();
        assert!(out.contains("beta = 12\n"), "{out}");

        let fractional = params(&[("beta", ParamValue::Float(1.5))]);
        let err = rewrite_source(SOURCE, "Mixer", &fractional, None).unwrap_err();
        assert!(matches!(err, RewriteError::TypeMismatch { .. }));
    }

    #[test]
    fn test_real_param_gets_decimal_point() {
        let out = rewrite_source(SOURCE, "Mixer", &params(&[("alpha", ParamValue::Int(2))]), None)
            .unwrap();
        assert!(out.contains("alpha = 2.0"), "{out}");
    }

    #[test]
    fn test_errors() {
        let p = params(&[("alpha", ParamValue::Float(1.0))]);
        assert_eq!(
            rewrite_source(SOURCE, "Other", &p, None).unwrap_err(),
            RewriteError::ClassNotFound("Other".into())
        );
        assert_eq!(
            rewrite_source(SOURCE, "Mixer", &params(&[("delta", ParamValue::Int(1))]), None)
                .unwrap_err(),
            RewriteError::UnknownParameter("delta".into())
        );

        let flat = "[algorithm]\nclass = \"A\"\n[config]\nparameters = 5\n";
        assert_eq!(
            rewrite_source(flat, "A", &p, None).unwrap_err(),
            RewriteError::NotAMapping("config.parameters")
        );
        let no_config = "[algorithm]\nclass = \"A\"\nconfig = \"x\"\n";
        assert_eq!(
            rewrite_source(no_config, "A", &p, None).unwrap_err(),
            RewriteError::NotAMapping("config")
        );
        assert!(matches!(
            rewrite_source("[[[", "A", &p, None).unwrap_err(),
            RewriteError::Parse(_)
        ));
    }

    #[test]
    fn test_extends_made_absolute() {
        let out = rewrite_source(SOURCE, "Mixer", &ParamMap::new(), Some(Path::new("/srv/algos")))
            .unwrap();
        let expected = Path::new("/srv/algos").join("base.toml");
        assert!(out.contains(&format!("extends = \"{}\"", expected.display())), "{out}");
    }

    proptest! {
        #[test]
        fn prop_rewrite_then_extract_round_trips(
            alpha in -1.0e6f64..1.0e6,
            beta in -100_000i64..100_000,
        ) {
            let new = params(&[
                ("alpha", ParamValue::Float(alpha)),
                ("beta", ParamValue::Int(beta)),
            ]);
            let out = rewrite_source(SOURCE, "Mixer", &new, None).unwrap();
            let extracted: ParamMap = extract_parameters(&out).unwrap().into_iter().collect();

            prop_assert_eq!(extracted.get("alpha"), Some(ParamValue::Float(alpha)));
            prop_assert_eq!(extracted.get("beta"), Some(ParamValue::Int(beta)));
            prop_assert_eq!(extracted.get("gamma"), Some(ParamValue::Int(10)));
        }
    }
}
