//! The panel value model and the coercion table from §4.5.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// The declared primitive type of a `StateSlot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelType {
    String,
    Number,
    Boolean,
    List,
    Object,
}

/// A state value on the wire. Backed by `serde_json::Value` since every
/// external interface (§6) speaks JSON, but kept as a distinct newtype so the
/// coercion table lives in one place rather than being re-derived at each
/// call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanelValue(pub Json);

impl PanelValue {
    pub fn null() -> Self {
        Self(Json::Null)
    }

    pub fn as_json(&self) -> &Json {
        &self.0
    }

    /// Applies the coercion table documented in §4.5 to produce a value
    /// whose JSON shape matches `target`.
    pub fn coerce(&self, target: PanelType) -> PanelValue {
        let out = match target {
            PanelType::String => Json::String(canonical_string(&self.0)),
            PanelType::Number => Json::from(coerce_number(&self.0)),
            PanelType::Boolean => Json::Bool(coerce_boolean(&self.0)),
            PanelType::List => coerce_list(&self.0),
            PanelType::Object => coerce_object(&self.0),
        };
        PanelValue(out)
    }

    /// The default value for a freshly-created or deleted slot of a given
    /// declared type.
    pub fn default_for(target: PanelType) -> PanelValue {
        let out = match target {
            PanelType::String => Json::String(String::new()),
            PanelType::Number => Json::from(0_f64),
            PanelType::Boolean => Json::Bool(false),
            PanelType::List => Json::Array(Vec::new()),
            PanelType::Object => Json::Object(Default::default()),
        };
        PanelValue(out)
    }
}

fn canonical_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn coerce_number(value: &Json) -> f64 {
    match value {
        Json::Number(n) => n.as_f64().unwrap_or(0.0),
        Json::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Json::Bool(true) => 1.0,
        Json::Bool(false) => 0.0,
        _ => 0.0,
    }
}

fn coerce_boolean(value: &Json) -> bool {
    match value {
        Json::Bool(b) => *b,
        Json::Null => false,
        Json::String(s) => {
            let s = s.as_str();
            if s.eq_ignore_ascii_case("false") || s.is_empty() {
                false
            } else if s.eq_ignore_ascii_case("true") {
                true
            } else {
                !s.is_empty()
            }
        }
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

fn coerce_list(value: &Json) -> Json {
    match value {
        Json::Array(_) => value.clone(),
        Json::Null => Json::Array(Vec::new()),
        Json::String(s) => match serde_json::from_str::<Json>(s) {
            Ok(Json::Array(a)) => Json::Array(a),
            _ => Json::Array(vec![Json::String(s.clone())]),
        },
        other => Json::Array(vec![other.clone()]),
    }
}

fn coerce_object(value: &Json) -> Json {
    match value {
        Json::Object(_) => value.clone(),
        Json::String(s) => match serde_json::from_str::<Json>(s) {
            Ok(obj @ Json::Object(_)) => obj,
            _ => Json::Object(Default::default()),
        },
        _ => Json::Object(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(j: Json) -> PanelValue {
        PanelValue(j)
    }

    #[test]
    fn number_coercion() {
        assert_eq!(v(Json::from("42")).coerce(PanelType::Number).0, Json::from(42.0));
        assert_eq!(v(Json::Bool(true)).coerce(PanelType::Number).0, Json::from(1.0));
        assert_eq!(v(Json::from("nope")).coerce(PanelType::Number).0, Json::from(0.0));
    }

    #[test]
    fn boolean_coercion() {
        assert_eq!(v(Json::from("true")).coerce(PanelType::Boolean).0, Json::Bool(true));
        assert_eq!(v(Json::from("")).coerce(PanelType::Boolean).0, Json::Bool(false));
        assert_eq!(v(Json::from(0.0)).coerce(PanelType::Boolean).0, Json::Bool(false));
        assert_eq!(v(Json::Null).coerce(PanelType::Boolean).0, Json::Bool(false));
    }

    #[test]
    fn list_coercion() {
        assert_eq!(
            v(Json::from("[1,2]")).coerce(PanelType::List).0,
            Json::from(vec![1, 2])
        );
        assert_eq!(
            v(Json::from(5)).coerce(PanelType::List).0,
            Json::Array(vec![Json::from(5)])
        );
        assert_eq!(v(Json::Null).coerce(PanelType::List).0, Json::Array(vec![]));
    }

    #[test]
    fn object_coercion() {
        assert_eq!(
            v(Json::from(7)).coerce(PanelType::Object).0,
            Json::Object(Default::default())
        );
    }
}
