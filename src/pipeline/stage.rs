use crate::error::{EngineError, Result};
use crate::operators::{GroupSpec, SortSpec};

/// One parsed pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Group(GroupSpec),
    Sort(SortSpec),
    Limit(u64),
}

impl Stage {
    /// Parses a single `{"$name": <body>}` stage object.
    pub fn parse(spec: &serde_json::Value) -> Result<Self> {
        let (name, body) = spec
            .as_object()
            .filter(|map| map.len() == 1)
            .and_then(|map| map.iter().next())
            .ok_or_else(|| {
                EngineError::invalid_argument(
                    "a pipeline stage must be an object with exactly one field",
                )
            })?;

        match name.as_str() {
            "$group" => GroupSpec::parse(body).map(Stage::Group),
            "$sort" => SortSpec::parse(body).map(Stage::Sort),
            "$limit" => parse_limit(body).map(Stage::Limit),
            other => Err(EngineError::invalid_argument(format!(
                "unrecognized pipeline stage name: '{}'",
                other
            ))),
        }
    }

    pub fn parse_pipeline(spec: &serde_json::Value) -> Result<Vec<Self>> {
        spec.as_array()
            .ok_or_else(|| EngineError::invalid_argument("pipeline must be an array of stages"))?
            .iter()
            .map(Stage::parse)
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Stage::Limit(0) => Err(EngineError::invalid_argument("the limit must be positive")),
            Stage::Sort(SortSpec { limit: Some(0), .. }) => {
                Err(EngineError::invalid_argument("a sort limit must be positive"))
            }
            _ => Ok(()),
        }
    }
}

/// Accepts positive integers, including integral doubles such as `1e9`.
pub fn parse_limit(value: &serde_json::Value) -> Result<u64> {
    let limit = if let Some(limit) = value.as_u64() {
        Some(limit)
    } else {
        value
            .as_f64()
            .filter(|f| f.is_finite() && f.fract() == 0.0 && *f >= 1.0 && *f < u64::MAX as f64)
            .map(|f| f as u64)
    };

    match limit {
        Some(limit) if limit > 0 => Ok(limit),
        _ => Err(EngineError::invalid_argument(format!(
            "the limit must be a positive integer, got {}",
            value
        ))),
    }
}
