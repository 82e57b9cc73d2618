use crate::error::{EngineError, Result};
use crate::pipeline::stage::Stage;

/// An aggregation to run: the stages in order plus the disk-use opt-in.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub pipeline: Vec<Stage>,
    pub allow_disk_use: bool,
}

impl AggregateRequest {
    pub fn new(pipeline: Vec<Stage>) -> Self {
        Self {
            pipeline,
            allow_disk_use: false,
        }
    }

    pub fn with_allow_disk_use(mut self, allow_disk_use: bool) -> Self {
        self.allow_disk_use = allow_disk_use;
        self
    }

    /// Parses `{"pipeline": [...], "allowDiskUse": <bool>}`. `allowDiskUse`
    /// must be a real boolean; `1` or `"true"` are rejected.
    pub fn from_json(spec: &serde_json::Value) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| EngineError::invalid_argument("aggregate request must be an object"))?;

        let mut pipeline = None;
        let mut allow_disk_use = false;

        for (field, value) in map {
            match field.as_str() {
                "pipeline" => pipeline = Some(Stage::parse_pipeline(value)?),
                "allowDiskUse" => {
                    allow_disk_use = value.as_bool().ok_or_else(|| {
                        EngineError::invalid_argument(format!(
                            "allowDiskUse must be a boolean, got {}",
                            value
                        ))
                    })?;
                }
                // Cursor options have no meaning for a local stream
                "cursor" => {}
                other => {
                    return Err(EngineError::invalid_argument(format!(
                        "unrecognized field '{}' in aggregate request",
                        other
                    )))
                }
            }
        }

        let pipeline = pipeline
            .ok_or_else(|| EngineError::invalid_argument("aggregate request requires a pipeline"))?;
        Ok(Self::new(pipeline).with_allow_disk_use(allow_disk_use))
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.iter().try_for_each(Stage::validate)
    }
}
