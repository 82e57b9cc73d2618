use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::constants::ACCUMULATOR_BASE_BYTES;
use crate::document::value::double_bits;
use crate::document::Value;
use crate::error::{EngineError, Result};
use crate::expression::Expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Min,
    Max,
    First,
    Last,
    Sum,
    Avg,
    Push,
    AddToSet,
}

impl AccumulatorOp {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "$min" => Ok(AccumulatorOp::Min),
            "$max" => Ok(AccumulatorOp::Max),
            "$first" => Ok(AccumulatorOp::First),
            "$last" => Ok(AccumulatorOp::Last),
            "$sum" => Ok(AccumulatorOp::Sum),
            "$avg" => Ok(AccumulatorOp::Avg),
            "$push" => Ok(AccumulatorOp::Push),
            "$addToSet" => Ok(AccumulatorOp::AddToSet),
            _ => Err(EngineError::invalid_argument(format!("unknown group accumulator '{}'", name))),
        }
    }
}

/// `<output_field>: {<op>: <argument>}` inside a `$group`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorSpec {
    pub output_field: String,
    pub op: AccumulatorOp,
    pub argument: Expression,
}

impl AccumulatorSpec {
    pub fn new(output_field: impl Into<String>, op: AccumulatorOp, argument: Expression) -> Self {
        Self {
            output_field: output_field.into(),
            op,
            argument,
        }
    }

    pub fn parse(output_field: &str, spec: &serde_json::Value) -> Result<Self> {
        let map = spec
            .as_object()
            .filter(|map| map.len() == 1)
            .ok_or_else(|| {
                EngineError::invalid_argument(format!(
                    "accumulator '{}' must be an object with exactly one operator",
                    output_field
                ))
            })?;
        let (op, argument) = map.iter().next().ok_or_else(|| {
            EngineError::invalid_argument(format!("accumulator '{}' is empty", output_field))
        })?;

        Ok(Self::new(output_field, AccumulatorOp::parse(op)?, Expression::parse(argument)?))
    }
}

/// A value tagged with the input position it came from, so order-sensitive
/// accumulators merge the same way whatever the spill boundaries were.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequenced {
    pub seq: u64,
    pub value: Value,
}

/// Neumaier-compensated double total. The running error term is kept next
/// to the sum and spilled with it, so partial totals from different runs add
/// up without losing the low-order bits either one carried.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompensatedSum {
    #[serde(with = "double_bits")]
    sum: f64,
    #[serde(with = "double_bits")]
    compensation: f64,
}

impl CompensatedSum {
    pub fn add(&mut self, value: f64) {
        let total = self.sum + value;
        if total.is_finite() {
            if self.sum.abs() >= value.abs() {
                self.compensation += (self.sum - total) + value;
            } else {
                self.compensation += (value - total) + self.sum;
            }
        }
        self.sum = total;
    }

    pub fn merge(&mut self, other: CompensatedSum) {
        self.add(other.sum);
        self.compensation += other.compensation;
    }

    pub fn value(&self) -> f64 {
        if self.sum.is_finite() {
            self.sum + self.compensation
        } else {
            self.sum
        }
    }
}

/// Per-group running state.
///
/// Every variant supports `init`, `update` and `merge`. Merging is
/// commutative, and partial states written to different runs combine to the
/// same result in any order; double totals are compensated sums.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccumulatorState {
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Sequenced>),
    Last(Option<Sequenced>),
    Sum {
        ints: i64,
        doubles: CompensatedSum,
        has_double: bool,
    },
    Avg {
        sum: CompensatedSum,
        count: u64,
    },
    Push(Vec<Sequenced>),
    AddToSet(BTreeSet<Value>),
}

impl AccumulatorState {
    pub fn init(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Min => AccumulatorState::Min(None),
            AccumulatorOp::Max => AccumulatorState::Max(None),
            AccumulatorOp::First => AccumulatorState::First(None),
            AccumulatorOp::Last => AccumulatorState::Last(None),
            AccumulatorOp::Sum => AccumulatorState::Sum {
                ints: 0,
                doubles: CompensatedSum::default(),
                has_double: false,
            },
            AccumulatorOp::Avg => AccumulatorState::Avg {
                sum: CompensatedSum::default(),
                count: 0,
            },
            AccumulatorOp::Push => AccumulatorState::Push(Vec::new()),
            AccumulatorOp::AddToSet => AccumulatorState::AddToSet(BTreeSet::new()),
        }
    }

    /// Folds in the argument evaluated for the document at input position
    /// `seq`. `None` means the argument referenced a missing field.
    pub fn update(&mut self, value: Option<Value>, seq: u64) {
        match self {
            AccumulatorState::Min(current) => {
                if let Some(value) = value.filter(|v| !v.is_null()) {
                    if current.as_ref().map_or(true, |c| value < *c) {
                        *current = Some(value);
                    }
                }
            }
            AccumulatorState::Max(current) => {
                if let Some(value) = value.filter(|v| !v.is_null()) {
                    if current.as_ref().map_or(true, |c| value > *c) {
                        *current = Some(value);
                    }
                }
            }
            AccumulatorState::First(current) => {
                if current.as_ref().map_or(true, |c| seq < c.seq) {
                    *current = Some(Sequenced {
                        seq,
                        value: value.unwrap_or(Value::Null),
                    });
                }
            }
            AccumulatorState::Last(current) => {
                if current.as_ref().map_or(true, |c| seq > c.seq) {
                    *current = Some(Sequenced {
                        seq,
                        value: value.unwrap_or(Value::Null),
                    });
                }
            }
            AccumulatorState::Sum {
                ints,
                doubles,
                has_double,
            } => match value {
                Some(Value::Int(i)) => add_int(ints, doubles, has_double, i),
                Some(Value::Double(d)) => {
                    doubles.add(d);
                    *has_double = true;
                }
                _ => {}
            },
            AccumulatorState::Avg { sum, count } => {
                if let Some(n) = value.as_ref().and_then(Value::as_f64) {
                    sum.add(n);
                    *count += 1;
                }
            }
            AccumulatorState::Push(values) => {
                if let Some(value) = value {
                    values.push(Sequenced { seq, value });
                }
            }
            AccumulatorState::AddToSet(values) => {
                if let Some(value) = value {
                    values.insert(value);
                }
            }
        }
    }

    /// Combines a partial state for the same key and accumulator into `self`.
    pub fn merge(&mut self, other: AccumulatorState) {
        match (self, other) {
            (AccumulatorState::Min(current), AccumulatorState::Min(other)) => {
                if let Some(other) = other {
                    if current.as_ref().map_or(true, |c| other < *c) {
                        *current = Some(other);
                    }
                }
            }
            (AccumulatorState::Max(current), AccumulatorState::Max(other)) => {
                if let Some(other) = other {
                    if current.as_ref().map_or(true, |c| other > *c) {
                        *current = Some(other);
                    }
                }
            }
            (AccumulatorState::First(current), AccumulatorState::First(other)) => {
                if let Some(other) = other {
                    if current.as_ref().map_or(true, |c| other.seq < c.seq) {
                        *current = Some(other);
                    }
                }
            }
            (AccumulatorState::Last(current), AccumulatorState::Last(other)) => {
                if let Some(other) = other {
                    if current.as_ref().map_or(true, |c| other.seq > c.seq) {
                        *current = Some(other);
                    }
                }
            }
            (
                AccumulatorState::Sum {
                    ints,
                    doubles,
                    has_double,
                },
                AccumulatorState::Sum {
                    ints: other_ints,
                    doubles: other_doubles,
                    has_double: other_has_double,
                },
            ) => {
                add_int(ints, doubles, has_double, other_ints);
                doubles.merge(other_doubles);
                *has_double |= other_has_double;
            }
            (
                AccumulatorState::Avg { sum, count },
                AccumulatorState::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                sum.merge(other_sum);
                *count += other_count;
            }
            (AccumulatorState::Push(values), AccumulatorState::Push(other)) => {
                values.extend(other);
            }
            (AccumulatorState::AddToSet(values), AccumulatorState::AddToSet(other)) => {
                values.extend(other);
            }
            (state, other) => unreachable!(
                "group states are built from one spec, cannot merge {:?} into {:?}",
                other, state
            ),
        }
    }

    pub fn finalize(self) -> Value {
        match self {
            AccumulatorState::Min(value) | AccumulatorState::Max(value) => value.unwrap_or(Value::Null),
            AccumulatorState::First(value) | AccumulatorState::Last(value) => {
                value.map(|v| v.value).unwrap_or(Value::Null)
            }
            AccumulatorState::Sum {
                ints,
                doubles,
                has_double,
            } => {
                if has_double {
                    let mut total = doubles;
                    total.add(ints as f64);
                    Value::Double(total.value())
                } else {
                    Value::Int(ints)
                }
            }
            AccumulatorState::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Double(sum.value() / count as f64)
                }
            }
            AccumulatorState::Push(mut values) => {
                values.sort_by_key(|v| v.seq);
                Value::Array(values.into_iter().map(|v| v.value).collect())
            }
            AccumulatorState::AddToSet(values) => Value::Array(values.into_iter().collect()),
        }
    }

    pub fn approximate_size(&self) -> usize {
        ACCUMULATOR_BASE_BYTES
            + match self {
                AccumulatorState::Min(value) | AccumulatorState::Max(value) => {
                    value.as_ref().map_or(0, Value::approximate_size)
                }
                AccumulatorState::First(value) | AccumulatorState::Last(value) => {
                    value.as_ref().map_or(0, |v| 8 + v.value.approximate_size())
                }
                AccumulatorState::Sum { .. } | AccumulatorState::Avg { .. } => 24,
                AccumulatorState::Push(values) => {
                    values.iter().map(|v| 8 + v.value.approximate_size()).sum()
                }
                AccumulatorState::AddToSet(values) => values.iter().map(Value::approximate_size).sum(),
            }
    }
}

// Integer overflow spills the addend into the double total
fn add_int(ints: &mut i64, doubles: &mut CompensatedSum, has_double: &mut bool, addend: i64) {
    match ints.checked_add(addend) {
        Some(total) => *ints = total,
        None => {
            doubles.add(addend as f64);
            *has_double = true;
        }
    }
}

pub fn states_size(states: &[AccumulatorState]) -> usize {
    states.iter().map(AccumulatorState::approximate_size).sum()
}
