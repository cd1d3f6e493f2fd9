//! Tensor data model and JSON codec.
//!
//! A tensor couples its dtype and payload in a single tagged variant so the
//! two can never disagree. Request tensors must be fully concrete (positive
//! dims); model metadata may carry non-positive dims to mark dynamic axes.

use std::fmt;

use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Float32,
    Float64,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Int64,
    Bool,
    String,
}

impl Dtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Int8 => "int8",
            Dtype::Uint8 => "uint8",
            Dtype::Int16 => "int16",
            Dtype::Uint16 => "uint16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Bool => "bool",
            Dtype::String => "string",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "float32" => Ok(Dtype::Float32),
            "float64" => Ok(Dtype::Float64),
            "int8" => Ok(Dtype::Int8),
            "uint8" => Ok(Dtype::Uint8),
            "int16" => Ok(Dtype::Int16),
            "uint16" => Ok(Dtype::Uint16),
            "int32" => Ok(Dtype::Int32),
            "int64" => Ok(Dtype::Int64),
            "bool" => Ok(Dtype::Bool),
            "string" => Ok(Dtype::String),
            other => Err(Error::InvalidRequest(format!("unknown dtype '{}'", other))),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dtype-discriminated element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorPayload {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl TensorPayload {
    pub fn dtype(&self) -> Dtype {
        match self {
            TensorPayload::F32(_) => Dtype::Float32,
            TensorPayload::F64(_) => Dtype::Float64,
            TensorPayload::I8(_) => Dtype::Int8,
            TensorPayload::U8(_) => Dtype::Uint8,
            TensorPayload::I16(_) => Dtype::Int16,
            TensorPayload::U16(_) => Dtype::Uint16,
            TensorPayload::I32(_) => Dtype::Int32,
            TensorPayload::I64(_) => Dtype::Int64,
            TensorPayload::Bool(_) => Dtype::Bool,
            TensorPayload::Str(_) => Dtype::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorPayload::F32(v) => v.len(),
            TensorPayload::F64(v) => v.len(),
            TensorPayload::I8(v) => v.len(),
            TensorPayload::U8(v) => v.len(),
            TensorPayload::I16(v) => v.len(),
            TensorPayload::U16(v) => v.len(),
            TensorPayload::I32(v) => v.len(),
            TensorPayload::I64(v) => v.len(),
            TensorPayload::Bool(v) => v.len(),
            TensorPayload::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat row-major data as a JSON array.
    pub fn to_json(&self) -> Value {
        match self {
            TensorPayload::F32(v) => json!(v),
            TensorPayload::F64(v) => json!(v),
            TensorPayload::I8(v) => json!(v),
            TensorPayload::U8(v) => json!(v),
            TensorPayload::I16(v) => json!(v),
            TensorPayload::U16(v) => json!(v),
            TensorPayload::I32(v) => json!(v),
            TensorPayload::I64(v) => json!(v),
            TensorPayload::Bool(v) => json!(v),
            TensorPayload::Str(v) => json!(v),
        }
    }
}

/// A named, typed, multi-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub payload: TensorPayload,
}

impl Tensor {
    pub fn dtype(&self) -> Dtype {
        self.payload.dtype()
    }

    /// Parse one entry of the request `inputs` map:
    /// `{"shape": [..], "data": [..], "dtype"?: "float32"}`.
    pub fn from_request(name: &str, value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            Error::InvalidRequest(format!("input '{}' must be an object", name))
        })?;

        let shape_value = obj
            .get("shape")
            .ok_or_else(|| Error::InvalidRequest(format!("input '{}' is missing 'shape'", name)))?;
        let shape = parse_shape(name, shape_value)?;

        let expected: i64 = shape.iter().try_fold(1i64, |acc, &d| {
            acc.checked_mul(d).ok_or_else(|| {
                Error::InvalidRequest(format!("input '{}' shape is too large", name))
            })
        })?;

        let data = obj
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::InvalidRequest(format!("input '{}' is missing 'data' array", name))
            })?;

        if data.len() as i64 != expected {
            return Err(Error::InvalidRequest(format!(
                "input '{}' has {} data elements but shape {:?} requires {}",
                name,
                data.len(),
                shape,
                expected
            )));
        }

        let dtype = match obj.get("dtype") {
            Some(v) => {
                let s = v.as_str().ok_or_else(|| {
                    Error::InvalidRequest(format!("input '{}' dtype must be a string", name))
                })?;
                Dtype::parse(s)?
            }
            None => Dtype::Float32,
        };

        let payload = parse_payload(name, dtype, data)?;

        Ok(Tensor {
            name: name.to_string(),
            shape,
            payload,
        })
    }

    /// JSON form used in responses: `{"shape": [..], "data": [..]}`.
    pub fn to_json(&self) -> Value {
        json!({
            "shape": self.shape,
            "data": self.payload.to_json(),
        })
    }
}

fn parse_shape(name: &str, value: &Value) -> Result<Vec<i64>> {
    let dims = value
        .as_array()
        .ok_or_else(|| Error::InvalidRequest(format!("input '{}' shape must be an array", name)))?;

    let mut shape = Vec::with_capacity(dims.len());
    for dim in dims {
        let d = dim.as_i64().ok_or_else(|| {
            Error::InvalidRequest(format!("input '{}' shape must contain integers", name))
        })?;
        if d <= 0 {
            return Err(Error::InvalidRequest(format!(
                "input '{}' has non-positive dimension {}; request tensors must be concrete",
                name, d
            )));
        }
        shape.push(d);
    }
    Ok(shape)
}

fn parse_payload(name: &str, dtype: Dtype, data: &[Value]) -> Result<TensorPayload> {
    fn floats(name: &str, data: &[Value]) -> Result<Vec<f64>> {
        data.iter()
            .map(|v| {
                v.as_f64().ok_or_else(|| {
                    Error::InvalidRequest(format!("input '{}' data must be numeric", name))
                })
            })
            .collect()
    }

    fn ints(name: &str, data: &[Value]) -> Result<Vec<i64>> {
        data.iter()
            .map(|v| {
                v.as_i64().ok_or_else(|| {
                    Error::InvalidRequest(format!("input '{}' data must contain integers", name))
                })
            })
            .collect()
    }

    Ok(match dtype {
        Dtype::Float32 => {
            TensorPayload::F32(floats(name, data)?.into_iter().map(|v| v as f32).collect())
        }
        Dtype::Float64 => TensorPayload::F64(floats(name, data)?),
        Dtype::Int8 => TensorPayload::I8(ints(name, data)?.into_iter().map(|v| v as i8).collect()),
        Dtype::Uint8 => TensorPayload::U8(ints(name, data)?.into_iter().map(|v| v as u8).collect()),
        Dtype::Int16 => {
            TensorPayload::I16(ints(name, data)?.into_iter().map(|v| v as i16).collect())
        }
        Dtype::Uint16 => {
            TensorPayload::U16(ints(name, data)?.into_iter().map(|v| v as u16).collect())
        }
        Dtype::Int32 => {
            TensorPayload::I32(ints(name, data)?.into_iter().map(|v| v as i32).collect())
        }
        Dtype::Int64 => TensorPayload::I64(ints(name, data)?),
        Dtype::Bool => TensorPayload::Bool(
            data.iter()
                .map(|v| match v {
                    Value::Bool(b) => Ok(*b),
                    Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
                    _ => Err(Error::InvalidRequest(format!(
                        "input '{}' data must contain booleans",
                        name
                    ))),
                })
                .collect::<Result<Vec<bool>>>()?,
        ),
        Dtype::String => TensorPayload::Str(
            data.iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::InvalidRequest(format!(
                            "input '{}' data must contain strings",
                            name
                        ))
                    })
                })
                .collect::<Result<Vec<String>>>()?,
        ),
    })
}

/// Shape compatibility check: ranks must match; non-positive declared dims
/// are dynamic axes and match any concrete size.
pub fn shape_matches(declared: &[i64], actual: &[i64]) -> bool {
    declared.len() == actual.len()
        && declared
            .iter()
            .zip(actual)
            .all(|(&d, &a)| d <= 0 || d == a)
}
