//! Payload validators for the station and sensor endpoints.
//!
//! Each validator checks presence and JSON type of the fields its endpoint
//! requires. Extra fields pass through untouched.

use serde_json::{Map, Value};

use crate::routing::PathParams;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` must be a number")]
    NotANumber(&'static str),
    #[error("field `{0}` must be a non-empty string")]
    NotAnIdentifier(&'static str),
    #[error("field `{field}` does not match path parameter `{param}`")]
    ParamMismatch {
        field: &'static str,
        param: &'static str,
    },
}

impl ValidationError {
    /// The offending field, if the failure concerns one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::NotAnObject => None,
            ValidationError::MissingField(f)
            | ValidationError::NotANumber(f)
            | ValidationError::NotAnIdentifier(f) => Some(*f),
            ValidationError::ParamMismatch { field, .. } => Some(*field),
        }
    }

    /// Short machine-friendly reason, used as a span attribute.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::NotAnObject => "not_an_object",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::NotANumber(_) => "not_a_number",
            ValidationError::NotAnIdentifier(_) => "not_an_identifier",
            ValidationError::ParamMismatch { .. } => "param_mismatch",
        }
    }
}

fn object(payload: &Value) -> Result<&Map<String, Value>, ValidationError> {
    payload.as_object().ok_or(ValidationError::NotAnObject)
}

fn number(obj: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(value) => value.as_f64().ok_or(ValidationError::NotANumber(field)),
    }
}

fn identifier<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(_) => Err(ValidationError::NotAnIdentifier(field)),
    }
}

/// `/sensor/{sensorId}/temperature`
pub fn temperature(payload: &Value, _params: &PathParams) -> Result<(), ValidationError> {
    let obj = object(payload)?;
    number(obj, "temperature")?;
    Ok(())
}

/// `/sensor/{sensorId}/wind` and `/station/{stationId}/wind`
pub fn wind(payload: &Value, _params: &PathParams) -> Result<(), ValidationError> {
    let obj = object(payload)?;
    number(obj, "speed")?;
    number(obj, "direction")?;
    Ok(())
}

/// `/sensor/temperature`: the sensor id travels in the body.
pub fn temperature_with_sensor_id(payload: &Value, params: &PathParams) -> Result<(), ValidationError> {
    temperature(payload, params)?;
    identifier(object(payload)?, "sensorId")?;
    Ok(())
}

/// `/sensor/wind`: the sensor id travels in the body.
pub fn wind_with_sensor_id(payload: &Value, params: &PathParams) -> Result<(), ValidationError> {
    wind(payload, params)?;
    identifier(object(payload)?, "sensorId")?;
    Ok(())
}

/// `/station/{stationId}/diagnostics`: body `stationId` must equal the path's.
pub fn diagnostics(payload: &Value, params: &PathParams) -> Result<(), ValidationError> {
    let obj = object(payload)?;
    number(obj, "batteryV")?;
    number(obj, "signalDb")?;
    let station_id = identifier(obj, "stationId")?;
    if params.get("stationId") != Some(station_id) {
        return Err(ValidationError::ParamMismatch {
            field: "stationId",
            param: "stationId",
        });
    }
    Ok(())
}

/// `/sensor/data`: anything that decoded as JSON is forwarded.
pub fn accept_any(_payload: &Value, _params: &PathParams) -> Result<(), ValidationError> {
    Ok(())
}
