//! The gateway's endpoint table.
//!
//! Order matters: the first matching template wins, so literal routes are
//! registered ahead of parameterised ones that share their shape.

use super::validators;
use crate::routing::{Endpoint, RouteError, RouteRegistry};

/// Every endpoint the gateway serves, in registration order.
pub fn default_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::new(
            "/sensor/temperature",
            "/api/sensors/temperature",
            validators::temperature_with_sensor_id,
        ),
        Endpoint::new(
            "/sensor/wind",
            "/api/sensors/wind",
            validators::wind_with_sensor_id,
        ),
        Endpoint::new("/sensor/data", "/api/sensors/data", validators::accept_any),
        Endpoint::new(
            "/sensor/{sensorId}/temperature",
            "/api/sensors/{sensorId}/temperature",
            validators::temperature,
        ),
        Endpoint::new(
            "/sensor/{sensorId}/wind",
            "/api/sensors/{sensorId}/wind",
            validators::wind,
        ),
        Endpoint::new(
            "/station/{stationId}/wind",
            "/api/stations/{stationId}/wind",
            validators::wind,
        ),
        Endpoint::new(
            "/station/{stationId}/diagnostics",
            "/api/stations/{stationId}/diagnostics",
            validators::diagnostics,
        ),
    ]
}

/// Compile the default catalog. Called once at startup.
pub fn build_registry() -> Result<RouteRegistry, RouteError> {
    RouteRegistry::from_endpoints(default_endpoints())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_compiles() {
        let registry = build_registry().unwrap();
        assert_eq!(registry.len(), default_endpoints().len());
    }

    #[test]
    fn catalog_routes_resolve_to_expected_targets() {
        let registry = build_registry().unwrap();
        let cases = [
            ("/sensor/station-1/temperature", "/api/sensors/station-1/temperature"),
            ("/sensor/anemo/wind", "/api/sensors/anemo/wind"),
            ("/sensor/wind", "/api/sensors/wind"),
            ("/sensor/temperature", "/api/sensors/temperature"),
            ("/sensor/data", "/api/sensors/data"),
            ("/station/vasiliki/wind", "/api/stations/vasiliki/wind"),
            ("/station/vasiliki/diagnostics", "/api/stations/vasiliki/diagnostics"),
        ];
        for (path, expected) in cases {
            let matched = registry
                .resolve(path)
                .unwrap_or_else(|| panic!("{path} should resolve"));
            let target = matched.route.target_for(&matched.params).unwrap();
            assert_eq!(target.to_string(), expected);
        }
    }

    #[test]
    fn unknown_paths_do_not_resolve() {
        let registry = build_registry().unwrap();
        for path in ["/unknown/path", "/sensor", "/station/vasiliki", "/sensor/a/b/c"] {
            assert!(registry.resolve(path).is_none(), "{path} should not resolve");
        }
    }
}
