//! Inbound write request and its validation rules.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use validator::{Validate, ValidationError};

use crate::structs::CoordinatePair;

/// A request to claim the cell containing `coordinate_pair`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct PaintRequest {
    /// Raw (unsnapped) coordinate.
    #[validate(custom(function = "validate_coordinates"))]
    pub coordinate_pair: CoordinatePair,
    /// Color as `#RGB`, `#RRGGBB` or `#RRGGBBAA`.
    #[validate(custom(function = "validate_color"))]
    pub color: String,
    /// Authenticated user identifier (1 to 128 bytes).
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
}

fn validate_coordinates(pair: &CoordinatePair) -> Result<(), ValidationError> {
    if pair.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("coordinate_not_finite"))
    }
}

fn validate_color(color: &str) -> Result<(), ValidationError> {
    let Some(hex) = color.strip_prefix('#') else {
        return Err(ValidationError::new("color_missing_hash"));
    };
    let well_formed =
        matches!(hex.len(), 3 | 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit());
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::new("color_not_hex"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pair: CoordinatePair, color: &str, user: &str) -> PaintRequest {
        PaintRequest {
            coordinate_pair: pair,
            color: color.to_owned(),
            user_id: user.to_owned(),
        }
    }

    #[test]
    fn accepts_well_formed_request() {
        let req = request(CoordinatePair(37.5, 127.5), "#FF0000", "u1");
        assert!(req.validate().is_ok());
        assert!(request(CoordinatePair(0.0, 0.0), "#abc", "u1").validate().is_ok());
    }

    #[test]
    fn rejects_bad_color() {
        assert!(request(CoordinatePair(0.0, 0.0), "red", "u1").validate().is_err());
        assert!(request(CoordinatePair(0.0, 0.0), "#GG0000", "u1").validate().is_err());
        assert!(request(CoordinatePair(0.0, 0.0), "#FF00", "u1").validate().is_err());
    }

    #[test]
    fn rejects_non_finite_coordinates() {
        let req = request(CoordinatePair(f64::NAN, 1.0), "#FFFFFF", "u1");
        assert!(req.validate().is_err());
        let req = request(CoordinatePair(1.0, f64::INFINITY), "#FFFFFF", "u1");
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_empty_or_oversized_user() {
        assert!(request(CoordinatePair(0.0, 0.0), "#FFFFFF", "").validate().is_err());
        let long = "x".repeat(129);
        assert!(request(CoordinatePair(0.0, 0.0), "#FFFFFF", &long).validate().is_err());
    }
}
