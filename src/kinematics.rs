//! Tooth index to stage angle.
//!
//! `teeth == 0` is a caller error; runs validate the tooth count before any
//! angle is computed.

/// Angular pitch between adjacent teeth in degrees
pub fn step_angle_deg(teeth: u32) -> f64 {
    debug_assert!(teeth > 0, "tooth count must be positive");
    360.0 / f64::from(teeth)
}

/// Absolute stage angle for the 0-based capture `index`
pub fn target_angle_deg(index: u32, teeth: u32) -> f64 {
    f64::from(index) * step_angle_deg(teeth)
}
