//! Configuration default values
//!
//! This module contains all the default values for configuration options,
//! making them easily changeable in one central location.

use crate::models::Direction;

// Storage defaults
pub const DEFAULT_STORAGE_PATH: &str = "./data/scales";
pub const DEFAULT_FIELD: &str = crate::services::DEFAULT_FIELD;

// Scaling defaults
pub const DEFAULT_DIRECTION: Direction = Direction::Down;
pub const DEFAULT_QUALITY: u8 = crate::models::scale_parameters::DEFAULT_QUALITY;
pub const DEFAULT_MAX_OUTPUT_PIXELS: u64 = crate::scaling::DEFAULT_MAX_OUTPUT_PIXELS;

// Maintenance defaults
pub const DEFAULT_MAX_AGE: &str = "30days";
