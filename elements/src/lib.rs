// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astro_util;
pub mod capture_trait;
pub mod clock_trait;
pub mod cloud_trait;
pub mod ephemeris_trait;
pub mod hardware_trait;
pub mod image_trait;
