// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod acquisition;
pub mod boundaries;
pub mod cloud_monitor;
pub mod config;
pub mod diagnostics;
pub mod gphoto2_backend;
pub mod image_files;
pub mod image_handler;
pub mod interval_control;
pub mod jobs;
pub mod serial_controller;
pub mod session;
pub mod teardown;
pub mod tether;

#[cfg(test)]
mod testing;
