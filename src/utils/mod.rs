//! Utility modules for common functionality.
//!
//! This module contains helpers shared by the binary, currently logging
//! setup.

pub mod logger;
