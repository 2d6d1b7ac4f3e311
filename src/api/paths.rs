//! All Paths are recorded here for use throughout this codebase
//!
//! Anything not listed is rate limited.
pub mod base {
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}
