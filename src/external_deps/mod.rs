//! Integrations with external capabilities.
//!
//! Captcha-solving vendors and JavaScript runtimes live behind narrow traits
//! so the bypass engine stays agnostic of vendor specifics.

pub mod captcha;
pub mod interpreters;
