//! Error catalog for RMX.
//!
//! Stable, categorized error codes with remediation steps. Session failures
//! reported to a client carry one of these codes.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                               |
//! |------------|-------------|-------------------------------------------|
//! | E001-E099  | Config      | Environment and command-line setup        |
//! | E100-E199  | Transfer    | Hashing, packing and applying patches     |
//! | E200-E299  | Session     | Protocol and job resolution               |
//! | E300-E399  | Resource    | GPU pool scheduling                       |
//! | E400-E499  | Process     | Spawning and supervising job processes    |
//! | E500-E599  | Internal    | Internal/unexpected errors                |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
