//! `realmio`: connection-side line IO for realmhost.
//!
//! A client line goes through two stages: [`line::LineReader`] frames
//! the byte stream on `\n`, then [`clean::clean_line`] applies the
//! client editing rules (backspace erasure, control stripping, outer
//! whitespace trim) before the text reaches command dispatch.

pub mod clean;
pub mod line;
