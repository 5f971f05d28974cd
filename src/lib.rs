// Library interface for lazynote
// Exposes the preview pipeline and its collaborators to the binary and tests

pub mod ansi;
pub mod cache;
pub mod cli;
pub mod config;
pub mod graphics;
pub mod logging;
pub mod render;
pub mod session;
pub mod source;

#[cfg(test)]
mod test_utils;
