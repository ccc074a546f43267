//! # ozite
//!
//! Generate disk images from oz templates and publish them to an OpenStack
//! image registry.
//!
//! A run resolves a template set (from a git repository or a local
//! directory), drives `oz-install` to produce a raw disk image, converts it
//! to the requested format, and optionally uploads the result, replacing any
//! image of the same name.

pub mod builder;
pub mod cli;
pub mod credentials;
pub mod registry;
pub mod template;
pub mod workspace;

#[cfg(test)]
mod testutil;
