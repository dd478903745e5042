//! Common utilities and types shared across chat relay components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes (rooms, users, devices, connections)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for user token utilities (validation, claims, constants)
pub mod jwt;
