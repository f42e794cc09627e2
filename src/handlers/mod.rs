//! HTTP request handlers for the measurement upload server.
//!
//! This module contains all endpoint handlers organized by functionality:
//! - `measurements`: the three-request upload protocol for sensor traces
//! - `attachments`: the same protocol for attachment bundles
//! - `health`: health check endpoints

pub mod attachments;
pub mod health;
pub mod measurements;
