//! Thermoguard - temperature monitoring with a hardened command surface.
//!
//! # Overview
//!
//! Thermoguard polls a sensor endpoint on a fixed interval, checks every
//! reading against configured thresholds, and raises de-duplicated alerts.
//! When the endpoint fails, the last good snapshot keeps alerting alive until
//! it becomes too old, at which point a single "source unavailable" alert is
//! raised instead.
//!
//! Operators talk to it through commands. Every command is screened: inputs
//! are classified against their grammar and known attack signatures, actors
//! are rate limited, and repeat offenders are warned and then blocked for
//! escalating periods.
//!
//! # Modules
//!
//! - [`validation`]: Input classification
//! - [`rate_limit`], [`threat`], [`guard`]: Per-actor admission and escalation
//! - [`roles`]: Role and group access
//! - [`cache`], [`source`]: Sensor readings with fallback
//! - [`dedup`], [`monitor`], [`notify`]: Alert evaluation and delivery
//! - [`commands`], [`api`]: HTTP control surface
//! - [`storage`]: SQLite storage for thresholds and the alert log
//! - [`config`]: Environment configuration

pub mod api;
pub mod cache;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod error;
pub mod guard;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod rate_limit;
pub mod roles;
pub mod source;
pub mod storage;
pub mod threat;
pub mod validation;
