//! Cloud Monitoring API interaction module
//!
//! This module provides the core functionality for talking to the Cloud
//! Monitoring API: credential resolution, identity authentication, the HTTP
//! client, and the resource collections the provisioning workflow uses.
//!
//! # Module Structure
//!
//! - [`auth`] - Credential resolution and identity-service authentication
//! - [`client`] - Main client exposing the token, entity and alarm collections
//! - [`collection`] - Find/create/save over one remote collection
//! - [`http`] - HTTP utilities for REST API calls
//! - [`mock`] - In-memory fixture backing mock mode
//! - [`resources`] - Agent token, entity and alarm types
//!
//! # Example
//!
//! ```ignore
//! use cmagent::monitoring::{Credentials, MonitoringClient};
//!
//! async fn example() -> cmagent::error::Result<()> {
//!     let client = MonitoringClient::new(Credentials::new("user", "api-key"))?;
//!     let token = client.agent_tokens().find_by_label("web01").await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod collection;
pub mod http;
pub mod mock;
pub mod resources;

pub use auth::Credentials;
pub use client::MonitoringClient;
pub use mock::MockFixture;
pub use resources::{AgentToken, Alarm, Entity, NewAgentToken, NewAlarm, NewEntity};
