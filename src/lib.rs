//! Ephemeral server fixtures
//!
//! Provisions short-lived, isolated instances of an external server process
//! for tests:
//! - Allocates a private workspace directory and a unique TCP port
//! - Renders a per-instance config file from a template
//! - Launches and supervises the server process
//! - Waits until the instance answers HTTP requests
//! - Offers a retrying JSON client for the test body
//! - Tears everything down, gracefully or on drop
//!
//! ```no_run
//! use ephemeral_server::{httpd_server, FixtureConfig, HttpdOptions};
//!
//! # async fn example() -> ephemeral_server::Result<()> {
//! let config = FixtureConfig::from_env()?;
//! let options = HttpdOptions::new().proxy_rule("/api/", "http://127.0.0.1:9000/");
//! let mut server = httpd_server(&config, options).await?;
//! let pong = server.query("/api/ping", &[]).await?;
//! println!("{}", pong);
//! server.teardown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod hostname;
pub mod httpd;
pub mod logging;
pub mod port;
pub mod process;
pub mod readiness;
pub mod routing;
pub mod server;
pub mod template;
pub mod workspace;

pub use client::{RawResponse, RetryPolicy, ServerClient};
pub use config::FixtureConfig;
pub use error::{ErrorCategory, FixtureError, Result};
pub use httpd::{httpd_server, HttpdOptions, HttpdServer};
pub use process::ProcessState;
pub use readiness::{wait_until_ready, ReadinessProbe};
pub use server::{InstanceContext, ServerProduct, TestServer};
