//! # qfs - Filter-Aware File Tree Synchronizer
//!
//! qfs synchronizes directory trees through a central object-store-backed
//! repository. Multiple sites push to and pull from the repository; a
//! filter language decides which paths participate, and conflict checks
//! catch concurrent modification before anything is overwritten.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use qfs::confirm::AutoConfirmer;
//! use qfs::coordinator::{Coordinator, OpOptions};
//! use qfs::site::Site;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let site = Site::discover(std::path::Path::new("."))?;
//!     let c = Coordinator::connect(site, Arc::new(AutoConfirmer { answer: true })).await?;
//!     c.push(&OpOptions::default()).await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod apply;
pub mod concurrent;
pub mod confirm;
pub mod coordinator;
pub mod db;
pub mod diff;
pub mod error;
pub mod filter;
pub mod logging;
pub mod repo;
pub mod site;
pub mod source;
pub mod store;
pub mod traverse;
pub mod types;
pub mod util;

// Re-export commonly used types and functions
pub use coordinator::{Coordinator, InitMode, OpOptions};
pub use db::{Database, DbFlavor};
pub use diff::{diff, Diff, DiffOptions};
pub use error::{DbError, FilterError, QfsError, QfsResult};
pub use filter::{Filter, Group};
pub use types::{FileInfo, FileType};

// vim: ts=4
