//! # Parley Core Library
//!
//! `parley-core` is the attachment-transfer engine of the Parley encrypted
//! chat client. It moves attachment bytes directly between two peers over a
//! point-to-point data channel; the chat UI, signaling transport, key
//! management and payload encryption are collaborators supplied by the host.
//!
//! ## Features
//!
//! - **Shared upload sessions**: concurrent downloaders of the same content
//!   share one read stream and one bounded read-ahead cache
//! - **Receiver-driven flow control**: downloads pause the sender when their
//!   write backlog grows
//! - **Admission control**: a global cap on active downloads, small files first
//! - **Stable telemetry**: smoothed speed and dampened ETA per transfer
//! - **History**: persisted, bounded transfer log with accessibility checks
//!
//! ## Modules
//!
//! - [`cache`] - Content-hash cache of completed downloads
//! - [`config`] - Configuration management
//! - [`download`] - Receive-side stream writer
//! - [`engine`] - Engine facade driving every component
//! - [`history`] - Transfer history tracking and persistence
//! - [`protocol`] - Signaling and in-band wire messages
//! - [`queue`] - Download admission queue
//! - [`registry`] - Live transfer state table
//! - [`runtime`] - Tokio task hosting an engine
//! - [`storage`] - Content source and storage sink seams
//! - [`telemetry`] - Speed and ETA estimation
//! - [`transfer`] - Transfer data model and status machine
//! - [`transport`] - Transport and signaling seams
//! - [`upload`] - Upload session pool
//!
//! ## Example
//!
//! ```rust,ignore
//! use parley_core::engine::TransferEngine;
//!
//! let id = engine.request_download(attachment, Instant::now())?;
//! for state in engine.transfers() {
//!     println!("{} {:.0}%", state.file_name, state.progress * 100.0);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod cache;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod history;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod telemetry;
pub mod transfer;
pub mod transport;
pub mod upload;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default chunk size read from the content source (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default cap on simultaneously active downloads
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default number of upload sessions pumping at once
pub const DEFAULT_MAX_RUNNING_SESSIONS: usize = 2;
