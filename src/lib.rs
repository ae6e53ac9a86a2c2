//! Image identity and caption sidecars.
//!
//! Every image in a folder gets a stable identity (a uuid plus a perceptual
//! fingerprint) stored in a JSON file next to it. Opening a folder
//! reconciles those files with the images on disk and pushes the result to
//! a shared metadata store in the background.

pub mod config;
pub mod db;
pub mod export;
pub mod import;
pub mod logging;
pub mod reconcile;
pub mod scanner;
pub mod sidecar;
pub mod sync;
pub mod workbench;

pub use config::Config;
pub use workbench::Workbench;
