//! Lumen Engine
//!
//! Crawling, page execution, scan aggregation, landmark classification and
//! the run lifecycle behind the `lumen` CLI.

pub mod aggregator;
pub mod archive;
pub mod browser;
pub mod config;
pub mod crawler;
pub mod events;
pub mod executor;
pub mod landmark;
pub mod lifecycle;
pub mod occurrence;
pub mod scripts;
pub mod service;
pub mod tree;

pub use archive::{Archiver, RunSnapshot};
pub use browser::{BrowserSurface, PlaywrightFactory, SurfaceFactory};
pub use config::LumenConfig;
pub use crawler::{Crawler, Fetcher, HttpFetcher};
pub use events::{EventBus, Outcome, RunEvent};
pub use executor::PageExecutor;
pub use lifecycle::Lifecycle;
pub use scripts::ScriptBundle;
pub use service::{Lumen, NewTest, TargetUpdate, TargetUpdateOutcome};
