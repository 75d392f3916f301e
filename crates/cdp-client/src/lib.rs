//! Chrome DevTools Protocol client for outpost.
//!
//! [`CdpMux`] owns the single WebSocket to the browser and demultiplexes
//! responses and events. [`PageAdapter`] and [`NetworkRecorder`] are the two
//! domain adapters built on top of it: navigation with load-state waiters,
//! screenshots, evaluation, and a HAR-exporting network trace.

pub mod error;
pub mod har;
pub mod mux;
pub mod page;
pub mod recorder;
pub mod target;

pub use error::{CdpError, CdpResult};
pub use mux::{CdpEvent, CdpMux, CdpMuxOptions};
pub use page::{
    NavigateOptions, PageAdapter, ScreenshotFormat, ScreenshotOptions, WaitUntil,
};
pub use recorder::{NetworkEntry, NetworkRecorder, RecorderEvent, RequestRecord, ResponseRecord};
pub use target::discover_ws_url;
