//! Records MPEG-DASH live broadcasts from their very first segment.
//!
//! ```text
//! ┌──────────────────────┐  oldest - 1, - 2 ...  ┌────────────────────┐
//! │                      ├───── HEAD probes ─────►                    │
//! │  PastSegmentLocator  │                       │    Segment CDN     │
//! │                      ◄──── present/absent ───┤                    │
//! └──────────┬───────────┘                       └─────────▲──────────┘
//!            │ past queue (paced)                          │ GET
//! ┌──────────▼───────────┐                       ┌─────────┴──────────┐
//! │                      │                       │                    │
//! │    SegmentFetcher    ├───── downloaded ──────►   SegmentStorage   │
//! │      [Semaphore]     │                       │                    │
//! └──────────▲───────────┘                       └────────────────────┘
//!            │ live queue                 every outcome
//! ┌──────────┴───────────┐                ┌────────────────────┐
//! │                      │   discovered   │                    │
//! │  LiveSegmentPoller   ├────────────────►   SegmentLedger    ├──► Summary / MergeTrack
//! │                      │                │                    │
//! └──────────▲───────────┘                └────────────────────┘
//!            │ refresh every poll interval
//!       MPD manifest
//! ```

pub mod config;
pub mod convention;
pub mod dash;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod live;
pub mod locator;
pub mod merge;
pub mod probe;
pub mod recorder;
pub mod storage;
pub mod summary;
pub mod util;

pub use config::RecorderConfig;
pub use error::{KaikoError, KaikoResult};
pub use recorder::{cancel_on_ctrl_c, Recorder, RecorderState, Recording};
