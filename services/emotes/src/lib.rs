//! Emote Service
//!
//! Upload and processing reconciliation for community emotes. An upload is
//! validated, recorded as `PENDING`, staged in private object storage and
//! handed to an external processing worker as a job. The worker reports
//! progress and results on two queues, which this service folds back into
//! the emote record.
//!
//! ## Features
//!
//! - **Upload Validation**: size, name and tag checks, container sniffing,
//!   dimension and frame probing through `ffprobe`/`webpmux`
//! - **Object Staging**: raw uploads written to a private S3 bucket
//! - **Job Dispatch**: persistent job descriptors on the AMQP job queue
//! - **Reconciliation**: update and result consumers driving the emote
//!   lifecycle, with the latest stage kept in a short-lived cache
//!
//! ## Architecture
//!
//! ```text
//!  POST /emotes
//!       │
//!       ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Upload       │───▶│ Emote Store  │───▶│ Object       │───▶│ Job          │
//! │ Validator    │    │ (PENDING)    │    │ Stager (S3)  │    │ Dispatcher   │
//! └──────────────┘    └──────────────┘    └──────────────┘    └──────────────┘
//!                            ▲                                       │
//!                            │                                       ▼
//!                     ┌──────────────┐                        ┌──────────────┐
//!                     │ Reconciler   │◀── update / result ────│ AMQP broker  │
//!                     │              │──▶ Status Cache        │ + worker     │
//!                     └──────────────┘                        └──────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod emote_store;
pub mod error;
pub mod model;
pub mod probe;
pub mod reconciler;
pub mod stager;
pub mod status_cache;
pub mod validator;

pub use api::{create_router, start_api_server, AppState};
pub use auth::{Actor, Authenticator, Claims};
pub use config::Config;
pub use dispatcher::JobDispatcher;
pub use emote_store::{EmoteStore, MemoryEmoteStore, PgEmoteStore};
pub use error::ApiError;
pub use model::{Emote, EmoteFlags, EmoteFormat, EmoteSize, EmoteStatus};
pub use probe::{CommandProbe, Container, MediaInfo, MediaProbe};
pub use reconciler::{Reconciler, ReconcilerHandles};
pub use stager::{MemoryStager, ObjectStager, S3Stager};
pub use status_cache::{MemoryStatusCache, RedisStatusCache, StatusCache};
pub use validator::UploadValidator;
