//! Stream Sentinel
//!
//! Sampled video detection pipelines with alert dispatch.
//!
//! # Architecture
//!
//! Each watched stream runs one pipeline on its own thread:
//!
//! 1. **Frame source** opens the stream and yields frames (`ingest`).
//! 2. **Sampler** forwards one frame per interval or per frame stride (`sampler`).
//! 3. **Detector** turns a frame into structured detections (`detect`).
//! 4. **Decision rule** decides, per detection, whether to alert (`rules`).
//! 5. **Dispatcher** saves a snapshot and posts it to the callback (`dispatch`).
//!
//! The `supervisor` starts and stops pipelines; the `api` module exposes it
//! over HTTP. The `receiver` module is the alert sink used in deployments
//! and tests.
//!
//! # Module Structure
//!
//! - `frame`, `clock`, `error`: shared types
//! - `ingest`, `sampler`, `detect`, `rules`, `dispatch`, `audit`: pipeline stages
//! - `pipeline`, `supervisor`: the engine and its lifecycle
//! - `http`, `api`, `receiver`: HTTP services
//! - `config`: layered daemon configuration

pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod http;
pub mod ingest;
pub mod pipeline;
pub mod receiver;
pub mod rules;
pub mod sampler;
pub mod supervisor;

pub use clock::{CancelToken, Clock, ManualClock, SystemClock};
pub use detect::{BoundingBox, Detection, DetectorBackend, Keypoint};
pub use dispatch::{Alert, AlertDispatcher, AlertTransport, DispatchStatus};
pub use error::{InferenceError, SourceError};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, ReadOutcome};
pub use pipeline::{DetectionKind, EndReason, Pipeline, PipelineReport, PipelineSettings};
pub use rules::{AlertPolicy, Decision, DecisionRule, FallAngleRule, Outcome, PlateDedupRule};
pub use sampler::{Sampler, SamplingPolicy};
pub use supervisor::{
    DefaultFactory, PipelineFactory, PipelineHandle, PipelineId, PipelineState, StartRequest,
    StopTarget, Supervisor,
};
