//! Model version registry, routing and A/B lifecycle engine for classification endpoints.

pub mod ab_test;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod predictor;
pub mod registry;
pub mod router;
pub mod status;
pub mod store;

pub use ab_test::{AbTestController, CloseReport};
pub use error::{GatewayError, Result};
pub use predictor::{FixedPredictor, Prediction, Predictor, RemotePredictor};
pub use registry::{Registration, Registry, RegistryBuilder};
pub use router::{RouteOutcome, Router};
pub use status::StatusManager;
pub use store::{MemoryStore, RecordStore, SledStore, WriteBatch, WriteOp, Written};
