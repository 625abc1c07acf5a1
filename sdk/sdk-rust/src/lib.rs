//! Client for the encrypted counter: resolves the deployment for the connected network,
//! submits encrypted increments, decrements and resets, and decrypts the count locally
//! behind a cached, time-bounded decryption authorization.

pub mod client;
pub mod config;
pub mod error;

pub use client::CounterClient;
pub use config::{ConfigError, SdkConfig};
pub use error::{CounterError, Missing, OperationKind};

pub use authorization::{
    AuthorizationStatus, AuthorizationStore, InMemoryAuthorizationStore, JsonFileAuthorizationStore,
};
pub use fhe_counter::{Deployment, DeploymentRegistry};
pub use state::{CounterSnapshot, CounterState, Notice, NoticeLevel, PendingOperations, Subscription};

pub use authorization;
pub use chain;
pub use engine;
pub use fhe_counter;
pub use state;
