//! The global mapping backend: configuration, observer hooks, factor
//! construction, the smoother driver, and persistence.

pub mod builder;
pub mod callbacks;
pub mod config;
pub mod global_mapping;
pub mod persistence;

pub use callbacks::{GlobalMappingCallbacks, ImuInsertEvent, ObserverList, SmootherUpdateEvent};
pub use config::{BetweenRegistration, GlobalMappingConfig, RegistrationErrorKind};
pub use global_mapping::GlobalMapping;
