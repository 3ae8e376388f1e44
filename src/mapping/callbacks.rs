//! Typed observer hooks for the mapping backend.
//!
//! One observer list per event, invoked synchronously on the caller thread
//! at well-defined points: IMU insert, submap insert, before and after each
//! smoother update, and after submap poses are refreshed.

use nalgebra::Vector3;

use crate::smoother::UpdateResult;
use crate::submap::Submap;

/// A list of observers for one event type.
pub struct ObserverList<E: ?Sized> {
    observers: Vec<Box<dyn Fn(&E) + Send + Sync>>,
}

impl<E: ?Sized> Default for ObserverList<E> {
    fn default() -> Self {
        Self { observers: Vec::new() }
    }
}

impl<E: ?Sized> ObserverList<E> {
    /// Register an observer.
    pub fn add(&mut self, observer: impl Fn(&E) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Invoke every observer with the event payload.
    pub fn notify(&self, event: &E) {
        for observer in &self.observers {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl<E: ?Sized> std::fmt::Debug for ObserverList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObserverList({} observers)", self.observers.len())
    }
}

/// Raw IMU sample as handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct ImuInsertEvent {
    pub stamp: f64,
    pub linear_acc: Vector3<f64>,
    pub angular_vel: Vector3<f64>,
}

/// Pending inputs about to be submitted to the smoother.
#[derive(Debug, Clone, Copy)]
pub struct SmootherUpdateEvent {
    pub new_factors: usize,
    pub new_values: usize,
}

/// Observer hooks fired by [`crate::GlobalMapping`].
#[derive(Debug, Default)]
pub struct GlobalMappingCallbacks {
    pub on_insert_imu: ObserverList<ImuInsertEvent>,
    pub on_insert_submap: ObserverList<Submap>,
    pub on_smoother_update: ObserverList<SmootherUpdateEvent>,
    pub on_smoother_update_result: ObserverList<UpdateResult>,
    pub on_update_submaps: ObserverList<[Submap]>,
}
