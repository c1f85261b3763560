//! Measurement buffering and flush scheduling.
//!
//! Instrumented code publishes loosely-typed events on an [`EventBus`][bus::EventBus]. A
//! [`Dispatcher`][dispatcher::Dispatcher] subscribes to the event paths listed in the [registry], normalizes each event
//! into a raw measurement and hands it to the [buffering engine][engine]. The engine is a single task that owns the
//! pending measurements and persists them in bulk to a [`Sink`][sink::Sink] when either the size threshold is reached
//! or the flush interval elapses.
#![deny(missing_docs)]

pub mod bus;
pub mod dispatcher;
pub mod engine;
pub mod measurement;
pub mod registry;
pub mod shutdown;
pub mod sink;
