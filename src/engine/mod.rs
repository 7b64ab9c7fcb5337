//! Core engine: the reconcile → select → open → hold → close loop.

pub mod accountant;
pub mod controller;
pub mod reconciler;
pub mod selector;
pub mod timing;
