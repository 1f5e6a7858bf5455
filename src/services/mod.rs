//! Domain services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! `registry` owns room state, `edit` owns the transition rules, `pipeline`
//! orders events between connection tasks and the edit workers, and
//! `broadcast` delivers the results. `session` and `access` face the
//! transport and the external collaborators.

pub mod access;
pub mod broadcast;
pub mod edit;
pub mod pipeline;
pub mod registry;
pub mod session;
