//! Library surface behind the `hub_server` binary: exposed so integration
//! tests under `tests/` can drive `PortManager` and `JsonApi` directly
//! instead of going through the process entry point.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod http;
pub mod jsonapi;
pub mod luaconsole;
pub mod portmanager;
pub mod scripting;
pub mod simlink;
