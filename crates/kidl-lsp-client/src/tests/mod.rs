//! Session, registrar and lifecycle tests driven by in-memory servers.

mod registrar;
mod support;
