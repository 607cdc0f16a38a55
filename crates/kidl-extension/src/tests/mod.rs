//! Tests for the extension entry points.

mod support;
