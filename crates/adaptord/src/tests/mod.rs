//! Test suites for the adaptor daemon.

mod support;
