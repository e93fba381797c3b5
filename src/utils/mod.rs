//! Small shared helpers: process bootstrap and retry policies.

pub mod bootstrap;
pub mod retry;
