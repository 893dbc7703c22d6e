//! Core services behind the dashboard pages: cached table reads with
//! per-table invalidation, the success confetti effect, and document
//! export (print views and CSV).

pub mod services;
