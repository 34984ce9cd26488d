//! Shared logic of the `pen_dashboard` and `pen_detail` binaries:
//! layered configuration, file logging, sign-in and report formatting.

pub mod pen_logic;
