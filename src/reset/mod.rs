pub mod client;

pub use client::{request_account_reset, ResetError, ResetReceipt, ResetTargetKind};
