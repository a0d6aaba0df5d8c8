//! HTTP helpers for conditional fetching and retry budgeting.

pub mod client;
pub mod retry;
