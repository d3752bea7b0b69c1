pub mod csv;
pub mod webhook;

use crate::error::Result;

/// What the notification endpoint confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The endpoint accepted the request but did not confirm delivery.
    Ambiguous(String),
}

/// Destination for the rendered report of one date.
pub trait Notifier {
    fn notify(&self, text: &str) -> Result<Delivery>;
}
