// =============================================================================
// Alerts Module
// =============================================================================
//
// Formatting, image selection, and Telegram delivery of alert records
// produced by the aggregation engine.

pub mod dispatcher;
pub mod format;
pub mod images;

pub use dispatcher::{run_dispatcher, AlertDispatcher};
pub use images::ImageCollection;
