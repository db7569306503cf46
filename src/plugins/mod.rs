//! Built-in plugins

mod paper;

pub use paper::{PaperFill, PaperMarket, PaperPlugin, PAPER_PLUGIN};
