pub mod interval_builder;
pub mod merger;

pub use interval_builder::IntervalBuilder;
pub use merger::merge_intervals;
