/// MRS processing pipeline
///
/// Loads MR spectroscopy acquisitions, runs them through an ordered chain of
/// processing steps under an execution controller, and hands the result to an
/// external LCModel fit.

pub mod config;
pub mod data;
pub mod dsp;
pub mod fitting;
pub mod log;
pub mod pipeline;
pub mod steps;
