//! Formatting helpers shared by the reports

pub mod time;
