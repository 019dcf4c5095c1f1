//! CLI Commands

pub mod apps;
pub mod check;
pub mod run;
