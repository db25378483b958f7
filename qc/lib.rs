#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod anomaly;
pub mod check;
pub mod config;
pub mod data;
pub mod design;
pub mod diagnostics;
pub mod fit;
pub mod gibbs;
pub mod pipeline;
pub mod predictive;
pub mod report;
pub mod standardize;
