#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod data;
pub mod estimate;
pub mod faer_ndarray;
pub mod model;
pub mod predict;

pub mod pipeline;
pub mod report;
pub mod sensitivity;
pub mod subgroup;
