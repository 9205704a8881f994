pub mod check;
pub mod config;
pub mod rotate;
pub mod run;
pub mod status;
