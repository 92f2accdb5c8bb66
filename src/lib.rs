pub mod calibration;
pub mod config;
pub mod controller;
pub mod messages;
pub mod motor;
pub mod rotctl;
pub mod runtime;
