pub mod bandit_engine;
pub mod clock;
pub mod collaborator;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod grade;
pub mod grading_engine;
pub mod rng;
pub mod store;
pub mod subsystem;
pub mod types;
pub mod variance_controller;
