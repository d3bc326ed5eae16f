pub mod adapters;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod queue;
pub mod recover;
pub mod scenario;
pub mod web;
