//! Billing Engine - subscription, invoice and dunning lifecycle as a service.

pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod services;
pub mod startup;
