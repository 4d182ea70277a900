//! Collecteur Vigie : heartbeats des agents, sondes de joignabilité,
//! classification OK / WARN / DOWN et historique glissant par hôte.

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod persist;
pub mod prober;
pub mod timeline;
