pub mod adapters;
pub mod aggregator_client;
pub mod paper;
pub mod state_store;
