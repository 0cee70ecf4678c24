pub mod federated;
pub mod guards;
